//! Session state threaded through a decompilation run.
//!
//! No process-wide state: everything a run needs — signature resolver, type manager,
//! virtual-call registry, and configuration — travels in a [`DecompilationSession`] borrowed by
//! the pipeline context. The session is also the default [`CallInfoResolver`]: constant call
//! targets resolve through the signature resolver, indirect sites fall back to the virtual-call
//! registry, and when everything fails the project default signature is substituted and the
//! call site is marked ambiguous.

use crate::environ::{
    CallInfoResolver, FuncSignatureResolver, FunctionCallInfo, TypeManager, VirtCallRegistry,
};
use bitflags::bitflags;
use declift_pcode::Instruction;

bitflags! {
    /// Selection of the PROCESSING sub-passes, in pipeline order.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PassFlags: u32 {
        /// Fold chains of empty conditional blocks into compound conditions.
        const CONDITION_BLOCKS = 1 << 0;
        /// Constant folding, algebraic identities, canonical operand ordering.
        const EXPRESSIONS = 1 << 1;
        /// Materialize join variables as parallel assignment lines.
        const PARALLEL_ASSIGNMENTS = 1 << 2;
        /// Make block conditions read values their lines just computed.
        const ORDER_FIXING = 1 << 3;
        /// Display-only simplifications.
        const VIEW = 1 << 4;
        /// Annotate line roots with their originating instruction.
        const DEBUG_PROCESSING = 1 << 5;
        /// Turn parallel assignments into legal sequential ones.
        const LINE_EXPANSION = 1 << 6;
        /// Delete assignments nobody reads.
        const USELESS_LINES = 1 << 7;
    }
}

/// Where the pipeline stops when the host wants an intermediate artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopPoint {
    /// After the primary decompiler.
    Decompiling,
    /// After the optimization pipeline.
    Processing,
    /// After symbolization.
    Symbolizing,
    /// After the SDA optimizations; the full run.
    FinalProcessing,
}

/// Tunables of one decompilation run.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Cap on the loop version counter; past it the last computed state is kept and the graph
    /// is tagged imprecise.
    pub loop_version_cap: u32,
    /// Whether type calculation may rewrite the declared type of auto (compiler-inferred)
    /// program symbols, or only adjust the node-local calculated types.
    pub mutate_auto_symbol_types: bool,
    /// Run the debug-processing pass (before and after line expansion).
    pub debug_processing: bool,
    /// Which PROCESSING sub-passes run.
    pub passes: PassFlags,
    /// Where the pipeline stops.
    pub stop_point: StopPoint,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loop_version_cap: 128,
            mutate_auto_symbol_types: true,
            debug_processing: false,
            passes: PassFlags::all(),
            stop_point: StopPoint::FinalProcessing,
        }
    }
}

/// The collaborators and configuration of one decompilation run.
pub struct DecompilationSession<'a> {
    /// Resolver of function signatures.
    pub signatures: &'a dyn FuncSignatureResolver,
    /// The data type manager.
    pub types: &'a dyn TypeManager,
    /// The table of resolved virtual call sites.
    pub virt_calls: &'a dyn VirtCallRegistry,
    /// Run configuration.
    pub config: Config,
}

impl CallInfoResolver for DecompilationSession<'_> {
    fn resolve_call_info(&self, instr: &Instruction, target: Option<u64>) -> FunctionCallInfo {
        if let Some(target) = target {
            if let Some(signature) = self.signatures.resolve(target) {
                return FunctionCallInfo {
                    signature,
                    target: Some(target),
                    ambiguous: false,
                };
            }
        }
        if let Some(target) = self.virt_calls.resolve_target(instr.offset) {
            if let Some(signature) = self.signatures.resolve(target) {
                return FunctionCallInfo {
                    signature,
                    target: Some(target),
                    ambiguous: false,
                };
            }
        }
        if let Some(signature) = self.signatures.resolve_virtual(instr.offset) {
            return FunctionCallInfo {
                signature,
                target: None,
                ambiguous: false,
            };
        }
        FunctionCallInfo {
            signature: self.signatures.default_signature(),
            target,
            ambiguous: true,
        }
    }
}
