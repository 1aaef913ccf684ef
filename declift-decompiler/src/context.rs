//! Decompilation context and main entry point.
//!
//! A `Context` drives one function through the pipeline: primary decompiling, the optimization
//! passes, symbolization, and the SDA optimizations. The host picks where to stop through the
//! session's configuration and can read the intermediate artifact after any stage. The context
//! holds no program-wide state; everything external comes in through the session and the
//! explicit collaborator arguments.

use crate::dec_graph::DecompiledCodeGraph;
use crate::decompiler::PrimaryDecompiler;
use crate::environ::{FunctionSignature, ReturnInfo, SymbolContext};
use crate::error::{DecompileError, DecompileResult};
use crate::expr::TopNode;
use crate::opt;
use crate::sda::{
    do_memory_optimization, do_sda_building, do_sda_useless_line_removal, do_type_calculation,
    SdaCodeGraph,
};
use crate::session::{DecompilationSession, StopPoint};
use declift_pcode::{ComplexOffset, FuncGraph, ImagePCodeGraph, Opcode, RegisterFactory, Varnode};

/// Pipeline state for decompiling one function at a time.
pub struct Context<'a> {
    /// The session the runs execute under.
    pub session: DecompilationSession<'a>,
    /// The decompiled graph, present after the DECOMPILING stage until symbolization takes it.
    pub graph: Option<DecompiledCodeGraph>,
    /// The symbolized graph, present after the SYMBOLIZING stage.
    pub sda: Option<SdaCodeGraph>,
}

impl<'a> Context<'a> {
    /// Create a context for a session.
    pub fn new(session: DecompilationSession<'a>) -> Self {
        Self {
            session,
            graph: None,
            sda: None,
        }
    }

    /// Drop the artifacts of the previous function.
    pub fn clear(&mut self) {
        self.graph = None;
        self.sda = None;
    }

    /// Run the pipeline for `func` up to the configured stop point.
    pub fn run(
        &mut self,
        pcode: &mut ImagePCodeGraph,
        func: FuncGraph,
        reg_factory: &dyn RegisterFactory,
        symbols: &mut dyn SymbolContext,
    ) -> DecompileResult<()> {
        let signature = self.function_signature(pcode, func);
        let return_info = ReturnInfo {
            value: signature.ret,
        };
        let stop = self.session.config.stop_point;

        self.decompile(pcode, func, reg_factory, return_info)?;
        if stop == StopPoint::Decompiling {
            return Ok(());
        }
        self.process()?;
        if stop == StopPoint::Processing {
            return Ok(());
        }
        self.symbolize(pcode, reg_factory, symbols, &signature)?;
        if stop == StopPoint::Symbolizing {
            return Ok(());
        }
        self.final_process(symbols)
    }

    /// The signature of the function itself, falling back to the project default.
    pub fn function_signature(
        &self,
        pcode: &ImagePCodeGraph,
        func: FuncGraph,
    ) -> FunctionSignature {
        pcode
            .func_graph(func)
            .start_block
            .expand()
            .and_then(|start| {
                self.session
                    .signatures
                    .resolve(pcode.block(start).min_offset.byte_offset())
            })
            .unwrap_or_else(|| self.session.signatures.default_signature())
    }

    /// Stage 1: primary decompiling.
    pub fn decompile(
        &mut self,
        pcode: &ImagePCodeGraph,
        func: FuncGraph,
        reg_factory: &dyn RegisterFactory,
        return_info: ReturnInfo,
    ) -> DecompileResult<()> {
        self.clear();
        let decompiler = PrimaryDecompiler::new(
            pcode,
            func,
            reg_factory,
            return_info,
            &self.session,
            self.session.config.loop_version_cap,
        );
        self.graph = Some(decompiler.decompile()?);
        Ok(())
    }

    /// Stage 2: the optimization pipeline, then block heights.
    pub fn process(&mut self) -> DecompileResult<()> {
        let graph = self
            .graph
            .as_mut()
            .ok_or(DecompileError::Integrity("process before decompile"))?;
        opt::run_pipeline(graph, &self.session.config);
        graph.calculate_heights();
        Ok(())
    }

    /// Stage 3: symbolization and type calculation. Also records virtual call edges the
    /// registry can now resolve.
    pub fn symbolize(
        &mut self,
        pcode: &mut ImagePCodeGraph,
        reg_factory: &dyn RegisterFactory,
        symbols: &mut dyn SymbolContext,
        signature: &FunctionSignature,
    ) -> DecompileResult<()> {
        let graph = self
            .graph
            .take()
            .ok_or(DecompileError::Integrity("symbolize before decompile"))?;
        let func = graph.func;
        let mut sda = SdaCodeGraph::new(graph);
        do_sda_building(&mut sda, symbols, self.session.types, signature, reg_factory);
        do_type_calculation(
            &mut sda,
            self.session.types,
            symbols,
            signature,
            self.session.config.mutate_auto_symbol_types,
        );
        self.record_virt_call_edges(pcode, func);
        self.sda = Some(sda);
        Ok(())
    }

    /// Stage 4: SDA optimizations.
    pub fn final_process(&mut self, symbols: &mut dyn SymbolContext) -> DecompileResult<()> {
        let sda = self
            .sda
            .as_mut()
            .ok_or(DecompileError::Integrity("final process before symbolize"))?;
        do_memory_optimization(sda, symbols);
        do_sda_useless_line_removal(sda, symbols);
        sda.graph.verify_integrity()?;
        Ok(())
    }

    fn record_virt_call_edges(&self, pcode: &mut ImagePCodeGraph, func: FuncGraph) {
        let sites = pcode.func_graph(func).unresolved_calls.clone();
        for inst in sites {
            let offset = pcode.inst(inst).offset;
            let Some(target) = self.session.virt_calls.resolve_target(offset) else {
                continue;
            };
            if let Some(callee) = pcode.func_graph_starting_at(ComplexOffset::from(target)) {
                pcode.add_virt_call(func, callee);
                log::debug!("virtual call at {offset} resolved to {callee}");
            }
        }
    }

    /// Debugger hook: the top node computed at `offset` in the current artifact.
    pub fn find_block_top_node_at_offset(&self, offset: ComplexOffset) -> Option<TopNode> {
        if let Some(sda) = &self.sda {
            return sda.graph.find_block_top_node_at_offset(offset);
        }
        self.graph
            .as_ref()
            .and_then(|g| g.find_block_top_node_at_offset(offset))
    }
}

/// Debugger hook: the stack pointer displacement at `offset`, from the constant stack
/// adjustments on the straight-line path leading there.
pub fn stack_pointer_value_at_offset(
    pcode: &ImagePCodeGraph,
    func: FuncGraph,
    reg_factory: &dyn RegisterFactory,
    offset: ComplexOffset,
) -> i64 {
    let sp = reg_factory.stack_pointer();
    let mut value: i64 = 0;
    for &block in &pcode.func_graph(func).blocks {
        for &inst in &pcode.block(block).instructions {
            let instr = pcode.inst(inst);
            if instr.offset > offset {
                return value;
            }
            let writes_sp = instr.output == Some(Varnode::Register(sp));
            let from_sp = instr.input0 == Some(Varnode::Register(sp));
            if !(writes_sp && from_sp) {
                continue;
            }
            let Some(Varnode::Constant { value: c, .. }) = instr.input1 else {
                continue;
            };
            match instr.opcode {
                Opcode::IntAdd => value = value.wrapping_add(c as i64),
                Opcode::IntSub => value = value.wrapping_sub(c as i64),
                _ => {}
            }
        }
    }
    value
}
