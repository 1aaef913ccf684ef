//! Decompiler symbols: the unnamed variables the primary decompiler introduces.
//!
//! These are not program symbols. They exist only inside one `DecompiledCodeGraph`: the
//! PHI-like variables created at context joins, the temporaries of line expansion, the result
//! variables of call sites, and the register outputs of end blocks. Symbolization later binds
//! them to program-level symbols.

use declift_entity::entity_impl;
use declift_pcode::Register;

/// An opaque reference to a decompiler symbol.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecSymbol(u32);
entity_impl!(DecSymbol, "var");

/// What a decompiler symbol stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecSymbolKind {
    /// A local variable: a loop- or join-carried value, or an expansion temporary.
    Local,
    /// The value of a register at a function exit.
    Register,
    /// The value returned by a call site.
    FuncResult,
}

/// Definition of one decompiler symbol.
#[derive(Clone, Debug)]
pub struct DecSymbolData {
    /// What the symbol stands for.
    pub kind: DecSymbolKind,
    /// Width in bytes.
    pub size: u8,
    /// The register the symbol models, for `Local` join variables and `Register` outputs.
    pub register: Option<Register>,
}

impl DecSymbolData {
    /// A plain local variable.
    pub fn local(size: u8) -> Self {
        Self {
            kind: DecSymbolKind::Local,
            size,
            register: None,
        }
    }

    /// A join variable carrying `register` across a control-flow merge.
    pub fn join_var(register: Register) -> Self {
        Self {
            kind: DecSymbolKind::Local,
            size: register.size,
            register: Some(register),
        }
    }

    /// The exit value of `register`.
    pub fn register_out(register: Register) -> Self {
        Self {
            kind: DecSymbolKind::Register,
            size: register.size,
            register: Some(register),
        }
    }

    /// The result of a call site.
    pub fn func_result(size: u8) -> Self {
        Self {
            kind: DecSymbolKind::FuncResult,
            size,
            register: None,
        }
    }
}
