//! The declift decompiler core.
//!
//! Given the PCode graph of one function, the pipeline lifts it into a high-level statement
//! graph in four stages:
//!
//! 1. **Decompiling** — the [`PrimaryDecompiler`] abstract-interprets every block
//!    into expression trees over per-block register contexts, joining contexts at control-flow
//!    merges and iterating loops to a fixed point.
//! 2. **Processing** — the [`opt`] pipeline rewrites the raw graph into canonical, compact
//!    form: compound conditions, folded expressions, materialized join variables, sequential
//!    lines, no dead assignments.
//! 3. **Symbolizing** — the [`sda`] pass binds nodes to program symbols and data types
//!    resolved through the host's managers, propagating types to a fixed point.
//! 4. **Final processing** — the typed cleanups: memory dedup and effect-aware dead-line
//!    removal.
//!
//! A [`Context`] drives the stages and lets the host stop after any of them. All external
//! state comes in through the [`environ`] traits; [`environ::DummyEnvironment`] implements
//! them in memory for tests and standalone use. Each function decompiles independently: the
//! [`DecompiledCodeGraph`] owns every node, block, symbol and context it produces, and drops
//! them all at once.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod environ;
pub mod opt;
pub mod sda;
pub mod write;

mod context;
mod dec_graph;
mod decompiler;
mod error;
mod exec_context;
mod expr;
mod fx;
mod interpreter;
mod session;
mod symbol;

pub use crate::context::{stack_pointer_value_at_offset, Context};
pub use crate::dec_graph::{DecBlock, DecBlockData, DecompiledCodeGraph, Line};
pub use crate::decompiler::PrimaryDecompiler;
pub use crate::error::{DecompileError, DecompileResult};
pub use crate::exec_context::{
    ExecContextData, ExecContextTable, ExecCtx, JoinVar, RegisterExecContext, RegisterInfo,
    RegisterUsing,
};
pub use crate::expr::{
    BoolOp, CondOp, ExprOp, ExprPool, Node, NodeData, TopNode,
};
pub use crate::session::{Config, DecompilationSession, PassFlags, StopPoint};
pub use crate::symbol::{DecSymbol, DecSymbolData, DecSymbolKind};
