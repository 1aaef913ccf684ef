//! PCode intermediate representation and control-flow graph recovery.
//!
//! Machine instructions are decoded (elsewhere) into one or more PCode micro-operations, a small
//! register-transfer IR. This crate models that IR and recovers structure from it:
//!
//! - [`ComplexOffset`] locates a single micro-operation inside the image: a 48-bit byte offset
//!   plus a 16-bit order id disambiguating the micro-operations of one machine instruction.
//! - [`Instruction`], [`Opcode`] and [`Varnode`] describe the operations themselves.
//! - [`Register`] and [`BitMask64`] form the register slice algebra: a machine register is
//!   viewed as a set of byte ranges that can be live with distinct values at the same time
//!   (`AL` and `AH` inside `RAX`).
//! - [`ImagePCodeGraph`] owns every instruction, basic block and per-function subgraph of the
//!   image, and [`GraphBuilder`] populates it from a decoded instruction stream and a set of
//!   known function entry points.
//!
//! The graphs built here are immutable for the lifetime of a decompilation; the decompiler crate
//! only reads them.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod builder;
mod graph;
mod instruction;
mod offset;
mod register;

pub use crate::builder::GraphBuilder;
pub use crate::graph::{Block, FuncGraph, GraphError, GraphResult, ImagePCodeGraph, Inst};
pub use crate::instruction::{Instruction, Opcode, Varnode};
pub use crate::offset::ComplexOffset;
pub use crate::register::{BitMask64, Register, RegisterFactory, RegisterId};
