//! Canonical textual rendering of decompiled graphs.
//!
//! The writer is the determinism witness: blocks come out in level order, lines in list order,
//! and expressions in infix form whose commutative operands were already canonically ordered by
//! the optimization pipeline, so two runs over the same input produce byte-identical text.

use crate::dec_graph::{DecBlock, DecompiledCodeGraph, Line};
use crate::environ::{SymbolContext, TypeManager};
use crate::expr::{Node, NodeData};
use crate::sda::SdaCodeGraph;
use crate::symbol::DecSymbolKind;
use core::fmt::{self, Write};
use declift_pcode::RegisterFactory;

struct Writer<'a> {
    graph: &'a DecompiledCodeGraph,
    reg_factory: Option<&'a dyn RegisterFactory>,
    symbols: Option<&'a dyn SymbolContext>,
    types: Option<&'a dyn TypeManager>,
}

/// Render a decompiled graph.
pub fn write_graph(
    w: &mut impl Write,
    graph: &DecompiledCodeGraph,
    reg_factory: Option<&dyn RegisterFactory>,
) -> fmt::Result {
    Writer {
        graph,
        reg_factory,
        symbols: None,
        types: None,
    }
    .write(w)
}

/// Render a decompiled graph to a string.
pub fn graph_to_string(
    graph: &DecompiledCodeGraph,
    reg_factory: Option<&dyn RegisterFactory>,
) -> String {
    let mut out = String::new();
    write_graph(&mut out, graph, reg_factory).expect("writing to a String cannot fail");
    out
}

/// Render a symbolized graph, with program symbol and type names from the host.
pub fn write_sda_graph(
    w: &mut impl Write,
    sda: &SdaCodeGraph,
    symbols: &dyn SymbolContext,
    types: &dyn TypeManager,
    reg_factory: Option<&dyn RegisterFactory>,
) -> fmt::Result {
    Writer {
        graph: &sda.graph,
        reg_factory,
        symbols: Some(symbols),
        types: Some(types),
    }
    .write(w)
}

/// Render a symbolized graph to a string.
pub fn sda_graph_to_string(
    sda: &SdaCodeGraph,
    symbols: &dyn SymbolContext,
    types: &dyn TypeManager,
    reg_factory: Option<&dyn RegisterFactory>,
) -> String {
    let mut out = String::new();
    write_sda_graph(&mut out, sda, symbols, types, reg_factory)
        .expect("writing to a String cannot fail");
    out
}

impl Writer<'_> {
    fn write(&self, w: &mut impl Write) -> fmt::Result {
        writeln!(w, "function {} {{", self.graph.func)?;
        for block in self.graph.blocks_in_order() {
            self.write_block(w, block)?;
        }
        writeln!(w, "}}")
    }

    fn block_name(&self, block: DecBlock) -> String {
        format!("block_{:x}", self.graph.block(block).min_offset.byte_offset())
    }

    fn write_block(&self, w: &mut impl Write, block: DecBlock) -> fmt::Result {
        let data = self.graph.block(block);
        writeln!(
            w,
            "{} (level {}, height {}):",
            self.block_name(block),
            data.level,
            data.height
        )?;
        for line in &data.par_lines {
            self.write_line(w, line)?;
        }
        for line in &data.seq_lines {
            self.write_line(w, line)?;
        }
        if let Some(cond) = data.condition.expand() {
            let far = data
                .next_far
                .expand()
                .map_or("<none>".to_string(), |b| self.block_name(b));
            write!(w, "    if (")?;
            self.write_expr(w, self.graph.exprs.top_root(cond), false)?;
            writeln!(w, ") goto {far}")?;
        } else if let Some(far) = data.next_far.expand() {
            writeln!(w, "    goto {}", self.block_name(far))?;
        }
        if let Some(near) = data.next_near.expand() {
            writeln!(w, "    goto {}", self.block_name(near))?;
        }
        if data.is_end {
            writeln!(w, "    return")?;
        }
        Ok(())
    }

    fn write_line(&self, w: &mut impl Write, line: &Line) -> fmt::Result {
        let dst = self.graph.exprs.top_root(line.dst);
        let dst = self.graph.exprs.resolve_mirrors(dst);
        write!(w, "    ")?;
        // A zero-sized destination is a call with no used result.
        if self.graph.exprs.size_of(dst) > 0 {
            self.write_expr(w, dst, false)?;
            write!(w, " = ")?;
        }
        self.write_expr(w, self.graph.exprs.top_root(line.src), false)?;
        writeln!(w)
    }

    fn write_expr(&self, w: &mut impl Write, node: Node, parens: bool) -> fmt::Result {
        match self.graph.exprs.data(node) {
            NodeData::Op { op, lhs, rhs, .. } => match rhs.expand() {
                Some(rhs) => {
                    if parens {
                        write!(w, "(")?;
                    }
                    self.write_expr(w, *lhs, true)?;
                    write!(w, " {} ", op.symbol())?;
                    self.write_expr(w, rhs, true)?;
                    if parens {
                        write!(w, ")")?;
                    }
                    Ok(())
                }
                None => match op {
                    crate::expr::ExprOp::ZExt
                    | crate::expr::ExprOp::SExt
                    | crate::expr::ExprOp::FAbs
                    | crate::expr::ExprOp::FSqrt => {
                        write!(w, "{}(", op.symbol())?;
                        self.write_expr(w, *lhs, false)?;
                        write!(w, ")")
                    }
                    _ => {
                        write!(w, "{}", op.symbol())?;
                        self.write_expr(w, *lhs, true)
                    }
                },
            },
            NodeData::Call {
                dest,
                args,
                ambiguous,
                ..
            } => {
                self.write_expr(w, *dest, true)?;
                write!(w, "(")?;
                for (i, &arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(w, ", ")?;
                    }
                    self.write_expr(w, arg, false)?;
                }
                write!(w, ")")?;
                if *ambiguous {
                    write!(w, " /* ambiguous */")?;
                }
                Ok(())
            }
            NodeData::Cond { op, lhs, rhs } => {
                if parens {
                    write!(w, "(")?;
                }
                match op {
                    crate::expr::CondOp::Carry
                    | crate::expr::CondOp::SCarry
                    | crate::expr::CondOp::SBorrow => {
                        write!(w, "{}(", op.symbol())?;
                        self.write_expr(w, *lhs, false)?;
                        write!(w, ", ")?;
                        self.write_expr(w, *rhs, false)?;
                        write!(w, ")")?;
                    }
                    _ => {
                        self.write_expr(w, *lhs, true)?;
                        write!(w, " {} ", op.symbol())?;
                        self.write_expr(w, *rhs, true)?;
                    }
                }
                if parens {
                    write!(w, ")")?;
                }
                Ok(())
            }
            NodeData::CompositeCond { op, lhs, rhs } => match rhs.expand() {
                Some(rhs) => {
                    if parens {
                        write!(w, "(")?;
                    }
                    self.write_expr(w, *lhs, true)?;
                    write!(w, " {} ", op.symbol())?;
                    self.write_expr(w, rhs, true)?;
                    if parens {
                        write!(w, ")")?;
                    }
                    Ok(())
                }
                None => {
                    write!(w, "{}", op.symbol())?;
                    self.write_expr(w, *lhs, true)
                }
            },
            NodeData::Mirror { target, .. } => self.write_expr(w, *target, parens),
            NodeData::Num { value, .. } => write!(w, "{value:#x}"),
            NodeData::Sym { symbol, .. } => {
                let data = self.graph.symbol(*symbol);
                match (data.kind, data.register) {
                    (DecSymbolKind::Register, Some(register)) => {
                        write!(w, "{}", self.register_name(register))
                    }
                    (DecSymbolKind::FuncResult, _) => write!(w, "ret{}", symbol.as_u32()),
                    _ => write!(w, "var{}", symbol.as_u32()),
                }
            }
            NodeData::RegRead { register } => write!(w, "{}", self.register_name(*register)),
            NodeData::SdaSym { symbol, .. } => match self.symbols {
                Some(symbols) => write!(w, "{}", symbols.name(*symbol)),
                None => write!(w, "{symbol}"),
            },
            NodeData::SdaMemSym {
                symbol,
                addr_getting,
                ..
            } => {
                if *addr_getting {
                    write!(w, "&")?;
                }
                match self.symbols {
                    Some(symbols) => write!(w, "{}", symbols.name(*symbol)),
                    None => write!(w, "{symbol}"),
                }
            }
            NodeData::SdaNum { value, .. } => write!(w, "{value:#x}"),
            NodeData::Cast { inner, ty, .. } => {
                match self.types {
                    Some(types) => write!(w, "({})", types.name(*ty))?,
                    None => write!(w, "({ty})")?,
                }
                self.write_expr(w, *inner, true)
            }
        }
    }

    fn register_name(&self, register: declift_pcode::Register) -> String {
        if let Some(factory) = self.reg_factory {
            if let Some(name) = factory.register_name(register.id) {
                if register.byte_offset == 0 && register.size == 8 {
                    return name.to_string();
                }
                return format!("{name}:{}:{}", register.byte_offset, register.size);
            }
        }
        format!("{register}")
    }
}
