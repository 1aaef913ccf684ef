//! Data type calculation to a fixed point.
//!
//! Every SDA node carries a source type (from its bound program symbol) and a calculated type.
//! Each round recomputes calculated types bottom-up — the stronger child type wins at
//! operational nodes — then reconciles assignments: when the two sides of a line disagree, the
//! winner is the stronger type; an auto symbol on the losing side may have its declared type
//! rewritten (when the run is configured for it), otherwise an implicit cast is inserted and a
//! diagnostic recorded. Rounds repeat until nothing changes, with a small bound as a backstop.

use crate::environ::{FunctionSignature, SymbolContext, TypeId, TypeManager};
use crate::expr::{Node, NodeData, TopNode};
use crate::sda::{SdaCodeGraph, TypeDiagnostic};

const MAX_ROUNDS: u32 = 8;

struct Calc<'a> {
    types: &'a dyn TypeManager,
    symbols: &'a mut dyn SymbolContext,
    mutate_auto: bool,
    changed: bool,
}

/// Run type calculation over the symbolized graph.
pub fn do_type_calculation(
    sda: &mut SdaCodeGraph,
    types: &dyn TypeManager,
    symbols: &mut dyn SymbolContext,
    signature: &FunctionSignature,
    mutate_auto: bool,
) {
    let _ = signature;
    let mut calc = Calc {
        types,
        symbols,
        mutate_auto,
        changed: false,
    };

    for round in 0..MAX_ROUNDS {
        calc.changed = false;
        let blocks: Vec<_> = sda.graph.all_blocks().collect();
        for block in blocks {
            if sda.graph.block(block).removed {
                continue;
            }
            let lines: Vec<_> = sda
                .graph
                .block(block)
                .par_lines
                .iter()
                .chain(&sda.graph.block(block).seq_lines)
                .copied()
                .collect();
            let condition = sda.graph.block(block).condition.expand();

            for line in lines {
                calc.visit_top(sda, line.dst);
                calc.visit_top(sda, line.src);
                calc.reconcile_line(sda, line.dst, line.src);
            }
            if let Some(cond) = condition {
                calc.visit_top(sda, cond);
            }
        }
        if !calc.changed {
            log::debug!("type calculation converged after {} rounds", round + 1);
            break;
        }
    }
}

impl Calc<'_> {
    fn visit_top(&mut self, sda: &mut SdaCodeGraph, top: TopNode) {
        let root = sda.graph.exprs.top_root(top);
        self.visit(sda, root);
    }

    /// Post-order type computation. Returns the node's calculated type.
    fn visit(&mut self, sda: &mut SdaCodeGraph, node: Node) -> TypeId {
        for child in sda.graph.exprs.children(node) {
            self.visit(sda, child);
        }

        let data = sda.graph.exprs.data(node).clone();
        let (src, calc) = match data {
            NodeData::SdaSym { symbol, .. } => {
                let ty = self.symbols.data_type(symbol);
                (Some(ty), ty)
            }
            NodeData::SdaMemSym {
                symbol,
                addr_getting,
                ..
            } => {
                let ty = self.symbols.data_type(symbol);
                let ty = if addr_getting {
                    self.types.pointer_to(ty)
                } else {
                    ty
                };
                (Some(ty), ty)
            }
            NodeData::SdaNum { ty, .. } => (None, ty),
            NodeData::Num { size, .. } | NodeData::Sym { size, .. } => {
                (None, self.types.default_type(size))
            }
            NodeData::RegRead { register } => (None, self.types.default_type(register.size)),
            NodeData::Cast { ty, .. } => (None, ty),
            NodeData::Cond { .. } | NodeData::CompositeCond { .. } => {
                (None, self.types.bool_type())
            }
            NodeData::Mirror { target, .. } => {
                let ty = self.node_calc(sda, target);
                (None, ty)
            }
            NodeData::Call { ret_size, .. } => (None, self.types.default_type(ret_size.max(1))),
            NodeData::Op { op, lhs, rhs, mask } => {
                let size = mask.size_in_bytes();
                let ty = if op == crate::expr::ExprOp::Load {
                    // Loading through a typed pointer yields the pointee.
                    let addr_ty = self.node_calc(sda, lhs);
                    match self.types.pointee(addr_ty) {
                        Some(pointee) if self.types.size_of(pointee) == size => pointee,
                        _ => self.types.default_type(size),
                    }
                } else if op.is_unary() {
                    self.resize(self.node_calc(sda, lhs), size)
                } else {
                    let rhs = rhs.expand().expect("binary operator");
                    let lhs_ty = self.node_calc(sda, lhs);
                    let rhs_ty = self.node_calc(sda, rhs);
                    let winner = self.stronger(lhs_ty, rhs_ty);
                    self.enforce_operand_size(sda, node, lhs, size, winner);
                    self.enforce_operand_size(sda, node, rhs, size, winner);
                    self.resize(winner, size)
                };
                (None, ty)
            }
        };

        let entry = &mut sda.types[node];
        if entry.src.expand() != src {
            entry.src = src.into();
            self.changed = true;
        }
        if entry.calc.expand() != Some(calc) {
            entry.calc = calc.into();
            self.changed = true;
        }
        calc
    }

    fn node_calc(&self, sda: &SdaCodeGraph, node: Node) -> TypeId {
        sda.types[node]
            .calc
            .expand()
            .unwrap_or_else(|| self.types.default_type(sda.graph.exprs.size_of(node).max(1)))
    }

    /// The child of an operational node must produce a value of the node's operand size;
    /// disagreement gets an implicit cast.
    fn enforce_operand_size(
        &mut self,
        sda: &mut SdaCodeGraph,
        parent: Node,
        child: Node,
        size: u8,
        winner: TypeId,
    ) {
        let child_ty = self.node_calc(sda, child);
        if self.types.size_of(child_ty) == size {
            return;
        }
        if matches!(sda.graph.exprs.data(child), NodeData::Cast { .. }) {
            return;
        }
        let target = self.resize(winner, size);
        let cast = sda.graph.exprs.make(NodeData::Cast {
            inner: child,
            ty: target,
            size,
        });
        sda.graph.exprs.replace_child(parent, child, cast);
        sda.types[cast].calc = target.into();
        sda.diagnostics.push(TypeDiagnostic {
            node: cast,
            expected: target,
            found: child_ty,
        });
        self.changed = true;
        log::trace!("implicit cast inserted under {parent}");
    }

    /// Reconcile an assignment's two sides.
    fn reconcile_line(&mut self, sda: &mut SdaCodeGraph, dst: TopNode, src: TopNode) {
        let dst_root = sda.graph.exprs.resolve_mirrors(sda.graph.exprs.top_root(dst));
        let src_root = sda.graph.exprs.resolve_mirrors(sda.graph.exprs.top_root(src));
        let dst_ty = self.node_calc(sda, dst_root);
        let src_ty = self.node_calc(sda, src_root);
        if dst_ty == src_ty {
            return;
        }

        // The stronger side wins; a weaker auto symbol adopts the winner's type.
        if self.strength(src_ty) > self.strength(dst_ty) {
            if let NodeData::SdaSym { symbol, .. } = *sda.graph.exprs.data(dst_root) {
                if self.mutate_auto
                    && self.symbols.is_auto(symbol)
                    && self.types.size_of(src_ty) == self.types.size_of(dst_ty)
                {
                    self.symbols.set_data_type(symbol, src_ty);
                    self.changed = true;
                    return;
                }
            }
        }
        if self.types.size_of(src_ty) != self.types.size_of(dst_ty) {
            let cast = sda.graph.exprs.make(NodeData::Cast {
                inner: src_root,
                ty: dst_ty,
                size: self.types.size_of(dst_ty),
            });
            sda.graph.exprs.set_top_root(src, cast);
            sda.types[cast].calc = dst_ty.into();
            sda.diagnostics.push(TypeDiagnostic {
                node: cast,
                expected: dst_ty,
                found: src_ty,
            });
            self.changed = true;
        }
    }

    fn strength(&self, ty: TypeId) -> u8 {
        self.types.strength(ty)
    }

    /// The stronger of two types, per [`Self::strength`]; ties favor `lhs`.
    fn stronger(&self, lhs: TypeId, rhs: TypeId) -> TypeId {
        if self.strength(rhs) > self.strength(lhs) {
            rhs
        } else {
            lhs
        }
    }

    /// A type of the same family but the given size.
    fn resize(&self, ty: TypeId, size: u8) -> TypeId {
        if self.types.size_of(ty) == size {
            return ty;
        }
        if self.types.is_pointer(ty) || self.types.is_float(ty) {
            // Pointer and float widths are fixed by the family; keep the type.
            return ty;
        }
        if self.types.is_signed(ty) {
            self.types.signed_type(size)
        } else {
            self.types.default_type(size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environ::{DummyEnvironment, ProgSymbolKind, SymbolContext as _, TypeManager as _};
    use crate::expr::NodeData;
    use crate::sda::SdaCodeGraph;
    use declift_pcode::ComplexOffset;

    /// Assigning a narrower value to a wider symbol inserts an implicit cast on the source and
    /// records a diagnostic; the cast's calculated type matches the destination.
    #[test]
    fn size_conflict_inserts_cast() {
        let mut env = DummyEnvironment::new();
        let u64_ty = env.types.default_type(8);
        let u32_ty = env.types.default_type(4);

        let mut graph = crate::dec_graph::DecompiledCodeGraph::new(
            declift_pcode::FuncGraph::from_u32(0),
        );
        let block = graph.create_block(
            declift_pcode::Block::from_u32(0),
            ComplexOffset::new(0, 0),
            ComplexOffset::new(1, 0),
            1,
            true,
        );
        let prog = env.symbols.register_local_var(8);
        env.symbols.set_data_type(prog, u64_ty);
        assert_eq!(env.symbols.kind(prog), ProgSymbolKind::LocalInstrVar);

        let dst = graph.exprs.make(NodeData::SdaSym {
            symbol: prog,
            dec: None.into(),
            size: 8,
        });
        let src = graph.exprs.make(NodeData::SdaNum {
            value: 7,
            ty: u32_ty,
            size: 4,
        });
        graph.add_seq_line(block, dst, src, None);

        let mut sda = SdaCodeGraph::new(graph);
        let signature = crate::environ::FunctionSignature::default();
        do_type_calculation(&mut sda, &env.types, &mut env.symbols, &signature, false);

        let line = sda.graph.block(block).seq_lines[0];
        let src_root = sda.graph.exprs.top_root(line.src);
        assert!(matches!(
            sda.graph.exprs.data(src_root),
            NodeData::Cast { .. }
        ));
        assert_eq!(sda.calc_type(src_root), Some(u64_ty));
        assert_eq!(sda.diagnostics.len(), 1);
    }
}
