//! Folding of empty conditional blocks into compound conditions.
//!
//! Two shapes are recognized, both requiring the middle block to carry no lines and to have the
//! folding block as its only predecessor:
//!
//! ```text
//!   A: if cA goto F        A: if cA goto F
//!   B: if cB goto F   =>   with A.cond = cA || cB, A.near = C
//!      else C
//! ```
//!
//! ```text
//!   A: if cA goto X        A: if cB' goto F
//!   B: if cB goto F   =>   with A.cond = !cA && cB, A.far = F, A.near = X
//!      else X
//! ```
//!
//! The left operand of the compound condition is always the earlier condition, so
//! short-circuit evaluation order is preserved. The folded block is marked removed; block
//! bijection with the PCode graph holds only before this pass, by design.

use crate::dec_graph::{DecBlock, DecompiledCodeGraph};
use crate::expr::BoolOp;

/// Fold chains of empty conditional blocks, repeating until no pattern matches.
pub fn do_condition_block_optimization(graph: &mut DecompiledCodeGraph) {
    let mut changed = true;
    while changed {
        changed = false;
        let blocks: Vec<_> = graph.all_blocks().collect();
        for a in blocks {
            if try_fold(graph, a) {
                changed = true;
            }
        }
    }
}

fn try_fold(graph: &mut DecompiledCodeGraph, a: DecBlock) -> bool {
    if graph.block(a).removed || graph.block(a).condition.is_none() {
        return false;
    }
    let Some(b) = graph.block(a).next_near.expand() else {
        return false;
    };
    let Some(a_far) = graph.block(a).next_far.expand() else {
        return false;
    };
    if b == a || graph.block(b).removed {
        return false;
    }
    let b_data = graph.block(b);
    if b_data.condition.is_none()
        || !b_data.par_lines.is_empty()
        || !b_data.seq_lines.is_empty()
        || b_data.predecessors.len() != 1
        || b_data.predecessors[0] != a
    {
        return false;
    }
    // A join variable still owes this block an assignment line; folding would lose it.
    if graph
        .join_vars
        .iter()
        .any(|v| v.ctxs.iter().any(|&c| graph.exec.get(c).block == b))
    {
        return false;
    }
    let (Some(b_near), Some(b_far)) = (b_data.next_near.expand(), b_data.next_far.expand())
    else {
        return false;
    };
    if b_near == b || b_far == b {
        return false;
    }

    let a_cond_top = graph.block(a).condition.unwrap();
    let b_cond_top = graph.block(b).condition.unwrap();
    let a_cond = graph.exprs.top_root(a_cond_top);
    let b_cond = graph.exprs.top_root(b_cond_top);

    if b_far == a_far {
        // Shared far target: `if (cA || cB) goto F else C`.
        let combined = graph.exprs.composite_cond(BoolOp::Or, a_cond, Some(b_cond));
        graph.exprs.set_top_root(a_cond_top, combined);
        remove_middle(graph, a, b);
        graph.set_next_near(a, b_near);
        log::trace!("folded {b} into {a} as a disjunction");
        true
    } else if b_near == a_far {
        // The far edge of A rejoins B's fall-through: `if (!cA && cB) goto F else X`.
        let not_a = graph.exprs.composite_cond(BoolOp::Not, a_cond, None);
        let combined = graph
            .exprs
            .composite_cond(BoolOp::And, not_a, Some(b_cond));
        graph.exprs.set_top_root(a_cond_top, combined);
        remove_middle(graph, a, b);
        graph.set_next_near(a, b_near);
        graph.set_next_far(a, b_far);
        log::trace!("folded {b} into {a} as a conjunction");
        true
    } else {
        false
    }
}

fn remove_middle(graph: &mut DecompiledCodeGraph, a: DecBlock, b: DecBlock) {
    // Drop A -> B before detaching B so predecessor lists stay exact.
    let _ = a;
    graph.clear_successors(b);
    let b_data = graph.block_mut(b);
    b_data.removed = true;
    b_data.condition = None.into();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CondOp, NodeData};
    use crate::symbol::DecSymbolData;
    use declift_pcode::ComplexOffset;

    fn block_at(graph: &mut DecompiledCodeGraph, n: u32, level: u32, is_end: bool) -> DecBlock {
        graph.create_block(
            declift_pcode::Block::from_u32(n),
            ComplexOffset::new(u64::from(n), 0),
            ComplexOffset::new(u64::from(n) + 1, 0),
            level,
            is_end,
        )
    }

    /// `if (a == 0) goto F; if (b == 0) goto F; else C` folds into one disjunction block.
    #[test]
    fn folds_shared_far_target() {
        let mut graph = DecompiledCodeGraph::new(declift_pcode::FuncGraph::from_u32(0));
        let a = block_at(&mut graph, 0, 1, false);
        let b = block_at(&mut graph, 1, 2, false);
        let f = block_at(&mut graph, 2, 3, true);
        let c = block_at(&mut graph, 3, 3, true);

        let sym_a = graph.new_symbol(DecSymbolData::local(8));
        let sym_b = graph.new_symbol(DecSymbolData::local(8));

        let read = graph.exprs.sym(sym_a, 8);
        let zero = graph.exprs.number(0, 8);
        let cond_a = graph.exprs.cond(CondOp::Eq, read, zero);
        graph.set_condition(a, cond_a, None);

        let read = graph.exprs.sym(sym_b, 8);
        let zero = graph.exprs.number(0, 8);
        let cond_b = graph.exprs.cond(CondOp::Eq, read, zero);
        graph.set_condition(b, cond_b, None);

        graph.set_next_near(a, b);
        graph.set_next_far(a, f);
        graph.set_next_near(b, c);
        graph.set_next_far(b, f);

        do_condition_block_optimization(&mut graph);

        assert!(graph.block(b).removed);
        assert_eq!(graph.block(a).next_near.expand(), Some(c));
        assert_eq!(graph.block(a).next_far.expand(), Some(f));
        let cond = graph
            .exprs
            .top_root(graph.block(a).condition.unwrap());
        match graph.exprs.data(cond) {
            NodeData::CompositeCond { op, lhs, .. } => {
                assert_eq!(*op, BoolOp::Or);
                // Short-circuit order: the earlier condition stays on the left.
                assert_eq!(*lhs, cond_a);
            }
            other => panic!("expected compound condition, got {other:?}"),
        }
    }
}
