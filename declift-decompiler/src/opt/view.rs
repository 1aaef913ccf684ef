//! Display-only simplifications.
//!
//! Rewrites that make the output read better without being required for correctness: an
//! addition of a constant whose sign bit is set becomes a subtraction of its magnitude. Nothing
//! here may change a value.

use crate::dec_graph::DecompiledCodeGraph;
use crate::expr::{mask_value_to_size, ExprOp, ExprPool, Node, NodeData};

/// Run view optimization over the whole graph.
pub fn do_view_optimization(graph: &mut DecompiledCodeGraph) {
    let blocks: Vec<_> = graph.all_blocks().collect();
    for block in blocks {
        if graph.block(block).removed {
            continue;
        }
        let mut tops: Vec<_> = Vec::new();
        for line in graph.block(block).par_lines.iter().chain(&graph.block(block).seq_lines) {
            tops.push(line.src);
        }
        if let Some(cond) = graph.block(block).condition.expand() {
            tops.push(cond);
        }
        for top in tops {
            let root = graph.exprs.top_root(top);
            let rewritten = rewrite(&mut graph.exprs, root);
            if rewritten != root {
                graph.exprs.set_top_root(top, rewritten);
            }
        }
    }
}

fn rewrite(pool: &mut ExprPool, node: Node) -> Node {
    for child in pool.children(node) {
        let new_child = rewrite(pool, child);
        if new_child != child {
            pool.replace_child(node, child, new_child);
        }
    }

    let NodeData::Op {
        op: ExprOp::Add,
        lhs,
        rhs,
        mask,
    } = *pool.data(node)
    else {
        return node;
    };
    let size = mask.size_in_bytes();
    let Some(rhs) = rhs.expand() else {
        return node;
    };
    let NodeData::Num { value, .. } = *pool.data(rhs) else {
        return node;
    };
    if size > 1 && is_negative(value, size) {
        let magnitude = pool.number(value.wrapping_neg(), size);
        return pool.op(ExprOp::Sub, lhs, magnitude, size);
    }
    node
}

fn is_negative(value: u64, size: u8) -> bool {
    let sign_bit = 1u64 << (u32::from(size) * 8 - 1);
    value & sign_bit != 0 && mask_value_to_size(value, size) == value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::DecSymbol;

    #[test]
    fn negative_addend_becomes_subtraction() {
        let mut pool = ExprPool::new();
        let s = pool.sym(DecSymbol::from_u32(0), 8);
        let minus_five = pool.number(5u64.wrapping_neg(), 8);
        let add = pool.op(ExprOp::Add, s, minus_five, 8);
        let rewritten = rewrite(&mut pool, add);
        match *pool.data(rewritten) {
            NodeData::Op {
                op: ExprOp::Sub,
                rhs,
                ..
            } => {
                assert!(matches!(
                    pool.data(rhs.unwrap()),
                    NodeData::Num { value: 5, .. }
                ));
            }
            _ => panic!("expected subtraction"),
        }
    }
}
