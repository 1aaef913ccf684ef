//! Ordering fixes between a block's lines and its condition.
//!
//! A block's condition was captured during interpretation, so it embeds the full expressions
//! current at the branch. Once line expansion serializes the parallel assignments, a line may
//! clobber a symbol the condition still wants the old value of. Two fixes, applied while the
//! lines are still parallel:
//!
//! 1. Any condition subtree equal (by canonical hash) to a line's source is replaced by the
//!    line's destination symbol: the condition then reads the value the line just wrote.
//! 2. A remaining bare read of a symbol some line reassigns gets routed through a fresh
//!    temporary assigned at the head of the parallel list, preserving the entry value.

use crate::dec_graph::DecompiledCodeGraph;
use crate::expr::{ExprPool, Node, NodeData, TopNode};
use crate::fx::FxHashSet;
use crate::symbol::{DecSymbol, DecSymbolData};

/// Run order fixing over every block with a condition.
pub fn do_order_fixing(graph: &mut DecompiledCodeGraph) {
    let blocks: Vec<_> = graph.all_blocks().collect();
    for block in blocks {
        if graph.block(block).removed {
            continue;
        }
        let Some(cond) = graph.block(block).condition.expand() else {
            continue;
        };

        // Fix 1: fold line sources that reappear inside the condition. Leaves inserted here
        // deliberately read the just-assigned value and are off limits for fix 2.
        let mut inserted: FxHashSet<Node> = FxHashSet::default();
        let lines = graph.block(block).par_lines.clone();
        for line in &lines {
            let src_root = graph.exprs.top_root(line.src);
            if graph.exprs.children(src_root).is_empty() {
                // Replacing leaf-sized sources buys nothing and rewrites constants.
                continue;
            }
            let dst_root = graph.exprs.top_root(line.dst);
            let NodeData::Sym { symbol, size } = *graph.exprs.data(dst_root) else {
                continue;
            };
            let src_hash = graph.exprs.hash(src_root);
            replace_matching_subtrees(&mut graph.exprs, cond, src_hash, symbol, size, &mut inserted);
        }

        // Fix 2: protect entry values the lines overwrite.
        let lines = graph.block(block).par_lines.clone();
        for line in &lines {
            let dst_root = graph.exprs.top_root(line.dst);
            let NodeData::Sym { symbol, size } = *graph.exprs.data(dst_root) else {
                continue;
            };
            let cond_root = graph.exprs.top_root(cond);
            let mut reads = graph.exprs.gather_symbol_leaves(cond_root, symbol);
            reads.retain(|leaf| !inserted.contains(leaf));
            if reads.is_empty() {
                continue;
            }
            let temp = graph.new_symbol(DecSymbolData::local(size));
            let temp_dst = graph.exprs.sym(temp, size);
            let old_value = graph.exprs.sym(symbol, size);
            graph.insert_par_line_front(block, temp_dst, old_value, None);
            for leaf in reads {
                let temp_leaf = graph.exprs.sym(temp, size);
                replace_in_tree(&mut graph.exprs, cond, leaf, temp_leaf);
            }
            log::trace!("condition of {block} now reads {temp} for {symbol}");
        }
    }
}

/// Replace every subtree of the top-held tree whose hash equals `hash` with a fresh leaf of
/// `symbol`.
fn replace_matching_subtrees(
    pool: &mut ExprPool,
    top: TopNode,
    hash: u64,
    symbol: DecSymbol,
    size: u8,
    inserted: &mut FxHashSet<Node>,
) {
    let root = pool.top_root(top);
    if pool.hash(root) == hash {
        let leaf = pool.sym(symbol, size);
        inserted.insert(leaf);
        pool.set_top_root(top, leaf);
        return;
    }
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        for child in pool.children(node) {
            if pool.hash(child) == hash {
                let leaf = pool.sym(symbol, size);
                inserted.insert(leaf);
                pool.replace_child(node, child, leaf);
            } else {
                stack.push(child);
            }
        }
    }
}

/// Replace one specific node within the top-held tree only.
fn replace_in_tree(pool: &mut ExprPool, top: TopNode, old: Node, new: Node) {
    let root = pool.top_root(top);
    if root == old {
        pool.set_top_root(top, new);
        return;
    }
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        for child in pool.children(node) {
            if child == old {
                pool.replace_child(node, child, new);
            } else {
                stack.push(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprOp;
    use declift_pcode::ComplexOffset;

    /// A loop latch: parallel line `i = i + 1`, condition `i + 1 < 10`. After the fix the
    /// condition reads `i < 10`... through the freshly assigned `i`.
    #[test]
    fn condition_reads_assigned_value() {
        let mut graph = DecompiledCodeGraph::new(declift_pcode::FuncGraph::from_u32(0));
        let block = graph.create_block(
            declift_pcode::Block::from_u32(0),
            ComplexOffset::new(0, 0),
            ComplexOffset::new(4, 0),
            1,
            false,
        );
        let i = graph.new_symbol(DecSymbolData::local(8));

        let i_read = graph.exprs.sym(i, 8);
        let one = graph.exprs.number(1, 8);
        let inc = graph.exprs.op(ExprOp::Add, i_read, one, 8);
        let dst = graph.exprs.sym(i, 8);
        graph.add_par_line(block, dst, inc, None);

        let i_read2 = graph.exprs.sym(i, 8);
        let one2 = graph.exprs.number(1, 8);
        let inc2 = graph.exprs.op(ExprOp::Add, i_read2, one2, 8);
        let ten = graph.exprs.number(10, 8);
        let cond = graph.exprs.cond(crate::expr::CondOp::Ult, inc2, ten);
        graph.set_condition(block, cond, None);

        do_order_fixing(&mut graph);

        let cond_root = graph
            .exprs
            .top_root(graph.block(block).condition.unwrap());
        let NodeData::Cond { lhs, .. } = *graph.exprs.data(cond_root) else {
            panic!("condition should remain a comparison");
        };
        assert!(matches!(
            graph.exprs.data(lhs),
            NodeData::Sym { symbol, .. } if *symbol == i
        ));
    }
}
