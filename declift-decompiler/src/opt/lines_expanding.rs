//! Expansion of parallel assignments into legal sequential ones.
//!
//! Parallel lines have simultaneous-assignment semantics: every right-hand side reads the
//! values from before the whole group. Emitting them one after another breaks that whenever a
//! later line reads a symbol an earlier line assigns. The fix is a temporary per clobbered
//! symbol: later reads are redirected to the temporary, and `temp = symbol` is emitted before
//! the clobbering line. The classic case is the swap `{a = b; b = a}`, which becomes
//! `{t = a; a = b; b = t}`.

use crate::dec_graph::{DecompiledCodeGraph, Line};
use crate::expr::NodeData;
use crate::symbol::{DecSymbol, DecSymbolData};

/// Expand the parallel lines of every block into the sequential list.
pub fn do_lines_expanding(graph: &mut DecompiledCodeGraph) {
    let blocks: Vec<_> = graph.all_blocks().collect();
    for block in blocks {
        if graph.block(block).removed {
            continue;
        }
        let par: Vec<Line> = core::mem::take(&mut graph.block_mut(block).par_lines);
        for (i, line) in par.iter().enumerate() {
            let dst_root = graph.exprs.top_root(line.dst);
            let dst_root = graph.exprs.resolve_mirrors(dst_root);
            let NodeData::Sym { symbol, size } = *graph.exprs.data(dst_root) else {
                graph.block_mut(block).seq_lines.push(*line);
                continue;
            };

            // Later lines reading the symbol we are about to clobber get a temporary.
            let mut temp: Option<DecSymbol> = None;
            for later in &par[i + 1..] {
                let later_src = graph.exprs.top_root(later.src);
                let reads = graph.exprs.gather_symbol_leaves(later_src, symbol);
                if reads.is_empty() {
                    continue;
                }
                let temp = *temp
                    .get_or_insert_with(|| graph.new_symbol(DecSymbolData::local(size)));
                for leaf in reads {
                    let temp_leaf = graph.exprs.sym(temp, size);
                    graph.exprs.replace_everywhere(leaf, temp_leaf);
                }
            }
            if let Some(temp) = temp {
                let temp_dst = graph.exprs.sym(temp, size);
                let old_value = graph.exprs.sym(symbol, size);
                graph.add_seq_line(block, temp_dst, old_value, None);
                log::trace!("expansion temp {temp} preserves {symbol} in {block}");
            }
            graph.block_mut(block).seq_lines.push(*line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declift_pcode::ComplexOffset;

    fn leaf_symbol(graph: &DecompiledCodeGraph, top: crate::expr::TopNode) -> DecSymbol {
        match graph.exprs.data(graph.exprs.top_root(top)) {
            NodeData::Sym { symbol, .. } => *symbol,
            other => panic!("expected symbol leaf, got {other:?}"),
        }
    }

    /// The swap `{a = b; b = a}` expands to `{t = a; a = b; b = t}`, and running the pass
    /// again leaves those three lines alone.
    #[test]
    fn swap() {
        let mut graph = DecompiledCodeGraph::new(declift_pcode::FuncGraph::from_u32(0));
        let block = graph.create_block(
            declift_pcode::Block::from_u32(0),
            ComplexOffset::new(0, 0),
            ComplexOffset::new(2, 0),
            1,
            true,
        );
        let a = graph.new_symbol(DecSymbolData::local(8));
        let b = graph.new_symbol(DecSymbolData::local(8));

        let dst_a = graph.exprs.sym(a, 8);
        let read_b = graph.exprs.sym(b, 8);
        graph.add_par_line(block, dst_a, read_b, None);
        let dst_b = graph.exprs.sym(b, 8);
        let read_a = graph.exprs.sym(a, 8);
        graph.add_par_line(block, dst_b, read_a, None);

        do_lines_expanding(&mut graph);

        let seq = graph.block(block).seq_lines.clone();
        assert_eq!(seq.len(), 3);
        assert!(graph.block(block).par_lines.is_empty());

        let t = leaf_symbol(&graph, seq[0].dst);
        assert_eq!(leaf_symbol(&graph, seq[0].src), a);
        assert_eq!(leaf_symbol(&graph, seq[1].dst), a);
        assert_eq!(leaf_symbol(&graph, seq[1].src), b);
        assert_eq!(leaf_symbol(&graph, seq[2].dst), b);
        assert_eq!(leaf_symbol(&graph, seq[2].src), t);
        assert_ne!(t, a);
        assert_ne!(t, b);

        do_lines_expanding(&mut graph);
        assert_eq!(graph.block(block).seq_lines.len(), 3);
    }

    /// A line whose right-hand side does not mention earlier destinations expands without
    /// temporaries.
    #[test]
    fn independent_lines_need_no_temp() {
        let mut graph = DecompiledCodeGraph::new(declift_pcode::FuncGraph::from_u32(0));
        let block = graph.create_block(
            declift_pcode::Block::from_u32(0),
            ComplexOffset::new(0, 0),
            ComplexOffset::new(2, 0),
            1,
            true,
        );
        let a = graph.new_symbol(DecSymbolData::local(8));
        let b = graph.new_symbol(DecSymbolData::local(8));

        let dst_a = graph.exprs.sym(a, 8);
        let one = graph.exprs.number(1, 8);
        graph.add_par_line(block, dst_a, one, None);
        let dst_b = graph.exprs.sym(b, 8);
        let two = graph.exprs.number(2, 8);
        graph.add_par_line(block, dst_b, two, None);

        do_lines_expanding(&mut graph);
        assert_eq!(graph.block(block).seq_lines.len(), 2);
    }
}
