//! Removal of assignments nobody reads.
//!
//! The decompiled-graph analogue of dead-code elimination: liveness is per decompiler symbol
//! rather than per SSA value. A line is removable when its destination is a symbol with no read
//! anywhere in the graph, unless the symbol is a register output (the function's visible
//! result) or the right-hand side contains a call (an effect that must stay). Removing a line
//! can kill the last read of another symbol, so the pass iterates.

use crate::dec_graph::{DecompiledCodeGraph, Line};
use crate::expr::NodeData;
use crate::fx::FxHashSet;
use crate::symbol::{DecSymbol, DecSymbolKind};

/// Every symbol read somewhere in the graph: in a line source, inside a memory-write
/// destination, or in a block condition.
pub(crate) fn collect_read_symbols(graph: &DecompiledCodeGraph) -> FxHashSet<DecSymbol> {
    let mut used = FxHashSet::default();
    let mut record = |graph: &DecompiledCodeGraph, root| {
        graph.exprs.walk(root, &mut |n| {
            if let NodeData::Sym { symbol, .. } = graph.exprs.data(n) {
                used.insert(*symbol);
            }
        });
    };
    for block in graph.all_blocks() {
        let data = graph.block(block);
        if data.removed {
            continue;
        }
        for line in data.par_lines.iter().chain(&data.seq_lines) {
            record(graph, graph.exprs.top_root(line.src));
            // A destination that is not a plain symbol leaf (a memory write) reads whatever
            // its address expression mentions.
            let dst = graph.exprs.top_root(line.dst);
            let dst = graph.exprs.resolve_mirrors(dst);
            if !matches!(graph.exprs.data(dst), NodeData::Sym { .. }) {
                record(graph, dst);
            }
        }
        if let Some(cond) = data.condition.expand() {
            record(graph, graph.exprs.top_root(cond));
        }
    }
    used
}

/// Delete assignment lines whose target symbol has no further reads.
pub fn do_useless_line_removal(graph: &mut DecompiledCodeGraph) {
    loop {
        let used = collect_read_symbols(graph);
        let mut removed_any = false;
        let blocks: Vec<_> = graph.all_blocks().collect();
        for block in blocks {
            if graph.block(block).removed {
                continue;
            }
            let par: Vec<Line> = graph.block(block).par_lines.clone();
            let seq: Vec<Line> = graph.block(block).seq_lines.clone();
            let keep = |graph: &DecompiledCodeGraph, line: &Line| -> bool {
                let dst = graph.exprs.resolve_mirrors(graph.exprs.top_root(line.dst));
                let NodeData::Sym { symbol, .. } = graph.exprs.data(dst) else {
                    // Memory writes stay.
                    return true;
                };
                if graph.symbol_kind(*symbol) == DecSymbolKind::Register {
                    return true;
                }
                if used.contains(symbol) {
                    return true;
                }
                // The value is dead but the computation has effects.
                let src = graph.exprs.top_root(line.src);
                graph.exprs.contains_call(src)
            };
            let new_par: Vec<Line> = par.iter().filter(|l| keep(graph, l)).copied().collect();
            let new_seq: Vec<Line> = seq.iter().filter(|l| keep(graph, l)).copied().collect();
            if new_par.len() != par.len() || new_seq.len() != seq.len() {
                removed_any = true;
                log::trace!(
                    "removed {} dead lines in {block}",
                    par.len() + seq.len() - new_par.len() - new_seq.len()
                );
                graph.block_mut(block).par_lines = new_par;
                graph.block_mut(block).seq_lines = new_seq;
            }
        }
        if !removed_any {
            break;
        }
    }
}
