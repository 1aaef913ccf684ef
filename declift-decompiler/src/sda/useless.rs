//! Useless-line removal at the typed level.
//!
//! The SDA-aware counterpart of the decompiled-graph pass: liveness is per program symbol, and
//! effects decide what must stay. Calls always stay. Writes to globals stay (visible outside
//! the function). Writes to stack and register locals whose symbol is never read anywhere in
//! the graph go away.

use crate::dec_graph::{DecompiledCodeGraph, Line};
use crate::environ::{ProgSymbol, ProgSymbolKind, SymbolContext};
use crate::expr::NodeData;
use crate::fx::FxHashSet;
use crate::sda::SdaCodeGraph;

/// Every program symbol read somewhere in the graph.
fn collect_read_prog_symbols(graph: &DecompiledCodeGraph) -> FxHashSet<ProgSymbol> {
    let mut used = FxHashSet::default();
    let mut record = |graph: &DecompiledCodeGraph, root| {
        graph.exprs.walk(root, &mut |n| match graph.exprs.data(n) {
            NodeData::SdaSym { symbol, .. } => {
                used.insert(*symbol);
            }
            NodeData::SdaMemSym { symbol, .. } => {
                used.insert(*symbol);
            }
            _ => {}
        });
    };
    for block in graph.all_blocks() {
        let data = graph.block(block);
        if data.removed {
            continue;
        }
        for line in data.par_lines.iter().chain(&data.seq_lines) {
            record(graph, graph.exprs.top_root(line.src));
            let dst = graph.exprs.resolve_mirrors(graph.exprs.top_root(line.dst));
            // Address arithmetic inside a memory destination is a read of what it mentions.
            for child in graph.exprs.children(dst) {
                record(graph, child);
            }
        }
        if let Some(cond) = data.condition.expand() {
            record(graph, graph.exprs.top_root(cond));
        }
    }
    used
}

/// Delete typed assignment lines nobody reads and nothing observes.
pub fn do_sda_useless_line_removal(sda: &mut SdaCodeGraph, symbols: &dyn SymbolContext) {
    loop {
        let used = collect_read_prog_symbols(&sda.graph);
        let mut removed_any = false;
        let blocks: Vec<_> = sda.graph.all_blocks().collect();
        for block in blocks {
            if sda.graph.block(block).removed {
                continue;
            }
            let keep = |graph: &DecompiledCodeGraph, line: &Line| -> bool {
                let src = graph.exprs.top_root(line.src);
                if graph.exprs.contains_call(src) {
                    return true;
                }
                let dst = graph.exprs.resolve_mirrors(graph.exprs.top_root(line.dst));
                let symbol = match graph.exprs.data(dst) {
                    NodeData::SdaSym { symbol, dec, .. } => {
                        // Register outputs are the function's visible result.
                        if let Some(dec) = dec.expand() {
                            if graph.symbol_kind(dec) == crate::symbol::DecSymbolKind::Register {
                                return true;
                            }
                        }
                        *symbol
                    }
                    NodeData::SdaMemSym {
                        symbol,
                        addr_getting: false,
                        ..
                    } => *symbol,
                    // Anything else (raw symbols, unresolved memory writes) stays.
                    _ => return true,
                };
                if used.contains(&symbol) {
                    return true;
                }
                // Only invisible storage may be dropped.
                matches!(
                    symbols.kind(symbol),
                    ProgSymbolKind::GlobalVar | ProgSymbolKind::Function | ProgSymbolKind::VTableEntry
                )
            };
            let par: Vec<Line> = sda.graph.block(block).par_lines.clone();
            let seq: Vec<Line> = sda.graph.block(block).seq_lines.clone();
            let new_par: Vec<Line> = par.iter().filter(|l| keep(&sda.graph, l)).copied().collect();
            let new_seq: Vec<Line> = seq.iter().filter(|l| keep(&sda.graph, l)).copied().collect();
            if new_par.len() != par.len() || new_seq.len() != seq.len() {
                removed_any = true;
                sda.graph.block_mut(block).par_lines = new_par;
                sda.graph.block_mut(block).seq_lines = new_seq;
            }
        }
        if !removed_any {
            break;
        }
    }
}
