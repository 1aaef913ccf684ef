//! Materialization of join variables as parallel assignment lines.
//!
//! The primary decompiler only records which contexts feed each join variable; the values
//! themselves must be read *after* the fixed point, when every contributing context holds its
//! final expressions. This pass requests the join variable's register from each recorded
//! context and emits `var = value` in that context's block. Join variables nothing reads are
//! skipped; emitting a line can introduce new reads, so the pass loops until dry.

use super::{collect_read_symbols, optimize_subtree};
use crate::dec_graph::{DecBlock, DecompiledCodeGraph};
use crate::expr::NodeData;
use crate::fx::FxHashSet;
use crate::symbol::DecSymbol;

fn has_assignment_to(graph: &DecompiledCodeGraph, block: DecBlock, symbol: DecSymbol) -> bool {
    let data = graph.block(block);
    data.par_lines.iter().chain(&data.seq_lines).any(|line| {
        let dst = graph.exprs.resolve_mirrors(graph.exprs.top_root(line.dst));
        matches!(graph.exprs.data(dst), NodeData::Sym { symbol: s, .. } if *s == symbol)
    })
}

/// Emit the parallel assignment lines for all live join variables.
pub fn do_create_parallel_assignments(graph: &mut DecompiledCodeGraph) {
    let mut emitted: FxHashSet<DecSymbol> = FxHashSet::default();
    loop {
        let used = collect_read_symbols(graph);
        let pending: Vec<_> = graph
            .join_vars
            .iter()
            .filter(|var| used.contains(&var.symbol) && !emitted.contains(&var.symbol))
            .cloned()
            .collect();
        if pending.is_empty() {
            break;
        }
        for var in pending {
            emitted.insert(var.symbol);
            for &ctx in &var.ctxs {
                let block = graph.exec.get(ctx).block;
                // Already materialized on an earlier run of the pass.
                if has_assignment_to(graph, block, var.symbol) {
                    continue;
                }
                let expr = graph.exec.get_mut(ctx).current.request_register(
                    var.register,
                    &mut graph.exprs,
                    ctx,
                );
                let expr = optimize_subtree(&mut graph.exprs, expr);
                // The context's value for the register is the join variable itself: nothing
                // to assign on this path.
                if let NodeData::Sym { symbol, .. } = graph.exprs.data(expr) {
                    if *symbol == var.symbol {
                        continue;
                    }
                }
                let dst = graph.exprs.sym(var.symbol, var.register.size);
                graph.add_par_line(block, dst, expr, None);
                log::trace!("par line {} = ... in {block}", var.symbol);
            }
        }
    }
}
