//! Debug processing: annotate line and condition roots with their originating instruction.
//!
//! The annotations are mirror nodes, transparent to hashing and to every other pass, so running
//! this twice (before and after line expansion, as the pipeline does) and re-running the
//! pipeline changes nothing semantically. The debugger uses the offsets for stepping.

use crate::dec_graph::DecompiledCodeGraph;
use crate::expr::NodeData;

/// Wrap every line and condition root that knows its originating instruction.
pub fn do_debug_processing(graph: &mut DecompiledCodeGraph) {
    let blocks: Vec<_> = graph.all_blocks().collect();
    for block in blocks {
        if graph.block(block).removed {
            continue;
        }
        let mut work: Vec<_> = Vec::new();
        for line in graph.block(block).par_lines.iter().chain(&graph.block(block).seq_lines) {
            if let Some(origin) = line.origin {
                work.push((line.src, origin));
            }
        }
        if let Some(cond) = graph.block(block).condition.expand() {
            if let Some(origin) = graph.block(block).cond_origin {
                work.push((cond, origin));
            }
        }
        for (top, origin) in work {
            let root = graph.exprs.top_root(top);
            // Already annotated on an earlier run.
            if matches!(graph.exprs.data(root), NodeData::Mirror { .. }) {
                continue;
            }
            let mirror = graph.exprs.make(NodeData::Mirror {
                target: root,
                offset: origin,
            });
            graph.exprs.set_top_root(top, mirror);
        }
    }
}
