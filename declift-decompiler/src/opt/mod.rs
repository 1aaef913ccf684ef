//! The optimization pipeline over the decompiled graph.
//!
//! The passes run in a fixed order, each seeing the full output of the previous; block identity
//! is never invalidated, only expressions and line lists change. A pass that finds the graph in
//! an inconsistent state logs and leaves it alone rather than propagating an error.

mod cond_blocks;
mod debug;
mod exprs;
mod lines_expanding;
mod order_fixing;
mod par_assignments;
mod useless_lines;
mod view;

pub use self::cond_blocks::do_condition_block_optimization;
pub use self::debug::do_debug_processing;
pub use self::exprs::do_expr_optimization;
pub use self::lines_expanding::do_lines_expanding;
pub use self::order_fixing::do_order_fixing;
pub use self::par_assignments::do_create_parallel_assignments;
pub use self::useless_lines::do_useless_line_removal;
pub use self::view::do_view_optimization;

pub(crate) use self::exprs::optimize_subtree;
pub(crate) use self::useless_lines::collect_read_symbols;

use crate::dec_graph::DecompiledCodeGraph;
use crate::session::{Config, PassFlags};

/// Run the configured sub-passes in pipeline order.
pub fn run_pipeline(graph: &mut DecompiledCodeGraph, config: &Config) {
    let passes = config.passes;
    let mut step = |name: &str, enabled: bool, f: &mut dyn FnMut(&mut DecompiledCodeGraph)| {
        if !enabled {
            return;
        }
        log::debug!("pass {name}");
        f(graph);
        if graph.verify_integrity().is_err() {
            log::warn!("pass {name} left the graph inconsistent");
        }
    };

    step(
        "condition-blocks",
        passes.contains(PassFlags::CONDITION_BLOCKS),
        &mut do_condition_block_optimization,
    );
    step(
        "expressions",
        passes.contains(PassFlags::EXPRESSIONS),
        &mut do_expr_optimization,
    );
    step(
        "parallel-assignments",
        passes.contains(PassFlags::PARALLEL_ASSIGNMENTS),
        &mut do_create_parallel_assignments,
    );
    step(
        "order-fixing",
        passes.contains(PassFlags::ORDER_FIXING),
        &mut do_order_fixing,
    );
    step(
        "view",
        passes.contains(PassFlags::VIEW),
        &mut do_view_optimization,
    );
    step(
        "debug-pre",
        config.debug_processing && passes.contains(PassFlags::DEBUG_PROCESSING),
        &mut do_debug_processing,
    );
    step(
        "line-expansion",
        passes.contains(PassFlags::LINE_EXPANSION),
        &mut do_lines_expanding,
    );
    step(
        "useless-lines",
        passes.contains(PassFlags::USELESS_LINES),
        &mut do_useless_line_removal,
    );
    step(
        "debug-post",
        config.debug_processing && passes.contains(PassFlags::DEBUG_PROCESSING),
        &mut do_debug_processing,
    );
}
