//! Semantic data analysis: binding program symbols and data types to the decompiled graph.
//!
//! Symbolization rewrites leaves into their `Sda*` variants bound to program symbols resolved
//! through the host's symbol context; type calculation then reconciles data types across the
//! graph to a fixed point, inserting implicit casts where sides disagree. The SDA optimizations
//! clean up at the typed level: duplicate memory reads collapse, overwritten stores and unread
//! assignments disappear.

mod building;
mod memory_opt;
mod type_calc;
mod useless;

pub use self::building::do_sda_building;
pub use self::memory_opt::{do_memory_optimization, MemLocKind, MemLocation};
pub use self::type_calc::do_type_calculation;
pub use self::useless::do_sda_useless_line_removal;

use crate::dec_graph::DecompiledCodeGraph;
use crate::environ::{ProgSymbol, TypeId};
use crate::expr::Node;
use crate::fx::FxHashMap;
use crate::symbol::DecSymbol;
use declift_entity::{PackedOption, SecondaryMap};

/// The data types attached to one node.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeTypes {
    /// The type from the bound program symbol, where the node has one.
    pub src: PackedOption<TypeId>,
    /// The locally calculated type.
    pub calc: PackedOption<TypeId>,
}

/// A non-fatal disagreement recorded during type calculation.
#[derive(Clone, Copy, Debug)]
pub struct TypeDiagnostic {
    /// The node an implicit cast was inserted under.
    pub node: Node,
    /// The type the context wanted.
    pub expected: TypeId,
    /// The type the child produced.
    pub found: TypeId,
}

/// The decompiled graph plus everything symbolization attached to it.
pub struct SdaCodeGraph {
    /// The underlying decompiled graph; SDA rewrites its nodes in place.
    pub graph: DecompiledCodeGraph,
    /// Per-node data types.
    pub types: SecondaryMap<Node, NodeTypes>,
    /// Program symbol bound to each decompiler symbol.
    pub dec_to_prog: FxHashMap<DecSymbol, ProgSymbol>,
    /// Type conflicts resolved by implicit casts.
    pub diagnostics: Vec<TypeDiagnostic>,
}

impl SdaCodeGraph {
    /// Wrap a decompiled graph for symbolization.
    pub fn new(graph: DecompiledCodeGraph) -> Self {
        Self {
            graph,
            types: SecondaryMap::new(),
            dec_to_prog: FxHashMap::default(),
            diagnostics: Vec::new(),
        }
    }

    /// The calculated type of a node, if one has been assigned.
    pub fn calc_type(&self, node: Node) -> Option<TypeId> {
        self.types[node].calc.expand()
    }
}
