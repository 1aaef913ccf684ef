//! Memory optimization at the typed level.
//!
//! Within one block, the pass tracks which memory location each store wrote last and which
//! value each location is known to hold. A later read of a location with a known value is
//! replaced by that value (redundant-read elimination / store-to-load forwarding); a store
//! overwritten by a later store to the same location, with no intervening read of anything
//! overlapping and no call in between, is deleted. Calls invalidate everything: the callee may
//! read or write any memory the function can see.

use crate::dec_graph::Line;
use crate::expr::{Node, NodeData, TopNode};
use crate::fx::FxHashMap;
use crate::sda::SdaCodeGraph;

/// Which disjoint region a location lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemLocKind {
    /// Stack-pointer-relative.
    Stack,
    /// Absolute address in the image.
    Global,
}

/// A concrete memory location: region, byte offset, access width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemLocation {
    /// The region.
    pub kind: MemLocKind,
    /// Byte offset within the region.
    pub offset: i64,
    /// Access width in bytes.
    pub value_size: u8,
}

impl MemLocation {
    /// Do two locations touch any common byte?
    pub fn overlaps(&self, other: &MemLocation) -> bool {
        self.kind == other.kind
            && self.offset < other.offset + i64::from(other.value_size)
            && other.offset < self.offset + i64::from(self.value_size)
    }
}

fn location_of(sda: &SdaCodeGraph, node: Node, symbols: &dyn crate::environ::SymbolContext) -> Option<MemLocation> {
    if let NodeData::SdaMemSym {
        symbol,
        offset,
        addr_getting: false,
        size,
    } = *sda.graph.exprs.data(node)
    {
        let kind = match symbols.kind(symbol) {
            crate::environ::ProgSymbolKind::LocalStackVar => MemLocKind::Stack,
            crate::environ::ProgSymbolKind::GlobalVar => MemLocKind::Global,
            _ => return None,
        };
        return Some(MemLocation {
            kind,
            offset,
            value_size: size,
        });
    }
    None
}

/// Run memory optimization over every block.
pub fn do_memory_optimization(sda: &mut SdaCodeGraph, symbols: &dyn crate::environ::SymbolContext) {
    let blocks: Vec<_> = sda.graph.all_blocks().collect();
    for block in blocks {
        if sda.graph.block(block).removed {
            continue;
        }
        optimize_block(sda, block, symbols);
    }
}

fn optimize_block(
    sda: &mut SdaCodeGraph,
    block: crate::dec_graph::DecBlock,
    symbols: &dyn crate::environ::SymbolContext,
) {
    // Last store per location, with a flag set once anything overlapping was read.
    let mut last_store: FxHashMap<MemLocation, (usize, bool)> = FxHashMap::default();
    let mut known: FxHashMap<MemLocation, Node> = FxHashMap::default();
    let mut dead: Vec<usize> = Vec::new();

    let lines: Vec<Line> = sda.graph.block(block).seq_lines.clone();
    for (idx, line) in lines.iter().enumerate() {
        // Replace redundant reads in the source first.
        replace_known_reads(sda, line.src, &mut last_store, &known, symbols);

        let src_root = sda.graph.exprs.top_root(line.src);
        if sda.graph.exprs.contains_call(src_root) {
            last_store.clear();
            known.clear();
        }

        let dst_root = sda.graph.exprs.resolve_mirrors(sda.graph.exprs.top_root(line.dst));
        if let Some(loc) = location_of(sda, dst_root, symbols) {
            // A store. The previous store to the same location dies if nothing read it.
            if let Some(&(prev_idx, read_since)) = last_store.get(&loc) {
                if !read_since {
                    dead.push(prev_idx);
                    log::trace!("store at line {prev_idx} in {block} is overwritten");
                }
            }
            known.retain(|other, _| !other.overlaps(&loc));
            known.insert(loc, sda.graph.exprs.top_root(line.src));
            last_store.retain(|other, _| !other.overlaps(&loc));
            last_store.insert(loc, (idx, false));
        } else if !matches!(sda.graph.exprs.data(dst_root), NodeData::Sym { .. } | NodeData::SdaSym { .. }) {
            // A write through an unresolved address could touch anything.
            last_store.clear();
            known.clear();
        }
    }

    if !dead.is_empty() {
        let mut keep_idx = 0usize;
        sda.graph.block_mut(block).seq_lines.retain(|_| {
            let keep = !dead.contains(&keep_idx);
            keep_idx += 1;
            keep
        });
    }

    // Conditions read memory too.
    if let Some(cond) = sda.graph.block(block).condition.expand() {
        replace_known_reads(sda, cond, &mut last_store, &known, symbols);
    }
}

/// Replace reads of locations with known values inside the tree held by `top`, marking the
/// locations they overlap as read.
fn replace_known_reads(
    sda: &mut SdaCodeGraph,
    top: TopNode,
    last_store: &mut FxHashMap<MemLocation, (usize, bool)>,
    known: &FxHashMap<MemLocation, Node>,
    symbols: &dyn crate::environ::SymbolContext,
) {
    let root = sda.graph.exprs.top_root(top);

    // Mark overlapping stores as read, whether or not we replace the read.
    let mut reads: Vec<(Option<Node>, Node, MemLocation)> = Vec::new();
    collect_reads(sda, None, root, symbols, &mut reads);
    for (_, _, loc) in &reads {
        for (stored, entry) in last_store.iter_mut() {
            if stored.overlaps(loc) {
                entry.1 = true;
            }
        }
    }

    for (parent, read, loc) in reads {
        let Some(&value) = known.get(&loc) else {
            continue;
        };
        // Cheap values only: duplicating a large computation would trade a load for worse.
        if !sda.graph.exprs.children(value).is_empty() {
            continue;
        }
        let copy = sda.graph.exprs.clone_subtree(value);
        match parent {
            Some(parent) => sda.graph.exprs.replace_child(parent, read, copy),
            None => sda.graph.exprs.set_top_root(top, copy),
        }
        log::trace!("forwarded stored value into a read of {loc:?}");
    }
}

fn collect_reads(
    sda: &SdaCodeGraph,
    parent: Option<Node>,
    node: Node,
    symbols: &dyn crate::environ::SymbolContext,
    out: &mut Vec<(Option<Node>, Node, MemLocation)>,
) {
    if let Some(loc) = location_of(sda, node, symbols) {
        out.push((parent, node, loc));
        return;
    }
    for child in sda.graph.exprs.children(node) {
        collect_reads(sda, Some(node), child, symbols, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap() {
        let a = MemLocation {
            kind: MemLocKind::Stack,
            offset: 8,
            value_size: 8,
        };
        let b = MemLocation {
            kind: MemLocKind::Stack,
            offset: 12,
            value_size: 4,
        };
        let c = MemLocation {
            kind: MemLocKind::Stack,
            offset: 16,
            value_size: 4,
        };
        let g = MemLocation {
            kind: MemLocKind::Global,
            offset: 8,
            value_size: 8,
        };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&g));
    }
}
