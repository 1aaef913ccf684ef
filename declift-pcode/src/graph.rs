//! The image-wide PCode graph: instructions, basic blocks, and per-function subgraphs.
//!
//! All three entity spaces live in arenas owned by [`ImagePCodeGraph`] and are referenced by
//! index; ordered `BTreeMap` side tables key them by offset for the interval lookups the host
//! performs. The graph is populated once by the builder and treated as immutable afterwards,
//! except for the virtual-call edges the symbolization pass discovers late.

use crate::instruction::{Instruction, Opcode};
use crate::offset::ComplexOffset;
use declift_entity::{entity_impl, PackedOption, PrimaryMap};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// An opaque reference to a PCode instruction in the image's pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a PCode basic block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to a function's PCode subgraph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncGraph(u32);
entity_impl!(FuncGraph, "func");

/// Errors raised by graph lookups and construction.
///
/// These are the fatal graph-structure failures: the current function cannot be decompiled and
/// the pipeline reports the offending offset.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// No block covers the given offset.
    #[error("no block at offset {0:#x}")]
    BlockNotFound(u64),
    /// No function graph covers the given offset.
    #[error("no function graph at offset {0:#x}")]
    FuncGraphNotFound(u64),
    /// A block names a successor offset that no block starts at.
    #[error("block at {block:#x} has a dangling successor {target:#x}")]
    DanglingSuccessor {
        /// Minimum offset of the block with the bad edge.
        block: u64,
        /// The offset the edge points at.
        target: u64,
    },
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// A non-branching basic block of PCode instructions.
///
/// `next_far` is the taken side of a conditional branch (or the target of an unconditional
/// one); `next_near` is the fall-through side. If `next_far` is set, the last instruction is a
/// BRANCH or CBRANCH.
pub struct BlockData {
    /// Lowest offset covered by the block.
    pub min_offset: ComplexOffset,
    /// End offset of the block (exclusive end of its last machine instruction).
    pub max_offset: ComplexOffset,
    /// Instructions in program order.
    pub instructions: Vec<Inst>,
    /// Fall-through successor.
    pub next_near: PackedOption<Block>,
    /// Branch-taken successor.
    pub next_far: PackedOption<Block>,
    /// Blocks holding an edge into this one.
    pub predecessors: SmallVec<[Block; 2]>,
    /// Longest back-edge-free distance from the function's start block, starting at 1.
    /// An edge from a higher to a lower or equal level is a loop edge.
    pub level: u32,
    /// The function subgraph this block was claimed by.
    pub func: PackedOption<FuncGraph>,
}

impl BlockData {
    fn new(min_offset: ComplexOffset, max_offset: ComplexOffset) -> Self {
        Self {
            min_offset,
            max_offset,
            instructions: Vec::new(),
            next_near: None.into(),
            next_far: None.into(),
            predecessors: SmallVec::new(),
            level: 0,
            func: None.into(),
        }
    }

    /// Both successors, fall-through edge first, skipping absent ones.
    pub fn successors(&self) -> SmallVec<[Block; 2]> {
        self.next_near
            .expand()
            .into_iter()
            .chain(self.next_far.expand())
            .collect()
    }

    /// The last instruction of the block, if any.
    pub fn last_instruction(&self) -> Option<Inst> {
        self.instructions.last().copied()
    }

    /// Does the block have no successors at all?
    pub fn is_end(&self) -> bool {
        self.next_near.is_none() && self.next_far.is_none()
    }
}

/// The PCode subgraph of a single function.
pub struct FuncGraphData {
    /// The entry block.
    pub start_block: PackedOption<Block>,
    /// All blocks claimed by this function, in ascending offset order.
    pub blocks: Vec<Block>,
    /// Functions known to call this one.
    pub callers: BTreeSet<FuncGraph>,
    /// Resolved direct (non-virtual) callees.
    pub non_virt_calls: BTreeSet<FuncGraph>,
    /// Call sites whose target could not be resolved; candidates for virtual-call inference.
    pub unresolved_calls: Vec<Inst>,
    /// Callees inferred late through the virtual-call registry.
    pub virt_calls: BTreeSet<FuncGraph>,
    /// Concrete integer values known for individual instructions from simple constant folding.
    /// Used only to resolve indirect call and branch targets.
    pub const_values: FxHashMap<Inst, u64>,
}

impl FuncGraphData {
    fn new() -> Self {
        Self {
            start_block: None.into(),
            blocks: Vec::new(),
            callers: BTreeSet::new(),
            non_virt_calls: BTreeSet::new(),
            unresolved_calls: Vec::new(),
            virt_calls: BTreeSet::new(),
            const_values: FxHashMap::default(),
        }
    }

    /// A head function has no known caller within the image.
    pub fn is_head(&self) -> bool {
        self.callers.is_empty()
    }
}

/// The PCode graph of a whole image: instruction pool, block arena, and the function subgraphs
/// over them.
pub struct ImagePCodeGraph {
    insts: PrimaryMap<Inst, Instruction>,
    inst_index: BTreeMap<ComplexOffset, Inst>,
    blocks: PrimaryMap<Block, BlockData>,
    block_index: BTreeMap<ComplexOffset, Block>,
    func_graphs: PrimaryMap<FuncGraph, FuncGraphData>,
    func_index: BTreeMap<ComplexOffset, FuncGraph>,
    head_funcs: Vec<FuncGraph>,
}

impl ImagePCodeGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            insts: PrimaryMap::new(),
            inst_index: BTreeMap::new(),
            blocks: PrimaryMap::new(),
            block_index: BTreeMap::new(),
            func_graphs: PrimaryMap::new(),
            func_index: BTreeMap::new(),
            head_funcs: Vec::new(),
        }
    }

    /// Add a decoded instruction to the pool.
    pub fn add_instruction(&mut self, instruction: Instruction) -> Inst {
        let offset = instruction.offset;
        let inst = self.insts.push(instruction);
        let prev = self.inst_index.insert(offset, inst);
        debug_assert!(prev.is_none(), "duplicate instruction at {offset}");
        inst
    }

    /// Look up an instruction.
    pub fn inst(&self, inst: Inst) -> &Instruction {
        &self.insts[inst]
    }

    /// Find the instruction at an exact complex offset.
    pub fn get_instruction_at(&self, offset: ComplexOffset) -> Option<Inst> {
        self.inst_index.get(&offset).copied()
    }

    /// Number of instructions in the pool.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Iterate over the whole pool in ascending offset order.
    pub fn insts_in_order(&self) -> impl Iterator<Item = Inst> + '_ {
        self.inst_index.values().copied()
    }

    /// Create a new block spanning `[min_offset, max_offset)`.
    pub fn create_block(&mut self, min_offset: ComplexOffset, max_offset: ComplexOffset) -> Block {
        let block = self.blocks.push(BlockData::new(min_offset, max_offset));
        let prev = self.block_index.insert(min_offset, block);
        debug_assert!(prev.is_none(), "duplicate block at {min_offset}");
        block
    }

    /// Look up a block's data.
    pub fn block(&self, block: Block) -> &BlockData {
        &self.blocks[block]
    }

    /// Look up a block's data, mutable edition. Reserved for the builder.
    pub(crate) fn block_mut(&mut self, block: Block) -> &mut BlockData {
        &mut self.blocks[block]
    }

    /// Iterate over all blocks in ascending offset order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.block_index.values().copied()
    }

    /// Find the block whose interval covers `offset`.
    ///
    /// With `half_open`, the block's interval is `[min, max)`; otherwise `[min, max]`, which is
    /// what callers mapping the last byte of an instruction back to its block want.
    pub fn get_block_at(&self, offset: ComplexOffset, half_open: bool) -> GraphResult<Block> {
        let (_, &block) = self
            .block_index
            .range(..=offset)
            .next_back()
            .ok_or(GraphError::BlockNotFound(offset.byte_offset()))?;
        let data = &self.blocks[block];
        let inside = if half_open {
            offset < data.max_offset
        } else {
            offset <= data.max_offset
        };
        if inside {
            Ok(block)
        } else {
            Err(GraphError::BlockNotFound(offset.byte_offset()))
        }
    }

    /// Find the block starting exactly at `offset`, if any.
    pub fn block_starting_at(&self, offset: ComplexOffset) -> Option<Block> {
        self.block_index.get(&offset).copied()
    }

    /// Create a new, empty function graph.
    pub fn create_func_graph(&mut self) -> FuncGraph {
        self.func_graphs.push(FuncGraphData::new())
    }

    /// Look up a function graph's data.
    pub fn func_graph(&self, func: FuncGraph) -> &FuncGraphData {
        &self.func_graphs[func]
    }

    /// Look up a function graph's data, mutable edition.
    pub fn func_graph_mut(&mut self, func: FuncGraph) -> &mut FuncGraphData {
        &mut self.func_graphs[func]
    }

    /// Iterate over all function graphs in creation order.
    pub fn func_graphs(&self) -> impl Iterator<Item = FuncGraph> + '_ {
        self.func_graphs.keys()
    }

    /// Find the function graph owning the block that covers `offset`.
    pub fn get_func_graph_at(&self, offset: ComplexOffset, half_open: bool) -> GraphResult<FuncGraph> {
        let block = self
            .get_block_at(offset, half_open)
            .map_err(|_| GraphError::FuncGraphNotFound(offset.byte_offset()))?;
        self.blocks[block]
            .func
            .expand()
            .ok_or(GraphError::FuncGraphNotFound(offset.byte_offset()))
    }

    /// Find the function graph starting exactly at `offset`, if any.
    pub fn func_graph_starting_at(&self, offset: ComplexOffset) -> Option<FuncGraph> {
        self.func_index.get(&offset).copied()
    }

    /// Record `start` as the start block of `func` and index the function by its offset.
    pub fn set_start_block(&mut self, func: FuncGraph, start: Block) {
        let offset = self.blocks[start].min_offset;
        self.func_graphs[func].start_block = start.into();
        match self.func_index.entry(offset) {
            Entry::Vacant(e) => {
                e.insert(func);
            }
            Entry::Occupied(_) => {
                debug_assert!(false, "two function graphs starting at {offset}");
            }
        }
    }

    /// Set the fall-through successor of `block`, maintaining predecessor lists.
    pub fn set_next_near(&mut self, block: Block, next: Block) {
        self.unlink_successor(block, self.blocks[block].next_near.expand());
        self.blocks[block].next_near = next.into();
        self.blocks[next].predecessors.push(block);
    }

    /// Set the branch-taken successor of `block`, maintaining predecessor lists.
    pub fn set_next_far(&mut self, block: Block, next: Block) {
        self.unlink_successor(block, self.blocks[block].next_far.expand());
        self.blocks[block].next_far = next.into();
        self.blocks[next].predecessors.push(block);
    }

    /// Remove one successor edge of `block`.
    pub fn remove_next_block(&mut self, block: Block, next: Block) {
        if self.blocks[block].next_near.expand() == Some(next) {
            self.blocks[block].next_near = None.into();
            self.unlink_predecessor(next, block);
        }
        if self.blocks[block].next_far.expand() == Some(next) {
            self.blocks[block].next_far = None.into();
            self.unlink_predecessor(next, block);
        }
    }

    /// Disconnect `block` from all of its neighbours.
    pub fn disconnect(&mut self, block: Block) {
        for succ in self.blocks[block].successors() {
            self.remove_next_block(block, succ);
        }
        let preds: SmallVec<[Block; 2]> = self.blocks[block].predecessors.clone();
        for pred in preds {
            self.remove_next_block(pred, block);
        }
    }

    fn unlink_successor(&mut self, block: Block, old: Option<Block>) {
        if let Some(old) = old {
            self.unlink_predecessor(old, block);
        }
    }

    fn unlink_predecessor(&mut self, block: Block, pred: Block) {
        let preds = &mut self.blocks[block].predecessors;
        if let Some(pos) = preds.iter().position(|&b| b == pred) {
            preds.remove(pos);
        }
    }

    /// Record a resolved direct call edge between two function graphs.
    pub fn add_non_virt_call(&mut self, caller: FuncGraph, callee: FuncGraph) {
        self.func_graphs[caller].non_virt_calls.insert(callee);
        self.func_graphs[callee].callers.insert(caller);
    }

    /// Record a virtual call edge inferred after graph construction.
    pub fn add_virt_call(&mut self, caller: FuncGraph, callee: FuncGraph) {
        self.func_graphs[caller].virt_calls.insert(callee);
        self.func_graphs[callee].callers.insert(caller);
    }

    /// Enumerate all function graphs and remember those not targeted by any call edge.
    pub fn fill_head_func_graphs(&mut self) {
        self.head_funcs = self
            .func_graphs
            .keys()
            .filter(|&f| self.func_graphs[f].is_head())
            .collect();
    }

    /// The head functions found by [`Self::fill_head_func_graphs`].
    pub fn head_func_graphs(&self) -> &[FuncGraph] {
        &self.head_funcs
    }

    /// The entry function graph: the first head function, if any.
    pub fn entry_func_graph(&self) -> Option<FuncGraph> {
        self.head_funcs.first().copied()
    }

    /// Check that every block of `func` that ends in a direct branch has the matching successor
    /// edge. Returns the first dangling edge found.
    pub fn verify_func_graph(&self, func: FuncGraph) -> GraphResult<()> {
        for &block in &self.func_graphs[func].blocks {
            let data = &self.blocks[block];
            let Some(last) = data.last_instruction() else {
                continue;
            };
            let instr = &self.insts[last];
            if let Some(target) = instr.constant_target() {
                if instr.opcode != Opcode::Call && data.next_far.is_none() {
                    return Err(GraphError::DanglingSuccessor {
                        block: data.min_offset.byte_offset(),
                        target,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for ImagePCodeGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn off(byte: u64) -> ComplexOffset {
        ComplexOffset::new(byte, 0)
    }

    #[test]
    fn interval_lookup() {
        let mut graph = ImagePCodeGraph::new();
        let b0 = graph.create_block(off(0x100), off(0x110));
        let b1 = graph.create_block(off(0x110), off(0x118));

        assert_eq!(graph.get_block_at(off(0x100), true), Ok(b0));
        assert_eq!(graph.get_block_at(off(0x10f), true), Ok(b0));
        assert_eq!(graph.get_block_at(off(0x110), true), Ok(b1));
        // Closed interval admits the end offset.
        assert_eq!(graph.get_block_at(off(0x110), false), Ok(b0));
        assert_eq!(
            graph.get_block_at(off(0x200), true),
            Err(GraphError::BlockNotFound(0x200))
        );
        assert_eq!(
            graph.get_block_at(off(0x50), true),
            Err(GraphError::BlockNotFound(0x50))
        );
    }

    #[test]
    fn edges_maintain_predecessors() {
        let mut graph = ImagePCodeGraph::new();
        let b0 = graph.create_block(off(0x100), off(0x110));
        let b1 = graph.create_block(off(0x110), off(0x118));
        let b2 = graph.create_block(off(0x118), off(0x120));

        graph.set_next_near(b0, b1);
        graph.set_next_far(b0, b2);
        assert_eq!(graph.block(b1).predecessors.as_slice(), &[b0]);
        assert_eq!(graph.block(b2).predecessors.as_slice(), &[b0]);

        graph.remove_next_block(b0, b1);
        assert!(graph.block(b1).predecessors.is_empty());
        assert!(graph.block(b0).next_near.is_none());

        graph.disconnect(b2);
        assert!(graph.block(b0).next_far.is_none());
        assert!(graph.block(b2).predecessors.is_empty());
    }

    #[test]
    fn head_functions() {
        let mut graph = ImagePCodeGraph::new();
        let f0 = graph.create_func_graph();
        let f1 = graph.create_func_graph();
        graph.add_non_virt_call(f0, f1);
        graph.fill_head_func_graphs();
        assert_eq!(graph.head_func_graphs(), &[f0]);
        assert_eq!(graph.entry_func_graph(), Some(f0));
        assert!(graph.func_graph(f1).callers.contains(&f0));
    }
}
