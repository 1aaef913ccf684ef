//! The high-level control-flow graph produced by the primary decompiler.
//!
//! Each PCode block gets one [`DecBlock`] carrying assignment lines and an optional terminating
//! condition. The graph owns everything a decompilation produces: the blocks, the expression
//! pool, the decompiler symbols, the exec contexts, and the ledger of join variables the
//! parallel-assignment pass materializes later. Dropping the graph frees all of it at once.

use crate::error::{DecompileError, DecompileResult};
use crate::exec_context::{ExecContextTable, JoinVar};
use crate::expr::{ExprPool, Node, NodeData, TopNode};
use crate::fx::FxHashMap;
use crate::symbol::{DecSymbol, DecSymbolData, DecSymbolKind};
use declift_entity::{entity_impl, PackedOption, PrimaryMap};
use declift_pcode::{self as pcode, ComplexOffset, Register};
use smallvec::SmallVec;

/// An opaque reference to a decompiled block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecBlock(u32);
entity_impl!(DecBlock, "dec");

/// One assignment line: `dst = src`.
///
/// Both sides are held through top handles so substitutions made by the optimization passes stay
/// visible to the line.
#[derive(Clone, Copy, Debug)]
pub struct Line {
    /// The assigned symbol (or memory lvalue).
    pub dst: TopNode,
    /// The assigned expression.
    pub src: TopNode,
    /// The instruction this line was interpreted from, when it has one.
    pub origin: Option<ComplexOffset>,
}

/// Contents of one decompiled block.
pub struct DecBlockData {
    /// The PCode block this one mirrors.
    pub pcode_block: pcode::Block,
    /// Copied from the PCode block: lowest covered offset.
    pub min_offset: ComplexOffset,
    /// Copied from the PCode block: end offset.
    pub max_offset: ComplexOffset,
    /// Copied from the PCode block's loop analysis.
    pub level: u32,
    /// Longest path to an end block, computed by [`DecompiledCodeGraph::calculate_heights`].
    pub height: u32,
    /// Fall-through successor.
    pub next_near: PackedOption<DecBlock>,
    /// Branch-taken successor.
    pub next_far: PackedOption<DecBlock>,
    /// Blocks with an edge into this one.
    pub predecessors: SmallVec<[DecBlock; 2]>,
    /// Conceptually simultaneous assignments at the end of the block.
    pub par_lines: Vec<Line>,
    /// Ordered assignments.
    pub seq_lines: Vec<Line>,
    /// The branch condition; taking the far edge means the condition held.
    pub condition: PackedOption<TopNode>,
    /// The instruction the condition was interpreted from.
    pub cond_origin: Option<ComplexOffset>,
    /// The block has no successors (it ends the function).
    pub is_end: bool,
    /// Folded away by condition-block optimization.
    pub removed: bool,
}

impl DecBlockData {
    /// Successors in near/far order, absent edges skipped.
    pub fn successors(&self) -> SmallVec<[DecBlock; 2]> {
        self.next_near
            .expand()
            .into_iter()
            .chain(self.next_far.expand())
            .collect()
    }
}

/// The decompiled graph of one function, owner of all per-function state.
pub struct DecompiledCodeGraph {
    /// The PCode function this graph was decompiled from.
    pub func: pcode::FuncGraph,
    blocks: PrimaryMap<DecBlock, DecBlockData>,
    order: Vec<DecBlock>,
    by_pcode: FxHashMap<pcode::Block, DecBlock>,
    /// The expression arena.
    pub exprs: ExprPool,
    symbols: PrimaryMap<DecSymbol, DecSymbolData>,
    register_outs: FxHashMap<Register, DecSymbol>,
    /// Exec contexts, one per block, kept alive for the passes that re-request registers.
    pub exec: ExecContextTable,
    /// Join variables created at control-flow merges, materialized by the
    /// parallel-assignment pass.
    pub join_vars: Vec<JoinVar>,
    /// Set when the loop fixed point was cut short by the configured cap.
    pub may_be_imprecise: bool,
}

impl DecompiledCodeGraph {
    /// Create an empty graph for `func`.
    pub fn new(func: pcode::FuncGraph) -> Self {
        Self {
            func,
            blocks: PrimaryMap::new(),
            order: Vec::new(),
            by_pcode: FxHashMap::default(),
            exprs: ExprPool::new(),
            symbols: PrimaryMap::new(),
            register_outs: FxHashMap::default(),
            exec: ExecContextTable::new(),
            join_vars: Vec::new(),
            may_be_imprecise: false,
        }
    }

    /// Create the block mirroring `pcode_block`.
    pub fn create_block(
        &mut self,
        pcode_block: pcode::Block,
        min_offset: ComplexOffset,
        max_offset: ComplexOffset,
        level: u32,
        is_end: bool,
    ) -> DecBlock {
        let block = self.blocks.push(DecBlockData {
            pcode_block,
            min_offset,
            max_offset,
            level,
            height: 0,
            next_near: None.into(),
            next_far: None.into(),
            predecessors: SmallVec::new(),
            par_lines: Vec::new(),
            seq_lines: Vec::new(),
            condition: None.into(),
            cond_origin: None,
            is_end,
            removed: false,
        });
        self.by_pcode.insert(pcode_block, block);
        block
    }

    /// A block's contents.
    pub fn block(&self, block: DecBlock) -> &DecBlockData {
        &self.blocks[block]
    }

    /// A block's contents, mutable edition.
    pub fn block_mut(&mut self, block: DecBlock) -> &mut DecBlockData {
        &mut self.blocks[block]
    }

    /// The decompiled block mirroring a PCode block.
    pub fn dec_block_of(&self, pcode_block: pcode::Block) -> Option<DecBlock> {
        self.by_pcode.get(&pcode_block).copied()
    }

    /// All blocks ever created, including removed ones.
    pub fn all_blocks(&self) -> impl DoubleEndedIterator<Item = DecBlock> + '_ {
        self.blocks.keys()
    }

    /// Blocks in level order, skipping removed ones. Valid after
    /// [`Self::sort_blocks_by_level`].
    pub fn blocks_in_order(&self) -> impl Iterator<Item = DecBlock> + '_ {
        self.order
            .iter()
            .copied()
            .filter(move |&b| !self.blocks[b].removed)
    }

    /// Wire `near` as the fall-through successor of `block`.
    pub fn set_next_near(&mut self, block: DecBlock, near: DecBlock) {
        self.unlink(block, self.blocks[block].next_near.expand());
        self.blocks[block].next_near = near.into();
        self.blocks[near].predecessors.push(block);
    }

    /// Wire `far` as the branch-taken successor of `block`.
    pub fn set_next_far(&mut self, block: DecBlock, far: DecBlock) {
        self.unlink(block, self.blocks[block].next_far.expand());
        self.blocks[block].next_far = far.into();
        self.blocks[far].predecessors.push(block);
    }

    fn unlink(&mut self, block: DecBlock, old: Option<DecBlock>) {
        if let Some(old) = old {
            let preds = &mut self.blocks[old].predecessors;
            if let Some(pos) = preds.iter().position(|&b| b == block) {
                preds.remove(pos);
            }
        }
    }

    /// Allocate a decompiler symbol.
    pub fn new_symbol(&mut self, data: DecSymbolData) -> DecSymbol {
        self.symbols.push(data)
    }

    /// A symbol's definition.
    pub fn symbol(&self, symbol: DecSymbol) -> &DecSymbolData {
        &self.symbols[symbol]
    }

    /// All symbols in allocation order.
    pub fn symbols(&self) -> impl Iterator<Item = DecSymbol> + '_ {
        self.symbols.keys()
    }

    /// The interned symbol standing for `register`'s value at a function exit.
    pub fn register_out_symbol(&mut self, register: Register) -> DecSymbol {
        if let Some(&symbol) = self.register_outs.get(&register) {
            return symbol;
        }
        let symbol = self.symbols.push(DecSymbolData::register_out(register));
        self.register_outs.insert(register, symbol);
        symbol
    }

    /// Append a parallel assignment line to `block`.
    pub fn add_par_line(
        &mut self,
        block: DecBlock,
        dst: Node,
        src: Node,
        origin: Option<ComplexOffset>,
    ) {
        let dst = self.exprs.make_top(dst);
        let src = self.exprs.make_top(src);
        self.blocks[block].par_lines.push(Line { dst, src, origin });
    }

    /// Append a sequential assignment line to `block`.
    pub fn add_seq_line(
        &mut self,
        block: DecBlock,
        dst: Node,
        src: Node,
        origin: Option<ComplexOffset>,
    ) {
        let dst = self.exprs.make_top(dst);
        let src = self.exprs.make_top(src);
        self.blocks[block].seq_lines.push(Line { dst, src, origin });
    }

    /// Insert a parallel assignment line at the front of `block`'s list.
    pub fn insert_par_line_front(
        &mut self,
        block: DecBlock,
        dst: Node,
        src: Node,
        origin: Option<ComplexOffset>,
    ) {
        let dst = self.exprs.make_top(dst);
        let src = self.exprs.make_top(src);
        self.blocks[block].par_lines.insert(0, Line { dst, src, origin });
    }

    /// Unlink both successor edges of `block`.
    pub fn clear_successors(&mut self, block: DecBlock) {
        let next_near = self.blocks[block].next_near.take();
        self.unlink(block, next_near);
        let next_far = self.blocks[block].next_far.take();
        self.unlink(block, next_far);
    }

    /// Set the terminating condition of `block`.
    pub fn set_condition(
        &mut self,
        block: DecBlock,
        condition: Node,
        origin: Option<ComplexOffset>,
    ) {
        let top = self.exprs.make_top(condition);
        self.blocks[block].condition = top.into();
        self.blocks[block].cond_origin = origin;
    }

    /// Drop all lines and the condition of `block`, clearing their top handles. Used when a
    /// block is re-interpreted on a loop pass.
    pub fn clear_code(&mut self, block: DecBlock) {
        let data = &mut self.blocks[block];
        let lines: Vec<Line> = data.par_lines.drain(..).chain(data.seq_lines.drain(..)).collect();
        let condition = data.condition.take();
        data.cond_origin = None;
        for line in lines {
            self.exprs.clear_top(line.dst);
            self.exprs.clear_top(line.src);
        }
        if let Some(top) = condition {
            self.exprs.clear_top(top);
        }
    }

    /// Sort the block visitation order by level, then by offset for determinism.
    pub fn sort_blocks_by_level(&mut self) {
        let mut order: Vec<DecBlock> = self.blocks.keys().collect();
        order.sort_by_key(|&b| (self.blocks[b].level, self.blocks[b].min_offset));
        self.order = order;
    }

    /// Walk back from every end block, assigning each block the length of its longest path to
    /// an end. Loop edges do not contribute.
    pub fn calculate_heights(&mut self) {
        let mut order: Vec<DecBlock> = self
            .blocks
            .keys()
            .filter(|&b| !self.blocks[b].removed)
            .collect();
        order.sort_by_key(|&b| core::cmp::Reverse(self.blocks[b].level));
        // Two rounds pick up chains the level order alone misses.
        for _ in 0..2 {
            for &block in &order {
                if self.blocks[block].is_end {
                    continue;
                }
                let level = self.blocks[block].level;
                let mut height = 0;
                for succ in self.blocks[block].successors() {
                    let succ_data = &self.blocks[succ];
                    if !succ_data.removed && succ_data.level > level {
                        height = height.max(1 + succ_data.height);
                    }
                }
                self.blocks[block].height = height;
            }
        }
    }

    /// Debugger hook: the top node computed at `offset`, if the offset falls inside this
    /// function. Picks the line (or condition) with the greatest origin not after `offset`.
    pub fn find_block_top_node_at_offset(&self, offset: ComplexOffset) -> Option<TopNode> {
        let block = self.blocks.keys().find(|&b| {
            let data = &self.blocks[b];
            !data.removed && data.min_offset <= offset && offset < data.max_offset
        })?;
        let data = &self.blocks[block];
        let mut best: Option<(ComplexOffset, TopNode)> = None;
        let mut consider = |origin: Option<ComplexOffset>, top: TopNode| {
            if let Some(origin) = origin {
                if origin <= offset && best.map_or(true, |(o, _)| origin > o) {
                    best = Some((origin, top));
                }
            }
        };
        for line in data.seq_lines.iter().chain(&data.par_lines) {
            consider(line.origin, line.src);
        }
        if let Some(cond) = data.condition.expand() {
            consider(data.cond_origin, cond);
        }
        best.map(|(_, top)| top)
            .or_else(|| data.condition.expand())
            .or_else(|| data.seq_lines.first().map(|l| l.src))
    }

    /// Check cross-node invariants: every child's parent list contains its parents, and every
    /// line assigns to an lvalue. Debug builds assert; release builds report.
    pub fn verify_integrity(&self) -> DecompileResult<()> {
        if let Err((node, child)) = self.exprs.verify_parent_links() {
            debug_assert!(false, "{child} is missing parent link to {node}");
            return Err(DecompileError::Integrity("inconsistent parent links"));
        }
        for block in self.blocks.keys() {
            let data = &self.blocks[block];
            for line in data.par_lines.iter().chain(&data.seq_lines) {
                let dst = self.exprs.resolve_mirrors(self.exprs.top_root(line.dst));
                let ok = matches!(
                    self.exprs.data(dst),
                    NodeData::Sym { .. }
                        | NodeData::SdaSym { .. }
                        | NodeData::SdaMemSym { .. }
                        | NodeData::RegRead { .. }
                        | NodeData::Op {
                            op: crate::expr::ExprOp::Load,
                            ..
                        }
                );
                if !ok {
                    debug_assert!(false, "line in {block} assigns to a non-lvalue");
                    return Err(DecompileError::Integrity("line assigns to a non-lvalue"));
                }
            }
        }
        Ok(())
    }

    /// The kind of a symbol, shorthand used by the passes.
    pub fn symbol_kind(&self, symbol: DecSymbol) -> DecSymbolKind {
        self.symbols[symbol].kind
    }

    /// Return registers inferred from using modes: register slices that every end block leaves
    /// fully written. Used when no signature names the return storage.
    pub fn infer_return_registers(&self) -> Vec<Register> {
        let mut result: Vec<Register> = Vec::new();
        for ctx in self.exec.iter() {
            let data = self.exec.get(ctx);
            if !self.blocks[data.block].is_end {
                continue;
            }
            for (_, entries) in data.current.iter() {
                for info in entries {
                    let written = !matches!(
                        self.exprs.data(self.exprs.top_root(info.expr)),
                        NodeData::RegRead { .. }
                    );
                    if info.using == crate::exec_context::RegisterUsing::Full
                        && written
                        && !result.contains(&info.register)
                    {
                        result.push(info.register);
                    }
                }
            }
        }
        result
    }
}
