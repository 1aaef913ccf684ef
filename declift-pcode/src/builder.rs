//! Recovery of the block and function structure from a decoded instruction stream.
//!
//! Blocks are split at every known function entry, every direct branch target, and the
//! instruction following any terminator. Conditional branches get their taken side as the far
//! successor and the fall-through as the near successor. Each function entry then claims the
//! blocks reachable from it, levels are assigned (longest cycle-free distance from the start
//! block), and call sites are classified: a call whose target folds to a constant inside a known
//! function becomes a direct call edge, anything else is left for the virtual-call registry.

use crate::graph::{Block, FuncGraph, GraphResult, ImagePCodeGraph, Inst};
use crate::instruction::{Instruction, Opcode, Varnode};
use crate::offset::ComplexOffset;
use crate::register::RegisterId;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeSet, VecDeque};

/// Builds an [`ImagePCodeGraph`] from a decoded PCode stream.
pub struct GraphBuilder {
    graph: ImagePCodeGraph,
}

impl GraphBuilder {
    /// Create a builder with an empty graph.
    pub fn new() -> Self {
        Self {
            graph: ImagePCodeGraph::new(),
        }
    }

    /// Add decoded instructions to the pool. The stream must be in ascending offset order.
    pub fn add_instructions<I>(&mut self, instructions: I)
    where
        I: IntoIterator<Item = Instruction>,
    {
        for instruction in instructions {
            self.graph.add_instruction(instruction);
        }
    }

    /// Split blocks, wire edges, claim blocks per function, assign levels and classify calls.
    ///
    /// `entry_offsets` are the known function entry points; direct call targets found in the
    /// stream are added to them.
    pub fn build(mut self, entry_offsets: &[u64]) -> GraphResult<ImagePCodeGraph> {
        let insts: Vec<Inst> = self.graph.insts_in_order().collect();
        let entries = self.find_function_entries(&insts, entry_offsets);
        let splits = self.find_split_offsets(&insts, &entries);
        self.create_blocks(&insts, &splits);
        self.wire_edges();
        for &entry in &entries {
            self.claim_function(entry);
        }
        for func in self.graph.func_graphs().collect::<Vec<_>>() {
            self.assign_levels(func);
            self.track_const_values(func);
            self.classify_calls(func);
        }
        self.graph.fill_head_func_graphs();
        log::debug!(
            "built pcode graph: {} instructions, {} functions, {} heads",
            self.graph.num_insts(),
            self.graph.func_graphs().count(),
            self.graph.head_func_graphs().len()
        );
        Ok(self.graph)
    }

    fn find_function_entries(&self, insts: &[Inst], entry_offsets: &[u64]) -> Vec<u64> {
        let mut entries: BTreeSet<u64> = entry_offsets.iter().copied().collect();
        for &inst in insts {
            let instr = self.graph.inst(inst);
            if instr.opcode == Opcode::Call {
                if let Some(target) = instr.constant_target() {
                    entries.insert(target);
                }
            }
        }
        entries.into_iter().collect()
    }

    fn find_split_offsets(&self, insts: &[Inst], entries: &[u64]) -> BTreeSet<ComplexOffset> {
        let mut splits: BTreeSet<ComplexOffset> = BTreeSet::new();
        for &entry in entries {
            splits.insert(ComplexOffset::from(entry));
        }
        if let Some(&first) = insts.first() {
            splits.insert(self.graph.inst(first).offset);
        }
        for (idx, &inst) in insts.iter().enumerate() {
            let instr = self.graph.inst(inst);
            match instr.opcode {
                Opcode::Branch | Opcode::CBranch => {
                    if let Some(target) = instr.constant_target() {
                        splits.insert(ComplexOffset::from(target));
                    }
                }
                _ => {}
            }
            if instr.opcode.is_branching() {
                if let Some(&next) = insts.get(idx + 1) {
                    splits.insert(self.graph.inst(next).offset);
                }
            }
        }
        splits
    }

    fn create_blocks(&mut self, insts: &[Inst], splits: &BTreeSet<ComplexOffset>) {
        let mut current: Option<Block> = None;
        for &inst in insts {
            let instr = *self.graph.inst(inst);
            if splits.contains(&instr.offset) || current.is_none() {
                current = Some(self.graph.create_block(instr.offset, instr.offset));
            }
            let block = current.expect("block started above");
            let data = self.graph.block_mut(block);
            data.instructions.push(inst);
            data.max_offset = ComplexOffset::from(instr.orig_offset_end());
        }
    }

    fn wire_edges(&mut self) {
        let blocks: Vec<Block> = self.graph.blocks().collect();
        for block in blocks {
            let Some(last) = self.graph.block(block).last_instruction() else {
                continue;
            };
            let instr = *self.graph.inst(last);
            match instr.opcode {
                Opcode::CBranch => {
                    self.wire_far(block, &instr);
                    self.wire_fall_through(block);
                }
                Opcode::Branch => {
                    self.wire_far(block, &instr);
                }
                Opcode::BranchInd | Opcode::Return => {}
                _ => {
                    self.wire_fall_through(block);
                }
            }
        }
    }

    fn wire_far(&mut self, block: Block, instr: &Instruction) {
        let Some(target) = instr.constant_target() else {
            return;
        };
        match self.graph.block_starting_at(ComplexOffset::from(target)) {
            Some(dest) => self.graph.set_next_far(block, dest),
            None => log::warn!(
                "branch at {} targets {target:#x} outside the stream",
                instr.offset
            ),
        }
    }

    fn wire_fall_through(&mut self, block: Block) {
        let end = self.graph.block(block).max_offset;
        if let Some(dest) = self.graph.block_starting_at(end) {
            self.graph.set_next_near(block, dest);
        }
    }

    fn claim_function(&mut self, entry: u64) {
        let Some(start) = self.graph.block_starting_at(ComplexOffset::from(entry)) else {
            log::warn!("function entry {entry:#x} has no block");
            return;
        };
        if self.graph.block(start).func.is_some() {
            // Entry inside an already claimed region; keep the first claimant.
            return;
        }
        let func = self.graph.create_func_graph();
        self.graph.set_start_block(func, start);

        let mut queue: VecDeque<Block> = VecDeque::new();
        queue.push_back(start);
        while let Some(block) = queue.pop_front() {
            if self.graph.block(block).func.is_some() {
                continue;
            }
            self.graph.block_mut(block).func = func.into();
            self.graph.func_graph_mut(func).blocks.push(block);
            for succ in self.graph.block(block).successors() {
                if self.graph.block(succ).func.is_none() {
                    queue.push_back(succ);
                }
            }
        }
        self.graph.func_graph_mut(func).blocks.sort();
        log::trace!(
            "function at {entry:#x} claimed {} blocks",
            self.graph.func_graph(func).blocks.len()
        );
    }

    /// Assign each block the length of the longest cycle-free path from the start block.
    ///
    /// Depth-first walk keeping the current path for cycle breaking; a block is revisited only
    /// along a longer path, which must raise its level. The walk is bounded so pathological
    /// graphs can't blow up; past the bound the levels computed so far are kept.
    fn assign_levels(&mut self, func: FuncGraph) {
        let Some(start) = self.graph.func_graph(func).start_block.expand() else {
            return;
        };
        let budget = self.graph.func_graph(func).blocks.len().saturating_mul(64) + 64;
        let mut steps = 0usize;

        struct Frame {
            block: Block,
            succs: smallvec::SmallVec<[Block; 2]>,
            next: usize,
        }
        let mut on_path: FxHashSet<Block> = FxHashSet::default();
        let mut stack: Vec<Frame> = Vec::new();

        fn enter(
            graph: &mut ImagePCodeGraph,
            on_path: &mut FxHashSet<Block>,
            stack: &mut Vec<Frame>,
            block: Block,
        ) {
            on_path.insert(block);
            let depth = stack.len() as u32 + 1;
            let data = graph.block_mut(block);
            if depth > data.level {
                data.level = depth;
            }
            let succs = data.successors();
            stack.push(Frame {
                block,
                succs,
                next: 0,
            });
        }
        enter(&mut self.graph, &mut on_path, &mut stack, start);

        'walk: loop {
            let stack_len = stack.len();
            let Some(frame) = stack.last_mut() else {
                break 'walk;
            };
            while frame.next < frame.succs.len() {
                let succ = frame.succs[frame.next];
                frame.next += 1;
                steps += 1;
                if steps > budget {
                    log::warn!("level assignment budget exhausted for {func}");
                    break 'walk;
                }
                let succ_data = self.graph.block(succ);
                let same_func = succ_data.func.expand() == Some(func);
                let deeper = (stack_len as u32 + 1) > succ_data.level;
                if same_func && deeper && !on_path.contains(&succ) {
                    enter(&mut self.graph, &mut on_path, &mut stack, succ);
                    continue 'walk;
                }
            }
            on_path.remove(&frame.block);
            stack.pop();
        }
    }

    /// Simple intra-block constant tracking, recording folded values for the instructions that
    /// need them (indirect call and branch targets).
    fn track_const_values(&mut self, func: FuncGraph) {
        let blocks = self.graph.func_graph(func).blocks.clone();
        for block in blocks {
            let mut regs: FxHashMap<RegisterId, u64> = FxHashMap::default();
            let mut syms: FxHashMap<u32, u64> = FxHashMap::default();
            let insts = self.graph.block(block).instructions.clone();
            for inst in insts {
                let instr = *self.graph.inst(inst);
                let known = |vn: Option<Varnode>| -> Option<u64> {
                    match vn? {
                        Varnode::Constant { value, .. } => Some(value),
                        Varnode::Register(reg) if reg.byte_offset == 0 => {
                            regs.get(&reg.id).copied()
                        }
                        Varnode::Symbol { id, .. } => syms.get(&id).copied(),
                        Varnode::Register(_) => None,
                    }
                };

                let folded = match instr.opcode {
                    Opcode::Copy => known(instr.input0),
                    Opcode::IntAdd => match (known(instr.input0), known(instr.input1)) {
                        (Some(a), Some(b)) => Some(a.wrapping_add(b)),
                        _ => None,
                    },
                    Opcode::IntSub => match (known(instr.input0), known(instr.input1)) {
                        (Some(a), Some(b)) => Some(a.wrapping_sub(b)),
                        _ => None,
                    },
                    _ => None,
                };

                if matches!(
                    instr.opcode,
                    Opcode::Call | Opcode::CallInd | Opcode::BranchInd
                ) {
                    if let Some(value) = known(instr.input0) {
                        self.graph
                            .func_graph_mut(func)
                            .const_values
                            .insert(inst, value);
                    }
                }

                if instr.opcode.is_call() {
                    // The callee may clobber anything we tracked.
                    regs.clear();
                    syms.clear();
                    continue;
                }

                match instr.output {
                    Some(Varnode::Register(reg)) => {
                        if reg.byte_offset == 0 && folded.is_some() {
                            regs.insert(reg.id, folded.expect("checked above"));
                        } else {
                            regs.remove(&reg.id);
                        }
                    }
                    Some(Varnode::Symbol { id, .. }) => {
                        match folded {
                            Some(value) => syms.insert(id, value),
                            None => syms.remove(&id),
                        };
                    }
                    _ => {}
                }
            }
        }
    }

    fn classify_calls(&mut self, func: FuncGraph) {
        let blocks = self.graph.func_graph(func).blocks.clone();
        for block in blocks {
            let insts = self.graph.block(block).instructions.clone();
            for inst in insts {
                let instr = *self.graph.inst(inst);
                if !instr.opcode.is_call() {
                    continue;
                }
                let target = self
                    .graph
                    .func_graph(func)
                    .const_values
                    .get(&inst)
                    .copied();
                let callee =
                    target.and_then(|t| self.graph.func_graph_starting_at(ComplexOffset::from(t)));
                match callee {
                    Some(callee) if callee != func => {
                        self.graph.add_non_virt_call(func, callee);
                    }
                    Some(_) => {}
                    None => {
                        self.graph.func_graph_mut(func).unresolved_calls.push(inst);
                        log::trace!("unresolved call at {}", instr.offset);
                    }
                }
            }
        }
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::Register;

    const RAX: u16 = 0;
    const RCX: u16 = 2;

    fn reg(id: u16, size: u8) -> Varnode {
        Varnode::Register(Register::whole(RegisterId::from_u16(id), size))
    }

    fn konst(value: u64, size: u8) -> Varnode {
        Varnode::Constant { value, size }
    }

    fn sym(id: u32, size: u8) -> Varnode {
        Varnode::Symbol { id, size }
    }

    fn instr(
        byte: u64,
        order: u16,
        opcode: Opcode,
        output: Option<Varnode>,
        input0: Option<Varnode>,
        input1: Option<Varnode>,
    ) -> Instruction {
        Instruction::new(
            ComplexOffset::new(byte, order),
            opcode,
            output,
            input0,
            input1,
            1,
        )
    }

    /// A diamond: 0x0 cbranch-> 0x2, falls to 0x1, both join at 0x3.
    fn diamond() -> Vec<Instruction> {
        vec![
            instr(
                0,
                0,
                Opcode::IntEqual,
                Some(sym(0, 1)),
                Some(reg(RAX, 8)),
                Some(konst(0, 8)),
            ),
            instr(0, 1, Opcode::CBranch, None, Some(konst(2, 8)), Some(sym(0, 1))),
            instr(1, 0, Opcode::Copy, Some(reg(RAX, 8)), Some(konst(1, 8)), None),
            instr(1, 1, Opcode::Branch, None, Some(konst(3, 8)), None),
            instr(2, 0, Opcode::Copy, Some(reg(RAX, 8)), Some(konst(2, 8)), None),
            instr(3, 0, Opcode::Return, None, None, None),
        ]
    }

    #[test]
    fn diamond_structure() {
        let mut builder = GraphBuilder::new();
        builder.add_instructions(diamond());
        let graph = builder.build(&[0]).unwrap();

        let func = graph.entry_func_graph().unwrap();
        assert_eq!(graph.func_graph(func).blocks.len(), 4);

        let b0 = graph.block_starting_at(ComplexOffset::from(0)).unwrap();
        let b1 = graph.block_starting_at(ComplexOffset::from(1)).unwrap();
        let b2 = graph.block_starting_at(ComplexOffset::from(2)).unwrap();
        let b3 = graph.block_starting_at(ComplexOffset::from(3)).unwrap();

        assert_eq!(graph.block(b0).next_near.expand(), Some(b1));
        assert_eq!(graph.block(b0).next_far.expand(), Some(b2));
        assert_eq!(graph.block(b1).next_far.expand(), Some(b3));
        assert_eq!(graph.block(b1).next_near.expand(), None);
        assert_eq!(graph.block(b2).next_near.expand(), Some(b3));
        assert!(graph.block(b3).is_end());

        assert_eq!(graph.block(b0).level, 1);
        assert_eq!(graph.block(b1).level, 2);
        assert_eq!(graph.block(b2).level, 2);
        assert_eq!(graph.block(b3).level, 3);
    }

    /// A two-block loop: 0x0 body, 0x1 latch branching back to 0x1 itself.
    #[test]
    fn loop_levels() {
        let mut builder = GraphBuilder::new();
        builder.add_instructions(vec![
            instr(0, 0, Opcode::Copy, Some(reg(RCX, 8)), Some(konst(0, 8)), None),
            instr(
                1,
                0,
                Opcode::IntAdd,
                Some(reg(RCX, 8)),
                Some(reg(RCX, 8)),
                Some(konst(1, 8)),
            ),
            instr(
                1,
                1,
                Opcode::IntLess,
                Some(sym(0, 1)),
                Some(reg(RCX, 8)),
                Some(konst(10, 8)),
            ),
            instr(1, 2, Opcode::CBranch, None, Some(konst(1, 8)), Some(sym(0, 1))),
            instr(2, 0, Opcode::Return, None, None, None),
        ]);
        let graph = builder.build(&[0]).unwrap();

        let b0 = graph.block_starting_at(ComplexOffset::from(0)).unwrap();
        let b1 = graph.block_starting_at(ComplexOffset::from(1)).unwrap();
        let b2 = graph.block_starting_at(ComplexOffset::from(2)).unwrap();

        // The latch's back edge targets a block at the same level: a loop edge.
        assert_eq!(graph.block(b1).next_far.expand(), Some(b1));
        assert_eq!(graph.block(b0).level, 1);
        assert_eq!(graph.block(b1).level, 2);
        assert_eq!(graph.block(b2).level, 3);
    }

    /// An indirect call through a register folded to a known function becomes a direct edge.
    #[test]
    fn call_classification() {
        let mut builder = GraphBuilder::new();
        builder.add_instructions(vec![
            instr(
                0,
                0,
                Opcode::Copy,
                Some(reg(RAX, 8)),
                Some(konst(0x10, 8)),
                None,
            ),
            instr(0, 1, Opcode::CallInd, None, Some(reg(RAX, 8)), None),
            instr(1, 0, Opcode::CallInd, None, Some(reg(RCX, 8)), None),
            instr(2, 0, Opcode::Return, None, None, None),
            instr(0x10, 0, Opcode::Return, None, None, None),
        ]);
        let graph = builder.build(&[0, 0x10]).unwrap();

        let caller = graph
            .func_graph_starting_at(ComplexOffset::from(0))
            .unwrap();
        let callee = graph
            .func_graph_starting_at(ComplexOffset::from(0x10))
            .unwrap();

        assert!(graph.func_graph(caller).non_virt_calls.contains(&callee));
        assert_eq!(graph.func_graph(caller).unresolved_calls.len(), 1);
        assert!(graph.func_graph(callee).callers.contains(&caller));
        assert_eq!(graph.head_func_graphs(), &[caller]);
    }
}
