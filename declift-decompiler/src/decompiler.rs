//! The primary decompiler: abstract interpretation of a PCode function graph.
//!
//! Each PCode block gets a mirror block and an exec context. Interpretation starts at the
//! function's start block and follows successor edges with an explicit worklist of
//! `(block, version)` pairs (recursion depth on large functions is unbounded, so no call
//! stack). A block is admitted only once every forward predecessor has delivered its context;
//! loop edges re-enter blocks under a fresh, strictly larger version, so re-interpretation is
//! monotone and reaches a fixed point. The version counter is capped; past the cap the last
//! computed state stands and the graph is tagged imprecise.
//!
//! Joins are where control-flow merges meet: register slices present on both sides with
//! disagreeing values are replaced by a join variable, and the contributing contexts are
//! recorded so the parallel-assignment pass can materialize the assignments later.

use crate::dec_graph::{DecBlock, DecompiledCodeGraph};
use crate::environ::{CallInfoResolver, ReturnInfo};
use crate::error::{DecompileError, DecompileResult};
use crate::exec_context::{ExecCtx, JoinVar, RegisterInfo};
use crate::expr::NodeData;
use crate::fx::FxHashMap;
use crate::symbol::DecSymbolData;
use declift_entity::{PackedOption, SecondaryMap};
use declift_pcode::{
    BitMask64, ImagePCodeGraph, Register, RegisterFactory, RegisterId,
};
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// Per-block scheduling state.
#[derive(Clone, Default)]
struct BlockState {
    ctx: PackedOption<ExecCtx>,
    enter_count: u32,
    version: u32,
    is_decompiled: bool,
}

/// The primary decompiler for one function.
pub struct PrimaryDecompiler<'a> {
    pub(crate) pcode: &'a ImagePCodeGraph,
    pub(crate) reg_factory: &'a dyn RegisterFactory,
    pub(crate) call_resolver: &'a dyn CallInfoResolver,
    pub(crate) return_info: ReturnInfo,
    /// The graph being built; taken by [`Self::decompile`].
    pub(crate) graph: DecompiledCodeGraph,
    states: SecondaryMap<DecBlock, BlockState>,
    loops_count: u32,
    loop_cap: u32,
    join_var_index: FxHashMap<(ExecCtx, RegisterId, u64), crate::symbol::DecSymbol>,
}

impl<'a> PrimaryDecompiler<'a> {
    /// Create a decompiler for the function graph `func` of `pcode`.
    pub fn new(
        pcode: &'a ImagePCodeGraph,
        func: declift_pcode::FuncGraph,
        reg_factory: &'a dyn RegisterFactory,
        return_info: ReturnInfo,
        call_resolver: &'a dyn CallInfoResolver,
        loop_cap: u32,
    ) -> Self {
        Self {
            pcode,
            reg_factory,
            call_resolver,
            return_info,
            graph: DecompiledCodeGraph::new(func),
            states: SecondaryMap::new(),
            loops_count: 0,
            loop_cap,
            join_var_index: FxHashMap::default(),
        }
    }

    /// Run the interpretation to its fixed point and return the decompiled graph.
    pub fn decompile(mut self) -> DecompileResult<DecompiledCodeGraph> {
        let func_data = self.pcode.func_graph(self.graph.func);
        let start_pcode = func_data
            .start_block
            .expand()
            .ok_or(DecompileError::NoStartBlock)?;
        self.pcode.verify_func_graph(self.graph.func)?;

        // One mirror block and one exec context per PCode block.
        for &pblock in &func_data.blocks {
            let data = self.pcode.block(pblock);
            let block = self.graph.create_block(
                pblock,
                data.min_offset,
                data.max_offset,
                data.level,
                data.is_end(),
            );
            let ctx = self.graph.exec.create(block);
            self.states[block].ctx = ctx.into();
        }
        self.wire_block_links();

        let start = self
            .graph
            .dec_block_of(start_pcode)
            .expect("start block was just created");
        let mut worklist: Vec<(DecBlock, u32)> = vec![(start, 1)];
        while let Some((block, version)) = worklist.pop() {
            self.states[block].enter_count += 1;
            if self.states[block].enter_count < self.high_pred_count(block) {
                continue;
            }
            self.interpret_block(block);

            let was_decompiled = self.states[block].is_decompiled;
            self.states[block].is_decompiled = true;
            self.states[block].version = version;

            // Push in reverse so the near successor is processed first.
            let succs = self.graph.block(block).successors();
            let mut scheduled: SmallVec<[(DecBlock, u32); 2]> = SmallVec::new();
            for succ in succs {
                let mut next_version = version;
                if self.graph.block(succ).level <= self.graph.block(block).level {
                    // A loop edge. Bump the version once per loop discovery; a block that was
                    // already decompiled before this pass does not re-arm its loops.
                    if !was_decompiled {
                        if self.loops_count >= self.loop_cap {
                            log::warn!(
                                "loop version cap {} reached in {}; result may be imprecise",
                                self.loop_cap,
                                self.graph.func
                            );
                            self.graph.may_be_imprecise = true;
                            continue;
                        }
                        self.loops_count += 1;
                        next_version = self.loops_count + 1;
                    }
                }
                if next_version <= self.states[succ].version {
                    continue;
                }
                let succ_ctx = self.states[succ].ctx.unwrap();
                let block_ctx = self.states[block].ctx.unwrap();
                // Snapshot the outgoing state first: restoring a self-loop's context below
                // would otherwise destroy the very state being joined in.
                let outgoing = self
                    .graph
                    .exec
                    .get(block_ctx)
                    .current
                    .duplicate(&mut self.graph.exprs);
                if self.states[succ].is_decompiled {
                    self.graph
                        .exec
                        .get_mut(succ_ctx)
                        .restore_current(&mut self.graph.exprs);
                }
                self.join_contexts(&outgoing, succ_ctx);
                scheduled.push((succ, next_version));
            }
            while let Some(item) = scheduled.pop() {
                worklist.push(item);
            }
        }

        self.materialize_end_block_outputs();
        self.graph.sort_blocks_by_level();

        debug_assert_eq!(
            self.graph.all_blocks().count(),
            self.pcode.func_graph(self.graph.func).blocks.len(),
            "dec blocks must biject with pcode blocks"
        );
        debug_assert!(self
            .graph
            .exec
            .iter()
            .all(|c| self.graph.exec.get(c).current.verify_mask_disjointness()));
        self.graph.verify_integrity()?;
        Ok(self.graph)
    }

    fn wire_block_links(&mut self) {
        let func_blocks = self.pcode.func_graph(self.graph.func).blocks.clone();
        for &pblock in &func_blocks {
            let block = self.graph.dec_block_of(pblock).expect("mirrored");
            if let Some(near) = self.pcode.block(pblock).next_near.expand() {
                if let Some(dec) = self.graph.dec_block_of(near) {
                    self.graph.set_next_near(block, dec);
                }
            }
            if let Some(far) = self.pcode.block(pblock).next_far.expand() {
                if let Some(dec) = self.graph.dec_block_of(far) {
                    self.graph.set_next_far(block, dec);
                }
            }
        }
    }

    /// Number of forward (non-loop) predecessors: all of them must deliver their context
    /// before the block is first interpreted.
    fn high_pred_count(&self, block: DecBlock) -> u32 {
        let level = self.graph.block(block).level;
        self.graph
            .block(block)
            .predecessors
            .iter()
            .filter(|&&pred| self.graph.block(pred).level < level)
            .count()
            .max(1) as u32
    }

    fn interpret_block(&mut self, block: DecBlock) {
        let ctx = self.states[block].ctx.unwrap();
        log::trace!("interpreting {block} (ctx {ctx})");
        self.graph
            .exec
            .get_mut(ctx)
            .snapshot_start(&mut self.graph.exprs);
        self.graph.clear_code(block);
        let insts = self
            .pcode
            .block(self.graph.block(block).pcode_block)
            .instructions
            .clone();
        for inst in insts {
            self.execute_instruction(block, ctx, inst);
        }
    }

    /// Merge a predecessor's outgoing register state into `succ_ctx`.
    ///
    /// The live slices of both sides are partitioned byte-wise. Runs covered by one side pass
    /// through; runs covered by both compare their values by canonical hash, and a
    /// disagreement becomes a join variable recorded in the graph's ledger.
    fn join_contexts(&mut self, pred: &crate::exec_context::RegisterExecContext, succ_ctx: ExecCtx) {
        let ids: BTreeSet<RegisterId> = {
            let succ = &self.graph.exec.get(succ_ctx).current;
            succ.iter().map(|(id, _)| id).chain(pred.iter().map(|(id, _)| id)).collect()
        };

        for id in ids {
            let a_entries: Vec<RegisterInfo> =
                self.graph.exec.get(succ_ctx).current.entries(id).to_vec();
            let b_entries: Vec<RegisterInfo> = pred.entries(id).to_vec();

            if a_entries.is_empty() {
                // First contribution: adopt the predecessor's slices as they are.
                let copied: Vec<RegisterInfo> = b_entries
                    .iter()
                    .map(|info| RegisterInfo {
                        register: info.register,
                        expr: {
                            let root = self.graph.exprs.top_root(info.expr);
                            self.graph.exprs.make_top(root)
                        },
                        source: info.source,
                        using: info.using,
                    })
                    .collect();
                self.graph
                    .exec
                    .get_mut(succ_ctx)
                    .current
                    .set_entries(id, copied);
                continue;
            }

            let mut merged: Vec<RegisterInfo> = Vec::new();
            for (run, a_idx, b_idx) in partition_byte_runs(&a_entries, &b_entries) {
                let slice = Register::new(id, run.low_byte_offset(), run.size_in_bytes());
                let merged_info = match (a_idx, b_idx) {
                    (Some(ai), None) => self.take_run(&a_entries[ai], slice, run),
                    (None, Some(bi)) => self.take_run(&b_entries[bi], slice, run),
                    (Some(ai), Some(bi)) => {
                        self.merge_run(succ_ctx, &a_entries[ai], &b_entries[bi], slice, run)
                    }
                    (None, None) => unreachable!("partition yields covered runs only"),
                };
                merged.push(merged_info);
            }
            self.graph
                .exec
                .get_mut(succ_ctx)
                .current
                .set_entries(id, merged);
        }
    }

    /// Carve the bytes `run` out of `info` into a standalone entry.
    fn take_run(&mut self, info: &RegisterInfo, slice: Register, run: BitMask64) -> RegisterInfo {
        let value = self.graph.exprs.top_root(info.expr);
        let expr = crate::exec_context::extract_run(
            &mut self.graph.exprs,
            value,
            info.register.mask(),
            run,
        );
        RegisterInfo {
            register: slice,
            expr: self.graph.exprs.make_top(expr),
            source: info.source,
            using: info.using,
        }
    }

    /// Merge one byte run covered by both sides.
    fn merge_run(
        &mut self,
        succ_ctx: ExecCtx,
        a: &RegisterInfo,
        b: &RegisterInfo,
        slice: Register,
        run: BitMask64,
    ) -> RegisterInfo {
        let a_value = self.graph.exprs.top_root(a.expr);
        let b_value = self.graph.exprs.top_root(b.expr);
        let a_expr = crate::exec_context::extract_run(
            &mut self.graph.exprs,
            a_value,
            a.register.mask(),
            run,
        );
        let b_expr = crate::exec_context::extract_run(
            &mut self.graph.exprs,
            b_value,
            b.register.mask(),
            run,
        );
        let using = a.using.max(b.using);

        if self.graph.exprs.hash(a_expr) == self.graph.exprs.hash(b_expr) {
            return RegisterInfo {
                register: slice,
                expr: self.graph.exprs.make_top(a_expr),
                source: a.source,
                using,
            };
        }

        // Disagreement: a PHI-like union, carried by a join variable.
        let key = (succ_ctx, slice.id, run.value());
        let symbol = match self.join_var_index.get(&key).copied() {
            Some(symbol) => {
                self.record_join_ctx(symbol, b.source);
                symbol
            }
            None => {
                let symbol = self.graph.new_symbol(DecSymbolData::join_var(slice));
                let mut ctxs = vec![a.source];
                if b.source != a.source {
                    ctxs.push(b.source);
                }
                self.graph.join_vars.push(JoinVar {
                    symbol,
                    register: slice,
                    ctxs,
                });
                self.join_var_index.insert(key, symbol);
                log::trace!("join var {symbol} for {slice} at {succ_ctx}");
                symbol
            }
        };
        // If the a side already reads the join variable, keep that leaf; otherwise make one.
        let a_is_var = matches!(
            self.graph.exprs.data(a_expr),
            NodeData::Sym { symbol: s, .. } if *s == symbol
        );
        let leaf = if a_is_var {
            a_expr
        } else {
            self.record_join_ctx(symbol, a.source);
            self.graph.exprs.sym(symbol, slice.size)
        };
        RegisterInfo {
            register: slice,
            expr: self.graph.exprs.make_top(leaf),
            source: succ_ctx,
            using,
        }
    }

    fn record_join_ctx(&mut self, symbol: crate::symbol::DecSymbol, ctx: ExecCtx) {
        if let Some(var) = self.graph.join_vars.iter_mut().find(|v| v.symbol == symbol) {
            if !var.ctxs.contains(&ctx) {
                var.ctxs.push(ctx);
            }
        }
    }

    /// Emit `reg = value` lines on every end block for the function's return storage.
    fn materialize_end_block_outputs(&mut self) {
        let Some(ret) = self.return_info.value else {
            return;
        };
        let end_blocks: Vec<DecBlock> = self
            .graph
            .all_blocks()
            .filter(|&b| self.graph.block(b).is_end)
            .collect();
        for block in end_blocks {
            let ctx = self.states[block].ctx.unwrap();
            let expr = {
                let exec = self.graph.exec.get_mut(ctx);
                exec.current
                    .request_register(ret.register, &mut self.graph.exprs, ctx)
            };
            // Nothing was computed into the register on this path; no output to show.
            if let NodeData::RegRead { register } = self.graph.exprs.data(expr) {
                if *register == ret.register {
                    continue;
                }
            }
            let symbol = self.graph.register_out_symbol(ret.register);
            let dst = self.graph.exprs.sym(symbol, ret.register.size);
            self.graph.add_par_line(block, dst, expr, None);
        }
    }

}

/// Partition the union of both entry sets into byte runs with a constant covering pair.
fn partition_byte_runs(
    a_entries: &[RegisterInfo],
    b_entries: &[RegisterInfo],
) -> Vec<(BitMask64, Option<usize>, Option<usize>)> {
    let cover = |entries: &[RegisterInfo], byte: u8| -> Option<usize> {
        let bit = BitMask64::from_size_offset(1, byte);
        entries
            .iter()
            .position(|info| bit.is_fully_contained_in(info.register.mask()))
    };
    let mut runs = Vec::new();
    let mut current: Option<(u8, Option<usize>, Option<usize>)> = None;
    for byte in 0..8u8 {
        let pair = (cover(a_entries, byte), cover(b_entries, byte));
        match (&mut current, pair) {
            (_, (None, None)) => {
                if let Some((start, a, b)) = current.take() {
                    runs.push((BitMask64::from_size_offset(byte - start, start), a, b));
                }
            }
            (Some((start, a, b)), (pa, pb)) if (*a, *b) != (pa, pb) => {
                runs.push((BitMask64::from_size_offset(byte - *start, *start), *a, *b));
                current = Some((byte, pa, pb));
            }
            (Some(_), _) => {}
            (None, (pa, pb)) => current = Some((byte, pa, pb)),
        }
    }
    if let Some((start, a, b)) = current {
        runs.push((BitMask64::from_size_offset(8 - start, start), a, b));
    }
    runs
}
