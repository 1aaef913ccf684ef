//! Per-block symbolic execution state.
//!
//! A [`RegisterExecContext`] maps each architectural register to the list of its currently live
//! sub-slices, each owning the expression that produces its value. Reading a register
//! reassembles the requested slice from whatever sub-slices are live, OR-ing masked parts
//! together and inventing input-read leaves for bytes nothing has written yet. Writing a
//! register removes or shrinks every overlapping slice first, so live masks for one register are
//! always pairwise disjoint.
//!
//! An [`ExecContextTable`] owns one [`ExecContextData`] per block: the register context as it
//! was on block entry (`start`), the one being mutated (`current`), and the values of symbolic
//! temporaries.

use crate::dec_graph::DecBlock;
use crate::expr::{ExprOp, ExprPool, Node, TopNode};
use crate::symbol::DecSymbol;
use declift_entity::{entity_impl, PrimaryMap};
use declift_pcode::{BitMask64, Register, RegisterId, Varnode};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// An opaque reference to a block's exec context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecCtx(u32);
entity_impl!(ExecCtx, "ctx");

/// How much of a tracked register slice the function has touched. Used to figure out the return
/// registers when no signature says so.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegisterUsing {
    /// Never read or written here.
    NotUsed,
    /// Partially covered by reads or writes.
    Partial,
    /// Fully written or fully read.
    Full,
}

/// One live sub-slice of a register.
#[derive(Clone, Debug)]
pub struct RegisterInfo {
    /// The slice this entry covers.
    pub register: Register,
    /// Handle to the expression producing the slice's value.
    pub expr: TopNode,
    /// The exec context the value originated from.
    pub source: ExecCtx,
    /// Using mode for return-register inference.
    pub using: RegisterUsing,
}

/// A piece of a requested register value: which live slice it comes from and which bytes of it
/// are wanted.
struct RegisterPart {
    /// Mask of the live slice the expression belongs to.
    slice_mask: BitMask64,
    /// The sub-range of that slice being read.
    part_mask: BitMask64,
    /// The slice's expression.
    expr: Node,
}

/// Expression values for the live slices of every register.
#[derive(Default)]
pub struct RegisterExecContext {
    registers: BTreeMap<RegisterId, Vec<RegisterInfo>>,
    /// Set once the context has received its first contents (from interpretation or a join).
    pub is_filled: bool,
}

impl RegisterExecContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all tracked slices.
    pub fn clear(&mut self) {
        self.registers.clear();
        self.is_filled = false;
    }

    /// The live entries of one register.
    pub fn entries(&self, id: RegisterId) -> &[RegisterInfo] {
        self.registers.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Iterate over all registers with live entries, in register-id order.
    pub fn iter(&self) -> impl Iterator<Item = (RegisterId, &[RegisterInfo])> {
        self.registers.iter().map(|(&id, v)| (id, v.as_slice()))
    }

    /// Replace the entries of one register wholesale. Used by the join step.
    pub fn set_entries(&mut self, id: RegisterId, entries: Vec<RegisterInfo>) {
        if entries.is_empty() {
            self.registers.remove(&id);
        } else {
            self.registers.insert(id, entries);
        }
        self.is_filled = true;
    }

    /// Reconstruct the value of `reg` from the live slices.
    ///
    /// Bytes nothing has written yet become fresh input-read leaves, which are registered as
    /// live entries of `self` so that repeated reads see the same leaf and a later join can
    /// replace it.
    pub fn request_register(
        &mut self,
        reg: Register,
        pool: &mut ExprPool,
        self_ctx: ExecCtx,
    ) -> Node {
        let need = reg.mask();
        let mut remaining = need;
        let mut parts: Vec<RegisterPart> = Vec::new();

        let entries = self.registers.entry(reg.id).or_default();
        for info in entries.iter_mut() {
            let slice_mask = info.register.mask();
            let overlap = slice_mask.intersect(remaining);
            if overlap.is_zero() {
                continue;
            }
            for run in contiguous_runs(overlap) {
                parts.push(RegisterPart {
                    slice_mask,
                    part_mask: run,
                    expr: pool.top_root(info.expr),
                });
            }
            info.using = if overlap == slice_mask {
                RegisterUsing::Full
            } else {
                info.using.max(RegisterUsing::Partial)
            };
            remaining = remaining.subtract(overlap);
            if remaining.is_zero() {
                break;
            }
        }

        for run in contiguous_runs(remaining) {
            let slice = reg.with_mask(run);
            let leaf = pool.reg_read(slice);
            let top = pool.make_top(leaf);
            entries.push(RegisterInfo {
                register: slice,
                expr: top,
                source: self_ctx,
                using: RegisterUsing::NotUsed,
            });
            parts.push(RegisterPart {
                slice_mask: run,
                part_mask: run,
                expr: leaf,
            });
        }
        self.is_filled = true;

        create_expr_from_register_parts(pool, parts, reg)
    }

    /// Record that `reg` now holds `expr`, shrinking or evicting every overlapping slice.
    pub fn set_register(
        &mut self,
        reg: Register,
        expr: Node,
        pool: &mut ExprPool,
        self_ctx: ExecCtx,
    ) {
        let write_mask = reg.mask();
        let old = self.registers.remove(&reg.id).unwrap_or_default();
        let mut kept: Vec<RegisterInfo> = Vec::with_capacity(old.len() + 1);
        for info in old {
            let slice_mask = info.register.mask();
            if !slice_mask.intersects(write_mask) {
                kept.push(info);
                continue;
            }
            let rest = slice_mask.subtract(write_mask);
            if rest.is_zero() {
                pool.clear_top(info.expr);
                continue;
            }
            let value = pool.top_root(info.expr);
            pool.clear_top(info.expr);
            for run in contiguous_runs(rest) {
                let sub = extract_run(pool, value, slice_mask, run);
                let slice = info.register.with_mask(run);
                let top = pool.make_top(sub);
                kept.push(RegisterInfo {
                    register: slice,
                    expr: top,
                    source: info.source,
                    using: info.using,
                });
            }
        }
        let top = pool.make_top(expr);
        kept.push(RegisterInfo {
            register: reg,
            expr: top,
            source: self_ctx,
            using: RegisterUsing::Full,
        });
        self.registers.insert(reg.id, kept);
        self.is_filled = true;
    }

    /// A duplicate of this context: same expression roots under fresh top handles.
    pub fn duplicate(&self, pool: &mut ExprPool) -> Self {
        let mut registers = BTreeMap::new();
        for (&id, entries) in &self.registers {
            let copied: Vec<RegisterInfo> = entries
                .iter()
                .map(|info| RegisterInfo {
                    register: info.register,
                    expr: pool.make_top(pool.top_root(info.expr)),
                    source: info.source,
                    using: info.using,
                })
                .collect();
            registers.insert(id, copied);
        }
        Self {
            registers,
            is_filled: self.is_filled,
        }
    }

    /// Check that the live masks of every register are pairwise disjoint.
    pub fn verify_mask_disjointness(&self) -> bool {
        self.registers.values().all(|entries| {
            let mut seen = BitMask64::ZERO;
            entries.iter().all(|info| {
                let mask = info.register.mask();
                let disjoint = !mask.intersects(seen);
                seen = seen.union(mask);
                disjoint
            })
        })
    }
}

/// The contiguous byte runs of a mask, low to high.
pub fn contiguous_runs(mask: BitMask64) -> SmallVec<[BitMask64; 2]> {
    let mut runs = SmallVec::new();
    let mut start: Option<u8> = None;
    for byte in 0..8u8 {
        let bit = BitMask64::from_size_offset(1, byte);
        let covered = bit.is_fully_contained_in(mask);
        match (covered, start) {
            (true, None) => start = Some(byte),
            (false, Some(s)) => {
                runs.push(BitMask64::from_size_offset(byte - s, s));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(BitMask64::from_size_offset(8 - s, s));
    }
    runs
}

/// Extract the bytes `part` of a value that represents the slice `slice_mask`.
///
/// The result is a `part`-sized value: shifted down to bit 0 and masked when the slice carries
/// more than the requested bytes. A run covering the whole slice comes back untouched.
pub(crate) fn extract_run(
    pool: &mut ExprPool,
    value: Node,
    slice_mask: BitMask64,
    part: BitMask64,
) -> Node {
    debug_assert!(part.is_fully_contained_in(slice_mask));
    let shift_bytes = part.low_byte_offset() - slice_mask.low_byte_offset();
    let part_size = part.size_in_bytes();
    let slice_size = slice_mask.size_in_bytes();
    let mut expr = value;
    if shift_bytes > 0 {
        let amount = pool.number(u64::from(shift_bytes) * 8, 1);
        expr = pool.op(ExprOp::Shr, expr, amount, slice_size);
    }
    if shift_bytes + part_size < slice_size {
        let ones = pool.number(mask_ones(part_size), part_size);
        expr = pool.op(ExprOp::And, expr, ones, part_size);
    }
    expr
}

fn mask_ones(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (u32::from(size) * 8)) - 1
    }
}

/// OR the collected parts together into the value of the requested slice.
fn create_expr_from_register_parts(
    pool: &mut ExprPool,
    mut parts: Vec<RegisterPart>,
    reg: Register,
) -> Node {
    debug_assert!(!parts.is_empty());
    parts.sort_by_key(|p| p.part_mask.low_byte_offset());

    // The common case: one live slice covers the request exactly.
    if parts.len() == 1 {
        let part = &parts[0];
        if part.part_mask == reg.mask() && part.part_mask == part.slice_mask {
            return part.expr;
        }
    }

    let mut result: Option<Node> = None;
    for part in &parts {
        let mut expr = extract_run(pool, part.expr, part.slice_mask, part.part_mask);
        let pos = part.part_mask.low_byte_offset() - reg.byte_offset;
        if pos > 0 {
            let amount = pool.number(u64::from(pos) * 8, 1);
            expr = pool.op(ExprOp::Shl, expr, amount, reg.size);
        }
        result = Some(match result {
            Some(acc) => pool.op(ExprOp::Or, acc, expr, reg.size),
            None => expr,
        });
    }
    result.expect("at least one part")
}

/// Per-block execution state.
pub struct ExecContextData {
    /// The block this context belongs to.
    pub block: DecBlock,
    /// Snapshot of the register context at block entry.
    pub start: RegisterExecContext,
    /// The register context being mutated by interpretation.
    pub current: RegisterExecContext,
    /// Values of symbolic temporaries, keyed by their decoder id.
    pub varnode_syms: BTreeMap<u32, TopNode>,
}

impl ExecContextData {
    /// Snapshot `current` into `start`. Done on each admission to the block.
    pub fn snapshot_start(&mut self, pool: &mut ExprPool) {
        self.start = self.current.duplicate(pool);
    }

    /// Reset `current` from the `start` snapshot. Done before re-joining on a loop pass.
    pub fn restore_current(&mut self, pool: &mut ExprPool) {
        self.current = self.start.duplicate(pool);
    }

    /// Read an operand.
    pub fn request_varnode(
        &mut self,
        varnode: Varnode,
        pool: &mut ExprPool,
        self_ctx: ExecCtx,
    ) -> Node {
        match varnode {
            Varnode::Register(reg) => self.current.request_register(reg, pool, self_ctx),
            Varnode::Constant { value, size } => pool.number(value, size),
            Varnode::Symbol { id, size } => match self.varnode_syms.get(&id) {
                Some(&top) => pool.top_root(top),
                None => {
                    log::warn!("read of unwritten temporary u{id}");
                    pool.number(0, size)
                }
            },
        }
    }

    /// Write an operand.
    pub fn set_varnode(
        &mut self,
        varnode: Varnode,
        expr: Node,
        pool: &mut ExprPool,
        self_ctx: ExecCtx,
    ) {
        match varnode {
            Varnode::Register(reg) => self.current.set_register(reg, expr, pool, self_ctx),
            Varnode::Symbol { id, .. } => {
                let top = pool.make_top(expr);
                if let Some(old) = self.varnode_syms.insert(id, top) {
                    pool.clear_top(old);
                }
            }
            Varnode::Constant { .. } => {
                debug_assert!(false, "write to a constant varnode");
            }
        }
    }
}

/// All exec contexts of one decompilation, one per block.
pub struct ExecContextTable {
    ctxs: PrimaryMap<ExecCtx, ExecContextData>,
}

impl ExecContextTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            ctxs: PrimaryMap::new(),
        }
    }

    /// Allocate the context of `block`.
    pub fn create(&mut self, block: DecBlock) -> ExecCtx {
        self.ctxs.push(ExecContextData {
            block,
            start: RegisterExecContext::new(),
            current: RegisterExecContext::new(),
            varnode_syms: BTreeMap::new(),
        })
    }

    /// A context's data.
    pub fn get(&self, ctx: ExecCtx) -> &ExecContextData {
        &self.ctxs[ctx]
    }

    /// A context's data, mutable edition.
    pub fn get_mut(&mut self, ctx: ExecCtx) -> &mut ExecContextData {
        &mut self.ctxs[ctx]
    }

    /// All contexts in creation order.
    pub fn iter(&self) -> impl Iterator<Item = ExecCtx> + '_ {
        self.ctxs.keys()
    }
}

impl Default for ExecContextTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A join variable: the PHI-like symbol standing for a register whose joined values disagreed.
///
/// `ctxs` are the contexts contributing a value; the parallel-assignment pass requests
/// `register` from each of them and emits `symbol = <value>` in the owning block.
#[derive(Clone, Debug)]
pub struct JoinVar {
    /// The decompiler symbol carrying the merged value.
    pub symbol: DecSymbol,
    /// The register slice being merged.
    pub register: Register,
    /// The contexts contributing values, in join order.
    pub ctxs: Vec<ExecCtx>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::NodeData;

    fn rax() -> Register {
        Register::whole(RegisterId::from_u16(0), 8)
    }

    fn eax() -> Register {
        Register::whole(RegisterId::from_u16(0), 4)
    }

    fn ah() -> Register {
        Register::new(RegisterId::from_u16(0), 1, 1)
    }

    fn ctx0() -> ExecCtx {
        ExecCtx::from_u32(0)
    }

    #[test]
    fn runs() {
        let mask = BitMask64::from_value(0xff00ff);
        let runs = contiguous_runs(mask);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].value(), 0xff);
        assert_eq!(runs[1].value(), 0xff0000);
    }

    #[test]
    fn write_then_read_back() {
        let mut pool = ExprPool::new();
        let mut ctx = RegisterExecContext::new();
        let value = pool.number(0x42, 8);
        ctx.set_register(rax(), value, &mut pool, ctx0());
        let read = ctx.request_register(rax(), &mut pool, ctx0());
        assert_eq!(read, value);
        assert!(ctx.verify_mask_disjointness());
    }

    /// Writing EAX then AH leaves two disjoint slices; reading RAX recombines them with
    /// mask/shift/or arithmetic.
    #[test]
    fn slice_overwrite_splits() {
        let mut pool = ExprPool::new();
        let mut ctx = RegisterExecContext::new();
        let dead = pool.number(0xdead_beef, 4);
        ctx.set_register(eax(), dead, &mut pool, ctx0());
        let zero = pool.number(0, 1);
        ctx.set_register(ah(), zero, &mut pool, ctx0());

        let entries = ctx.entries(RegisterId::from_u16(0));
        // Byte 1 was carved out of the EAX slice: bytes [0], [2..4), plus the AH write.
        assert_eq!(entries.len(), 3);
        assert!(ctx.verify_mask_disjointness());

        let read = ctx.request_register(rax(), &mut pool, ctx0());
        // Bytes [4..8) were never written, so an input leaf was invented for them.
        let leafs = entries_with_input_leaf(&ctx, &pool);
        assert_eq!(leafs, 1);
        assert!(matches!(pool.data(read), NodeData::Op { .. }));
    }

    fn entries_with_input_leaf(ctx: &RegisterExecContext, pool: &ExprPool) -> usize {
        ctx.entries(RegisterId::from_u16(0))
            .iter()
            .filter(|info| {
                matches!(
                    pool.data(pool.top_root(info.expr)),
                    NodeData::RegRead { .. }
                )
            })
            .count()
    }

    #[test]
    fn repeated_unwritten_read_shares_leaf() {
        let mut pool = ExprPool::new();
        let mut ctx = RegisterExecContext::new();
        let first = ctx.request_register(rax(), &mut pool, ctx0());
        let second = ctx.request_register(rax(), &mut pool, ctx0());
        assert_eq!(first, second);
        assert!(matches!(pool.data(first), NodeData::RegRead { .. }));
    }

    #[test]
    fn using_modes() {
        let mut pool = ExprPool::new();
        let mut ctx = RegisterExecContext::new();
        let value = pool.number(1, 8);
        ctx.set_register(rax(), value, &mut pool, ctx0());
        assert_eq!(
            ctx.entries(RegisterId::from_u16(0))[0].using,
            RegisterUsing::Full
        );

        let mut ctx2 = RegisterExecContext::new();
        let value2 = pool.number(2, 8);
        ctx2.set_register(rax(), value2, &mut pool, ctx0());
        let _ = ctx2.request_register(ah(), &mut pool, ctx0());
        // A one-byte read of an eight-byte slice is a partial use, but the slice was fully
        // written before, so it stays fully using.
        assert_eq!(
            ctx2.entries(RegisterId::from_u16(0))[0].using,
            RegisterUsing::Full
        );
    }
}
