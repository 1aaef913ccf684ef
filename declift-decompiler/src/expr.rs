//! The expression-tree arena.
//!
//! Expression nodes live in a single [`ExprPool`] per decompiled function and reference each
//! other by [`Node`] index; the whole pool is dropped with its graph, so nothing here tracks
//! individual ownership. What is tracked is the *parent* side of every edge: a node knows every
//! node that uses it as a child, which is what substitution, liveness and the final integrity
//! check work from. A [`TopNode`] is a stable handle to a subtree root; exec contexts and block
//! lines hold tops, so replacing a root updates every holder at once.
//!
//! Hashes are canonical and bottom-up: commutative operators combine their children
//! order-insensitively, so two trees that differ only in commutative operand order hash equal.
//! The optimization pipeline sorts commutative operands by this hash, which is what makes the
//! final output deterministic.

use crate::environ::{ProgSymbol, TypeId};
use crate::symbol::DecSymbol;
use declift_entity::{entity_impl, PackedOption, PrimaryMap, SecondaryMap};
use declift_pcode::{BitMask64, ComplexOffset, Register};
use smallvec::SmallVec;

/// An opaque reference to an expression node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);
entity_impl!(Node, "n");

/// A stable handle to a subtree root.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopNode(u32);
entity_impl!(TopNode, "top");

/// Operators of non-condition operational nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs, reason = "conventional operator names")]
pub enum ExprOp {
    Add,
    Sub,
    Mul,
    Div,
    SDiv,
    Rem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Not,
    Neg,
    ZExt,
    SExt,
    Load,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FNeg,
    FAbs,
    FSqrt,
}

impl ExprOp {
    /// Operand order does not matter.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::And | Self::Or | Self::Xor | Self::FAdd | Self::FMul
        )
    }

    /// Chains of this operator can be reassociated freely.
    pub fn is_associative(self) -> bool {
        matches!(self, Self::Add | Self::Mul | Self::And | Self::Or | Self::Xor)
    }

    /// The operator takes a single operand.
    pub fn is_unary(self) -> bool {
        matches!(
            self,
            Self::Not
                | Self::Neg
                | Self::ZExt
                | Self::SExt
                | Self::Load
                | Self::FNeg
                | Self::FAbs
                | Self::FSqrt
        )
    }

    /// Name used by the textual writer.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add | Self::FAdd => "+",
            Self::Sub | Self::FSub => "-",
            Self::Mul | Self::FMul => "*",
            Self::Div | Self::SDiv | Self::FDiv => "/",
            Self::Rem | Self::SRem => "%",
            Self::And => "&",
            Self::Or => "|",
            Self::Xor => "^",
            Self::Shl => "<<",
            Self::Shr | Self::Sar => ">>",
            Self::Not => "~",
            Self::Neg | Self::FNeg => "-",
            Self::ZExt => "zext",
            Self::SExt => "sext",
            Self::Load => "*",
            Self::FAbs => "fabs",
            Self::FSqrt => "fsqrt",
        }
    }
}

/// Comparison operators of condition nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs, reason = "conventional operator names")]
pub enum CondOp {
    Eq,
    Ne,
    Ult,
    Ule,
    Slt,
    Sle,
    Carry,
    SCarry,
    SBorrow,
    FEq,
    FNe,
    FLt,
    FLe,
}

impl CondOp {
    /// Operand order does not matter.
    pub fn is_commutative(self) -> bool {
        matches!(self, Self::Eq | Self::Ne | Self::FEq | Self::FNe)
    }

    /// Name used by the textual writer.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq | Self::FEq => "==",
            Self::Ne | Self::FNe => "!=",
            Self::Ult | Self::Slt | Self::FLt => "<",
            Self::Ule | Self::Sle | Self::FLe => "<=",
            Self::Carry => "carry",
            Self::SCarry => "scarry",
            Self::SBorrow => "sborrow",
        }
    }
}

/// Connectives of composite condition nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs, reason = "conventional operator names")]
pub enum BoolOp {
    And,
    Or,
    Xor,
    Not,
}

impl BoolOp {
    /// Name used by the textual writer.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::And => "&&",
            Self::Or => "||",
            Self::Xor => "^^",
            Self::Not => "!",
        }
    }
}

/// The tagged variants of an expression node.
///
/// The first group is produced by the primary decompiler; the `Sda*` and `Cast` variants appear
/// once symbolization has bound nodes to program symbols and data types.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeData {
    /// An operational node. `rhs` is absent for unary operators. `mask` is the value mask of
    /// the result.
    Op {
        /// The operator.
        op: ExprOp,
        /// Left (or only) operand.
        lhs: Node,
        /// Right operand, absent for unary operators.
        rhs: PackedOption<Node>,
        /// Value mask of the result.
        mask: BitMask64,
    },
    /// A function call.
    Call {
        /// The call target expression.
        dest: Node,
        /// Argument expressions, in parameter order.
        args: SmallVec<[Node; 4]>,
        /// Size of the returned value in bytes; 0 when the callee returns nothing.
        ret_size: u8,
        /// Set when no signature could be resolved and the project default was substituted.
        ambiguous: bool,
    },
    /// A comparison producing a boolean.
    Cond {
        /// The comparison operator.
        op: CondOp,
        /// Left operand.
        lhs: Node,
        /// Right operand.
        rhs: Node,
    },
    /// A boolean connective over conditions. `rhs` is absent for `Not`.
    CompositeCond {
        /// The connective.
        op: BoolOp,
        /// Left (or only) operand.
        lhs: Node,
        /// Right operand, absent for `Not`.
        rhs: PackedOption<Node>,
    },
    /// A transparent annotation produced by debug processing: same value as `target`, tagged
    /// with the instruction that computed it.
    Mirror {
        /// The annotated expression.
        target: Node,
        /// The originating instruction.
        offset: ComplexOffset,
    },
    /// An integer constant.
    Num {
        /// The value, masked to `size`.
        value: u64,
        /// Width in bytes.
        size: u8,
    },
    /// A read of a decompiler symbol.
    Sym {
        /// The symbol.
        symbol: DecSymbol,
        /// Width in bytes.
        size: u8,
    },
    /// A read of a register slice the function never wrote: an input of the function.
    RegRead {
        /// The register slice.
        register: Register,
    },
    /// A symbol leaf bound to a program symbol.
    SdaSym {
        /// The program symbol.
        symbol: ProgSymbol,
        /// The decompiler symbol this leaf replaced, if any.
        dec: PackedOption<DecSymbol>,
        /// Width in bytes.
        size: u8,
    },
    /// A memory-resident program symbol (stack slot or global), or its address.
    SdaMemSym {
        /// The program symbol.
        symbol: ProgSymbol,
        /// Byte offset of the location: stack-pointer relative or an absolute global address.
        offset: i64,
        /// True when the expression denotes the address rather than the stored value.
        addr_getting: bool,
        /// Width of the accessed value in bytes.
        size: u8,
    },
    /// A typed integer constant.
    SdaNum {
        /// The value.
        value: u64,
        /// The calculated data type.
        ty: TypeId,
        /// Width in bytes.
        size: u8,
    },
    /// An implicit cast inserted by type calculation.
    Cast {
        /// The casted expression.
        inner: Node,
        /// The target data type.
        ty: TypeId,
        /// Width of the target type in bytes.
        size: u8,
    },
}

/// The arena of expression nodes for one decompiled function.
pub struct ExprPool {
    nodes: PrimaryMap<Node, NodeData>,
    parents: SecondaryMap<Node, SmallVec<[Node; 2]>>,
    tops: PrimaryMap<TopNode, PackedOption<Node>>,
}

impl ExprPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            nodes: PrimaryMap::new(),
            parents: SecondaryMap::new(),
            tops: PrimaryMap::new(),
        }
    }

    /// Number of nodes ever created.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// The data of a node.
    pub fn data(&self, node: Node) -> &NodeData {
        &self.nodes[node]
    }

    /// The nodes using `node` as a child.
    pub fn parents(&self, node: Node) -> &[Node] {
        &self.parents[node]
    }

    /// Allocate a node, linking it as a parent of all of its children.
    pub fn make(&mut self, data: NodeData) -> Node {
        let node = self.nodes.next_key();
        for child in Self::children_of(&data) {
            self.parents[child].push(node);
        }
        self.nodes.push(data)
    }

    /// Allocate an integer constant leaf, masking the value to `size`.
    pub fn number(&mut self, value: u64, size: u8) -> Node {
        self.make(NodeData::Num {
            value: mask_value_to_size(value, size),
            size,
        })
    }

    /// Allocate a decompiler-symbol leaf.
    pub fn sym(&mut self, symbol: DecSymbol, size: u8) -> Node {
        self.make(NodeData::Sym { symbol, size })
    }

    /// Allocate an input-register read leaf.
    pub fn reg_read(&mut self, register: Register) -> Node {
        self.make(NodeData::RegRead { register })
    }

    /// Allocate a binary operational node sized like its mask.
    pub fn op(&mut self, op: ExprOp, lhs: Node, rhs: Node, size: u8) -> Node {
        debug_assert!(!op.is_unary());
        self.make(NodeData::Op {
            op,
            lhs,
            rhs: rhs.into(),
            mask: BitMask64::from_size_offset(size, 0),
        })
    }

    /// Allocate a unary operational node.
    pub fn unary_op(&mut self, op: ExprOp, operand: Node, size: u8) -> Node {
        debug_assert!(op.is_unary());
        self.make(NodeData::Op {
            op,
            lhs: operand,
            rhs: None.into(),
            mask: BitMask64::from_size_offset(size, 0),
        })
    }

    /// Allocate a comparison node.
    pub fn cond(&mut self, op: CondOp, lhs: Node, rhs: Node) -> Node {
        self.make(NodeData::Cond { op, lhs, rhs })
    }

    /// Allocate a composite condition node.
    pub fn composite_cond(&mut self, op: BoolOp, lhs: Node, rhs: Option<Node>) -> Node {
        debug_assert_eq!(rhs.is_none(), op == BoolOp::Not);
        self.make(NodeData::CompositeCond {
            op,
            lhs,
            rhs: rhs.into(),
        })
    }

    /// The children of a node, in operand order.
    pub fn children(&self, node: Node) -> SmallVec<[Node; 4]> {
        Self::children_of(&self.nodes[node])
    }

    fn children_of(data: &NodeData) -> SmallVec<[Node; 4]> {
        match data {
            NodeData::Op { lhs, rhs, .. } | NodeData::CompositeCond { lhs, rhs, .. } => {
                let mut v = SmallVec::new();
                v.push(*lhs);
                if let Some(rhs) = rhs.expand() {
                    v.push(rhs);
                }
                v
            }
            NodeData::Call { dest, args, .. } => {
                let mut v = SmallVec::with_capacity(args.len() + 1);
                v.push(*dest);
                v.extend(args.iter().copied());
                v
            }
            NodeData::Cond { lhs, rhs, .. } => SmallVec::from_slice(&[*lhs, *rhs]),
            NodeData::Mirror { target, .. } => SmallVec::from_slice(&[*target]),
            NodeData::Cast { inner, .. } => SmallVec::from_slice(&[*inner]),
            NodeData::Num { .. }
            | NodeData::Sym { .. }
            | NodeData::RegRead { .. }
            | NodeData::SdaSym { .. }
            | NodeData::SdaMemSym { .. }
            | NodeData::SdaNum { .. } => SmallVec::new(),
        }
    }

    /// Width of a node's value in bytes.
    pub fn size_of(&self, node: Node) -> u8 {
        match &self.nodes[node] {
            NodeData::Op { mask, .. } => mask.size_in_bytes(),
            NodeData::Call { ret_size, .. } => *ret_size,
            NodeData::Cond { .. } | NodeData::CompositeCond { .. } => 1,
            NodeData::Mirror { target, .. } => self.size_of(*target),
            NodeData::Num { size, .. }
            | NodeData::Sym { size, .. }
            | NodeData::SdaSym { size, .. }
            | NodeData::SdaMemSym { size, .. }
            | NodeData::SdaNum { size, .. }
            | NodeData::Cast { size, .. } => *size,
            NodeData::RegRead { register } => register.size,
        }
    }

    /// Look through any mirror annotations.
    pub fn resolve_mirrors(&self, mut node: Node) -> Node {
        while let NodeData::Mirror { target, .. } = self.nodes[node] {
            node = target;
        }
        node
    }

    /// Is the node a condition (comparison or composite)?
    pub fn is_condition(&self, node: Node) -> bool {
        matches!(
            self.nodes[self.resolve_mirrors(node)],
            NodeData::Cond { .. } | NodeData::CompositeCond { .. }
        )
    }

    /// Allocate a new top handle owning `root`.
    pub fn make_top(&mut self, root: Node) -> TopNode {
        self.tops.push(root.into())
    }

    /// The root currently held by a top handle.
    pub fn top_root(&self, top: TopNode) -> Node {
        self.tops[top].expect("top handle has been cleared")
    }

    /// Point a top handle at a different root.
    pub fn set_top_root(&mut self, top: TopNode, root: Node) {
        self.tops[top] = root.into();
    }

    /// Clear a top handle. The subtree stays in the arena; it is simply no longer reachable
    /// through this handle.
    pub fn clear_top(&mut self, top: TopNode) {
        self.tops[top] = None.into();
    }

    /// Replace one occurrence of `old` among `parent`'s children with `new`, relinking the
    /// parent lists of both sides before returning.
    pub fn replace_child(&mut self, parent: Node, old: Node, new: Node) {
        let replaced = {
            let data = &mut self.nodes[parent];
            Self::swap_child(data, old, new)
        };
        debug_assert!(replaced, "{old} is not a child of {parent}");
        if replaced {
            let parents = &mut self.parents[old];
            if let Some(pos) = parents.iter().position(|&p| p == parent) {
                parents.remove(pos);
            }
            self.parents[new].push(parent);
        }
    }

    fn swap_child(data: &mut NodeData, old: Node, new: Node) -> bool {
        let slot = |n: &mut Node| {
            if *n == old {
                *n = new;
                true
            } else {
                false
            }
        };
        let packed_slot = |n: &mut PackedOption<Node>| {
            if n.expand() == Some(old) {
                *n = new.into();
                true
            } else {
                false
            }
        };
        match data {
            NodeData::Op { lhs, rhs, .. } | NodeData::CompositeCond { lhs, rhs, .. } => {
                slot(lhs) || packed_slot(rhs)
            }
            NodeData::Call { dest, args, .. } => {
                slot(dest) || args.iter_mut().any(slot)
            }
            NodeData::Cond { lhs, rhs, .. } => slot(lhs) || slot(rhs),
            NodeData::Mirror { target, .. } => slot(target),
            NodeData::Cast { inner, .. } => slot(inner),
            _ => false,
        }
    }

    /// Replace `old` with `new` in every parent and every top handle.
    pub fn replace_everywhere(&mut self, old: Node, new: Node) {
        if old == new {
            return;
        }
        let parents: SmallVec<[Node; 2]> = self.parents[old].clone();
        for parent in parents {
            self.replace_child(parent, old, new);
        }
        for top in self.tops.keys().collect::<Vec<_>>() {
            if self.tops[top].expand() == Some(old) {
                self.tops[top] = new.into();
            }
        }
    }

    /// Deep-copy a subtree, allocating fresh nodes throughout.
    pub fn clone_subtree(&mut self, node: Node) -> Node {
        let data = self.nodes[node].clone();
        let data = match data {
            NodeData::Op { op, lhs, rhs, mask } => NodeData::Op {
                op,
                lhs: self.clone_subtree(lhs),
                rhs: match rhs.expand() {
                    Some(rhs) => self.clone_subtree(rhs).into(),
                    None => None.into(),
                },
                mask,
            },
            NodeData::Call {
                dest,
                args,
                ret_size,
                ambiguous,
            } => NodeData::Call {
                dest: self.clone_subtree(dest),
                args: args.iter().map(|&a| self.clone_subtree(a)).collect(),
                ret_size,
                ambiguous,
            },
            NodeData::Cond { op, lhs, rhs } => NodeData::Cond {
                op,
                lhs: self.clone_subtree(lhs),
                rhs: self.clone_subtree(rhs),
            },
            NodeData::CompositeCond { op, lhs, rhs } => NodeData::CompositeCond {
                op,
                lhs: self.clone_subtree(lhs),
                rhs: match rhs.expand() {
                    Some(rhs) => self.clone_subtree(rhs).into(),
                    None => None.into(),
                },
            },
            NodeData::Mirror { target, offset } => NodeData::Mirror {
                target: self.clone_subtree(target),
                offset,
            },
            NodeData::Cast { inner, ty, size } => NodeData::Cast {
                inner: self.clone_subtree(inner),
                ty,
                size,
            },
            leaf => leaf,
        };
        self.make(data)
    }

    /// Visit `root` and every node below it, parents before children.
    pub fn walk(&self, root: Node, f: &mut impl FnMut(Node)) {
        f(root);
        for child in self.children(root) {
            self.walk(child, f);
        }
    }

    /// Collect the symbol leaves of `symbol` inside the subtree at `root`.
    pub fn gather_symbol_leaves(&self, root: Node, symbol: DecSymbol) -> Vec<Node> {
        let mut leaves = Vec::new();
        self.walk(root, &mut |n| {
            if let NodeData::Sym { symbol: s, .. } = self.nodes[n] {
                if s == symbol {
                    leaves.push(n);
                }
            }
        });
        leaves
    }

    /// Does the subtree contain a call node?
    pub fn contains_call(&self, root: Node) -> bool {
        let mut found = false;
        self.walk(root, &mut |n| {
            found |= matches!(self.nodes[n], NodeData::Call { .. });
        });
        found
    }

    /// Canonical bottom-up hash of a subtree.
    ///
    /// Commutative operators combine child hashes order-insensitively; mirror annotations are
    /// transparent. Equal hashes are treated as structural equality throughout the pipeline.
    pub fn hash(&self, node: Node) -> u64 {
        match &self.nodes[node] {
            NodeData::Op { op, lhs, rhs, mask } => {
                let tag = mix(0x10, *op as u64 ^ mask.value());
                match rhs.expand() {
                    Some(rhs) if op.is_commutative() => {
                        mix(tag, self.hash(*lhs).wrapping_add(self.hash(rhs)))
                    }
                    Some(rhs) => mix(mix(tag, self.hash(*lhs)), self.hash(rhs)),
                    None => mix(tag, self.hash(*lhs)),
                }
            }
            NodeData::Call { dest, args, .. } => {
                let mut h = mix(0x20, self.hash(*dest));
                for &arg in args {
                    h = mix(h, self.hash(arg));
                }
                h
            }
            NodeData::Cond { op, lhs, rhs } => {
                let tag = mix(0x30, *op as u64);
                if op.is_commutative() {
                    mix(tag, self.hash(*lhs).wrapping_add(self.hash(*rhs)))
                } else {
                    mix(mix(tag, self.hash(*lhs)), self.hash(*rhs))
                }
            }
            NodeData::CompositeCond { op, lhs, rhs } => {
                let tag = mix(0x40, *op as u64);
                match rhs.expand() {
                    Some(rhs) if *op != BoolOp::Not => {
                        mix(tag, self.hash(*lhs).wrapping_add(self.hash(rhs)))
                    }
                    Some(rhs) => mix(mix(tag, self.hash(*lhs)), self.hash(rhs)),
                    None => mix(tag, self.hash(*lhs)),
                }
            }
            NodeData::Mirror { target, .. } => self.hash(*target),
            NodeData::Num { value, size } => mix(0x50, value ^ (u64::from(*size) << 56)),
            NodeData::Sym { symbol, .. } => mix(0x60, symbol.as_u32() as u64),
            NodeData::RegRead { register } => mix(
                0x70,
                (u64::from(register.id.as_u16()) << 16)
                    | (u64::from(register.byte_offset) << 8)
                    | u64::from(register.size),
            ),
            NodeData::SdaSym { symbol, .. } => mix(0x80, symbol.as_u32() as u64),
            // Combine the offset so the same base symbol at different offsets does not collide.
            NodeData::SdaMemSym {
                symbol,
                offset,
                addr_getting,
                ..
            } => mix(
                0x90 | u64::from(*addr_getting),
                (symbol.as_u32() as u64).wrapping_add(*offset as u64),
            ),
            NodeData::SdaNum { value, .. } => mix(0xa0, *value),
            NodeData::Cast { inner, ty, .. } => mix(0xb0 ^ ty.as_u32() as u64, self.hash(*inner)),
        }
    }

    /// Iterate over all top handles currently holding a root.
    pub fn tops(&self) -> impl Iterator<Item = (TopNode, Node)> + '_ {
        self.tops
            .iter()
            .filter_map(|(top, root)| root.expand().map(|r| (top, r)))
    }

    /// Check parent-link consistency: for every node and every child of it, the node must be in
    /// the child's parent list. Returns the first offending pair.
    pub fn verify_parent_links(&self) -> Result<(), (Node, Node)> {
        for node in self.nodes.keys() {
            for child in self.children(node) {
                if !self.parents[child].contains(&node) {
                    return Err((node, child));
                }
            }
        }
        Ok(())
    }
}

impl Default for ExprPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Mask `value` to the low `size` bytes.
pub fn mask_value_to_size(value: u64, size: u8) -> u64 {
    if size >= 8 {
        value
    } else {
        value & ((1u64 << (u32::from(size) * 8)) - 1)
    }
}

fn mix(a: u64, b: u64) -> u64 {
    let mut x = a ^ b.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(pool: &mut ExprPool, id: u32) -> Node {
        pool.sym(DecSymbol::from_u32(id), 8)
    }

    #[test]
    fn commutative_hash() {
        let mut pool = ExprPool::new();
        let a = sym(&mut pool, 0);
        let b = sym(&mut pool, 1);
        let ab = pool.op(ExprOp::Add, a, b, 8);
        let a2 = sym(&mut pool, 0);
        let b2 = sym(&mut pool, 1);
        let ba = pool.op(ExprOp::Add, b2, a2, 8);
        assert_eq!(pool.hash(ab), pool.hash(ba));

        let sub_ab = pool.op(ExprOp::Sub, a, b, 8);
        let sub_ba = pool.op(ExprOp::Sub, b, a, 8);
        assert_ne!(pool.hash(sub_ab), pool.hash(sub_ba));
    }

    #[test]
    fn mirrors_are_transparent_to_hashing() {
        let mut pool = ExprPool::new();
        let a = sym(&mut pool, 0);
        let wrapped = pool.make(NodeData::Mirror {
            target: a,
            offset: ComplexOffset::new(0x10, 0),
        });
        assert_eq!(pool.hash(a), pool.hash(wrapped));
        assert_eq!(pool.resolve_mirrors(wrapped), a);
    }

    #[test]
    fn parent_links() {
        let mut pool = ExprPool::new();
        let a = sym(&mut pool, 0);
        let b = sym(&mut pool, 1);
        let add = pool.op(ExprOp::Add, a, b, 8);
        assert_eq!(pool.parents(a), &[add]);
        assert_eq!(pool.parents(b), &[add]);
        assert!(pool.verify_parent_links().is_ok());

        let c = sym(&mut pool, 2);
        pool.replace_child(add, b, c);
        assert!(pool.parents(b).is_empty());
        assert_eq!(pool.parents(c), &[add]);
        assert!(pool.verify_parent_links().is_ok());
    }

    #[test]
    fn replace_everywhere_updates_tops() {
        let mut pool = ExprPool::new();
        let a = sym(&mut pool, 0);
        let top = pool.make_top(a);
        let n = pool.number(7, 8);
        pool.replace_everywhere(a, n);
        assert_eq!(pool.top_root(top), n);
    }

    #[test]
    fn clone_is_deep() {
        let mut pool = ExprPool::new();
        let a = sym(&mut pool, 0);
        let n = pool.number(1, 8);
        let add = pool.op(ExprOp::Add, a, n, 8);
        let copy = pool.clone_subtree(add);
        assert_ne!(copy, add);
        assert_eq!(pool.hash(copy), pool.hash(add));
        // The copy has its own leaves.
        assert_eq!(pool.parents(a).len(), 1);
    }

    #[test]
    fn gather_leaves() {
        let mut pool = ExprPool::new();
        let s = DecSymbol::from_u32(3);
        let a = pool.sym(s, 8);
        let b = pool.sym(s, 8);
        let add = pool.op(ExprOp::Add, a, b, 8);
        assert_eq!(pool.gather_symbol_leaves(add, s).len(), 2);
        assert_eq!(
            pool.gather_symbol_leaves(add, DecSymbol::from_u32(4)).len(),
            0
        );
    }
}
