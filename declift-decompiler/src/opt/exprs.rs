//! Expression optimization: constant folding, algebraic identities, canonical ordering.
//!
//! Works bottom-up over every top-held tree in the graph. Associative chains are flattened,
//! their constants folded into one, and the remaining operands sorted by canonical hash (ties
//! by symbol id), so equal subtrees end up in one canonical spelling. The folded constant, when
//! it survives, goes last, which is also where a human would write it.

use crate::dec_graph::DecompiledCodeGraph;
use crate::expr::{mask_value_to_size, CondOp, ExprOp, ExprPool, Node, NodeData};

/// Run expression optimization over the whole graph.
pub fn do_expr_optimization(graph: &mut DecompiledCodeGraph) {
    let blocks: Vec<_> = graph.all_blocks().collect();
    for block in blocks {
        if graph.block(block).removed {
            continue;
        }
        let mut tops: Vec<_> = Vec::new();
        for line in graph.block(block).par_lines.iter().chain(&graph.block(block).seq_lines) {
            tops.push(line.dst);
            tops.push(line.src);
        }
        if let Some(cond) = graph.block(block).condition.expand() {
            tops.push(cond);
        }
        for top in tops {
            let root = graph.exprs.top_root(top);
            let optimized = optimize_subtree(&mut graph.exprs, root);
            if optimized != root {
                graph.exprs.set_top_root(top, optimized);
            }
        }
    }
}

/// Optimize one subtree to a fixed point (bounded), returning the new root.
pub(crate) fn optimize_subtree(pool: &mut ExprPool, mut node: Node) -> Node {
    for _ in 0..4 {
        let before = pool.hash(node);
        node = optimize_once(pool, node);
        if pool.hash(node) == before {
            break;
        }
    }
    node
}

fn optimize_once(pool: &mut ExprPool, node: Node) -> Node {
    for child in pool.children(node) {
        let new_child = optimize_once(pool, child);
        if new_child != child {
            pool.replace_child(node, child, new_child);
        }
    }
    rewrite(pool, node)
}

fn as_number(pool: &ExprPool, node: Node) -> Option<u64> {
    match pool.data(node) {
        NodeData::Num { value, .. } => Some(*value),
        _ => None,
    }
}

fn rewrite(pool: &mut ExprPool, node: Node) -> Node {
    match pool.data(node).clone() {
        NodeData::Op { op, lhs, rhs, mask } => {
            let size = mask.size_in_bytes();
            match rhs.expand() {
                Some(rhs) => rewrite_binary(pool, node, op, lhs, rhs, size),
                None => rewrite_unary(pool, node, op, lhs, size),
            }
        }
        NodeData::Cond { op, lhs, rhs } => {
            if let (Some(a), Some(b)) = (as_number(pool, lhs), as_number(pool, rhs)) {
                let size = pool.size_of(lhs);
                if let Some(result) = fold_comparison(op, a, b, size) {
                    return pool.number(u64::from(result), 1);
                }
            }
            node
        }
        NodeData::CompositeCond { op, lhs, rhs } => {
            // !!x => x
            if op == crate::expr::BoolOp::Not && rhs.is_none() {
                if let NodeData::CompositeCond {
                    op: crate::expr::BoolOp::Not,
                    lhs: inner,
                    rhs: inner_rhs,
                } = *pool.data(lhs)
                {
                    if inner_rhs.is_none() {
                        return inner;
                    }
                }
            }
            node
        }
        _ => node,
    }
}

fn rewrite_unary(pool: &mut ExprPool, node: Node, op: ExprOp, operand: Node, size: u8) -> Node {
    let Some(value) = as_number(pool, operand) else {
        return node;
    };
    let operand_size = pool.size_of(operand);
    match op {
        ExprOp::Not => pool.number(!value, size),
        ExprOp::Neg => pool.number(value.wrapping_neg(), size),
        ExprOp::ZExt => pool.number(value, size),
        ExprOp::SExt => pool.number(sign_extend(value, operand_size), size),
        _ => node,
    }
}

fn rewrite_binary(
    pool: &mut ExprPool,
    node: Node,
    op: ExprOp,
    lhs: Node,
    rhs: Node,
    size: u8,
) -> Node {
    // Both constant: fold outright.
    if let (Some(a), Some(b)) = (as_number(pool, lhs), as_number(pool, rhs)) {
        if let Some(value) = fold_binary(op, a, b, size) {
            return pool.number(value, size);
        }
    }

    let lhs_hash = pool.hash(lhs);
    let rhs_hash = pool.hash(rhs);
    let rhs_value = as_number(pool, rhs);
    let ones = mask_value_to_size(u64::MAX, size);

    // Identities with a constant right operand.
    if let Some(c) = rhs_value {
        match op {
            ExprOp::Add | ExprOp::Sub | ExprOp::Or | ExprOp::Xor if c == 0 => return lhs,
            ExprOp::Shl | ExprOp::Shr | ExprOp::Sar if c == 0 => return lhs,
            ExprOp::Mul if c == 1 => return lhs,
            ExprOp::Mul if c == 0 => return pool.number(0, size),
            ExprOp::And if c == 0 => return pool.number(0, size),
            ExprOp::And if c == ones => return lhs,
            _ => {}
        }
    }
    if let Some(c) = as_number(pool, lhs) {
        match op {
            ExprOp::Add | ExprOp::Or | ExprOp::Xor if c == 0 => return rhs,
            ExprOp::Mul if c == 1 => return rhs,
            ExprOp::Mul | ExprOp::And if c == 0 => return pool.number(0, size),
            _ => {}
        }
    }

    // Identities on equal operands.
    if lhs_hash == rhs_hash {
        match op {
            ExprOp::Xor | ExprOp::Sub => return pool.number(0, size),
            ExprOp::And | ExprOp::Or => return lhs,
            _ => {}
        }
    }

    if op.is_associative() && op.is_commutative() {
        return canonicalize_chain(pool, node, op, size);
    }
    node
}

/// Flatten an associative chain, fold its constants, and rebuild it with operands in canonical
/// order.
fn canonicalize_chain(pool: &mut ExprPool, node: Node, op: ExprOp, size: u8) -> Node {
    let mut operands: Vec<Node> = Vec::new();
    collect_chain(pool, node, op, &mut operands);

    let identity = match op {
        ExprOp::Add | ExprOp::Or | ExprOp::Xor => 0u64,
        ExprOp::Mul => 1,
        ExprOp::And => mask_value_to_size(u64::MAX, size),
        _ => unreachable!("not an associative chain operator"),
    };
    let mut constant = identity;
    let mut rest: Vec<Node> = Vec::new();
    for operand in operands {
        match as_number(pool, operand) {
            Some(value) => {
                constant = fold_binary(op, constant, value, size).unwrap_or(value);
            }
            None => rest.push(operand),
        }
    }

    // Ascending hash, ties by symbol id.
    rest.sort_by_key(|&n| (pool.hash(n), symbol_id(pool, n)));

    if rest.is_empty() {
        return pool.number(constant, size);
    }
    let mut result = rest[0];
    for &operand in &rest[1..] {
        result = pool.op(op, result, operand, size);
    }
    if constant != identity {
        let c = pool.number(constant, size);
        result = pool.op(op, result, c, size);
    }
    result
}

fn collect_chain(pool: &ExprPool, node: Node, op: ExprOp, out: &mut Vec<Node>) {
    if let NodeData::Op {
        op: node_op,
        lhs,
        rhs,
        ..
    } = *pool.data(node)
    {
        if node_op == op {
            if let Some(rhs) = rhs.expand() {
                collect_chain(pool, lhs, op, out);
                collect_chain(pool, rhs, op, out);
                return;
            }
        }
    }
    out.push(node);
}

fn symbol_id(pool: &ExprPool, node: Node) -> u32 {
    match pool.data(node) {
        NodeData::Sym { symbol, .. } => symbol.as_u32(),
        NodeData::SdaSym { symbol, .. } => symbol.as_u32(),
        _ => u32::MAX,
    }
}

fn fold_binary(op: ExprOp, a: u64, b: u64, size: u8) -> Option<u64> {
    let value = match op {
        ExprOp::Add => a.wrapping_add(b),
        ExprOp::Sub => a.wrapping_sub(b),
        ExprOp::Mul => a.wrapping_mul(b),
        ExprOp::Div => a.checked_div(b)?,
        ExprOp::Rem => a.checked_rem(b)?,
        ExprOp::SDiv => (a as i64).checked_div(b as i64)? as u64,
        ExprOp::SRem => (a as i64).checked_rem(b as i64)? as u64,
        ExprOp::And => a & b,
        ExprOp::Or => a | b,
        ExprOp::Xor => a ^ b,
        ExprOp::Shl => a.checked_shl(b as u32).unwrap_or(0),
        ExprOp::Shr => a.checked_shr(b as u32).unwrap_or(0),
        ExprOp::Sar => {
            let sa = sign_extend(a, size) as i64;
            sa.checked_shr(b as u32).unwrap_or(sa >> 63) as u64
        }
        _ => return None,
    };
    Some(mask_value_to_size(value, size))
}

fn fold_comparison(op: CondOp, a: u64, b: u64, size: u8) -> Option<bool> {
    let sa = sign_extend(a, size) as i64;
    let sb = sign_extend(b, size) as i64;
    Some(match op {
        CondOp::Eq => a == b,
        CondOp::Ne => a != b,
        CondOp::Ult => a < b,
        CondOp::Ule => a <= b,
        CondOp::Slt => sa < sb,
        CondOp::Sle => sa <= sb,
        _ => return None,
    })
}

fn sign_extend(value: u64, size: u8) -> u64 {
    if size >= 8 {
        return value;
    }
    let shift = 64 - u32::from(size) * 8;
    (((value << shift) as i64) >> shift) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::DecSymbol;

    fn pool() -> ExprPool {
        ExprPool::new()
    }

    #[test]
    fn folds_constants() {
        let mut p = pool();
        let a = p.number(0xdead_beef, 4);
        let m = p.number(0xff00, 4);
        let and = p.op(ExprOp::And, a, m, 4);
        let folded = optimize_subtree(&mut p, and);
        assert_eq!(as_number(&p, folded), Some(0xbe00));
    }

    /// The register-slicing scenario: EAX = 0xDEADBEEF with AH overwritten by zero reassembles
    /// to 0xDEAD00EF.
    #[test]
    fn folds_slice_reassembly() {
        let mut p = pool();
        let dead = p.number(0xdead_beef, 4);
        let low_mask = p.number(0xff, 4);
        let low = p.op(ExprOp::And, dead, low_mask, 4);
        let zero = p.number(0, 1);
        let eight = p.number(8, 1);
        let mid = p.op(ExprOp::Shl, zero, eight, 4);
        let sixteen = p.number(16, 1);
        let hi_shifted = p.op(ExprOp::Shr, dead, sixteen, 4);
        let hi = p.op(ExprOp::Shl, hi_shifted, sixteen, 4);
        let or1 = p.op(ExprOp::Or, low, mid, 4);
        let or2 = p.op(ExprOp::Or, or1, hi, 4);
        let folded = optimize_subtree(&mut p, or2);
        assert_eq!(as_number(&p, folded), Some(0xdead_00ef));
    }

    #[test]
    fn identities() {
        let mut p = pool();
        let s = p.sym(DecSymbol::from_u32(0), 8);
        let zero = p.number(0, 8);
        let add = p.op(ExprOp::Add, s, zero, 8);
        assert_eq!(optimize_subtree(&mut p, add), s);

        let s2 = p.sym(DecSymbol::from_u32(1), 8);
        let x1 = p.sym(DecSymbol::from_u32(1), 8);
        let xor = p.op(ExprOp::Xor, s2, x1, 8);
        let folded = optimize_subtree(&mut p, xor);
        assert_eq!(as_number(&p, folded), Some(0));
    }

    #[test]
    fn canonical_order_is_stable() {
        let mut p = pool();
        let a = p.sym(DecSymbol::from_u32(0), 8);
        let b = p.sym(DecSymbol::from_u32(1), 8);
        let ab = p.op(ExprOp::Add, a, b, 8);
        let ab = optimize_subtree(&mut p, ab);

        let a2 = p.sym(DecSymbol::from_u32(0), 8);
        let b2 = p.sym(DecSymbol::from_u32(1), 8);
        let ba = p.op(ExprOp::Add, b2, a2, 8);
        let ba = optimize_subtree(&mut p, ba);

        // Same canonical spelling, not just the same hash.
        let (l1, r1) = match *p.data(ab) {
            NodeData::Op { lhs, rhs, .. } => (p.hash(lhs), p.hash(rhs.unwrap())),
            _ => panic!("expected op"),
        };
        let (l2, r2) = match *p.data(ba) {
            NodeData::Op { lhs, rhs, .. } => (p.hash(lhs), p.hash(rhs.unwrap())),
            _ => panic!("expected op"),
        };
        assert_eq!((l1, r1), (l2, r2));
    }

    #[test]
    fn merges_chain_constants() {
        let mut p = pool();
        let s = p.sym(DecSymbol::from_u32(0), 8);
        let one = p.number(1, 8);
        let two = p.number(2, 8);
        let add1 = p.op(ExprOp::Add, s, one, 8);
        let add2 = p.op(ExprOp::Add, add1, two, 8);
        let folded = optimize_subtree(&mut p, add2);
        match *p.data(folded) {
            NodeData::Op {
                op: ExprOp::Add,
                lhs,
                rhs,
                ..
            } => {
                assert_eq!(lhs, s);
                assert_eq!(as_number(&p, rhs.unwrap()), Some(3));
            }
            _ => panic!("expected s + 3"),
        }
    }
}
