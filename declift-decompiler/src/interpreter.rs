//! Abstract interpretation of individual PCode instructions.
//!
//! One big match over the opcode, in translation-unit style: inputs are read through the exec
//! context, an expression node is built, and the result is written back through the context.
//! Only three opcode families leave traces outside the context: stores and calls append
//! sequential lines to the block, and conditional branches set the block's condition.

use crate::dec_graph::DecBlock;
use crate::decompiler::PrimaryDecompiler;
use crate::exec_context::ExecCtx;
use crate::expr::{BoolOp, CondOp, ExprOp, Node, NodeData};
use crate::symbol::DecSymbolData;
use declift_pcode::{Inst, Instruction, Opcode, Varnode};
use smallvec::SmallVec;

impl<'a> PrimaryDecompiler<'a> {
    pub(crate) fn execute_instruction(&mut self, block: DecBlock, ctx: ExecCtx, inst: Inst) {
        let instr = *self.pcode.inst(inst);
        log::trace!("  {instr}");
        match instr.opcode {
            Opcode::Copy => {
                let value = self.request(ctx, instr.input0);
                self.write_output(ctx, &instr, value);
            }
            Opcode::Load => {
                let addr = self.request(ctx, instr.input0);
                let size = instr.output.map_or(8, Varnode::size);
                let value = self.graph.exprs.unary_op(ExprOp::Load, addr, size);
                self.write_output(ctx, &instr, value);
            }
            Opcode::Store => {
                let addr = self.request(ctx, instr.input0);
                let value = self.request(ctx, instr.input1);
                let size = self.graph.exprs.size_of(value);
                let dst = self.graph.exprs.unary_op(ExprOp::Load, addr, size);
                self.graph.add_seq_line(block, dst, value, Some(instr.offset));
            }

            Opcode::IntAdd => self.binary(ctx, &instr, ExprOp::Add),
            Opcode::IntSub => self.binary(ctx, &instr, ExprOp::Sub),
            Opcode::IntMult => self.binary(ctx, &instr, ExprOp::Mul),
            Opcode::IntDiv => self.binary(ctx, &instr, ExprOp::Div),
            Opcode::IntSDiv => self.binary(ctx, &instr, ExprOp::SDiv),
            Opcode::IntRem => self.binary(ctx, &instr, ExprOp::Rem),
            Opcode::IntSRem => self.binary(ctx, &instr, ExprOp::SRem),
            Opcode::IntAnd => self.binary(ctx, &instr, ExprOp::And),
            Opcode::IntOr => self.binary(ctx, &instr, ExprOp::Or),
            Opcode::IntXor => self.binary(ctx, &instr, ExprOp::Xor),
            Opcode::IntLeft => self.binary(ctx, &instr, ExprOp::Shl),
            Opcode::IntRight => self.binary(ctx, &instr, ExprOp::Shr),
            Opcode::IntSRight => self.binary(ctx, &instr, ExprOp::Sar),
            Opcode::IntNegate => self.unary(ctx, &instr, ExprOp::Not),
            Opcode::Int2Comp => self.unary(ctx, &instr, ExprOp::Neg),
            Opcode::IntZExt => self.unary(ctx, &instr, ExprOp::ZExt),
            Opcode::IntSExt => self.unary(ctx, &instr, ExprOp::SExt),

            Opcode::IntEqual => self.comparison(ctx, &instr, CondOp::Eq),
            Opcode::IntNotEqual => self.comparison(ctx, &instr, CondOp::Ne),
            Opcode::IntLess => self.comparison(ctx, &instr, CondOp::Ult),
            Opcode::IntLessEqual => self.comparison(ctx, &instr, CondOp::Ule),
            Opcode::IntSLess => self.comparison(ctx, &instr, CondOp::Slt),
            Opcode::IntSLessEqual => self.comparison(ctx, &instr, CondOp::Sle),
            Opcode::IntCarry => self.comparison(ctx, &instr, CondOp::Carry),
            Opcode::IntSCarry => self.comparison(ctx, &instr, CondOp::SCarry),
            Opcode::IntSBorrow => self.comparison(ctx, &instr, CondOp::SBorrow),

            Opcode::BoolAnd => self.boolean(ctx, &instr, BoolOp::And),
            Opcode::BoolOr => self.boolean(ctx, &instr, BoolOp::Or),
            Opcode::BoolXor => self.boolean(ctx, &instr, BoolOp::Xor),
            Opcode::BoolNegate => {
                let operand = self.request_condition(ctx, instr.input0);
                let value = self
                    .graph
                    .exprs
                    .composite_cond(BoolOp::Not, operand, None);
                self.write_output(ctx, &instr, value);
            }

            Opcode::FloatAdd => self.binary(ctx, &instr, ExprOp::FAdd),
            Opcode::FloatSub => self.binary(ctx, &instr, ExprOp::FSub),
            Opcode::FloatMult => self.binary(ctx, &instr, ExprOp::FMul),
            Opcode::FloatDiv => self.binary(ctx, &instr, ExprOp::FDiv),
            Opcode::FloatNeg => self.unary(ctx, &instr, ExprOp::FNeg),
            Opcode::FloatAbs => self.unary(ctx, &instr, ExprOp::FAbs),
            Opcode::FloatSqrt => self.unary(ctx, &instr, ExprOp::FSqrt),
            Opcode::FloatEqual => self.comparison(ctx, &instr, CondOp::FEq),
            Opcode::FloatNotEqual => self.comparison(ctx, &instr, CondOp::FNe),
            Opcode::FloatLess => self.comparison(ctx, &instr, CondOp::FLt),
            Opcode::FloatLessEqual => self.comparison(ctx, &instr, CondOp::FLe),

            Opcode::Branch | Opcode::BranchInd => {
                // The edge is already in the graph; nothing to evaluate.
            }
            Opcode::CBranch => {
                let condition = self.request_condition(ctx, instr.input1);
                self.graph.set_condition(block, condition, Some(instr.offset));
            }
            Opcode::Call | Opcode::CallInd => {
                self.call(block, ctx, inst, &instr);
            }
            Opcode::Return => {
                // End-block outputs are materialized at finalization.
            }
        }
    }

    fn request(&mut self, ctx: ExecCtx, varnode: Option<Varnode>) -> Node {
        let Some(varnode) = varnode else {
            debug_assert!(false, "missing input operand");
            return self.graph.exprs.number(0, 1);
        };
        self.graph
            .exec
            .get_mut(ctx)
            .request_varnode(varnode, &mut self.graph.exprs, ctx)
    }

    /// Read an operand that must be a boolean condition, wrapping plain values in `!= 0`.
    fn request_condition(&mut self, ctx: ExecCtx, varnode: Option<Varnode>) -> Node {
        let value = self.request(ctx, varnode);
        if self.graph.exprs.is_condition(value) {
            value
        } else {
            let size = self.graph.exprs.size_of(value);
            let zero = self.graph.exprs.number(0, size);
            self.graph.exprs.cond(CondOp::Ne, value, zero)
        }
    }

    fn write_output(&mut self, ctx: ExecCtx, instr: &Instruction, value: Node) {
        let Some(output) = instr.output else {
            return;
        };
        self.graph
            .exec
            .get_mut(ctx)
            .set_varnode(output, value, &mut self.graph.exprs, ctx);
    }

    fn binary(&mut self, ctx: ExecCtx, instr: &Instruction, op: ExprOp) {
        let lhs = self.request(ctx, instr.input0);
        let rhs = self.request(ctx, instr.input1);
        let size = instr.output.map_or_else(|| self.graph.exprs.size_of(lhs), Varnode::size);
        let value = self.graph.exprs.op(op, lhs, rhs, size);
        self.write_output(ctx, instr, value);
    }

    fn unary(&mut self, ctx: ExecCtx, instr: &Instruction, op: ExprOp) {
        let operand = self.request(ctx, instr.input0);
        let size = instr
            .output
            .map_or_else(|| self.graph.exprs.size_of(operand), Varnode::size);
        let value = self.graph.exprs.unary_op(op, operand, size);
        self.write_output(ctx, instr, value);
    }

    fn comparison(&mut self, ctx: ExecCtx, instr: &Instruction, op: CondOp) {
        let lhs = self.request(ctx, instr.input0);
        let rhs = self.request(ctx, instr.input1);
        let value = self.graph.exprs.cond(op, lhs, rhs);
        self.write_output(ctx, instr, value);
    }

    fn boolean(&mut self, ctx: ExecCtx, instr: &Instruction, op: BoolOp) {
        let lhs = self.request_condition(ctx, instr.input0);
        let rhs = self.request_condition(ctx, instr.input1);
        let value = self.graph.exprs.composite_cond(op, lhs, Some(rhs));
        self.write_output(ctx, instr, value);
    }

    /// Interpret a call site: resolve its signature, read the arguments from their storages,
    /// bind the result to a fresh variable, and leave a sequential line for the call itself.
    fn call(&mut self, block: DecBlock, ctx: ExecCtx, inst: Inst, instr: &Instruction) {
        let target = self
            .pcode
            .func_graph(self.graph.func)
            .const_values
            .get(&inst)
            .copied()
            .or_else(|| instr.constant_target());
        let info = self.call_resolver.resolve_call_info(instr, target);
        if info.ambiguous {
            log::debug!("ambiguous call at {}", instr.offset);
        }

        let dest = match target {
            Some(target) => self.graph.exprs.number(target, 8),
            None => self.request(ctx, instr.input0),
        };

        let mut args: SmallVec<[Node; 4]> = SmallVec::new();
        for param in &info.signature.params {
            let arg = match param.storage {
                crate::environ::Storage::Register(reg) => {
                    let exec = self.graph.exec.get_mut(ctx);
                    exec.current
                        .request_register(reg, &mut self.graph.exprs, ctx)
                }
                crate::environ::Storage::Stack { offset, size } => {
                    let sp = self.reg_factory.stack_pointer();
                    let sp_expr = {
                        let exec = self.graph.exec.get_mut(ctx);
                        exec.current.request_register(sp, &mut self.graph.exprs, ctx)
                    };
                    let off = self.graph.exprs.number(offset as u64, sp.size);
                    let addr = self.graph.exprs.op(ExprOp::Add, sp_expr, off, sp.size);
                    self.graph.exprs.unary_op(ExprOp::Load, addr, size)
                }
            };
            args.push(arg);
        }

        let ret = info.signature.ret;
        let ret_size = ret.map_or(0, |r| r.register.size);
        let call = self.graph.exprs.make(NodeData::Call {
            dest,
            args,
            ret_size,
            ambiguous: info.ambiguous,
        });

        let result_sym = self.graph.new_symbol(DecSymbolData::func_result(ret_size));
        let result = self.graph.exprs.sym(result_sym, ret_size);
        self.graph
            .add_seq_line(block, result, call, Some(instr.offset));
        if let Some(ret) = ret {
            self.graph.exec.get_mut(ctx).current.set_register(
                ret.register,
                result,
                &mut self.graph.exprs,
                ctx,
            );
        }
    }
}
