//! End-to-end decompilation scenarios over small hand-built PCode streams.

use declift_decompiler::environ::{
    DummyEnvironment, FunctionSignature, Param, ReturnValue, Storage, TypeManager,
};
use declift_decompiler::write::{graph_to_string, sda_graph_to_string};
use declift_decompiler::{
    stack_pointer_value_at_offset, Config, Context, DecompilationSession, NodeData, StopPoint,
};
use declift_pcode::{
    ComplexOffset, GraphBuilder, ImagePCodeGraph, Instruction, Opcode, Register, RegisterFactory,
    RegisterId, Varnode,
};

const RAX: u16 = 0;
const RCX: u16 = 1;
const RSP: u16 = 4;
const RIP: u16 = 5;

struct X64Regs;

impl RegisterFactory for X64Regs {
    fn stack_pointer(&self) -> Register {
        Register::whole(RegisterId::from_u16(RSP), 8)
    }

    fn instruction_pointer(&self) -> Register {
        Register::whole(RegisterId::from_u16(RIP), 8)
    }

    fn register_name(&self, id: RegisterId) -> Option<&str> {
        match id.as_u16() {
            RAX => Some("rax"),
            RCX => Some("rcx"),
            RSP => Some("rsp"),
            RIP => Some("rip"),
            _ => None,
        }
    }
}

fn reg(id: u16, size: u8) -> Varnode {
    Varnode::Register(Register::whole(RegisterId::from_u16(id), size))
}

fn subreg(id: u16, offset: u8, size: u8) -> Varnode {
    Varnode::Register(Register::new(RegisterId::from_u16(id), offset, size))
}

fn konst(value: u64, size: u8) -> Varnode {
    Varnode::Constant { value, size }
}

fn temp(id: u32, size: u8) -> Varnode {
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

fn build(stream: Vec<Instruction>, entries: &[u64]) -> ImagePCodeGraph {
    let mut builder = GraphBuilder::new();
    builder.add_instructions(stream);
    builder.build(entries).expect("graph construction")
}

fn u64_signature(env: &DummyEnvironment, ret_reg: u16) -> FunctionSignature {
    let ty = env.types.default_type(8);
    FunctionSignature {
        params: vec![],
        ret: Some(ReturnValue {
            register: Register::whole(RegisterId::from_u16(ret_reg), 8),
            ty,
        }),
    }
}

fn run_full<'e>(
    signatures: &'e declift_decompiler::environ::DummySignatureResolver,
    types: &'e declift_decompiler::environ::DummyTypeManager,
    virt_calls: &'e declift_decompiler::environ::DummyVirtCallRegistry,
    symbols: &mut declift_decompiler::environ::DummySymbolContext,
    pcode: &mut ImagePCodeGraph,
    config: Config,
) -> Context<'e> {
    let _ = env_logger::builder().is_test(true).try_init();
    let func = pcode.entry_func_graph().expect("an entry function");
    let session = DecompilationSession {
        signatures,
        types,
        virt_calls,
        config,
    };
    let mut ctx = Context::new(session);
    ctx.run(pcode, func, &X64Regs, symbols).expect("pipeline");
    ctx
}

/// Single-block copy: `COPY RAX, #0x42` shows up as one `rax = 0x42` line, and after SDA the
/// number carries the unsigned 64-bit type.
#[test]
fn single_block_copy() {
    let stream = vec![instr(
        0,
        0,
        Opcode::Copy,
        Some(reg(RAX, 8)),
        Some(konst(0x42, 8)),
        None,
    )];

    // Stop after PROCESSING to look at the decompiled graph.
    let mut env = DummyEnvironment::new();
    env.signatures.declare(0, u64_signature(&env, RAX));
    let mut pcode = build(stream.clone(), &[0]);
    let config = Config {
        stop_point: StopPoint::Processing,
        ..Config::default()
    };
    let ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, config);
    let graph = ctx.graph.as_ref().expect("dec graph");
    let text = graph_to_string(graph, Some(&X64Regs));
    assert!(text.contains("rax = 0x42"), "got:\n{text}");

    // Full run: the constant's calculated type is uint64.
    let mut env = DummyEnvironment::new();
    env.signatures.declare(0, u64_signature(&env, RAX));
    let mut pcode = build(stream, &[0]);
    let ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, Config::default());
    let sda = ctx.sda.as_ref().expect("sda graph");

    let block = sda.graph.blocks_in_order().next().expect("one block");
    let line = sda.graph.block(block).seq_lines.first().expect("one line");
    let src = sda.graph.exprs.top_root(line.src);
    assert!(matches!(
        sda.graph.exprs.data(src),
        NodeData::SdaNum { value: 0x42, .. }
    ));
    assert_eq!(sda.calc_type(src), Some(env.types.default_type(8)));
}

fn conditional_stream() -> Vec<Instruction> {
    vec![
        instr(
            0,
            0,
            Opcode::IntEqual,
            Some(temp(0, 1)),
            Some(reg(RAX, 8)),
            Some(konst(0, 8)),
        ),
        instr(0, 1, Opcode::CBranch, None, Some(konst(2, 8)), Some(temp(0, 1))),
        instr(1, 0, Opcode::Copy, Some(reg(RAX, 8)), Some(konst(1, 8)), None),
        instr(1, 1, Opcode::Branch, None, Some(konst(3, 8)), None),
        instr(2, 0, Opcode::Copy, Some(reg(RAX, 8)), Some(konst(2, 8)), None),
        instr(3, 0, Opcode::Return, None, None, None),
    ]
}

/// Conditional fall-through: both sides write RAX, so the merge point carries a join variable
/// assigned `1` on one path and `2` on the other.
#[test]
fn conditional_fall_through() {
    let mut env = DummyEnvironment::new();
    env.signatures.declare(0, u64_signature(&env, RAX));
    let mut pcode = build(conditional_stream(), &[0]);

    let func = pcode.entry_func_graph().unwrap();
    assert_eq!(pcode.func_graph(func).blocks.len(), 4);

    let config = Config {
        stop_point: StopPoint::Processing,
        ..Config::default()
    };
    let ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, config);
    let graph = ctx.graph.as_ref().expect("dec graph");

    // Block bijection survives decompiling (condition folding has nothing to fold here).
    assert_eq!(graph.blocks_in_order().count(), 4);

    let text = graph_to_string(graph, Some(&X64Regs));
    assert!(text.contains("if (rax == 0x0) goto block_2"), "got:\n{text}");
    assert!(text.contains("var0 = 0x1"), "got:\n{text}");
    assert!(text.contains("var0 = 0x2"), "got:\n{text}");
    assert!(text.contains("rax = var0"), "got:\n{text}");
}

fn loop_stream() -> Vec<Instruction> {
    vec![
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
            Some(temp(0, 1)),
            Some(reg(RCX, 8)),
            Some(konst(10, 8)),
        ),
        instr(1, 2, Opcode::CBranch, None, Some(konst(1, 8)), Some(temp(0, 1))),
        instr(2, 0, Opcode::Return, None, None, None),
    ]
}

/// Loop with a counter: the fixed point arrives within two back-edge passes and the exit value
/// of RCX reads a loop-carried symbol, not an unrolled constant.
#[test]
fn loop_with_counter() {
    let mut env = DummyEnvironment::new();
    env.signatures.declare(0, u64_signature(&env, RCX));
    let mut pcode = build(loop_stream(), &[0]);
    let config = Config {
        stop_point: StopPoint::Processing,
        ..Config::default()
    };
    let ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, config);
    let graph = ctx.graph.as_ref().expect("dec graph");
    assert!(!graph.may_be_imprecise);

    let text = graph_to_string(graph, Some(&X64Regs));
    // The latch re-assigns the join variable from itself.
    assert!(text.contains("var0 = var0 + 0x1"), "got:\n{text}");
    // The exit value goes through a symbol, never a folded constant.
    let rcx_line = text
        .lines()
        .find(|l| l.trim_start().starts_with("rcx = "))
        .expect("an exit line for rcx");
    assert!(rcx_line.contains("var"), "got:\n{text}");
    assert!(!rcx_line.contains("0x"), "got:\n{text}");
}

/// Register slicing: overwriting AH inside a constant-filled EAX folds back together with the
/// hole punched out.
#[test]
fn register_slicing() {
    let stream = vec![
        instr(
            0,
            0,
            Opcode::Copy,
            Some(subreg(RAX, 0, 4)),
            Some(konst(0xdead_beef, 4)),
            None,
        ),
        instr(1, 0, Opcode::Copy, Some(subreg(RAX, 1, 1)), Some(konst(0, 1)), None),
    ];
    let mut env = DummyEnvironment::new();
    env.signatures.declare(0, u64_signature(&env, RAX));
    let mut pcode = build(stream, &[0]);
    let config = Config {
        stop_point: StopPoint::Processing,
        ..Config::default()
    };
    let ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, config);
    let text = graph_to_string(ctx.graph.as_ref().unwrap(), Some(&X64Regs));
    assert!(text.contains("0xdead00ef"), "got:\n{text}");
}

/// Call resolution: an indirect call whose target constant-folds to a known function picks up
/// that function's signature; one that doesn't is marked ambiguous.
#[test]
fn call_resolution() {
    let stream = vec![
        instr(
            0,
            0,
            Opcode::Copy,
            Some(reg(RAX, 8)),
            Some(konst(0x40_1000, 8)),
            None,
        ),
        instr(0, 1, Opcode::CallInd, None, Some(reg(RAX, 8)), None),
        instr(1, 0, Opcode::CallInd, None, Some(reg(RCX, 8)), None),
        instr(2, 0, Opcode::Return, None, None, None),
        instr(0x40_1000, 0, Opcode::Return, None, None, None),
    ];

    let mut env = DummyEnvironment::new();
    let u64_ty = env.types.default_type(8);
    env.signatures.declare(
        0x40_1000,
        FunctionSignature {
            params: vec![Param {
                storage: Storage::Register(Register::whole(RegisterId::from_u16(RCX), 8)),
                ty: u64_ty,
            }],
            ret: Some(ReturnValue {
                register: Register::whole(RegisterId::from_u16(RAX), 8),
                ty: u64_ty,
            }),
        },
    );

    let mut pcode = build(stream, &[0, 0x40_1000]);
    let func = pcode
        .func_graph_starting_at(ComplexOffset::from(0))
        .unwrap();
    let session = DecompilationSession {
        signatures: &env.signatures,
        types: &env.types,
        virt_calls: &env.virt_calls,
        config: Config {
            stop_point: StopPoint::Processing,
            ..Config::default()
        },
    };
    let mut ctx = Context::new(session);
    ctx.run(&mut pcode, func, &X64Regs, &mut env.symbols)
        .expect("pipeline");

    let text = graph_to_string(ctx.graph.as_ref().unwrap(), Some(&X64Regs));
    // The resolved call reads its argument from the signature's parameter register.
    assert!(text.contains("0x401000(rcx)"), "got:\n{text}");
    // The unresolved one got the default signature and an ambiguity mark.
    assert!(text.contains("/* ambiguous */"), "got:\n{text}");
}

/// Determinism and idempotence: two independent runs render identically, and re-running the
/// optimization pipeline on an already processed graph changes nothing.
#[test]
fn deterministic_and_idempotent() {
    let run_once = || {
        let mut env = DummyEnvironment::new();
        env.signatures.declare(0, u64_signature(&env, RAX));
        let mut pcode = build(conditional_stream(), &[0]);
        let config = Config {
            stop_point: StopPoint::Processing,
            ..Config::default()
        };
        let ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, config);
        graph_to_string(ctx.graph.as_ref().unwrap(), Some(&X64Regs))
    };
    let first = run_once();
    let second = run_once();
    assert_eq!(first, second);

    let mut env = DummyEnvironment::new();
    env.signatures.declare(0, u64_signature(&env, RAX));
    let mut pcode = build(conditional_stream(), &[0]);
    let config = Config {
        stop_point: StopPoint::Processing,
        ..Config::default()
    };
    let mut ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, config);
    let before = graph_to_string(ctx.graph.as_ref().unwrap(), Some(&X64Regs));
    ctx.process().expect("second processing");
    let after = graph_to_string(ctx.graph.as_ref().unwrap(), Some(&X64Regs));
    assert_eq!(before, after);
}

/// The SDA stage binds stack stores to stack symbols and the writer names them.
#[test]
fn stack_store_symbolization() {
    let stream = vec![
        // *(rsp - 8) = 7
        instr(
            0,
            0,
            Opcode::IntSub,
            Some(temp(0, 8)),
            Some(reg(RSP, 8)),
            Some(konst(8, 8)),
        ),
        instr(0, 1, Opcode::Store, None, Some(temp(0, 8)), Some(konst(7, 8))),
        // rax = *(rsp - 8)
        instr(
            1,
            0,
            Opcode::IntSub,
            Some(temp(1, 8)),
            Some(reg(RSP, 8)),
            Some(konst(8, 8)),
        ),
        instr(
            1,
            1,
            Opcode::Load,
            Some(reg(RAX, 8)),
            Some(temp(1, 8)),
            None,
        ),
        instr(2, 0, Opcode::Return, None, None, None),
    ];
    // After symbolization the store and the load both name the stack variable.
    let mut env = DummyEnvironment::new();
    env.signatures.declare(0, u64_signature(&env, RAX));
    let mut pcode = build(stream.clone(), &[0]);
    let config = Config {
        stop_point: StopPoint::Symbolizing,
        ..Config::default()
    };
    let ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, config);
    let sda = ctx.sda.as_ref().expect("sda graph");
    let text = sda_graph_to_string(sda, &env.symbols, &env.types, Some(&X64Regs));
    assert!(text.contains("stack_0x8"), "got:\n{text}");

    // Final processing forwards the stored value into the read and drops the dead store.
    let mut env = DummyEnvironment::new();
    env.signatures.declare(0, u64_signature(&env, RAX));
    let mut pcode = build(stream, &[0]);
    let ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, Config::default());
    let sda = ctx.sda.as_ref().expect("sda graph");
    let text = sda_graph_to_string(sda, &env.symbols, &env.types, Some(&X64Regs));
    assert!(text.contains("rax = 0x7"), "got:\n{text}");
    assert!(!text.contains("stack_0x8"), "got:\n{text}");
}

/// Debugger hooks: the stack displacement accumulates constant adjustments, and a line's top
/// node is discoverable from its instruction offset.
#[test]
fn debugger_hooks() {
    let stream = vec![
        instr(
            0,
            0,
            Opcode::IntSub,
            Some(reg(RSP, 8)),
            Some(reg(RSP, 8)),
            Some(konst(0x20, 8)),
        ),
        instr(
            1,
            0,
            Opcode::IntAdd,
            Some(reg(RSP, 8)),
            Some(reg(RSP, 8)),
            Some(konst(0x20, 8)),
        ),
        instr(2, 0, Opcode::Return, None, None, None),
    ];
    let mut env = DummyEnvironment::new();
    let mut pcode = build(stream, &[0]);
    let func = pcode.entry_func_graph().unwrap();

    assert_eq!(
        stack_pointer_value_at_offset(&pcode, func, &X64Regs, ComplexOffset::new(0, 0)),
        -0x20
    );
    assert_eq!(
        stack_pointer_value_at_offset(&pcode, func, &X64Regs, ComplexOffset::new(1, 0)),
        0
    );

    // A store line is addressable by its instruction offset.
    let store_stream = vec![
        instr(
            0,
            0,
            Opcode::Store,
            None,
            Some(konst(0x5000, 8)),
            Some(konst(1, 8)),
        ),
        instr(1, 0, Opcode::Return, None, None, None),
    ];
    let mut pcode = build(store_stream, &[0]);
    let config = Config {
        stop_point: StopPoint::Processing,
        ..Config::default()
    };
    let ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, config);
    let graph = ctx.graph.as_ref().unwrap();
    assert!(graph
        .find_block_top_node_at_offset(ComplexOffset::new(0, 0))
        .is_some());
}

/// Stop points expose intermediate artifacts.
#[test]
fn stop_points() {
    let mut env = DummyEnvironment::new();
    env.signatures.declare(0, u64_signature(&env, RAX));
    let mut pcode = build(conditional_stream(), &[0]);
    let config = Config {
        stop_point: StopPoint::Decompiling,
        ..Config::default()
    };
    let ctx = run_full(&env.signatures, &env.types, &env.virt_calls, &mut env.symbols, &mut pcode, config);
    assert!(ctx.graph.is_some());
    assert!(ctx.sda.is_none());
}
