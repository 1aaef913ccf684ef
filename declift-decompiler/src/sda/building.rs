//! Symbolization: rewriting decompiler leaves into program-symbol-bound SDA leaves.
//!
//! The walk is top-down so that address patterns are seen before their pieces are rewritten:
//! a load of `sp + k` becomes a stack variable access, a load of a constant inside the global
//! region becomes a global variable access, and a bare `sp + k` that is *not* under a load is
//! an address-getting reference to the stack variable. Everything else maps leaf by leaf:
//! decompiler symbols and input registers to fresh or resolved program symbols, numbers to
//! typed numbers.

use crate::dec_graph::DecompiledCodeGraph;
use crate::environ::{FunctionSignature, ProgSymbol, Storage, SymbolContext, TypeManager};
use crate::expr::{ExprOp, Node, NodeData, TopNode};
use crate::fx::FxHashMap;
use crate::sda::SdaCodeGraph;
use crate::symbol::DecSymbol;
use declift_pcode::{Register, RegisterFactory};

struct Builder<'a> {
    symbols: &'a mut dyn SymbolContext,
    types: &'a dyn TypeManager,
    signature: &'a FunctionSignature,
    stack_pointer: Register,
    dec_to_prog: FxHashMap<DecSymbol, ProgSymbol>,
    reg_to_prog: FxHashMap<Register, ProgSymbol>,
}

/// Symbolize the whole graph in place.
pub fn do_sda_building(
    sda: &mut SdaCodeGraph,
    symbols: &mut dyn SymbolContext,
    types: &dyn TypeManager,
    signature: &FunctionSignature,
    reg_factory: &dyn RegisterFactory,
) {
    let mut builder = Builder {
        symbols,
        types,
        signature,
        stack_pointer: reg_factory.stack_pointer(),
        dec_to_prog: FxHashMap::default(),
        reg_to_prog: FxHashMap::default(),
    };

    let blocks: Vec<_> = sda.graph.all_blocks().collect();
    for block in blocks {
        if sda.graph.block(block).removed {
            continue;
        }
        let mut tops: Vec<TopNode> = Vec::new();
        for line in sda
            .graph
            .block(block)
            .par_lines
            .iter()
            .chain(&sda.graph.block(block).seq_lines)
        {
            tops.push(line.dst);
            tops.push(line.src);
        }
        if let Some(cond) = sda.graph.block(block).condition.expand() {
            tops.push(cond);
        }
        for top in tops {
            let root = sda.graph.exprs.top_root(top);
            let rewritten = builder.transform(&mut sda.graph, root);
            if rewritten != root {
                sda.graph.exprs.set_top_root(top, rewritten);
            }
        }
    }

    sda.dec_to_prog = builder.dec_to_prog;
}

impl Builder<'_> {
    /// Rewrite one node, returning its replacement (possibly itself).
    fn transform(&mut self, graph: &mut DecompiledCodeGraph, node: Node) -> Node {
        // Whole-subtree patterns first: they consume their children.
        if let Some(replacement) = self.match_memory_pattern(graph, node) {
            return replacement;
        }

        for child in graph.exprs.children(node) {
            let rewritten = self.transform(graph, child);
            if rewritten != child {
                graph.exprs.replace_child(node, child, rewritten);
            }
        }

        let data = graph.exprs.data(node).clone();
        match data {
            NodeData::Sym { symbol, size } => {
                let prog = self.prog_for_dec(graph, symbol);
                graph.exprs.make(NodeData::SdaSym {
                    symbol: prog,
                    dec: symbol.into(),
                    size,
                })
            }
            NodeData::RegRead { register } => {
                if register == self.stack_pointer {
                    return node;
                }
                let prog = self.prog_for_register(register);
                graph.exprs.make(NodeData::SdaSym {
                    symbol: prog,
                    dec: None.into(),
                    size: register.size,
                })
            }
            NodeData::Num { value, size } => {
                let ty = self.types.default_type(size);
                graph.exprs.make(NodeData::SdaNum { value, ty, size })
            }
            _ => node,
        }
    }

    /// Stack and global access patterns.
    fn match_memory_pattern(
        &mut self,
        graph: &mut DecompiledCodeGraph,
        node: Node,
    ) -> Option<Node> {
        let data = graph.exprs.data(node).clone();
        match data {
            NodeData::Op {
                op: ExprOp::Load,
                lhs: addr,
                mask,
                ..
            } => {
                let size = mask.size_in_bytes();
                if let Some(offset) = self.stack_offset_of(graph, addr) {
                    let symbol = self.symbols.resolve_stack_var(offset, size);
                    return Some(graph.exprs.make(NodeData::SdaMemSym {
                        symbol,
                        offset,
                        addr_getting: false,
                        size,
                    }));
                }
                let addr_value = match *graph.exprs.data(addr) {
                    NodeData::Num { value, .. } => Some(value),
                    _ => None,
                };
                if let Some(value) = addr_value {
                    if self.symbols.global_region_contains(value) {
                        let symbol = self.symbols.resolve_global_var(value, size);
                        return Some(graph.exprs.make(NodeData::SdaMemSym {
                            symbol,
                            offset: value as i64,
                            addr_getting: false,
                            size,
                        }));
                    }
                }
                None
            }
            // A stack address that is not being dereferenced.
            _ => {
                let offset = self.stack_offset_of(graph, node)?;
                let symbol = self.symbols.resolve_stack_var(offset, 8);
                Some(graph.exprs.make(NodeData::SdaMemSym {
                    symbol,
                    offset,
                    addr_getting: true,
                    size: 8,
                }))
            }
        }
    }

    /// The stack-pointer displacement computed by a `sp`, `sp + k` or `sp - k` expression.
    fn stack_offset_of(&self, graph: &DecompiledCodeGraph, node: Node) -> Option<i64> {
        match *graph.exprs.data(node) {
            NodeData::RegRead { register } if register == self.stack_pointer => Some(0),
            NodeData::Op { op, lhs, rhs, .. }
                if matches!(op, ExprOp::Add | ExprOp::Sub) =>
            {
                let rhs = rhs.expand()?;
                if !matches!(
                    *graph.exprs.data(lhs),
                    NodeData::RegRead { register } if register == self.stack_pointer
                ) {
                    return None;
                }
                let value = match *graph.exprs.data(rhs) {
                    NodeData::Num { value, .. } => value,
                    NodeData::SdaNum { value, .. } => value,
                    _ => return None,
                };
                let value = value as i64;
                Some(if op == ExprOp::Sub { -value } else { value })
            }
            _ => None,
        }
    }

    fn prog_for_dec(&mut self, graph: &DecompiledCodeGraph, symbol: DecSymbol) -> ProgSymbol {
        if let Some(&prog) = self.dec_to_prog.get(&symbol) {
            return prog;
        }
        let data = graph.symbol(symbol);
        let prog = match data.register {
            // A register-carried symbol may be the function's return storage.
            Some(register) => {
                let prog = self.symbols.register_local_var(data.size);
                if let Some(ret) = self.signature.ret {
                    if ret.register == register {
                        self.symbols.set_data_type(prog, ret.ty);
                    }
                }
                prog
            }
            None => self.symbols.register_local_var(data.size),
        };
        self.dec_to_prog.insert(symbol, prog);
        prog
    }

    fn prog_for_register(&mut self, register: Register) -> ProgSymbol {
        if let Some(&prog) = self.reg_to_prog.get(&register) {
            return prog;
        }
        // An unwritten register read is a function input: a parameter if the signature says
        // so, an anonymous register variable otherwise.
        let param = self.signature.params.iter().enumerate().find(|(_, p)| {
            matches!(p.storage, Storage::Register(reg) if reg == register)
        });
        let prog = match param {
            Some((index, param)) => {
                let prog = self
                    .symbols
                    .resolve_param(index as u16, param.storage);
                self.symbols.set_data_type(prog, param.ty);
                prog
            }
            None => self.symbols.register_local_var(register.size),
        };
        self.reg_to_prog.insert(register, prog);
        prog
    }
}
