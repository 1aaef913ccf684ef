//! The collaborators a decompilation runs against.
//!
//! The core never owns program-wide state. Function signatures, program symbols, data types and
//! the virtual-call table belong to the host; the pipeline reaches them only through the narrow
//! traits defined here, bundled into a `DecompilationSession`. A [`DummyEnvironment`] implements
//! all of them in memory for tests and standalone use.

use crate::fx::FxHashMap;
use declift_entity::entity_impl;
use declift_pcode::{ComplexOffset, Instruction, Register};
use std::cell::RefCell;

/// An opaque reference to a program-level symbol owned by the host's symbol manager.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgSymbol(u32);
entity_impl!(ProgSymbol, "sym");

/// An opaque reference to a data type owned by the host's type manager.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);
entity_impl!(TypeId, "ty");

/// What kind of program entity a symbol is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgSymbolKind {
    /// A function parameter.
    FuncParameter,
    /// A stack-resident local variable.
    LocalStackVar,
    /// A register-resident local variable.
    LocalInstrVar,
    /// A global variable.
    GlobalVar,
    /// A function.
    Function,
    /// An entry of a virtual function table.
    VTableEntry,
}

/// Where a parameter lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Storage {
    /// In a register slice.
    Register(Register),
    /// On the stack, at a stack-pointer-relative offset at entry.
    Stack {
        /// Offset from the entry stack pointer.
        offset: i64,
        /// Width in bytes.
        size: u8,
    },
}

impl Storage {
    /// Width of the storage in bytes.
    pub fn size(&self) -> u8 {
        match *self {
            Self::Register(reg) => reg.size,
            Self::Stack { size, .. } => size,
        }
    }
}

/// One parameter of a function signature.
#[derive(Clone, Debug)]
pub struct Param {
    /// Where the parameter arrives.
    pub storage: Storage,
    /// Its declared data type.
    pub ty: TypeId,
}

/// The return value description of a signature.
#[derive(Clone, Copy, Debug)]
pub struct ReturnValue {
    /// The register holding the returned value.
    pub register: Register,
    /// Its declared data type.
    pub ty: TypeId,
}

/// A resolved function signature.
#[derive(Clone, Debug, Default)]
pub struct FunctionSignature {
    /// Parameters in declaration order.
    pub params: Vec<Param>,
    /// The return value, if the function returns one.
    pub ret: Option<ReturnValue>,
}

/// What the decompiled function itself returns, seeded from its own signature.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReturnInfo {
    /// The return storage, when known.
    pub value: Option<ReturnValue>,
}

impl ReturnInfo {
    /// A function with no known return storage.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Everything the interpreter needs to know about one call site.
#[derive(Clone, Debug)]
pub struct FunctionCallInfo {
    /// The callee signature driving argument and result placement.
    pub signature: FunctionSignature,
    /// The resolved target byte offset, when known.
    pub target: Option<u64>,
    /// True when no signature could be resolved and the project default was substituted.
    pub ambiguous: bool,
}

/// Capability object resolving call-site information.
///
/// Kept as a single-method object so the pipeline stays independent of the host's lookup policy
/// and tests can substitute a stub.
pub trait CallInfoResolver {
    /// Resolve the call at `instr`. `target` is the constant-folded target offset, if the graph
    /// builder found one.
    fn resolve_call_info(&self, instr: &Instruction, target: Option<u64>) -> FunctionCallInfo;
}

/// Resolver of function signatures by address.
pub trait FuncSignatureResolver {
    /// The signature of the function at `byte_offset`, if one is known.
    fn resolve(&self, byte_offset: u64) -> Option<FunctionSignature>;

    /// The signature a virtual call site resolves to, if the host knows one.
    fn resolve_virtual(&self, site: ComplexOffset) -> Option<FunctionSignature>;

    /// The project-wide default signature, substituted when everything else fails.
    fn default_signature(&self) -> FunctionSignature;
}

/// The table of virtual call sites resolved by earlier analyses.
pub trait VirtCallRegistry {
    /// The target function offset a virtual call site was resolved to.
    fn resolve_target(&self, site: ComplexOffset) -> Option<u64>;
}

/// Resolvers and factories for program-level symbols.
pub trait SymbolContext {
    /// The stack variable at the given entry-stack-pointer-relative offset, created if needed.
    fn resolve_stack_var(&mut self, offset: i64, size: u8) -> ProgSymbol;

    /// The global variable at the given address, created if needed.
    fn resolve_global_var(&mut self, addr: u64, size: u8) -> ProgSymbol;

    /// The parameter with the given index and storage, created if needed.
    fn resolve_param(&mut self, index: u16, storage: Storage) -> ProgSymbol;

    /// The function symbol at the given address, created if needed.
    fn resolve_function(&mut self, byte_offset: u64) -> ProgSymbol;

    /// Register a fresh compiler-inferred local variable.
    fn register_local_var(&mut self, size: u8) -> ProgSymbol;

    /// What kind of symbol this is.
    fn kind(&self, symbol: ProgSymbol) -> ProgSymbolKind;

    /// The symbol's declared data type.
    fn data_type(&self, symbol: ProgSymbol) -> TypeId;

    /// Change the symbol's data type. Only meaningful for auto symbols.
    fn set_data_type(&mut self, symbol: ProgSymbol, ty: TypeId);

    /// True when the symbol was inferred rather than user-declared; only these may have their
    /// type mutated by type calculation.
    fn is_auto(&self, symbol: ProgSymbol) -> bool;

    /// Display name of the symbol.
    fn name(&self, symbol: ProgSymbol) -> String;

    /// True when `addr` lies in the image's global data region.
    fn global_region_contains(&self, addr: u64) -> bool;
}

/// Lookup and construction of data types.
pub trait TypeManager {
    /// The default (unsigned integer) type of the given byte width.
    fn default_type(&self, size: u8) -> TypeId;

    /// The signed integer type of the given byte width.
    fn signed_type(&self, size: u8) -> TypeId;

    /// The boolean type.
    fn bool_type(&self) -> TypeId;

    /// Byte width of a type.
    fn size_of(&self, ty: TypeId) -> u8;

    /// Is the type a signed integer?
    fn is_signed(&self, ty: TypeId) -> bool;

    /// Is the type a floating point type?
    fn is_float(&self, ty: TypeId) -> bool;

    /// Is the type a pointer?
    fn is_pointer(&self, ty: TypeId) -> bool;

    /// The pointer type to `ty`.
    fn pointer_to(&self, ty: TypeId) -> TypeId;

    /// The pointee of a pointer type.
    fn pointee(&self, ty: TypeId) -> Option<TypeId>;

    /// Display name of a type.
    fn name(&self, ty: TypeId) -> String;

    /// How specific a type is; type calculation keeps the stronger side of a disagreement.
    fn strength(&self, ty: TypeId) -> u8 {
        if self.is_pointer(ty) {
            3
        } else if self.is_float(ty) {
            2
        } else if self.is_signed(ty) {
            1
        } else {
            0
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum DummyType {
    Uint(u8),
    Int(u8),
    Float(u8),
    Bool,
    Pointer(TypeId),
}

/// An in-memory [`TypeManager`] for tests and standalone runs.
pub struct DummyTypeManager {
    types: RefCell<Vec<DummyType>>,
}

impl DummyTypeManager {
    /// Create a manager with the scalar types pre-interned.
    pub fn new() -> Self {
        let types = vec![
            DummyType::Bool,
            DummyType::Uint(1),
            DummyType::Uint(2),
            DummyType::Uint(4),
            DummyType::Uint(8),
            DummyType::Int(1),
            DummyType::Int(2),
            DummyType::Int(4),
            DummyType::Int(8),
            DummyType::Float(4),
            DummyType::Float(8),
        ];
        Self {
            types: RefCell::new(types),
        }
    }

    fn intern(&self, ty: DummyType) -> TypeId {
        let mut types = self.types.borrow_mut();
        if let Some(pos) = types.iter().position(|t| *t == ty) {
            return TypeId::from_u32(pos as u32);
        }
        types.push(ty);
        TypeId::from_u32((types.len() - 1) as u32)
    }

    fn get(&self, ty: TypeId) -> DummyType {
        self.types.borrow()[ty.as_u32() as usize].clone()
    }

    /// The float type of the given byte width.
    pub fn float_type(&self, size: u8) -> TypeId {
        self.intern(DummyType::Float(size))
    }
}

impl Default for DummyTypeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeManager for DummyTypeManager {
    fn default_type(&self, size: u8) -> TypeId {
        self.intern(DummyType::Uint(size.max(1)))
    }

    fn signed_type(&self, size: u8) -> TypeId {
        self.intern(DummyType::Int(size.max(1)))
    }

    fn bool_type(&self) -> TypeId {
        TypeId::from_u32(0)
    }

    fn size_of(&self, ty: TypeId) -> u8 {
        match self.get(ty) {
            DummyType::Bool => 1,
            DummyType::Uint(s) | DummyType::Int(s) | DummyType::Float(s) => s,
            DummyType::Pointer(_) => 8,
        }
    }

    fn is_signed(&self, ty: TypeId) -> bool {
        matches!(self.get(ty), DummyType::Int(_))
    }

    fn is_float(&self, ty: TypeId) -> bool {
        matches!(self.get(ty), DummyType::Float(_))
    }

    fn is_pointer(&self, ty: TypeId) -> bool {
        matches!(self.get(ty), DummyType::Pointer(_))
    }

    fn pointer_to(&self, ty: TypeId) -> TypeId {
        self.intern(DummyType::Pointer(ty))
    }

    fn pointee(&self, ty: TypeId) -> Option<TypeId> {
        match self.get(ty) {
            DummyType::Pointer(inner) => Some(inner),
            _ => None,
        }
    }

    fn name(&self, ty: TypeId) -> String {
        match self.get(ty) {
            DummyType::Bool => "bool".to_string(),
            DummyType::Uint(s) => format!("uint{}", u32::from(s) * 8),
            DummyType::Int(s) => format!("int{}", u32::from(s) * 8),
            DummyType::Float(s) => format!("float{}", u32::from(s) * 8),
            DummyType::Pointer(inner) => format!("{}*", self.name(inner)),
        }
    }
}

struct DummySymbolData {
    kind: ProgSymbolKind,
    ty: TypeId,
    auto: bool,
    name: String,
}

/// An in-memory [`SymbolContext`] for tests and standalone runs.
pub struct DummySymbolContext {
    symbols: Vec<DummySymbolData>,
    stack_vars: FxHashMap<i64, ProgSymbol>,
    global_vars: FxHashMap<u64, ProgSymbol>,
    params: FxHashMap<u16, ProgSymbol>,
    functions: FxHashMap<u64, ProgSymbol>,
    default_ty: TypeId,
    /// Half-open byte range treated as the image's global data region.
    pub global_region: std::ops::Range<u64>,
}

impl DummySymbolContext {
    /// Create an empty context. `default_ty` types fresh auto symbols.
    pub fn new(default_ty: TypeId) -> Self {
        Self {
            symbols: Vec::new(),
            stack_vars: FxHashMap::default(),
            global_vars: FxHashMap::default(),
            params: FxHashMap::default(),
            functions: FxHashMap::default(),
            default_ty,
            global_region: 0..0,
        }
    }

    fn create(&mut self, kind: ProgSymbolKind, ty: TypeId, name: String) -> ProgSymbol {
        self.symbols.push(DummySymbolData {
            kind,
            ty,
            auto: true,
            name,
        });
        ProgSymbol::from_u32((self.symbols.len() - 1) as u32)
    }

    /// Declare a user symbol (not auto) for a parameter index.
    pub fn declare_param(&mut self, index: u16, ty: TypeId, name: &str) -> ProgSymbol {
        let symbol = self.create(ProgSymbolKind::FuncParameter, ty, name.to_string());
        self.symbols[symbol.as_u32() as usize].auto = false;
        self.params.insert(index, symbol);
        symbol
    }
}

impl SymbolContext for DummySymbolContext {
    fn resolve_stack_var(&mut self, offset: i64, size: u8) -> ProgSymbol {
        if let Some(&symbol) = self.stack_vars.get(&offset) {
            return symbol;
        }
        let ty = self.default_ty;
        let symbol = self.create(
            ProgSymbolKind::LocalStackVar,
            ty,
            format!("stack_0x{:x}", offset.unsigned_abs()),
        );
        let _ = size;
        self.stack_vars.insert(offset, symbol);
        symbol
    }

    fn resolve_global_var(&mut self, addr: u64, size: u8) -> ProgSymbol {
        if let Some(&symbol) = self.global_vars.get(&addr) {
            return symbol;
        }
        let ty = self.default_ty;
        let symbol = self.create(ProgSymbolKind::GlobalVar, ty, format!("glob_0x{addr:x}"));
        let _ = size;
        self.global_vars.insert(addr, symbol);
        symbol
    }

    fn resolve_param(&mut self, index: u16, storage: Storage) -> ProgSymbol {
        if let Some(&symbol) = self.params.get(&index) {
            return symbol;
        }
        let ty = self.default_ty;
        let symbol = self.create(ProgSymbolKind::FuncParameter, ty, format!("param{index}"));
        let _ = storage;
        self.params.insert(index, symbol);
        symbol
    }

    fn resolve_function(&mut self, byte_offset: u64) -> ProgSymbol {
        if let Some(&symbol) = self.functions.get(&byte_offset) {
            return symbol;
        }
        let ty = self.default_ty;
        let symbol = self.create(ProgSymbolKind::Function, ty, format!("fun_0x{byte_offset:x}"));
        self.functions.insert(byte_offset, symbol);
        symbol
    }

    fn register_local_var(&mut self, size: u8) -> ProgSymbol {
        let ty = self.default_ty;
        let n = self.symbols.len();
        let _ = size;
        self.create(ProgSymbolKind::LocalInstrVar, ty, format!("var{n}"))
    }

    fn kind(&self, symbol: ProgSymbol) -> ProgSymbolKind {
        self.symbols[symbol.as_u32() as usize].kind
    }

    fn data_type(&self, symbol: ProgSymbol) -> TypeId {
        self.symbols[symbol.as_u32() as usize].ty
    }

    fn set_data_type(&mut self, symbol: ProgSymbol, ty: TypeId) {
        self.symbols[symbol.as_u32() as usize].ty = ty;
    }

    fn is_auto(&self, symbol: ProgSymbol) -> bool {
        self.symbols[symbol.as_u32() as usize].auto
    }

    fn name(&self, symbol: ProgSymbol) -> String {
        self.symbols[symbol.as_u32() as usize].name.clone()
    }

    fn global_region_contains(&self, addr: u64) -> bool {
        self.global_region.contains(&addr)
    }
}

/// An in-memory [`FuncSignatureResolver`] for tests and standalone runs.
pub struct DummySignatureResolver {
    signatures: FxHashMap<u64, FunctionSignature>,
    virtuals: FxHashMap<u64, FunctionSignature>,
}

impl DummySignatureResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self {
            signatures: FxHashMap::default(),
            virtuals: FxHashMap::default(),
        }
    }

    /// Register the signature of the function at `byte_offset`.
    pub fn declare(&mut self, byte_offset: u64, signature: FunctionSignature) {
        self.signatures.insert(byte_offset, signature);
    }

    /// Register the signature a virtual call site resolves to.
    pub fn declare_virtual(&mut self, site: ComplexOffset, signature: FunctionSignature) {
        self.virtuals.insert(site.bits(), signature);
    }
}

impl Default for DummySignatureResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FuncSignatureResolver for DummySignatureResolver {
    fn resolve(&self, byte_offset: u64) -> Option<FunctionSignature> {
        self.signatures.get(&byte_offset).cloned()
    }

    fn resolve_virtual(&self, site: ComplexOffset) -> Option<FunctionSignature> {
        self.virtuals.get(&site.bits()).cloned()
    }

    fn default_signature(&self) -> FunctionSignature {
        FunctionSignature::default()
    }
}

/// An in-memory [`VirtCallRegistry`] for tests and standalone runs.
#[derive(Default)]
pub struct DummyVirtCallRegistry {
    targets: FxHashMap<u64, u64>,
}

impl DummyVirtCallRegistry {
    /// Record that the virtual call at `site` goes to `target`.
    pub fn record(&mut self, site: ComplexOffset, target: u64) {
        self.targets.insert(site.bits(), target);
    }
}

impl VirtCallRegistry for DummyVirtCallRegistry {
    fn resolve_target(&self, site: ComplexOffset) -> Option<u64> {
        self.targets.get(&site.bits()).copied()
    }
}

/// A complete in-memory environment bundling all dummy collaborators.
pub struct DummyEnvironment {
    /// The type manager.
    pub types: DummyTypeManager,
    /// The symbol context.
    pub symbols: DummySymbolContext,
    /// The signature resolver.
    pub signatures: DummySignatureResolver,
    /// The virtual-call registry.
    pub virt_calls: DummyVirtCallRegistry,
}

impl DummyEnvironment {
    /// Create an environment with empty tables.
    pub fn new() -> Self {
        let types = DummyTypeManager::new();
        let default_ty = types.default_type(8);
        Self {
            types,
            symbols: DummySymbolContext::new(default_ty),
            signatures: DummySignatureResolver::new(),
            virt_calls: DummyVirtCallRegistry::default(),
        }
    }
}

impl Default for DummyEnvironment {
    fn default() -> Self {
        Self::new()
    }
}
