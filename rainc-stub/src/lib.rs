//! Stand-in for `rainc.wasm`.
//!
//! The real compiler module is a multi-megabyte LLVM build, so tests in this
//! workspace drive a small module built here with `wasm-encoder` instead. It
//! speaks the same ABI as the real one:
//!
//!   imports: console.log, env.callback, time.now_perf, math.sqrt
//!   exports: memory, malloc, free, init, compile
//!
//! `compile(start, end, optimize)` echoes the source through `console.log`
//! and then emits canned events through `env.callback`:
//!
//!   - source starting with `!`  -> one Error event, nothing else
//!   - source starting with `#`  -> `unreachable` (trap)
//!   - source starting with `?`  -> an event with tag 42, then the normal run
//!   - anything else             -> Compile, Decompile, Link (in that order)
//!
//! After the Link event the stub overwrites the first word of the binary it
//! just reported, so a host that kept a view instead of a copy sees zeros.
//! The next normal run writes the magic back before reporting again.
//!
//! `stub_with_start` adds a start function that calls `console.log` and
//! `env.callback` during instantiation, before the host has bound the memory
//! export.
//!
//! A few mutable globals are exported so tests can observe what the host did:
//! allocation counts, the number of live allocations while `compile` ran, the
//! optimize flag, the byte right after the source and whether `init` ran.

use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataSection, EntityType, ExportKind, ExportSection,
    Function, FunctionSection, GlobalSection, GlobalType, ImportSection, Instruction, MemArg,
    MemorySection, MemoryType, Module, StartSection, TypeSection, ValType,
};

/// LLVM IR reported with tag 1.
pub const STUB_IR: &str = "; ModuleID = 'rain'\nsource_filename = \"<unknown>\"\n\ndefine i32 @main() {\n  ret i32 0\n}\n";

/// WAT reported with tag 3.
pub const STUB_WAT: &str = "(module\n  (func $main (result i32)\n    i32.const 0)\n  (export \"main\" (func $main)))\n";

/// Linked binary reported with tag 2.
pub const STUB_BINARY: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7f,
];

/// Error reported with tag -1, coloured the way the compiler colours it.
pub const STUB_ERROR: &str = "\x1b[1m<unknown>:1:1\x1b[0m: \x1b[31merror: \x1b[0m\x1b[1munexpected token '!'\x1b[0m\n!fn main() {}\n\x1b[32m^\x1b[0m\n";

/// Tag used for the forward-compatibility event.
pub const UNKNOWN_TAG: i32 = 42;

/// Names of the exported observation globals.
pub mod globals {
    pub const ALLOC_COUNT: &str = "alloc_count";
    pub const FREE_COUNT: &str = "free_count";
    pub const LIVE_AT_COMPILE: &str = "live_at_compile";
    pub const LAST_OPTIMIZE: &str = "last_optimize";
    pub const LAST_TERMINATOR: &str = "last_terminator";
    pub const INITIALIZED: &str = "initialized";
}

// Data segment layout. The heap starts above all of it.
const IR_OFFSET: i32 = 256;
const WAT_OFFSET: i32 = 1024;
const BINARY_OFFSET: i32 = 1792;
const ERROR_OFFSET: i32 = 2048;
const HEAP_BASE: i32 = 4096;

// Import indices.
const FN_CONSOLE_LOG: u32 = 0;
const FN_CALLBACK: u32 = 1;
const FN_NOW_PERF: u32 = 2;
const FN_SQRT: u32 = 3;

// Global indices.
const G_HEAP: u32 = 0;
const G_ALLOC_COUNT: u32 = 1;
const G_FREE_COUNT: u32 = 2;
const G_LIVE_AT_COMPILE: u32 = 3;
const G_LAST_OPTIMIZE: u32 = 4;
const G_LAST_TERMINATOR: u32 = 5;
const G_INITIALIZED: u32 = 6;

/// Shape of the exported `compile` function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// `compile(start, end, optimize)`, the current ABI.
    WithOptimize,
    /// `compile(start, end)`, what older compiler builds export.
    Legacy,
}

/// Build the stub with the current `compile` signature.
pub fn stub_compiler() -> Vec<u8> {
    build(EntryPoint::WithOptimize)
}

/// Build the stub with the older two-argument `compile`.
pub fn legacy_stub_compiler() -> Vec<u8> {
    build(EntryPoint::Legacy)
}

/// Build the stub with a start function that reports the IR (tag 1) and
/// echoes it through `console.log` while the module is still being
/// instantiated.
pub fn stub_with_start() -> Vec<u8> {
    build_shape(EntryPoint::WithOptimize, true, true)
}

/// Like `stub_with_start`, but linear memory is not exported, so the start
/// function's imports have no memory to read from.
pub fn stub_with_start_hidden_memory() -> Vec<u8> {
    build_shape(EntryPoint::WithOptimize, true, false)
}

/// Build a module that imports the host surface but exports no `compile`.
pub fn stub_without_compile() -> Vec<u8> {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function([ValType::I32, ValType::I32], []);
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import("console", "log", EntityType::Function(0));
    module.section(&imports);

    let mut memories = MemorySection::new();
    memories.memory(memory_type());
    module.section(&memories);

    let mut exports = ExportSection::new();
    exports.export("memory", ExportKind::Memory, 0);
    module.section(&exports);

    module.finish()
}

pub fn build(entry: EntryPoint) -> Vec<u8> {
    build_shape(entry, false, true)
}

fn build_shape(entry: EntryPoint, with_start: bool, export_memory: bool) -> Vec<u8> {
    let mut module = Module::new();

    // Types
    let mut types = TypeSection::new();
    let ty_range = types.len();
    types.ty().function([ValType::I32, ValType::I32], []);
    let ty_callback = types.len();
    types
        .ty()
        .function([ValType::I32, ValType::I32, ValType::I32], []);
    let ty_now = types.len();
    types.ty().function([], [ValType::F64]);
    let ty_unary_f64 = types.len();
    types.ty().function([ValType::F64], [ValType::F64]);
    let ty_malloc = types.len();
    types.ty().function([ValType::I32], [ValType::I32]);
    let ty_free = types.len();
    types.ty().function([ValType::I32], []);
    let ty_init = types.len();
    types.ty().function([], []);
    module.section(&types);

    let ty_compile = match entry {
        EntryPoint::WithOptimize => ty_callback,
        EntryPoint::Legacy => ty_range,
    };

    // Imports
    let mut imports = ImportSection::new();
    imports.import("console", "log", EntityType::Function(ty_range));
    imports.import("env", "callback", EntityType::Function(ty_callback));
    imports.import("time", "now_perf", EntityType::Function(ty_now));
    imports.import("math", "sqrt", EntityType::Function(ty_unary_f64));
    module.section(&imports);

    // Functions: malloc, free, init, compile
    let mut functions = FunctionSection::new();
    functions.function(ty_malloc);
    functions.function(ty_free);
    functions.function(ty_init);
    functions.function(ty_compile);
    if with_start {
        functions.function(ty_init);
    }
    module.section(&functions);
    let import_count = 4;
    let fn_malloc = import_count;
    let fn_free = import_count + 1;
    let fn_init = import_count + 2;
    let fn_compile = import_count + 3;
    let fn_start = import_count + 4;

    let mut memories = MemorySection::new();
    memories.memory(memory_type());
    module.section(&memories);

    let mut observed = GlobalSection::new();
    for initial in [HEAP_BASE, 0, 0, 0, -1, -1, 0] {
        observed.global(
            GlobalType {
                val_type: ValType::I32,
                mutable: true,
                shared: false,
            },
            &ConstExpr::i32_const(initial),
        );
    }
    module.section(&observed);

    let mut exports = ExportSection::new();
    if export_memory {
        exports.export("memory", ExportKind::Memory, 0);
    }
    exports.export("malloc", ExportKind::Func, fn_malloc);
    exports.export("free", ExportKind::Func, fn_free);
    exports.export("init", ExportKind::Func, fn_init);
    exports.export("compile", ExportKind::Func, fn_compile);
    exports.export(globals::ALLOC_COUNT, ExportKind::Global, G_ALLOC_COUNT);
    exports.export(globals::FREE_COUNT, ExportKind::Global, G_FREE_COUNT);
    exports.export(globals::LIVE_AT_COMPILE, ExportKind::Global, G_LIVE_AT_COMPILE);
    exports.export(globals::LAST_OPTIMIZE, ExportKind::Global, G_LAST_OPTIMIZE);
    exports.export(globals::LAST_TERMINATOR, ExportKind::Global, G_LAST_TERMINATOR);
    exports.export(globals::INITIALIZED, ExportKind::Global, G_INITIALIZED);
    module.section(&exports);

    if with_start {
        module.section(&StartSection {
            function_index: fn_start,
        });
    }

    let mut code = CodeSection::new();
    code.function(&malloc_body());
    code.function(&free_body());
    code.function(&init_body());
    code.function(&compile_body(entry));
    if with_start {
        code.function(&start_body());
    }
    module.section(&code);

    let mut data = DataSection::new();
    data.active(0, &ConstExpr::i32_const(IR_OFFSET), STUB_IR.bytes());
    data.active(0, &ConstExpr::i32_const(WAT_OFFSET), STUB_WAT.bytes());
    data.active(
        0,
        &ConstExpr::i32_const(BINARY_OFFSET),
        STUB_BINARY.iter().copied(),
    );
    data.active(0, &ConstExpr::i32_const(ERROR_OFFSET), STUB_ERROR.bytes());
    module.section(&data);

    module.finish()
}

fn memory_type() -> MemoryType {
    MemoryType {
        minimum: 2,
        maximum: None,
        memory64: false,
        shared: false,
        page_size_log2: None,
    }
}

fn byte_arg() -> MemArg {
    MemArg {
        offset: 0,
        align: 0,
        memory_index: 0,
    }
}

fn word_arg() -> MemArg {
    MemArg {
        offset: 0,
        align: 2,
        memory_index: 0,
    }
}

/// Bump allocator: hands out 8-byte aligned blocks and never reuses them.
fn malloc_body() -> Function {
    let mut f = Function::new([(1, ValType::I32)]);
    // ptr = heap
    f.instruction(&Instruction::GlobalGet(G_HEAP));
    f.instruction(&Instruction::LocalSet(1));
    // heap = (heap + size + 7) & !7
    f.instruction(&Instruction::GlobalGet(G_HEAP));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(7));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(-8));
    f.instruction(&Instruction::I32And);
    f.instruction(&Instruction::GlobalSet(G_HEAP));
    increment(&mut f, G_ALLOC_COUNT);
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::End);
    f
}

fn free_body() -> Function {
    let mut f = Function::new([]);
    increment(&mut f, G_FREE_COUNT);
    f.instruction(&Instruction::End);
    f
}

/// Touches the time and math imports so a host that forgets them fails to link.
fn init_body() -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::Call(FN_NOW_PERF));
    f.instruction(&Instruction::Call(FN_SQRT));
    f.instruction(&Instruction::Drop);
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::GlobalSet(G_INITIALIZED));
    f.instruction(&Instruction::End);
    f
}

/// Runs before the host has bound the memory export.
fn start_body() -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::I32Const(IR_OFFSET));
    f.instruction(&Instruction::I32Const(IR_OFFSET + STUB_IR.len() as i32));
    f.instruction(&Instruction::Call(FN_CONSOLE_LOG));
    emit(&mut f, 1, IR_OFFSET, STUB_IR.len());
    f.instruction(&Instruction::End);
    f
}

fn compile_body(entry: EntryPoint) -> Function {
    let mut f = Function::new([]);

    // live_at_compile = alloc_count - free_count
    f.instruction(&Instruction::GlobalGet(G_ALLOC_COUNT));
    f.instruction(&Instruction::GlobalGet(G_FREE_COUNT));
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::GlobalSet(G_LIVE_AT_COMPILE));

    if entry == EntryPoint::WithOptimize {
        f.instruction(&Instruction::LocalGet(2));
        f.instruction(&Instruction::GlobalSet(G_LAST_OPTIMIZE));
    }

    // last_terminator = *end
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Load8U(byte_arg()));
    f.instruction(&Instruction::GlobalSet(G_LAST_TERMINATOR));

    // console.log(start, end)
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::Call(FN_CONSOLE_LOG));

    // Leading-byte switches only apply to non-empty sources.
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Ne);
    f.instruction(&Instruction::If(BlockType::Empty));
    {
        first_byte_is(&mut f, b'!');
        f.instruction(&Instruction::If(BlockType::Empty));
        emit(&mut f, -1, ERROR_OFFSET, STUB_ERROR.len());
        f.instruction(&Instruction::Return);
        f.instruction(&Instruction::End);

        first_byte_is(&mut f, b'#');
        f.instruction(&Instruction::If(BlockType::Empty));
        f.instruction(&Instruction::Unreachable);
        f.instruction(&Instruction::End);

        first_byte_is(&mut f, b'?');
        f.instruction(&Instruction::If(BlockType::Empty));
        f.instruction(&Instruction::I32Const(UNKNOWN_TAG));
        f.instruction(&Instruction::LocalGet(0));
        f.instruction(&Instruction::LocalGet(1));
        f.instruction(&Instruction::Call(FN_CALLBACK));
        f.instruction(&Instruction::End);
    }
    f.instruction(&Instruction::End);

    emit(&mut f, 1, IR_OFFSET, STUB_IR.len());
    emit(&mut f, 3, WAT_OFFSET, STUB_WAT.len());

    // Rewrite the magic the previous compile clobbered.
    f.instruction(&Instruction::I32Const(BINARY_OFFSET));
    f.instruction(&Instruction::I32Const(i32::from_le_bytes([0x00, 0x61, 0x73, 0x6d])));
    f.instruction(&Instruction::I32Store(word_arg()));
    emit(&mut f, 2, BINARY_OFFSET, STUB_BINARY.len());

    // The binary buffer is "freed" once reported: clobber it.
    f.instruction(&Instruction::I32Const(BINARY_OFFSET));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::I32Store(word_arg()));

    f.instruction(&Instruction::End);
    f
}

fn increment(f: &mut Function, global: u32) {
    f.instruction(&Instruction::GlobalGet(global));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::GlobalSet(global));
}

fn first_byte_is(f: &mut Function, byte: u8) {
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Load8U(byte_arg()));
    f.instruction(&Instruction::I32Const(i32::from(byte)));
    f.instruction(&Instruction::I32Eq);
}

fn emit(f: &mut Function, tag: i32, offset: i32, len: usize) {
    f.instruction(&Instruction::I32Const(tag));
    f.instruction(&Instruction::I32Const(offset));
    f.instruction(&Instruction::I32Const(offset + len as i32));
    f.instruction(&Instruction::Call(FN_CALLBACK));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_is_valid_wasm() {
        wasmparser::validate(&stub_compiler()).expect("stub validates");
        wasmparser::validate(&legacy_stub_compiler()).expect("legacy stub validates");
        wasmparser::validate(&stub_without_compile()).expect("incomplete stub validates");
        wasmparser::validate(&stub_with_start()).expect("start stub validates");
        wasmparser::validate(&stub_with_start_hidden_memory())
            .expect("start stub without memory export validates");
    }

    #[test]
    fn data_segments_do_not_overlap() {
        assert!(IR_OFFSET as usize + STUB_IR.len() <= WAT_OFFSET as usize);
        assert!(WAT_OFFSET as usize + STUB_WAT.len() <= BINARY_OFFSET as usize);
        assert!(BINARY_OFFSET as usize + STUB_BINARY.len() <= ERROR_OFFSET as usize);
        assert!(ERROR_OFFSET as usize + STUB_ERROR.len() <= HEAP_BASE as usize);
    }

    #[test]
    fn stub_binary_is_a_wasm_header() {
        assert_eq!(&STUB_BINARY[..4], b"\0asm");
    }
}
