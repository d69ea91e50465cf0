//! Fetching and instantiating the compiler module.

use std::path::Path;

use tracing::{debug, warn};
use wasmi::{AsContext, Engine, Instance, Linker, Memory, Module, Store, TypedFunc, WasmParams, WasmResults};

use crate::LOG_TARGET;
use crate::config::BridgeConfig;
use crate::diagnostic::DiagnosticParser;
use crate::dispatch::{Callback, Dispatcher, EventHandler, Unregistered};
use crate::error::PlaygroundError;
use crate::imports::{self, HostState};
use crate::memory::GuestBuffer;

/// Builds a `ModuleHandle`. `C` decides where `env.callback` goes.
pub struct Loader<C = Unregistered> {
    config: BridgeConfig,
    callback: C,
}

impl Loader<Unregistered> {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            callback: Unregistered,
        }
    }
}

impl<C: Callback> Loader<C> {
    /// Route `env.callback` through a dispatcher feeding `handler`.
    pub fn with_dispatcher<H: EventHandler + 'static>(self, handler: H) -> Loader<Dispatcher<H>> {
        let parser = DiagnosticParser::new(self.config.locatable_marker.clone());
        Loader {
            callback: Dispatcher::new(handler, parser),
            config: self.config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Read the module from `path` and instantiate it.
    ///
    /// Reading is the only step that suspends. A failure anywhere fails the
    /// whole load; call `load` again to retry.
    pub async fn load(self, path: impl AsRef<Path>) -> Result<ModuleHandle<C>, PlaygroundError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| PlaygroundError::Fetch {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(target: LOG_TARGET, path = %path.display(), bytes = bytes.len(), "fetched compiler module");
        self.load_bytes(&bytes)
    }

    /// Instantiate a module that is already in memory.
    pub fn load_bytes(self, wasm: &[u8]) -> Result<ModuleHandle<C>, PlaygroundError> {
        let engine = Engine::default();
        let module = Module::new(&engine, wasm).map_err(PlaygroundError::Instantiation)?;

        let mut linker = <Linker<HostState<C>>>::new(&engine);
        imports::define(&mut linker)?;

        let state = HostState::new(self.config.memory_export.clone(), self.callback);
        let mut store = Store::new(&engine, state);
        let instance = linker
            .instantiate_and_start(&mut store, &module)
            .map_err(PlaygroundError::Instantiation)?;

        let memory = instance
            .get_memory(&store, &self.config.memory_export)
            .ok_or_else(|| PlaygroundError::MissingExport {
                name: self.config.memory_export.clone(),
            })?;
        store.data_mut().memory = Some(memory);

        let exports = Exports::bind(&store, &instance)?;
        debug!(
            target: LOG_TARGET,
            memory_bytes = memory.data(&store).len(),
            optimize_flag = exports.compile.accepts_optimize(),
            "instantiated compiler module"
        );

        Ok(ModuleHandle {
            store,
            instance,
            memory,
            exports,
        })
    }
}

/// `compile` as exported by the module.
enum CompileEntry {
    WithOptimize(TypedFunc<(i32, i32, i32), ()>),
    /// Older builds take only `(start, end)`.
    Legacy(TypedFunc<(i32, i32), ()>),
}

impl CompileEntry {
    fn accepts_optimize(&self) -> bool {
        matches!(self, CompileEntry::WithOptimize(_))
    }
}

struct Exports {
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
    init: TypedFunc<(), ()>,
    compile: CompileEntry,
}

impl Exports {
    fn bind(store: impl AsContext, instance: &Instance) -> Result<Self, PlaygroundError> {
        let store = store.as_context();
        let compile = match instance.get_typed_func::<(i32, i32, i32), ()>(&store, "compile") {
            Ok(func) => CompileEntry::WithOptimize(func),
            Err(_) => {
                let func = typed::<(i32, i32), ()>(&store, instance, "compile")?;
                warn!(target: LOG_TARGET, "compiler exports compile(start, end); the optimize flag will be ignored");
                CompileEntry::Legacy(func)
            }
        };
        Ok(Self {
            malloc: typed(&store, instance, "malloc")?,
            free: typed(&store, instance, "free")?,
            init: typed(&store, instance, "init")?,
            compile,
        })
    }
}

fn typed<P: WasmParams, R: WasmResults>(
    store: impl AsContext,
    instance: &Instance,
    name: &'static str,
) -> Result<TypedFunc<P, R>, PlaygroundError> {
    instance
        .get_typed_func::<P, R>(store, name)
        .map_err(|_| PlaygroundError::MissingExport {
            name: name.to_string(),
        })
}

/// A loaded compiler module.
///
/// Every call into the module takes `&mut self`, so only one can be in
/// flight at a time. The handle can be reused for any number of sequential
/// compiles.
pub struct ModuleHandle<C> {
    store: Store<HostState<C>>,
    instance: Instance,
    memory: Memory,
    exports: Exports,
}

impl<C: Callback> ModuleHandle<C> {
    /// Run the module's `init` export.
    pub fn initialize(&mut self) -> Result<(), PlaygroundError> {
        self.exports
            .init
            .call(&mut self.store, ())
            .map_err(|source| PlaygroundError::Trap {
                export: "init",
                source,
            })
    }

    /// Whether `compile` takes the optimize flag.
    pub fn accepts_optimize(&self) -> bool {
        self.exports.compile.accepts_optimize()
    }

    pub fn callback(&self) -> &C {
        &self.store.data().callback
    }

    pub fn callback_mut(&mut self) -> &mut C {
        &mut self.store.data_mut().callback
    }

    /// Current size of linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory().len()
    }

    /// Value of an exported `i32` global, for inspecting module state.
    pub fn global_i32(&self, name: &str) -> Option<i32> {
        self.instance
            .get_global(&self.store, name)
            .and_then(|global| global.get(&self.store).i32())
    }

    pub(crate) fn memory(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    pub(crate) fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }

    pub(crate) fn allocate(&mut self, size: u32) -> Result<u32, PlaygroundError> {
        let ptr = self
            .exports
            .malloc
            .call(&mut self.store, size as i32)
            .map_err(|source| PlaygroundError::Trap {
                export: "malloc",
                source,
            })?;
        if ptr == 0 && size != 0 {
            return Err(PlaygroundError::AllocationFailed {
                size: u64::from(size),
            });
        }
        Ok(ptr as u32)
    }

    pub(crate) fn free(&mut self, ptr: u32) -> Result<(), PlaygroundError> {
        self.exports
            .free
            .call(&mut self.store, ptr as i32)
            .map_err(|source| PlaygroundError::Trap {
                export: "free",
                source,
            })
    }

    /// Call `compile(start, end, optimize)` once. Events fire from inside
    /// this call and have all been handled when it returns.
    pub(crate) fn invoke_compile(
        &mut self,
        buffer: &GuestBuffer,
        optimize: bool,
    ) -> Result<(), PlaygroundError> {
        let (start, end) = buffer.bounds();
        let result = match &self.exports.compile {
            CompileEntry::WithOptimize(func) => {
                func.call(&mut self.store, (start, end, i32::from(optimize)))
            }
            CompileEntry::Legacy(func) => func.call(&mut self.store, (start, end)),
        };
        result.map_err(|source| PlaygroundError::Trap {
            export: "compile",
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuardRegion;

    #[test]
    fn rejects_bytes_that_are_not_wasm() {
        let err = Loader::new(BridgeConfig::default())
            .load_bytes(b"not a wasm module")
            .err()
            .expect("load fails");
        assert!(matches!(err, PlaygroundError::Instantiation(_)));
        assert!(err.is_load_failure());
    }

    #[test]
    fn rejects_module_missing_imports_it_cannot_satisfy() {
        // (module (import "host" "missing" (func)))
        let wasm = [
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type: () -> ()
            0x02, 0x10, 0x01, 0x04, b'h', b'o', b's', b't', 0x07, b'm', b'i', b's', b's', b'i',
            b'n', b'g', 0x00, 0x00, // import host.missing (func 0)
        ];
        let err = Loader::new(BridgeConfig::default())
            .load_bytes(&wasm)
            .err()
            .expect("load fails");
        assert!(matches!(err, PlaygroundError::Instantiation(_)));
    }

    #[test]
    fn unregistered_callback_still_completes_compile() {
        let mut handle = Loader::new(BridgeConfig::default())
            .load_bytes(&rainc_stub::stub_compiler())
            .expect("stub loads");
        handle.initialize().expect("init");
        assert!(handle.accepts_optimize());
        assert!(handle.memory_size() >= 2 * 65536);

        handle
            .with_encoded("fn main() {}", GuardRegion::DEFAULT, |handle, buffer| {
                handle.invoke_compile(buffer, true)
            })
            .expect("compile");
        assert_eq!(handle.global_i32(rainc_stub::globals::LAST_OPTIMIZE), Some(1));
        assert_eq!(handle.global_i32("no_such_global"), None);
    }

    #[test]
    fn rejects_module_without_memory() {
        // (module)
        let wasm = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
        let err = Loader::new(BridgeConfig::default())
            .load_bytes(&wasm)
            .err()
            .expect("load fails");
        assert!(matches!(err, PlaygroundError::MissingExport { ref name } if name == "memory"));
    }
}
