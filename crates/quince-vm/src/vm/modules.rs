//! Module loading
//!
//! Resolution order: built-in modules (`math`, `io`, `string`, `time`)
//! first, then the resolver's search path for scripts, packages and
//! native libraries. Results are cached by logical name; a cache entry is
//! written only after the module executed successfully, so a failed or
//! cyclic load leaves nothing behind.

use super::Vm;
use crate::error::RuntimeError;
use crate::heap::{ModuleObj, Object};
use crate::native;
use crate::resolver::Resolution;
use crate::value::{ObjRef, Value};

impl Vm {
    pub(crate) fn load_module(&mut self, name: &str) -> Result<Value, RuntimeError> {
        if let Some(module) = crate::stdlib::builtin_module(&mut self.heap, name) {
            let value = Value::object(module);
            self.module_cache.insert(name.to_string(), value);
            return Ok(value);
        }

        if self.loading.contains(name) {
            return Err(self.error(format!("Cyclic import of module '{}'", name)));
        }

        let Some(resolution) = self.resolver.resolve(name) else {
            return Err(self.error(format!("Module not found: {}", name)));
        };

        self.loading.insert(name.to_string());
        let result = match resolution {
            Resolution::Script(path) | Resolution::Package(path) => {
                self.load_script_module(name, &path)
            }
            Resolution::NativeLibrary(path) => self.load_native_module(name, &path),
        };
        self.loading.remove(name);

        let value = result?;
        self.module_cache.insert(name.to_string(), value);
        Ok(value)
    }

    fn load_script_module(
        &mut self,
        name: &str,
        path: &std::path::Path,
    ) -> Result<Value, RuntimeError> {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                return Err(self.error(format!(
                    "Could not read module '{}' ({}): {}",
                    name,
                    path.display(),
                    err
                )))
            }
        };

        let program = match quince_syntax::parse(&source) {
            Ok(program) => program,
            Err(err) => return Err(self.error(format!("In module '{}': {}", name, err))),
        };
        let chunk = match self.compile(&program) {
            Ok(chunk) => chunk,
            Err(err) => return Err(self.error(format!("In module '{}': {}", name, err))),
        };

        let module = self.new_module_object(name);
        self.heap.push_temp_root(module);
        let result = self.interpret(chunk, Some(module));
        self.heap.pop_temp_roots(1);
        result?;

        Ok(Value::object(module))
    }

    fn load_native_module(
        &mut self,
        name: &str,
        path: &std::path::Path,
    ) -> Result<Value, RuntimeError> {
        let library = match native::Library::open(path) {
            Ok(library) => library,
            Err(err) => return Err(self.error(err)),
        };
        let init = match library.init_fn() {
            Ok(init) => init,
            Err(err) => return Err(self.error(err)),
        };

        let module = self.new_module_object(name);
        self.heap.push_temp_root(module);
        native::run_module_init(&mut self.heap, module, init);
        self.heap.pop_temp_roots(1);

        self.libraries.push(library);
        Ok(Value::object(module))
    }

    fn new_module_object(&mut self, name: &str) -> ObjRef {
        self.heap.allocate(Object::Module(ModuleObj {
            name: name.to_string(),
            exports: Vec::new(),
        }))
    }
}
