//! Native-module C ABI and dynamic library loading
//!
//! This is the single place in the design where platform-specific ABI code
//! is permitted. A native module is a shared library exporting one symbol,
//! `quince_module_init`, which receives a [`QuinceHostApi`] callback table
//! and uses it to allocate values and populate its module's export table.
//! Values cross the boundary as raw NaN-box bits (`u64`), which is safe
//! because object payloads are heap slot indices, not pointers.
//!
//! Loaded libraries are kept alive for the lifetime of the process; the VM
//! never unloads them.

use std::ffi::{c_char, c_void, CStr};

use crate::heap::{Heap, NativeFunctionObj, NativeImpl, Object};
use crate::value::{ObjRef, Value};

/// The init symbol every native module must export.
pub const INIT_SYMBOL: &str = "quince_module_init";

/// Signature of a function exported by a native module. Arguments arrive as
/// raw value bits; the call context allows string allocation.
pub type RawNativeFn =
    unsafe extern "C" fn(call: *const QuinceCallContext, argc: u32, argv: *const u64) -> u64;

/// Signature of the module init symbol.
pub type QuinceInitFn = unsafe extern "C" fn(api: *const QuinceHostApi);

/// Callback table handed to a native function for the duration of one call.
#[repr(C)]
pub struct QuinceCallContext {
    ctx: *mut c_void,
    pub alloc_string: extern "C" fn(ctx: *mut c_void, s: *const c_char) -> u64,
}

/// Callback table handed to `quince_module_init`.
#[repr(C)]
pub struct QuinceHostApi {
    ctx: *mut c_void,
    /// Allocate a string value; returns its bits.
    pub alloc_string: extern "C" fn(ctx: *mut c_void, s: *const c_char) -> u64,
    /// Wrap a native function pointer in a function value; returns its bits.
    pub make_native: extern "C" fn(ctx: *mut c_void, name: *const c_char, f: RawNativeFn) -> u64,
    /// Record `name -> value` in the module's export table.
    pub export: extern "C" fn(ctx: *mut c_void, name: *const c_char, value: u64),
}

struct InitCtx {
    heap: *mut Heap,
    module: ObjRef,
}

unsafe fn c_str_owned(s: *const c_char) -> String {
    if s.is_null() {
        String::new()
    } else {
        CStr::from_ptr(s).to_string_lossy().into_owned()
    }
}

extern "C" fn api_alloc_string(ctx: *mut c_void, s: *const c_char) -> u64 {
    unsafe {
        let init = &mut *(ctx as *mut InitCtx);
        let heap = &mut *init.heap;
        heap.alloc_string(c_str_owned(s)).to_bits()
    }
}

extern "C" fn api_make_native(ctx: *mut c_void, name: *const c_char, f: RawNativeFn) -> u64 {
    unsafe {
        let init = &mut *(ctx as *mut InitCtx);
        let heap = &mut *init.heap;
        let func = heap.allocate(Object::Native(NativeFunctionObj {
            name: c_str_owned(name),
            imp: NativeImpl::Foreign(f),
        }));
        Value::object(func).to_bits()
    }
}

extern "C" fn api_export(ctx: *mut c_void, name: *const c_char, value: u64) {
    unsafe {
        let init = &mut *(ctx as *mut InitCtx);
        let heap = &mut *init.heap;
        let key = heap.alloc_string(c_str_owned(name));
        // table_set covers module export tables and applies the write
        // barrier for the young key/value.
        heap.table_set(init.module, key, Value::from_bits(value));
    }
}

/// Invoke a module's init function with the allocator interface.
pub fn run_module_init(heap: &mut Heap, module: ObjRef, init: QuinceInitFn) {
    let mut ctx = InitCtx {
        heap: heap as *mut Heap,
        module,
    };
    let api = QuinceHostApi {
        ctx: &mut ctx as *mut InitCtx as *mut c_void,
        alloc_string: api_alloc_string,
        make_native: api_make_native,
        export: api_export,
    };
    unsafe { init(&api) }
}

extern "C" fn call_alloc_string(ctx: *mut c_void, s: *const c_char) -> u64 {
    unsafe {
        let heap = &mut *(ctx as *mut Heap);
        heap.alloc_string(c_str_owned(s)).to_bits()
    }
}

/// Call a foreign native function. The returned bits are re-interpreted as
/// a value; the VM validates any object index against the heap afterwards.
pub fn call_foreign(heap: &mut Heap, f: RawNativeFn, args: &[Value]) -> Value {
    let bits: Vec<u64> = args.iter().map(|v| v.to_bits()).collect();
    let call = QuinceCallContext {
        ctx: heap as *mut Heap as *mut c_void,
        alloc_string: call_alloc_string,
    };
    let out = unsafe { f(&call, bits.len() as u32, bits.as_ptr()) };
    Value::from_bits(out)
}

/// A loaded shared library. The handle is deliberately never closed.
pub struct Library {
    #[cfg(unix)]
    handle: *mut c_void,
}

#[cfg(unix)]
impl Library {
    pub fn open(path: &std::path::Path) -> Result<Library, String> {
        use std::ffi::CString;
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| format!("Invalid library path '{}'", path.display()))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(format!(
                "Failed to load native library '{}': {}",
                path.display(),
                last_dl_error()
            ));
        }
        Ok(Library { handle })
    }

    pub fn init_fn(&self) -> Result<QuinceInitFn, String> {
        use std::ffi::CString;
        let symbol = CString::new(INIT_SYMBOL).expect("static symbol name");
        unsafe {
            libc::dlerror(); // clear any stale error
            let sym = libc::dlsym(self.handle, symbol.as_ptr());
            if sym.is_null() {
                return Err(format!(
                    "Native module does not export '{}': {}",
                    INIT_SYMBOL,
                    last_dl_error()
                ));
            }
            Ok(std::mem::transmute::<*mut c_void, QuinceInitFn>(sym))
        }
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

#[cfg(not(unix))]
impl Library {
    pub fn open(_path: &std::path::Path) -> Result<Library, String> {
        Err("Native modules are not supported on this platform".to_string())
    }

    pub fn init_fn(&self) -> Result<QuinceInitFn, String> {
        Err("Native modules are not supported on this platform".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, ModuleObj, Object};

    // An init function written the way a native module would write it,
    // exercising the ABI without an actual shared library.
    unsafe extern "C" fn fake_init(api: *const QuinceHostApi) {
        let api = &*api;
        let answer = 42.0f64.to_bits();
        (api.export)(api.ctx, c"answer".as_ptr(), answer);
        let greeting = (api.alloc_string)(api.ctx, c"hello".as_ptr());
        (api.export)(api.ctx, c"greeting".as_ptr(), greeting);
        let func = (api.make_native)(api.ctx, c"double_it".as_ptr(), double_it);
        (api.export)(api.ctx, c"double_it".as_ptr(), func);
    }

    unsafe extern "C" fn double_it(
        _call: *const QuinceCallContext,
        argc: u32,
        argv: *const u64,
    ) -> u64 {
        if argc < 1 {
            return Value::NIL.to_bits();
        }
        let arg = Value::from_bits(*argv);
        if arg.is_number() {
            Value::number(arg.as_number() * 2.0).to_bits()
        } else {
            Value::NIL.to_bits()
        }
    }

    #[test]
    fn init_populates_exports_through_the_abi() {
        let mut heap = Heap::new();
        let module = heap.allocate(Object::Module(ModuleObj {
            name: "fake".into(),
            exports: Vec::new(),
        }));

        run_module_init(&mut heap, module, fake_init);

        let key = heap.alloc_string("answer");
        assert_eq!(heap.table_get(module, key), Some(Value::number(42.0)));

        let key = heap.alloc_string("greeting");
        let greeting = heap.table_get(module, key).unwrap();
        assert_eq!(heap.as_str(greeting), Some("hello"));

        let key = heap.alloc_string("double_it");
        let func = heap.table_get(module, key).unwrap();
        let Object::Native(native) = heap.get(func.as_object()) else {
            panic!("expected native function export");
        };
        let NativeImpl::Foreign(f) = native.imp else {
            panic!("expected foreign impl");
        };
        let result = call_foreign(&mut heap, f, &[Value::number(21.0)]);
        assert_eq!(result, Value::number(42.0));
    }
}
