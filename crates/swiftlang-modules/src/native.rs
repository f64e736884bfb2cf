//! Dynamic library loading for native modules
//!
//! Cross-platform support for loading shared libraries (.so, .dylib, .dll)
//!
//! # Native ABI
//!
//! - init: `extern "C" fn(module: *const c_void) -> bool`, where the
//!   argument is an opaque pointer to the [`Module`] being initialized
//! - functions: `extern "C" fn(args: *const f64, argc: usize) -> f64`

use crate::error::NativeError;
use crate::host::{NativeLibrary, NativeLoader};
use crate::module::Module;
use crate::value::{NativeFunction, Value};
use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Init function signature
pub type NativeInitFn = extern "C" fn(*const c_void) -> bool;

/// Exported function signature
pub type NativeCallFn = extern "C" fn(*const f64, usize) -> f64;

/// Platform shared-library extension
pub fn library_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(windows) {
        "dll"
    } else {
        "so"
    }
}

/// Platform file name for a library called `name` (`libname.so`, `name.dll`)
pub fn library_file_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.{}", name, library_extension())
    } else {
        format!("lib{}.{}", name, library_extension())
    }
}

/// Check whether `path` has a shared-library extension
pub fn is_library_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("so") | Some("dylib") | Some("dll")
    )
}

/// Platform key used inside archives (`linux-x86_64`, `macos-aarch64`)
pub fn current_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Init symbols to try for `module_name`, most specific first
///
/// `math.native` with prefix `swiftlang` yields
/// `swiftlang_math_native_module_init`, then `swiftlang_module_init`.
pub fn init_symbols(prefix: &str, module_name: &str) -> [String; 2] {
    let stem: String = module_name
        .trim_start_matches('$')
        .chars()
        .map(|c| if c == '.' || c == '/' { '_' } else { c })
        .collect();
    [
        format!("{}_{}_module_init", prefix, stem),
        format!("{}_module_init", prefix),
    ]
}

/// Cross-platform dynamic library handle
pub struct Library {
    handle: LibraryHandle,
    path: PathBuf,
}

impl Library {
    /// Load a dynamic library from the given path.
    ///
    /// # Platform-specific behavior
    ///
    /// - **Linux/macOS**: `dlopen(RTLD_NOW | RTLD_LOCAL)`
    /// - **Windows**: `LoadLibraryW`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NativeError> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .ok_or_else(|| NativeError::InvalidPath(format!("{:?}", path_ref)))?;

        let handle = LibraryHandle::load(path_str)?;

        Ok(Library {
            handle,
            path: path_ref.to_path_buf(),
        })
    }

    /// Get a raw symbol address by name.
    ///
    /// # Safety
    ///
    /// The caller must ensure the symbol's real type matches the use it is
    /// put to, and that the library outlives every use of the pointer.
    pub unsafe fn raw_symbol(&self, symbol: &str) -> Result<*mut c_void, NativeError> {
        self.handle.symbol(symbol, &self.path.to_string_lossy())
    }

    /// Get the path this library was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Loader backed by the platform dynamic linker
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl DylibLoader {
    /// Create a loader
    pub fn new() -> Self {
        DylibLoader
    }
}

impl NativeLoader for DylibLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn NativeLibrary>, NativeError> {
        let library = Library::open(path)?;
        tracing::debug!(target: "swiftlang::native", path = %path.display(), "opened native library");
        Ok(Box::new(DylibLibrary {
            library: Arc::new(library),
        }))
    }
}

/// A library opened by [`DylibLoader`]
pub struct DylibLibrary {
    // Shared with every NativeFunction handed out so the code stays mapped
    library: Arc<Library>,
}

impl NativeLibrary for DylibLibrary {
    fn path(&self) -> &Path {
        self.library.path()
    }

    fn has_symbol(&self, symbol: &str) -> bool {
        unsafe { self.library.raw_symbol(symbol).is_ok() }
    }

    fn call_init(&self, symbol: &str, module: &Module) -> Option<bool> {
        let address = unsafe { self.library.raw_symbol(symbol).ok()? };
        let init: NativeInitFn = unsafe { std::mem::transmute::<*mut c_void, NativeInitFn>(address) };
        Some(init(module as *const Module as *const c_void))
    }

    fn function(&self, symbol: &str) -> Option<NativeFunction> {
        let address = unsafe { self.library.raw_symbol(symbol).ok()? };
        let func: NativeCallFn = unsafe { std::mem::transmute::<*mut c_void, NativeCallFn>(address) };
        let library = Arc::clone(&self.library);
        Some(NativeFunction::new(symbol, move |args| {
            let _keep_loaded = &library;
            let numbers = args
                .iter()
                .map(|arg| {
                    arg.as_number()
                        .ok_or_else(|| format!("native argument must be a number, got {}", arg.type_name()))
                })
                .collect::<Result<Vec<f64>, String>>()?;
            Ok(Value::Number(func(numbers.as_ptr(), numbers.len())))
        }))
    }
}

// Platform-specific implementations

#[cfg(unix)]
type LibraryHandle = UnixLibrary;

#[cfg(windows)]
type LibraryHandle = WindowsLibrary;

// ============================================================================
// Unix Implementation (Linux, macOS, BSD)
// ============================================================================

#[cfg(unix)]
struct UnixLibrary {
    handle: *mut c_void,
}

#[cfg(unix)]
impl UnixLibrary {
    fn load(path: &str) -> Result<Self, NativeError> {
        use std::ffi::CStr;

        let c_path = CString::new(path)
            .map_err(|e| NativeError::Platform(format!("Invalid path: {}", e)))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };

        if handle.is_null() {
            let error = unsafe {
                let err_ptr = libc::dlerror();
                if err_ptr.is_null() {
                    "Unknown error".to_string()
                } else {
                    CStr::from_ptr(err_ptr).to_string_lossy().into_owned()
                }
            };

            return Err(NativeError::NotFound {
                path: format!("{}: {}", path, error),
            });
        }

        Ok(UnixLibrary { handle })
    }

    unsafe fn symbol(&self, name: &str, lib_path: &str) -> Result<*mut c_void, NativeError> {
        use std::ffi::CStr;

        let c_name = CString::new(name)
            .map_err(|e| NativeError::Platform(format!("Invalid symbol name: {}", e)))?;

        // Clear any previous errors
        libc::dlerror();

        let symbol = libc::dlsym(self.handle, c_name.as_ptr());

        let err_ptr = libc::dlerror();
        if !err_ptr.is_null() {
            let error = CStr::from_ptr(err_ptr).to_string_lossy().into_owned();
            return Err(NativeError::SymbolNotFound {
                symbol: name.to_string(),
                library: format!("{}: {}", lib_path, error),
            });
        }

        if symbol.is_null() {
            return Err(NativeError::SymbolNotFound {
                symbol: name.to_string(),
                library: lib_path.to_string(),
            });
        }

        Ok(symbol)
    }
}

#[cfg(unix)]
impl Drop for UnixLibrary {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

#[cfg(unix)]
unsafe impl Send for UnixLibrary {}
#[cfg(unix)]
unsafe impl Sync for UnixLibrary {}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
struct WindowsLibrary {
    handle: *mut c_void,
}

#[cfg(windows)]
impl WindowsLibrary {
    fn load(path: &str) -> Result<Self, NativeError> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;

        let wide: Vec<u16> = OsStr::new(path)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };

        if handle.is_null() {
            let error = unsafe { GetLastError() };
            return Err(NativeError::NotFound {
                path: format!("{} (error code: {})", path, error),
            });
        }

        Ok(WindowsLibrary { handle })
    }

    unsafe fn symbol(&self, name: &str, lib_path: &str) -> Result<*mut c_void, NativeError> {
        let c_name = CString::new(name)
            .map_err(|e| NativeError::Platform(format!("Invalid symbol name: {}", e)))?;

        let symbol = GetProcAddress(self.handle, c_name.as_ptr());

        if symbol.is_null() {
            let error = GetLastError();
            return Err(NativeError::SymbolNotFound {
                symbol: name.to_string(),
                library: format!("{} (error code: {})", lib_path, error),
            });
        }

        Ok(symbol)
    }
}

#[cfg(windows)]
impl Drop for WindowsLibrary {
    fn drop(&mut self) {
        unsafe {
            FreeLibrary(self.handle);
        }
    }
}

#[cfg(windows)]
unsafe impl Send for WindowsLibrary {}
#[cfg(windows)]
unsafe impl Sync for WindowsLibrary {}

#[cfg(windows)]
extern "system" {
    fn LoadLibraryW(filename: *const u16) -> *mut c_void;
    fn GetProcAddress(module: *mut c_void, procname: *const std::ffi::c_char) -> *mut c_void;
    fn FreeLibrary(module: *mut c_void) -> i32;
    fn GetLastError() -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_not_found() {
        let result = DylibLoader::new().open(Path::new("/nonexistent/library.so"));
        assert!(matches!(result, Err(NativeError::NotFound { .. })));
    }

    #[test]
    fn test_init_symbols() {
        assert_eq!(
            init_symbols("swiftlang", "math.native"),
            [
                "swiftlang_math_native_module_init".to_string(),
                "swiftlang_module_init".to_string()
            ]
        );
        assert_eq!(init_symbols("swiftlang", "$clock")[0], "swiftlang_clock_module_init");
        assert_eq!(init_symbols("swiftlang", "pkg/fast")[0], "swiftlang_pkg_fast_module_init");
    }

    #[test]
    fn test_library_naming() {
        let name = library_file_name("clock");
        assert!(name.contains("clock"));
        assert!(is_library_path(Path::new(&name)));
        assert!(!is_library_path(Path::new("clock.swift")));
    }
}
