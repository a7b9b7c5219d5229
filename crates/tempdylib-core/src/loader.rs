//! The OS side of loading: turning a path into a module and a name into an
//! address. [`NativeLoader`] does it with `libloading`; tests plug in stubs.

use std::ffi::c_void;
use std::fmt;
use std::mem::ManuallyDrop;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::error_handling::LoaderError;

/// Address of a resolved routine. Never null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(NonZeroUsize);

impl Address {
    pub fn new(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Address)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0.get() as *const c_void
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0.get())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Loads modules from disk and looks up their exports.
pub trait ModuleLoader: Send + Sync {
    type Module: Send + Sync;

    fn load(&self, path: &Path) -> Result<Self::Module, LoaderError>;

    fn resolve(&self, module: &Self::Module, name: &str) -> Result<Address, LoaderError>;

    /// OS handle of a loaded module, as a word.
    fn raw_handle(&self, module: &Self::Module) -> usize;
}

/// `dlopen`/`LoadLibraryW` through `libloading`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeLoader;

/// A module mapped by [`NativeLoader`]. It stays mapped for the rest of the
/// process: addresses handed out from it must never dangle.
pub struct NativeModule {
    library: ManuallyDrop<Library>,
    raw: usize,
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("raw", &format_args!("{:#x}", self.raw))
            .finish()
    }
}

#[derive(Debug)]
struct NullSymbol(String);

impl fmt::Display for NullSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "symbol {} resolved to a null address", self.0)
    }
}

impl std::error::Error for NullSymbol {}

#[cfg(unix)]
fn open_native(path: &Path) -> Result<(Library, usize), libloading::Error> {
    use libloading::os::unix::Library as UnixLibrary;
    // Safety: running the module's initialisers is what the caller asked for.
    let lib = unsafe { UnixLibrary::new(path) }?;
    let raw = lib.into_raw();
    let lib = unsafe { UnixLibrary::from_raw(raw) };
    Ok((lib.into(), raw as usize))
}

#[cfg(windows)]
fn open_native(path: &Path) -> Result<(Library, usize), libloading::Error> {
    use libloading::os::windows::Library as WinLibrary;
    let lib = unsafe { WinLibrary::new(path) }?;
    let raw = lib.into_raw();
    let lib = unsafe { WinLibrary::from_raw(raw) };
    Ok((lib.into(), raw as usize))
}

impl ModuleLoader for NativeLoader {
    type Module = NativeModule;

    fn load(&self, path: &Path) -> Result<NativeModule, LoaderError> {
        let (library, raw) = open_native(path).map_err(|e| Arc::new(e) as LoaderError)?;
        Ok(NativeModule {
            library: ManuallyDrop::new(library),
            raw,
        })
    }

    fn resolve(&self, module: &NativeModule, name: &str) -> Result<Address, LoaderError> {
        // Safety: only the address is read here; calling it is the caller's
        // business.
        let symbol: Symbol<*const c_void> = unsafe { module.library.get(name.as_bytes()) }
            .map_err(|e| Arc::new(e) as LoaderError)?;
        Address::new(*symbol as usize)
            .ok_or_else(|| Arc::new(NullSymbol(name.to_string())) as LoaderError)
    }

    fn raw_handle(&self, module: &NativeModule) -> usize {
        module.raw
    }
}
