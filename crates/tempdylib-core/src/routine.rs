//! Routines exported by a [`LazyLibrary`], resolved on first use.

use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::error_handling::LoadError;
use crate::library::LazyLibrary;
use crate::loader::{Address, ModuleLoader, NativeLoader};
use crate::utils;

/// Most word arguments [`LazyRoutine::call`] can forward.
pub const MAX_CALL_ARGS: usize = 15;

/// What a forwarded call returned.
#[derive(Debug)]
pub struct CallOutcome {
    /// The routine's return register.
    pub value: usize,
    /// The thread's OS error code right after the call, if non-zero. Only
    /// meaningful for routines that set it.
    pub last_error: Option<io::Error>,
}

/// A named export of a [`LazyLibrary`]. Resolving it loads the library first.
pub struct LazyRoutine<L: ModuleLoader = NativeLoader> {
    library: Arc<LazyLibrary<L>>,
    name: String,
    address: OnceLock<Address>,
    attempts: AtomicU64,
    last_error: Mutex<Option<LoadError>>,
}

impl<L: ModuleLoader> LazyRoutine<L> {
    pub(crate) fn new(library: Arc<LazyLibrary<L>>, name: impl Into<String>) -> Self {
        Self {
            library,
            name: name.into(),
            address: OnceLock::new(),
            attempts: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn library(&self) -> &Arc<LazyLibrary<L>> {
        &self.library
    }

    pub fn is_resolved(&self) -> bool {
        self.address.get().is_some()
    }

    /// Load the library and resolve the routine if not done already.
    pub fn find(&self) -> Result<(), LoadError> {
        self.address().map(|_| ())
    }

    /// Same collapsing of concurrent first callers as
    /// [`LazyLibrary::handle`].
    pub fn address(&self) -> Result<Address, LoadError> {
        if let Some(addr) = self.address.get() {
            return Ok(*addr);
        }
        let seen = self.attempts.load(Ordering::Acquire);
        let mut last_error = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(addr) = self.address.get() {
            return Ok(*addr);
        }
        if self.attempts.load(Ordering::Acquire) != seen {
            if let Some(err) = &*last_error {
                return Err(err.clone());
            }
        }

        let result = self.resolve_locked();
        *last_error = result.as_ref().err().cloned();
        self.attempts.fetch_add(1, Ordering::Release);
        result
    }

    /// Like [`address`](Self::address) but panics on failure.
    pub fn must_address(&self) -> Address {
        match self.address() {
            Ok(addr) => addr,
            Err(e) => panic!("{}", e),
        }
    }

    fn resolve_locked(&self) -> Result<Address, LoadError> {
        let module = self.library.handle()?;
        let addr = self
            .library
            .loader()
            .resolve(module, &self.name)
            .map_err(|source| LoadError::SymbolResolveFailed {
                library: self.library.name().to_string(),
                symbol: self.name.clone(),
                source,
            })?;
        utils::log_debug(&format!(
            "resolved {} in {} at {}",
            self.name,
            self.library.name(),
            addr
        ));
        Ok(*self.address.get_or_init(|| addr))
    }

    /// Call the routine with up to [`MAX_CALL_ARGS`] word arguments using the
    /// C calling convention, resolving it first if needed.
    ///
    /// # Safety
    ///
    /// The routine must take exactly `args.len()` word-sized integer or
    /// pointer arguments and return a word (or nothing), and any pointers
    /// passed must be valid for whatever the routine does with them.
    pub unsafe fn call(&self, args: &[usize]) -> Result<CallOutcome, LoadError> {
        if args.len() > MAX_CALL_ARGS {
            return Err(LoadError::TooManyArguments {
                symbol: self.name.clone(),
                given: args.len(),
                max: MAX_CALL_ARGS,
            });
        }
        let addr = self.address()?;
        clear_last_os_error();
        let value = forward(addr.get(), args);
        let err = io::Error::last_os_error();
        let last_error = match err.raw_os_error() {
            Some(0) | None => None,
            Some(_) => Some(err),
        };
        Ok(CallOutcome { value, last_error })
    }
}

impl<L: ModuleLoader> fmt::Debug for LazyRoutine<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyRoutine")
            .field("library", &self.library.name())
            .field("name", &self.name)
            .field("address", &self.address.get())
            .finish()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn clear_last_os_error() {
    unsafe { *libc::__errno_location() = 0 }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn clear_last_os_error() {
    unsafe { *libc::__error() = 0 }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn clear_last_os_error() {}

macro_rules! forward_words {
    (@word $idx:tt) => { usize };
    ($addr:expr, $args:expr; $($idx:tt)*) => {{
        let f: unsafe extern "C" fn($(forward_words!(@word $idx)),*) -> usize =
            mem::transmute::<usize, _>($addr);
        f($($args[$idx]),*)
    }};
}

/// Caller guarantees `args.len() <= MAX_CALL_ARGS` and a matching signature.
unsafe fn forward(addr: usize, a: &[usize]) -> usize {
    match a.len() {
        0 => forward_words!(addr, a;),
        1 => forward_words!(addr, a; 0),
        2 => forward_words!(addr, a; 0 1),
        3 => forward_words!(addr, a; 0 1 2),
        4 => forward_words!(addr, a; 0 1 2 3),
        5 => forward_words!(addr, a; 0 1 2 3 4),
        6 => forward_words!(addr, a; 0 1 2 3 4 5),
        7 => forward_words!(addr, a; 0 1 2 3 4 5 6),
        8 => forward_words!(addr, a; 0 1 2 3 4 5 6 7),
        9 => forward_words!(addr, a; 0 1 2 3 4 5 6 7 8),
        10 => forward_words!(addr, a; 0 1 2 3 4 5 6 7 8 9),
        11 => forward_words!(addr, a; 0 1 2 3 4 5 6 7 8 9 10),
        12 => forward_words!(addr, a; 0 1 2 3 4 5 6 7 8 9 10 11),
        13 => forward_words!(addr, a; 0 1 2 3 4 5 6 7 8 9 10 11 12),
        14 => forward_words!(addr, a; 0 1 2 3 4 5 6 7 8 9 10 11 12 13),
        15 => forward_words!(addr, a; 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14),
        n => unreachable!("{} arguments", n),
    }
}
