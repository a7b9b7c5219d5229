//! Core library for tempdylib: write an in-memory library image to a
//! content-addressed file in the temp directory and load it on first use.
//! Safe to use from many threads and many processes at once.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tempdylib_core::LazyLibrary;
//!
//! static IMAGE: &[u8] = &[/* include_bytes!("plugin.so") */];
//!
//! let lib = Arc::new(LazyLibrary::new(IMAGE, "plugin.so"));
//! let version = lib.new_routine("plugin_version");
//! let out = unsafe { version.call(&[]) }.expect("plugin failed to load");
//! println!("version {}", out.value);
//! ```

pub mod cas;
pub mod config;
pub mod error_handling;
pub mod files;
pub mod library;
pub mod loader;
pub mod routine;
pub mod utils;

pub use cas::{target_path, ContentKey, IntegrityHash};
pub use config::{load_config, Config, RetryPolicy};
pub use error_handling::{LoadError, LoaderError, MaterializeError};
pub use files::{safe_write_file, Materialized};
pub use library::{LazyLibrary, LibraryState};
pub use loader::{Address, ModuleLoader, NativeLoader, NativeModule};
pub use routine::{CallOutcome, LazyRoutine, MAX_CALL_ARGS};
pub use utils::{log, log_error};
