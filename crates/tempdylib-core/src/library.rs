//! Lazily written, lazily loaded library images.
//!
//! A [`LazyLibrary`] does no I/O until its module is first asked for. The
//! first caller buffers the image, writes it to its content-addressed path,
//! and loads it; every later caller reads the published module without taking
//! a lock.

use std::borrow::Cow;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::cas::{self, IntegrityHash};
use crate::config::Config;
use crate::error_handling::LoadError;
use crate::files;
use crate::loader::{ModuleLoader, NativeLoader};
use crate::routine::LazyRoutine;
use crate::utils;

/// Where a library is in its one-way trip to loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LibraryState {
    Unloaded,
    Writing,
    Loading,
    Loaded,
    /// The last attempt failed. A retry goes back to `Writing`, or straight to
    /// `Loading` if the file was already written.
    Failed,
}

impl LibraryState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LibraryState::Writing,
            2 => LibraryState::Loading,
            3 => LibraryState::Loaded,
            4 => LibraryState::Failed,
            _ => LibraryState::Unloaded,
        }
    }
}

enum Image {
    Pending(Box<dyn Read + Send>),
    Buffered(Cow<'static, [u8]>),
    /// The source failed part-way; it cannot be read again.
    Unreadable(Arc<std::io::Error>),
    /// Written and verified; the bytes are no longer needed.
    Released,
}

struct Cold {
    image: Image,
    /// The verified file, held for the life of the library. Writers replace
    /// the path rather than the file, so this stays the loaded bytes.
    _guard: Option<std::fs::File>,
    last_error: Option<LoadError>,
}

/// A library image that is written to disk and loaded on first use.
pub struct LazyLibrary<L: ModuleLoader = NativeLoader> {
    name: String,
    loader: L,
    config: Config,
    integrity: Option<IntegrityHash>,
    path: OnceLock<PathBuf>,
    module: OnceLock<L::Module>,
    /// Finished cold-path attempts. Read before blocking on `cold`, so a
    /// waiter can tell that the attempt it waited on has already failed.
    attempts: AtomicU64,
    /// A `LibraryState`, written under `cold` and read without it.
    phase: AtomicU8,
    cold: Mutex<Cold>,
}

impl LazyLibrary<NativeLoader> {
    /// `image` is usually `&include_bytes!(..)[..]`.
    pub fn new(image: impl Into<Cow<'static, [u8]>>, name: impl Into<String>) -> Self {
        Self::with_loader(NativeLoader, image, name)
    }

    /// The reader is drained on first use, not here.
    pub fn from_reader(reader: impl Read + Send + 'static, name: impl Into<String>) -> Self {
        Self::from_reader_with_loader(NativeLoader, reader, name)
    }
}

impl<L: ModuleLoader> LazyLibrary<L> {
    pub fn with_loader(
        loader: L,
        image: impl Into<Cow<'static, [u8]>>,
        name: impl Into<String>,
    ) -> Self {
        Self::build(loader, Image::Buffered(image.into()), name.into())
    }

    pub fn from_reader_with_loader(
        loader: L,
        reader: impl Read + Send + 'static,
        name: impl Into<String>,
    ) -> Self {
        Self::build(loader, Image::Pending(Box::new(reader)), name.into())
    }

    fn build(loader: L, image: Image, name: String) -> Self {
        Self {
            name,
            loader,
            config: Config::default(),
            integrity: None,
            path: OnceLock::new(),
            module: OnceLock::new(),
            attempts: AtomicU64::new(0),
            phase: AtomicU8::new(LibraryState::Unloaded as u8),
            cold: Mutex::new(Cold {
                image,
                _guard: None,
                last_error: None,
            }),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Refuse to write an image whose digest differs from `expected`.
    pub fn with_integrity(mut self, expected: IntegrityHash) -> Self {
        self.integrity = Some(expected);
        self
    }

    /// Logical name, the suffix of the file name on disk.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Path of the written image, once it has been written.
    pub fn file_name(&self) -> Option<&Path> {
        self.path.get().map(PathBuf::as_path)
    }

    /// Never blocks, even while another thread is writing or loading.
    pub fn state(&self) -> LibraryState {
        if self.module.get().is_some() {
            return LibraryState::Loaded;
        }
        LibraryState::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_loaded(&self) -> bool {
        self.module.get().is_some()
    }

    /// Write and load the library if that has not happened yet.
    pub fn load(&self) -> Result<(), LoadError> {
        self.handle().map(|_| ())
    }

    /// The loaded module, loading it on first call.
    ///
    /// Concurrent first callers collapse into one attempt. If that attempt
    /// fails, everyone who waited on it gets its error; a later call tries
    /// again, skipping the write when the file was already verified.
    pub fn handle(&self) -> Result<&L::Module, LoadError> {
        if let Some(module) = self.module.get() {
            return Ok(module);
        }
        let seen = self.attempts.load(Ordering::Acquire);
        let mut cold = self.lock_cold();
        if let Some(module) = self.module.get() {
            return Ok(module);
        }
        if self.attempts.load(Ordering::Acquire) != seen {
            if let Some(err) = &cold.last_error {
                return Err(err.clone());
            }
        }

        let result = self.load_locked(&mut cold);
        match &result {
            Ok(_) => {
                self.set_phase(LibraryState::Loaded);
                cold.last_error = None;
            }
            Err(e) => {
                utils::log_error(&e.to_string());
                self.set_phase(LibraryState::Failed);
                cold.last_error = Some(e.clone());
            }
        }
        self.attempts.fetch_add(1, Ordering::Release);
        result
    }

    /// Like [`handle`](Self::handle) but panics on failure.
    pub fn must_handle(&self) -> &L::Module {
        match self.handle() {
            Ok(module) => module,
            Err(e) => panic!("{}", e),
        }
    }

    /// OS handle of the loaded module as a word.
    pub fn raw_handle(&self) -> Result<usize, LoadError> {
        let module = self.handle()?;
        Ok(self.loader.raw_handle(module))
    }

    /// A routine exported by this library. Nothing is resolved yet.
    pub fn new_routine(self: &Arc<Self>, name: impl Into<String>) -> LazyRoutine<L> {
        LazyRoutine::new(Arc::clone(self), name)
    }

    fn set_phase(&self, phase: LibraryState) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn lock_cold(&self) -> MutexGuard<'_, Cold> {
        // A panicking loader leaves nothing half-published: the module is
        // only set once it is complete.
        self.cold.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_locked(&self, cold: &mut Cold) -> Result<&L::Module, LoadError> {
        let path = match self.path.get() {
            Some(path) => path,
            None => {
                self.set_phase(LibraryState::Writing);
                self.write_image(cold)?
            }
        };

        self.set_phase(LibraryState::Loading);
        let module = self
            .loader
            .load(path)
            .map_err(|source| LoadError::ModuleLoadFailed {
                path: path.clone(),
                source,
            })?;
        utils::log(&format!("loaded {} from {}", self.name, path.display()));
        Ok(self.module.get_or_init(|| module))
    }

    fn write_image(&self, cold: &mut Cold) -> Result<&PathBuf, LoadError> {
        if !cas::is_valid_logical_name(&self.name) {
            return Err(LoadError::InvalidName {
                name: self.name.clone(),
            });
        }
        buffer(&mut cold.image, &self.name);
        let bytes: &[u8] = match &cold.image {
            Image::Buffered(bytes) => &**bytes,
            Image::Unreadable(source) => {
                return Err(LoadError::ImageReadFailed {
                    name: self.name.clone(),
                    source: Arc::clone(source),
                })
            }
            // A written image always has its path published.
            Image::Pending(_) | Image::Released => unreachable!("image not buffered"),
        };

        if let Some(expected) = &self.integrity {
            if !expected.verify(bytes) {
                return Err(LoadError::IntegrityMismatch {
                    name: self.name.clone(),
                    expected: expected.to_sri(),
                    actual: IntegrityHash::of(expected.algorithm, bytes).to_sri(),
                });
            }
        }

        let path = cas::target_path(&self.config.temp_dir(), bytes, &self.name);
        let done = files::safe_write_file(&path, bytes, &self.config.retry).map_err(|source| {
            LoadError::Materialize {
                name: self.name.clone(),
                source,
            }
        })?;
        utils::log(&format!(
            "materialized {} at {} ({} round(s), {} write(s))",
            self.name,
            path.display(),
            done.attempts,
            done.writes
        ));

        cold._guard = Some(done.into_file());
        cold.image = Image::Released;
        Ok(self.path.get_or_init(|| path))
    }
}

/// Drain a pending reader into memory. Only whole images are ever written.
fn buffer(image: &mut Image, name: &str) {
    if let Image::Pending(reader) = image {
        let mut bytes = Vec::new();
        *image = match reader.read_to_end(&mut bytes) {
            Ok(_) => Image::Buffered(Cow::Owned(bytes)),
            Err(e) => {
                let source = Arc::new(e);
                utils::log_error(&format!("reading image for {} failed: {}", name, source));
                Image::Unreadable(source)
            }
        };
    }
}

impl<L: ModuleLoader> fmt::Debug for LazyLibrary<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyLibrary")
            .field("name", &self.name)
            .field("path", &self.path.get())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error_handling::LoaderError;
    use crate::loader::Address;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::{Duration, Instant};

    const SENTINEL: usize = 0xD11;

    #[derive(Default)]
    struct StubLoader {
        loads: AtomicUsize,
        fail_loads: AtomicUsize,
        delay: Duration,
    }

    #[derive(Debug, PartialEq)]
    struct StubModule(usize);

    impl ModuleLoader for StubLoader {
        type Module = StubModule;

        fn load(&self, path: &Path) -> Result<StubModule, LoaderError> {
            assert!(path.is_file(), "load before write: {}", path.display());
            self.loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if self.fail_loads.load(Ordering::SeqCst) > 0 {
                self.fail_loads.fetch_sub(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                return Err(Arc::new(io::Error::new(io::ErrorKind::Other, "bad image")));
            }
            Ok(StubModule(SENTINEL))
        }

        fn resolve(&self, _: &StubModule, _: &str) -> Result<Address, LoaderError> {
            Ok(Address::new(1).unwrap())
        }

        fn raw_handle(&self, module: &StubModule) -> usize {
            module.0
        }
    }

    fn config(dir: &Path) -> Config {
        Config::default()
            .with_temp_dir(dir)
            .with_retry(RetryPolicy::new(2, Duration::ZERO))
    }

    fn image() -> Vec<u8> {
        vec![0xDE, 0xAD, 0xBE, 0xEF, 0, 1, 2, 3, 4, 5]
    }

    #[test]
    fn test_first_handle_writes_then_loads() {
        let dir = tempfile::tempdir().unwrap();
        let lib = LazyLibrary::with_loader(StubLoader::default(), image(), "x.bin")
            .with_config(config(dir.path()));
        assert_eq!(lib.state(), LibraryState::Unloaded);
        assert!(lib.file_name().is_none());

        assert_eq!(lib.raw_handle().unwrap(), SENTINEL);
        let path = lib.file_name().unwrap().to_path_buf();
        assert_eq!(path, cas::target_path(dir.path(), &image(), "x.bin"));
        assert_eq!(std::fs::read(&path).unwrap(), image());
        assert_eq!(lib.state(), LibraryState::Loaded);

        assert_eq!(lib.handle().unwrap(), &StubModule(SENTINEL));
        assert_eq!(lib.loader().loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_first_calls_load_once() {
        let dir = tempfile::tempdir().unwrap();
        let lib = Arc::new(
            LazyLibrary::with_loader(StubLoader::default(), image(), "x.bin")
                .with_config(config(dir.path())),
        );
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lib = Arc::clone(&lib);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    lib.raw_handle().unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), SENTINEL);
        }
        assert_eq!(lib.loader().loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiters_share_one_failure() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StubLoader::default();
        loader.fail_loads.store(1, Ordering::SeqCst);
        let lib = Arc::new(
            LazyLibrary::with_loader(loader, image(), "x.bin").with_config(config(dir.path())),
        );
        let barrier = Arc::new(Barrier::new(6));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let lib = Arc::clone(&lib);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    lib.load().map_err(|e| e.to_string())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // The failing attempt sleeps while holding the lock, so any thread that
        // blocked behind it sees its error rather than starting a new attempt.
        let failures = results.iter().filter(|r| r.is_err()).count();
        assert!(failures >= 1);
        for r in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(r.contains("bad image"));
        }
        assert_eq!(
            lib.loader().loads.load(Ordering::SeqCst),
            1 + (failures < 6) as usize
        );
    }

    #[test]
    fn test_retry_after_load_failure_skips_write() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StubLoader::default();
        loader.fail_loads.store(1, Ordering::SeqCst);
        let lib = LazyLibrary::with_loader(loader, image(), "x.bin").with_config(config(dir.path()));

        let err = lib.load().unwrap_err();
        assert!(matches!(err, LoadError::ModuleLoadFailed { .. }));
        assert_eq!(lib.state(), LibraryState::Failed);
        let path = lib.file_name().unwrap().to_path_buf();

        // Clobber the file: a retry must not rewrite it, only reload.
        std::fs::write(&path, b"changed").unwrap();
        lib.load().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"changed");
        assert_eq!(lib.loader().loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reader_source_buffered_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let lib = LazyLibrary::from_reader_with_loader(
            StubLoader::default(),
            io::Cursor::new(image()),
            "r.bin",
        )
        .with_config(config(dir.path()));
        lib.load().unwrap();
        assert_eq!(std::fs::read(lib.file_name().unwrap()).unwrap(), image());
    }

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated"))
        }
    }

    #[test]
    fn test_unreadable_source() {
        let dir = tempfile::tempdir().unwrap();
        let lib = LazyLibrary::from_reader_with_loader(StubLoader::default(), BrokenReader, "r.bin")
            .with_config(config(dir.path()));
        for _ in 0..2 {
            let err = lib.load().unwrap_err();
            assert!(matches!(err, LoadError::ImageReadFailed { .. }), "{}", err);
        }
        assert_eq!(lib.loader().loads.load(Ordering::SeqCst), 0);
        assert!(lib.file_name().is_none());
    }

    #[test]
    fn test_integrity_pin() {
        let dir = tempfile::tempdir().unwrap();
        let good = LazyLibrary::with_loader(StubLoader::default(), image(), "x.bin")
            .with_config(config(dir.path()))
            .with_integrity(IntegrityHash::sha256(&image()));
        good.load().unwrap();

        let bad = LazyLibrary::with_loader(StubLoader::default(), image(), "y.bin")
            .with_config(config(dir.path()))
            .with_integrity(IntegrityHash::sha256(b"something else"));
        let err = bad.load().unwrap_err();
        assert!(matches!(err, LoadError::IntegrityMismatch { .. }));
        assert!(bad.file_name().is_none());
        assert!(!cas::target_path(dir.path(), &image(), "y.bin").exists());
    }

    #[test]
    fn test_materialize_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir.path().join("missing"));
        let lib = LazyLibrary::with_loader(StubLoader::default(), image(), "x.bin").with_config(cfg);
        let err = lib.load().unwrap_err();
        assert!(matches!(err, LoadError::Materialize { .. }));
        assert_eq!(lib.state(), LibraryState::Failed);
    }

    #[test]
    fn test_state_observable_while_loading() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StubLoader {
            delay: Duration::from_millis(300),
            ..StubLoader::default()
        };
        let lib = Arc::new(
            LazyLibrary::with_loader(loader, image(), "x.bin").with_config(config(dir.path())),
        );
        let worker = {
            let lib = Arc::clone(&lib);
            thread::spawn(move || lib.load())
        };

        let start = Instant::now();
        let mut seen = Vec::new();
        while !lib.is_loaded() && start.elapsed() < Duration::from_secs(10) {
            let asked = Instant::now();
            let state = lib.state();
            assert!(asked.elapsed() < Duration::from_millis(150), "state() blocked");
            if seen.last() != Some(&state) {
                seen.push(state);
            }
            thread::sleep(Duration::from_millis(2));
        }
        worker.join().unwrap().unwrap();
        assert!(seen.contains(&LibraryState::Loading), "saw {:?}", seen);
        assert!(!seen.contains(&LibraryState::Failed));
        assert_eq!(lib.state(), LibraryState::Loaded);
    }

    #[test]
    fn test_name_with_separators_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        for name in ["../escape.so", "a/b.so", ".."] {
            let lib = LazyLibrary::with_loader(StubLoader::default(), image(), name)
                .with_config(config(&inner));
            let err = lib.load().unwrap_err();
            assert!(matches!(err, LoadError::InvalidName { .. }), "{}", err);
            assert!(lib.file_name().is_none());
            assert_eq!(lib.loader().loads.load(Ordering::SeqCst), 0);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(std::fs::read_dir(&inner).unwrap().count(), 0);
    }

    #[test]
    #[should_panic(expected = "failed to write x.bin")]
    fn test_must_handle_panics() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir.path().join("missing"));
        let lib = LazyLibrary::with_loader(StubLoader::default(), image(), "x.bin").with_config(cfg);
        lib.must_handle();
    }
}
