//! End to end with the real loader: copy a system library's bytes into a
//! LazyLibrary, let it write and dlopen the copy, and resolve exports.

#![cfg(target_os = "linux")]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempdylib_core::{Config, LazyLibrary, LoadError, RetryPolicy};

const LIBM_CANDIDATES: &[&str] = &[
    "/lib/x86_64-linux-gnu/libm.so.6",
    "/usr/lib/x86_64-linux-gnu/libm.so.6",
    "/lib/aarch64-linux-gnu/libm.so.6",
    "/usr/lib/aarch64-linux-gnu/libm.so.6",
    "/lib64/libm.so.6",
    "/usr/lib64/libm.so.6",
    "/usr/lib/libm.so.6",
];

fn system_libm() -> Option<Vec<u8>> {
    LIBM_CANDIDATES
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .and_then(|p| std::fs::read(p).ok())
}

#[test]
fn test_load_copy_of_libm_and_resolve() {
    let Some(image) = system_libm() else {
        eprintln!("no libm found, skipping");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::default()
        .with_temp_dir(dir.path())
        .with_retry(RetryPolicy::new(3, Duration::from_millis(10)));
    let lib = Arc::new(LazyLibrary::new(image.clone(), "libm-copy.so.6").with_config(cfg));

    let cos = lib.new_routine("cos");
    let addr = cos.address().unwrap();
    assert!(lib.is_loaded());
    assert_ne!(lib.raw_handle().unwrap(), 0);
    assert_eq!(cos.address().unwrap(), addr);

    let written = lib.file_name().unwrap();
    assert!(written.starts_with(dir.path()));
    assert!(written.to_string_lossy().ends_with("-libm-copy.so.6"));
    assert_eq!(std::fs::read(written).unwrap(), image);

    let missing = lib.new_routine("definitely_not_exported_by_libm");
    assert!(matches!(
        missing.address().unwrap_err(),
        LoadError::SymbolResolveFailed { .. }
    ));
}

#[test]
fn test_garbage_image_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::default()
        .with_temp_dir(dir.path())
        .with_retry(RetryPolicy::new(1, Duration::ZERO));
    let lib = LazyLibrary::new(&b"not an ELF file"[..], "junk.so").with_config(cfg);
    let err = lib.load().unwrap_err();
    assert!(matches!(err, LoadError::ModuleLoadFailed { .. }), "{}", err);
    // the image was still written and verified
    assert!(lib.file_name().unwrap().is_file());
}
