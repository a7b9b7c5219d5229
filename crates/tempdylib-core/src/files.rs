//! Writing library images to shared paths.
//!
//! Several processes may race to write the same content-addressed file. None of
//! them takes a lock: each one reads the file back, compares it with the image,
//! and rewrites it when it differs, for a bounded number of rounds. Because the
//! name is derived from the content, every writer agrees on the right bytes.
//!
//! A rewrite never touches the existing file in place. The bytes go to a
//! private staging file next to the target, which is then renamed over it, so
//! a reader that already holds the target keeps a complete copy.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crate::config::RetryPolicy;
use crate::error_handling::MaterializeError;
use crate::utils;

#[cfg(windows)]
mod win {
    pub const FILE_SHARE_READ: u32 = 0x0000_0001;
    pub const FILE_SHARE_DELETE: u32 = 0x0000_0004;
    pub const FILE_FLAG_DELETE_ON_CLOSE: u32 = 0x0400_0000;
    pub const GENERIC_READ: u32 = 0x8000_0000;
    pub const GENERIC_WRITE: u32 = 0x4000_0000;
    pub const DELETE: u32 = 0x0001_0000;
}

/// A verified file, open for reading.
#[derive(Debug)]
pub struct Materialized<F = File> {
    pub file: F,
    /// Rounds run, counting the one that verified the file.
    pub attempts: u32,
    /// Write-opens that succeeded along the way.
    pub writes: u32,
}

impl<F> Materialized<F> {
    pub fn into_file(self) -> F {
        self.file
    }
}

/// Both ends of the loop, split out so the protocol can run against
/// something other than the real file system.
pub(crate) trait Target {
    type Reader: Read + Seek;
    type Writer: Write;

    fn path(&self) -> &Path;
    fn open_read(&self) -> io::Result<Self::Reader>;
    /// A fresh, empty copy to write into. Failing here is a write-open failure.
    fn open_write(&self) -> io::Result<Self::Writer>;
    /// Publish a fully written copy at `path()`.
    fn commit(&self, writer: Self::Writer) -> io::Result<()>;
}

struct DiskTarget<'a>(&'a Path);

impl Target for DiskTarget<'_> {
    type Reader = File;
    type Writer = Staged;

    fn path(&self) -> &Path {
        self.0
    }

    fn open_read(&self) -> io::Result<File> {
        open_shared_read(self.0)
    }

    fn open_write(&self) -> io::Result<Staged> {
        Staged::create(self.0)
    }

    fn commit(&self, writer: Staged) -> io::Result<()> {
        writer.publish()
    }
}

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Staging file `<target>.<pid>-<seq>.tmp` in the target's directory. Removed
/// on drop unless it was renamed into place.
struct Staged {
    file: Option<File>,
    tmp: PathBuf,
    dest: PathBuf,
}

impl Staged {
    fn create(dest: &Path) -> io::Result<Self> {
        let mut name = dest.file_name().unwrap_or_default().to_os_string();
        name.push(format!(
            ".{}-{}.tmp",
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let tmp = dest.with_file_name(name);
        let file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        Ok(Self {
            file: Some(file),
            tmp,
            dest: dest.to_path_buf(),
        })
    }

    fn publish(mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        fs::rename(&self.tmp, &self.dest)
    }
}

impl Write for Staged {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "staging file closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        self.file.take();
        // Already gone after a successful rename.
        let _ = fs::remove_file(&self.tmp);
    }
}

/// Read-only, and on Windows shared so that other processes can still read or
/// replace the file, but not write into it while we hold it.
fn open_shared_read(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        opts.share_mode(win::FILE_SHARE_READ | win::FILE_SHARE_DELETE);
    }
    opts.open(path)
}

/// Make sure `path` holds exactly `contents` and return it open for reading.
///
/// Runs `policy.max_attempts()` rounds at most. Each round reads the file
/// back; a match ends the loop and hands the open file to the caller. A miss
/// (or a file that cannot be opened or read) triggers a rewrite. Every other
/// handle is closed before the next round.
pub fn safe_write_file(
    path: &Path,
    contents: &[u8],
    policy: &RetryPolicy,
) -> Result<Materialized, MaterializeError> {
    converge(&DiskTarget(path), contents, policy)
}

pub(crate) fn converge<T: Target>(
    target: &T,
    contents: &[u8],
    policy: &RetryPolicy,
) -> Result<Materialized<T::Reader>, MaterializeError> {
    let last = policy.last_round();
    // Last failure to open the file, and last failure to read an open one.
    let mut open_err: Option<Arc<io::Error>> = None;
    let mut read_err: Option<Arc<io::Error>> = None;
    let mut write_err: Option<Arc<io::Error>> = None;
    let mut writes = 0u32;

    for round in 0..=last {
        match target.open_read() {
            Ok(mut file) => {
                open_err = None;
                match same_contents(&mut file, contents) {
                    Ok(true) => {
                        utils::log_debug(&format!(
                            "verified {} after {} round(s), {} write(s)",
                            target.path().display(),
                            round + 1,
                            writes
                        ));
                        return Ok(Materialized {
                            file,
                            attempts: round + 1,
                            writes,
                        });
                    }
                    Ok(false) => read_err = None,
                    Err(e) => read_err = Some(Arc::new(e)),
                }
                if round == last {
                    return Err(MaterializeError::ContentMismatchExhausted {
                        path: target.path().to_path_buf(),
                        attempts: round + 1,
                        read: read_err,
                        write: write_err,
                    });
                }
                utils::log_debug(&format!(
                    "{} differs from image, rewriting (round {})",
                    target.path().display(),
                    round + 1
                ));
            }
            Err(e) => open_err = Some(Arc::new(e)),
        }

        match target.open_write() {
            Ok(mut out) => {
                writes += 1;
                let written = out.write_all(contents);
                write_err = written.and_then(|()| target.commit(out)).err().map(Arc::new);
            }
            Err(e) => {
                let e = Arc::new(e);
                if round == last {
                    return Err(MaterializeError::WriteOpenFailed {
                        path: target.path().to_path_buf(),
                        attempts: round + 1,
                        read: open_err.or(read_err),
                        write: e,
                    });
                }
                write_err = Some(e);
            }
        }

        if round + 1 < last {
            thread::sleep(policy.delay);
        }
    }

    // Any round that opened the file returns above, so the final round failed
    // to open it.
    let path = target.path().to_path_buf();
    let attempts = policy.max_attempts();
    Err(match open_err {
        Some(read) => MaterializeError::ReadOpenFailed {
            path,
            attempts,
            read,
            write: write_err,
        },
        None => MaterializeError::ContentMismatchExhausted {
            path,
            attempts,
            read: read_err,
            write: write_err,
        },
    })
}

/// Whole-file comparison. A short or long file is a mismatch. Leaves the
/// reader back at the start.
fn same_contents<R: Read + Seek>(file: &mut R, contents: &[u8]) -> io::Result<bool> {
    let mut on_disk = Vec::with_capacity(contents.len());
    file.read_to_end(&mut on_disk)?;
    file.rewind()?;
    Ok(on_disk == contents)
}

/// Create or truncate `dst` and stream `data` into it.
pub fn copy_file<R: Read>(dst: &Path, data: &mut R) -> io::Result<()> {
    let mut destination = File::create(dst)?;
    io::copy(data, &mut destination)?;
    destination.flush()
}

/// Like [`copy_file`] but panics on failure. Returns `dst`.
pub fn must_copy_file<R: Read>(dst: &Path, data: &mut R) -> PathBuf {
    if let Err(e) = copy_file(dst, data) {
        panic!("copy to {} failed: {}", dst.display(), e);
    }
    dst.to_path_buf()
}

/// Open an existing file so that it is removed once the returned handle (and
/// any other handle) is closed.
pub fn open_with_delete(path: &Path) -> io::Result<File> {
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        OpenOptions::new()
            .access_mode(win::GENERIC_READ | win::GENERIC_WRITE | win::DELETE)
            .share_mode(win::FILE_SHARE_READ | win::FILE_SHARE_DELETE)
            .custom_flags(win::FILE_FLAG_DELETE_ON_CLOSE)
            .open(path)
    }
    #[cfg(not(windows))]
    {
        // The inode outlives the directory entry until the last close.
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        fs::remove_file(path)?;
        Ok(file)
    }
}

/// Like [`open_with_delete`] but panics on failure.
pub fn must_open_with_delete(path: &Path) -> File {
    match open_with_delete(path) {
        Ok(file) => file,
        Err(e) => panic!("open {} for delete failed: {}", path.display(), e),
    }
}
