//! Content addressing for library images.
//!
//! A key is the SHA-256 of the whole image in unpadded RFC 4648 base32, so it
//! only uses `A-Z2-7` and survives case-insensitive file systems.

use std::fmt;
use std::path::{Path, PathBuf};

use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};

/// Length of a rendered key: 256 bits in 5-bit symbols, rounded up.
pub const CONTENT_KEY_LEN: usize = 52;

/// Digest-derived name for an image. Equal bytes always give equal keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn of(image: &[u8]) -> Self {
        let digest = Sha256::digest(image);
        ContentKey(BASE32_NOPAD.encode(&digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical name must stay a single path component: non-empty, no
/// separators or NUL, and not `.` or `..`.
pub fn is_valid_logical_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// `<key>-<logical name>`
pub fn target_file_name(key: &ContentKey, logical_name: &str) -> String {
    format!("{}-{}", key, logical_name)
}

/// Where `image` lives on disk under `dir`. Deterministic in (image, name).
pub fn target_path(dir: &Path, image: &[u8], logical_name: &str) -> PathBuf {
    dir.join(target_file_name(&ContentKey::of(image), logical_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shape() {
        let key = ContentKey::of(b"test content");
        assert_eq!(key.as_str().len(), CONTENT_KEY_LEN);
        assert!(key
            .as_str()
            .chars()
            .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
        assert!(!key.as_str().contains('='));
    }

    #[test]
    fn test_empty_image_known_digest() {
        // sha256("") = e3b0c442...b855
        let key = ContentKey::of(b"");
        assert_eq!(
            key.as_str(),
            "4OYMIQUY7QOBJGX36TEJS35ZEQT24QPEMSNZGTFESWMRW6CSXBKQ"
        );
    }

    #[test]
    fn test_same_bytes_same_key() {
        let a = ContentKey::of(&[1, 2, 3, 4]);
        let b = ContentKey::of(&vec![1u8, 2, 3, 4]);
        assert_eq!(a, b);
        assert_ne!(a, ContentKey::of(&[1, 2, 3, 5]));
    }

    #[test]
    fn test_target_path_layout() {
        let image = b"0123456789";
        let dir = Path::new("/tmp/libs");
        let path = target_path(dir, image, "x.bin");
        let expected = format!("{}-x.bin", ContentKey::of(image));
        assert_eq!(path, dir.join(expected));
        assert_eq!(path, target_path(dir, image, "x.bin"));
    }

    #[test]
    fn test_logical_name_validation() {
        assert!(is_valid_logical_name("libfoo.so.1"));
        assert!(is_valid_logical_name("x..y"));
        assert!(!is_valid_logical_name(""));
        assert!(!is_valid_logical_name(".."));
        assert!(!is_valid_logical_name("../x"));
        assert!(!is_valid_logical_name("a/b"));
        assert!(!is_valid_logical_name("a\\b"));
        assert!(!is_valid_logical_name("a\0b"));
    }

    #[test]
    fn test_name_changes_path_not_key() {
        let dir = Path::new("/tmp");
        assert_ne!(target_path(dir, b"abc", "a.so"), target_path(dir, b"abc", "b.so"));
    }
}
