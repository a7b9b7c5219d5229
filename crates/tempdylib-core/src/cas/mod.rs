//! Content addressing and integrity checks for library images.

mod address;
mod integrity;

pub use address::{
    is_valid_logical_name, target_file_name, target_path, ContentKey, CONTENT_KEY_LEN,
};
pub use integrity::{compute_integrity, verify_integrity, HashAlgorithm, IntegrityHash};
