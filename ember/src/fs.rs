//! Filesystem boundary.

use alloc::vec::Vec;

/// Whole-file reads by name.
///
/// An empty result means the file does not exist or has no content; the
/// filesystem makes no other promises here.
pub trait FileSource {
    /// Read the complete content of `name`.
    fn read_file(&self, name: &str) -> Vec<u8>;
}
