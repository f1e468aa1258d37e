//! Content fingerprints.
//!
//! Every cache key and every change-detection decision in kiln is built on a
//! [`ContentFingerprint`]: the SHA-256 digest of some bytes, hex encoded.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// SHA-256 hex digest of a byte sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, used in log lines and directory names.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which files of a source tree participate in its fingerprint.
#[derive(Debug, Clone)]
pub struct TreeFilter {
    /// File names always included regardless of extension (`Cargo.toml`, ...).
    pub descriptor_files: Vec<String>,
    /// Extensions (without the dot) of source files to include.
    pub extensions: Vec<String>,
    /// Directory names never descended into (build output, VCS metadata).
    pub skip_dirs: Vec<String>,
}

impl TreeFilter {
    fn accepts_file(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if self.descriptor_files.iter().any(|d| d == name) {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|x| x == ext))
    }

    fn skips_dir(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return true;
        };
        name.starts_with('.') || self.skip_dirs.iter().any(|d| d == name)
    }
}

impl Default for TreeFilter {
    fn default() -> Self {
        Self {
            descriptor_files: vec!["Cargo.toml".into()],
            extensions: vec!["rs".into(), "toml".into()],
            skip_dirs: vec!["target".into()],
        }
    }
}

pub struct ContentHasher;

impl ContentHasher {
    pub fn fingerprint_bytes(bytes: &[u8]) -> ContentFingerprint {
        ContentFingerprint(hex::encode(Sha256::digest(bytes)))
    }

    pub fn fingerprint_str(text: &str) -> ContentFingerprint {
        Self::fingerprint_bytes(text.as_bytes())
    }

    /// Fingerprint of an unordered set of strings. The items are sorted first
    /// so the result does not depend on iteration order.
    pub fn fingerprint_unordered<I, S>(items: I) -> ContentFingerprint
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut items: Vec<String> = items.into_iter().map(|s| s.as_ref().to_owned()).collect();
        items.sort();
        let mut hasher = Sha256::new();
        for item in &items {
            hasher.update(item.as_bytes());
            // separator so ["ab", "c"] and ["a", "bc"] differ
            hasher.update([0u8]);
        }
        ContentFingerprint(hex::encode(hasher.finalize()))
    }

    /// Fingerprint of a source tree.
    ///
    /// Files accepted by `filter` are visited in sorted relative-path order and
    /// both the relative path and the file bytes are digested, so renaming a
    /// file changes the fingerprint even when its content does not.
    ///
    /// This walks the filesystem synchronously; async callers should run it
    /// on a blocking thread.
    pub fn fingerprint_tree(
        root: &Path,
        filter: &TreeFilter,
    ) -> Result<ContentFingerprint, CacheError> {
        if !root.is_dir() {
            return Err(CacheError::TreeNotFound(root.to_path_buf()));
        }

        let mut files = Vec::new();
        collect_files(root, filter, &mut files)?;
        files.sort();

        let mut hasher = Sha256::new();
        for path in &files {
            let relative = path.strip_prefix(root).unwrap_or(path);
            let relative = relative.to_string_lossy().replace('\\', "/");
            let bytes = std::fs::read(path).map_err(|e| CacheError::Io {
                path: path.clone(),
                source: e,
            })?;
            hasher.update(relative.as_bytes());
            hasher.update([0u8]);
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }

        tracing::trace!(root = %root.display(), files = files.len(), "Fingerprinted source tree");
        Ok(ContentFingerprint(hex::encode(hasher.finalize())))
    }
}

fn collect_files(
    dir: &Path,
    filter: &TreeFilter,
    out: &mut Vec<PathBuf>,
) -> Result<(), CacheError> {
    let entries = std::fs::read_dir(dir).map_err(|e| CacheError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| CacheError::Io {
            path: path.clone(),
            source: e,
        })?;
        if file_type.is_dir() {
            if !filter.skips_dir(&path) {
                collect_files(&path, filter, out)?;
            }
        } else if file_type.is_file() && filter.accepts_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn identical_bytes_yield_identical_fingerprints() {
        let a = ContentHasher::fingerprint_str("echo hi");
        let b = ContentHasher::fingerprint_str("echo hi");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn single_byte_change_changes_fingerprint() {
        let a = ContentHasher::fingerprint_str("echo hi");
        let b = ContentHasher::fingerprint_str("echo ho");
        assert_ne!(a, b);
    }

    #[test]
    fn unordered_fingerprint_ignores_order() {
        let a = ContentHasher::fingerprint_unordered(["b", "a", "c"]);
        let b = ContentHasher::fingerprint_unordered(["c", "b", "a"]);
        assert_eq!(a, b);

        let split = ContentHasher::fingerprint_unordered(["ab", "c"]);
        let other = ContentHasher::fingerprint_unordered(["a", "bc"]);
        assert_ne!(split, other);
    }

    #[test]
    fn tree_fingerprint_is_stable_and_filtered() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Cargo.toml", "[package]\nname = \"demo\"\n");
        write(tmp.path(), "src/lib.rs", "pub fn demo() {}\n");
        let filter = TreeFilter::default();

        let first = ContentHasher::fingerprint_tree(tmp.path(), &filter).unwrap();

        // build output, hidden dirs and unknown extensions do not count
        write(tmp.path(), "target/release/libdemo.rlib", "binary");
        write(tmp.path(), ".git/HEAD", "ref: main");
        write(tmp.path(), "notes.txt", "scratch");
        let second = ContentHasher::fingerprint_tree(tmp.path(), &filter).unwrap();
        assert_eq!(first, second);

        write(tmp.path(), "src/lib.rs", "pub fn demo() { }\n");
        let third = ContentHasher::fingerprint_tree(tmp.path(), &filter).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn renaming_a_file_changes_tree_fingerprint() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Cargo.toml", "[package]");
        write(tmp.path(), "src/a.rs", "fn a() {}");
        let filter = TreeFilter::default();
        let before = ContentHasher::fingerprint_tree(tmp.path(), &filter).unwrap();

        std::fs::rename(tmp.path().join("src/a.rs"), tmp.path().join("src/b.rs")).unwrap();
        let after = ContentHasher::fingerprint_tree(tmp.path(), &filter).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn missing_tree_is_an_error() {
        let filter = TreeFilter::default();
        let err = ContentHasher::fingerprint_tree(Path::new("/does/not/exist"), &filter)
            .unwrap_err();
        assert!(matches!(err, CacheError::TreeNotFound(_)));
    }
}
