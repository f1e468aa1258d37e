use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::{ContentFingerprint, ContentHasher};

/// The three artifact kinds kiln caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Script,
    Library,
    DependencyGraph,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Script => "script",
            CacheKind::Library => "library",
            CacheKind::DependencyGraph => "deps",
        }
    }

    /// Subdirectory of the cache root reserved for this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheKind::Script => "scripts",
            CacheKind::Library => "libraries",
            CacheKind::DependencyGraph => "dependencies",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite cache key: `kind:name:primary:aux`.
///
/// `primary` fingerprints the identity content of the entity and `aux`
/// fingerprints its (sorted) dependency descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub name: String,
    pub primary: ContentFingerprint,
    pub aux: ContentFingerprint,
}

impl CacheKey {
    pub fn new(
        kind: CacheKind,
        name: impl Into<String>,
        primary: ContentFingerprint,
        aux: ContentFingerprint,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            primary,
            aux,
        }
    }

    /// Key of the cache slot for a named script compiled against `dependencies`.
    ///
    /// The script content is not part of the key. It is checked
    /// against the entry fingerprint on read, so an edited script lands in the
    /// same slot and evicts its stale predecessor.
    pub fn script<S: AsRef<str>>(name: &str, dependencies: &[S]) -> Self {
        Self::new(
            CacheKind::Script,
            name,
            ContentHasher::fingerprint_str(name),
            ContentHasher::fingerprint_unordered(dependencies.iter().map(AsRef::as_ref)),
        )
    }

    /// Key for a dependency graph over a set of library identities.
    pub fn dependency_graph<S: AsRef<str>>(identities: &[S]) -> Self {
        Self::new(
            CacheKind::DependencyGraph,
            "graph",
            ContentHasher::fingerprint_unordered(identities.iter().map(AsRef::as_ref)),
            ContentHasher::fingerprint_unordered(std::iter::empty::<&str>()),
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.kind, self.name, self.primary, self.aux)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_key_ignores_dependency_order() {
        let a = CacheKey::script("deploy", &["core", "utils"]);
        let b = CacheKey::script("deploy", &["utils", "core"]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn script_key_depends_on_name_and_dependencies() {
        let base = CacheKey::script("deploy", &["core"]);
        assert_ne!(base, CacheKey::script("build", &["core"]));
        assert_ne!(base, CacheKey::script("deploy", &["core", "extra"]));
    }

    #[test]
    fn display_is_colon_separated() {
        let key = CacheKey::script::<&str>("hello", &[]);
        let rendered = key.to_string();
        assert!(rendered.starts_with("script:hello:"));
        assert_eq!(rendered.split(':').count(), 4);
    }

    #[test]
    fn dependency_graph_key_is_order_independent() {
        let a = CacheKey::dependency_graph(&["a@1", "b@2"]);
        let b = CacheKey::dependency_graph(&["b@2", "a@1"]);
        assert_eq!(a, b);
        assert_eq!(a.kind, CacheKind::DependencyGraph);
    }
}
