//! Concurrency-safe target registry with an optional on-disk mirror.
//!
//! Targets are identified by their literal `name=url` string. The set lives
//! behind a single read-write lock; after every mutation the full set is
//! rewritten to the cache file (if configured) outside of the lock, via a
//! temporary file renamed over the cache so a crash never leaves it torn.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A scrape target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Name used as the origin label value.
    pub name: String,
    /// URL scraped for metrics.
    pub url: String,
}

/// Invalid target literal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("target '{0}' has an empty name")]
    EmptyName(String),
    #[error("target '{0}' has an empty url")]
    EmptyUrl(String),
}

impl Target {
    /// Parse a target literal.
    ///
    /// The literal is split once on the first `=` so URLs may contain `=`.
    /// Without `=`, the literal is both name and URL.
    pub fn parse(literal: &str) -> Result<Self, TargetError> {
        let (name, url) = match literal.split_once('=') {
            Some((name, url)) => (name.trim(), url.trim()),
            None => (literal.trim(), literal.trim()),
        };

        if url.is_empty() {
            return Err(TargetError::EmptyUrl(literal.to_string()));
        }
        if name.is_empty() {
            return Err(TargetError::EmptyName(literal.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.url)
    }
}

/// What to do when the cache file cannot be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistPolicy {
    /// Surface the failure; the gateway shuts down.
    #[default]
    Fatal,
    /// Log a warning and keep serving from memory.
    Warn,
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidTarget(#[from] TargetError),

    #[error("failed to write target cache {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read target cache {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The set of scrape targets.
pub struct TargetRegistry {
    targets: RwLock<BTreeSet<String>>,
    cache_path: Option<PathBuf>,
    policy: PersistPolicy,
}

/// Shareable registry handle.
pub type SharedRegistry = Arc<TargetRegistry>;

impl TargetRegistry {
    /// Create an empty registry, optionally mirrored to `cache_path`.
    pub fn new(cache_path: Option<PathBuf>, policy: PersistPolicy) -> Self {
        Self {
            targets: RwLock::new(BTreeSet::new()),
            cache_path,
            policy,
        }
    }

    /// Create an empty registry without persistence.
    pub fn in_memory() -> Self {
        Self::new(None, PersistPolicy::default())
    }

    /// Build the startup registry: recover the cache, then add the initial targets.
    ///
    /// A cache that exists but cannot be read is logged and skipped.
    pub fn open<I, S>(
        initial: I,
        cache_path: Option<PathBuf>,
        policy: PersistPolicy,
    ) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::new(cache_path, policy);

        if let Some(path) = registry.cache_path.clone() {
            match registry.load_from_file(&path) {
                Ok(count) => {
                    if count > 0 {
                        info!(path = %path.display(), count, "Recovered targets from cache");
                    }
                }
                Err(RegistryError::Load { path, source }) => {
                    warn!(path = %path.display(), error = %source, "Failed to load target cache");
                }
                Err(e) => return Err(e),
            }
        }

        for literal in initial {
            registry.add(literal.as_ref())?;
        }

        Ok(registry)
    }

    /// Add a target literal.
    ///
    /// Whitespace is trimmed and empty input ignored. Adding an existing
    /// literal is a no-op for the set. Returns whether the set grew.
    pub fn add(&self, literal: &str) -> Result<bool, RegistryError> {
        let literal = literal.trim();
        if literal.is_empty() {
            return Ok(false);
        }
        Target::parse(literal)?;

        let inserted = self.targets.write().insert(literal.to_string());
        if inserted {
            debug!(literal = %literal, "Target added");
        } else {
            debug!(literal = %literal, "Target already registered");
        }

        self.persist()?;
        Ok(inserted)
    }

    /// Remove a target literal. Removing an absent literal is a no-op.
    ///
    /// Returns whether the literal was present.
    pub fn remove(&self, literal: &str) -> Result<bool, RegistryError> {
        let literal = literal.trim();

        let removed = self.targets.write().remove(literal);
        if removed {
            debug!(literal = %literal, "Target removed");
        } else {
            info!(literal = %literal, "Target not registered, nothing to remove");
        }

        self.persist()?;
        Ok(removed)
    }

    /// Point-in-time copy of the registered literals.
    ///
    /// The copy is sorted, but positions shift whenever the set changes.
    pub fn snapshot(&self) -> Vec<String> {
        self.targets.read().iter().cloned().collect()
    }

    /// Whether a literal is registered.
    pub fn contains(&self, literal: &str) -> bool {
        self.targets.read().contains(literal.trim())
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    /// The configured cache file.
    pub fn cache_path(&self) -> Option<&Path> {
        self.cache_path.as_deref()
    }

    /// Fold newline-delimited literals from `path` into the registry.
    ///
    /// A missing file counts as empty. Invalid lines are logged and skipped.
    /// Returns the number of literals added.
    pub fn load_from_file(&self, path: &Path) -> Result<usize, RegistryError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No target cache file yet");
                return Ok(0);
            }
            Err(source) => {
                return Err(RegistryError::Load {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let mut added = 0;
        for line in content.lines() {
            match self.add(line) {
                Ok(true) => {
                    info!(literal = %line.trim(), "Recovered target from cache file");
                    added += 1;
                }
                Ok(false) => {}
                Err(RegistryError::InvalidTarget(e)) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid cached target");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(added)
    }

    /// Rewrite the cache file with the current set.
    fn persist(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.cache_path else {
            return Ok(());
        };

        let lines = self.snapshot();
        match write_lines(path, &lines) {
            Ok(()) => {
                debug!(path = %path.display(), targets = lines.len(), "Target cache written");
                Ok(())
            }
            Err(source) => match self.policy {
                PersistPolicy::Fatal => Err(RegistryError::Persist {
                    path: path.clone(),
                    source,
                }),
                PersistPolicy::Warn => {
                    warn!(
                        path = %path.display(),
                        error = %source,
                        "Failed to write target cache, continuing in memory"
                    );
                    Ok(())
                }
            },
        }
    }
}

/// Atomically replace `path` with one line per entry.
fn write_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut file = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(file.as_file_mut());
        for line in lines {
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
    }
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse_named() {
        let target = Target::parse("svc=http://h:1/metrics").unwrap();
        assert_eq!(target.name, "svc");
        assert_eq!(target.url, "http://h:1/metrics");
        assert_eq!(target.to_string(), "svc=http://h:1/metrics");
    }

    #[test]
    fn test_target_parse_keeps_equals_in_url() {
        let target = Target::parse("app=http://h/metrics?a=b&c=d").unwrap();
        assert_eq!(target.name, "app");
        assert_eq!(target.url, "http://h/metrics?a=b&c=d");
    }

    #[test]
    fn test_target_parse_bare_url() {
        let target = Target::parse("http://h:9100/metrics").unwrap();
        assert_eq!(target.name, "http://h:9100/metrics");
        assert_eq!(target.url, "http://h:9100/metrics");
    }

    #[test]
    fn test_target_parse_invalid() {
        assert!(matches!(
            Target::parse("=http://h"),
            Err(TargetError::EmptyName(_))
        ));
        assert!(matches!(Target::parse("svc= "), Err(TargetError::EmptyUrl(_))));
        assert!(matches!(Target::parse("  "), Err(TargetError::EmptyUrl(_))));
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = TargetRegistry::in_memory();

        assert!(registry.add("a=http://x").unwrap());
        assert!(!registry.add("a=http://x").unwrap());
        assert!(!registry.add("  a=http://x \n").unwrap());

        assert_eq!(registry.snapshot(), vec!["a=http://x".to_string()]);
    }

    #[test]
    fn test_add_ignores_empty() {
        let registry = TargetRegistry::in_memory();
        assert!(!registry.add("").unwrap());
        assert!(!registry.add("   ").unwrap());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_rejects_invalid() {
        let registry = TargetRegistry::in_memory();
        assert!(matches!(
            registry.add("=http://x"),
            Err(RegistryError::InvalidTarget(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = TargetRegistry::in_memory();
        registry.add("a=http://x").unwrap();

        assert!(!registry.remove("b=http://y").unwrap());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(" a=http://x ").unwrap());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_decoupled() {
        let registry = TargetRegistry::in_memory();
        registry.add("b=http://b").unwrap();
        registry.add("a=http://a").unwrap();

        let snapshot = registry.snapshot();
        registry.add("c=http://c").unwrap();
        registry.remove("a=http://a").unwrap();

        assert_eq!(snapshot, vec!["a=http://a", "b=http://b"]);
        assert!(registry.contains("c=http://c"));
        assert!(!registry.contains("a=http://a"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("targets.cache");

        let registry = TargetRegistry::new(Some(cache.clone()), PersistPolicy::Fatal);
        registry.add("svc=http://h:1").unwrap();

        let content = std::fs::read_to_string(&cache).unwrap();
        assert_eq!(content, "svc=http://h:1\n");

        let restarted =
            TargetRegistry::open(Vec::<String>::new(), Some(cache), PersistPolicy::Fatal)
                .unwrap();
        assert_eq!(restarted.snapshot(), vec!["svc=http://h:1".to_string()]);
    }

    #[test]
    fn test_remove_rewrites_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("targets.cache");

        let registry = TargetRegistry::new(Some(cache.clone()), PersistPolicy::Fatal);
        registry.add("a=http://a").unwrap();
        registry.add("b=http://b").unwrap();
        registry.remove("a=http://a").unwrap();

        let content = std::fs::read_to_string(&cache).unwrap();
        assert_eq!(content, "b=http://b\n");
    }

    #[test]
    fn test_missing_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("does-not-exist");

        let registry = TargetRegistry::new(Some(cache.clone()), PersistPolicy::Fatal);
        assert_eq!(registry.load_from_file(&cache).unwrap(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_open_merges_cache_and_initial() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("targets.cache");
        std::fs::write(&cache, "cached=http://c\n\n  \n=broken\nboth=http://b\n").unwrap();

        let registry = TargetRegistry::open(
            ["both=http://b", "initial=http://i"],
            Some(cache.clone()),
            PersistPolicy::Fatal,
        )
        .unwrap();

        assert_eq!(
            registry.snapshot(),
            vec!["both=http://b", "cached=http://c", "initial=http://i"]
        );
        let content = std::fs::read_to_string(&cache).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_fatal_policy_surfaces_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("missing-dir").join("targets.cache");

        let registry = TargetRegistry::new(Some(cache), PersistPolicy::Fatal);
        let err = registry.add("a=http://a").unwrap_err();

        assert!(matches!(err, RegistryError::Persist { .. }));
        // The in-memory mutation has already happened
        assert!(registry.contains("a=http://a"));
    }

    #[test]
    fn test_warn_policy_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("missing-dir").join("targets.cache");

        let registry = TargetRegistry::new(Some(cache), PersistPolicy::Warn);
        assert!(registry.add("a=http://a").unwrap());
        assert!(registry.remove("a=http://a").unwrap());
    }

    #[test]
    fn test_concurrent_mutation() {
        let registry = Arc::new(TargetRegistry::in_memory());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        registry.add(&format!("t{}-{}=http://h/{}", i, j, j)).unwrap();
                        let _ = registry.snapshot();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 400);
    }
}
