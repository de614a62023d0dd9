//! Filesystem collaborator scoped to a single project root.
//!
//! The engine never touches `std::fs` directly; it goes through
//! [`Workspace`]. Both implementations refuse any path that
//! [`normalize_rel_path`] rejects with `io::ErrorKind::InvalidInput`, so a
//! hand-built directive or a tampered state file cannot reach outside the
//! root. [`FsWorkspace`] is the on-disk implementation, [`MemoryWorkspace`]
//! an in-memory one for dry runs and tests.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tracing::{debug, trace};

use crate::infra::{
    cache::{Clock, FreshCache, SystemClock},
    io::write_atomic,
    paths::{STATE_DIR, normalize_rel_path},
};

/// Storage operations the engine needs.
///
/// `read_file` maps "does not exist" to `Ok(None)`; every other failure is
/// an error. `delete` reports whether anything was removed.
pub trait Workspace {
    fn read_file(&self, path: &str) -> io::Result<Option<String>>;

    fn write_file(&mut self, path: &str, contents: &str) -> io::Result<()>;

    fn delete(&mut self, path: &str) -> io::Result<bool>;

    fn create_dir_all(&mut self, path: &str) -> io::Result<()>;

    /// All files under the root, sorted, `/`-separated.
    fn list_files(&mut self) -> io::Result<Vec<String>>;

    /// Remove `dir` and then its ancestors while they are empty.
    fn prune_empty_dirs(&mut self, _dir: &str) -> io::Result<()> {
        Ok(())
    }
}

/// Validated form of `path`, or `InvalidInput`.
fn checked(path: &str) -> io::Result<String> {
    normalize_rel_path(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Parent directory of a normalized relative path, if any.
pub fn parent_dir(path: &str) -> Option<&str> {
    path.rfind('/').map(|i| &path[..i])
}

/// On-disk workspace rooted at a directory.
pub struct FsWorkspace {
    root: PathBuf,
    ignore_patterns: GlobSet,
    listing: FreshCache<Vec<String>>,
}

impl FsWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore_patterns: GlobSet::empty(),
            listing: FreshCache::new(Duration::from_secs(2), Arc::new(SystemClock::new())),
        }
    }

    /// Extra glob patterns excluded from [`Workspace::list_files`].
    pub fn with_ignore_patterns(mut self, patterns: &[String]) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        self.ignore_patterns = builder.build()?;
        Ok(self)
    }

    /// Freshness window and clock for the cached file listing.
    pub fn with_listing_cache(mut self, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        self.listing = FreshCache::new(ttl, clock);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of `rel`; paths that could escape the root are
    /// refused before any filesystem call.
    fn abs(&self, rel: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(checked(rel)?))
    }
}

fn walk(root: &Path, ignore_patterns: &GlobSet) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .filter_entry(|e| {
            let name = e.file_name();
            name != STATE_DIR && name != ".git"
        })
        .build();

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        if ignore_patterns.is_match(rel) {
            trace!(path = %rel.display(), "ignored by pattern");
            continue;
        }
        // Non-UTF-8 names cannot round-trip through directives
        let Some(rel) = rel.to_str() else {
            continue;
        };
        out.push(rel.replace(std::path::MAIN_SEPARATOR, "/"));
    }

    out.sort();
    Ok(out)
}

impl Workspace for FsWorkspace {
    fn read_file(&self, path: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.abs(path)?) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_file(&mut self, path: &str, contents: &str) -> io::Result<()> {
        debug!(path, bytes = contents.len(), "write");
        let abs = self.abs(path)?;
        write_atomic(&abs, contents.as_bytes()).map_err(io::Error::other)?;
        self.listing.invalidate();
        Ok(())
    }

    fn delete(&mut self, path: &str) -> io::Result<bool> {
        debug!(path, "delete");
        match fs::remove_file(self.abs(path)?) {
            Ok(()) => {
                self.listing.invalidate();
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create_dir_all(&mut self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.abs(path)?)
    }

    fn list_files(&mut self) -> io::Result<Vec<String>> {
        let (root, patterns) = (&self.root, &self.ignore_patterns);
        self.listing
            .get_or_try_insert_with(|| walk(root, patterns))
    }

    fn prune_empty_dirs(&mut self, dir: &str) -> io::Result<()> {
        let mut current = Some(checked(dir)?);
        while let Some(rel) = current {
            match fs::remove_dir(self.root.join(&rel)) {
                Ok(()) => debug!(dir = %rel, "pruned empty dir"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                // Not empty (or not ours to remove): stop climbing
                Err(_) => break,
            }
            current = parent_dir(&rel).map(str::to_string);
        }
        Ok(())
    }
}

/// In-memory workspace. Directories are implicit.
#[derive(Debug, Default, Clone)]
pub struct MemoryWorkspace {
    files: BTreeMap<String, String>,
    /// Paths whose writes and deletes fail, for exercising error paths
    failing: Vec<String>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with `(path, contents)` pairs.
    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            failing: Vec::new(),
        }
    }

    /// Make writes and deletes of `path` fail with `PermissionDenied`.
    pub fn fail_writes_to(&mut self, path: &str) {
        self.failing.push(path.to_string());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn check_writable(&self, path: &str) -> io::Result<()> {
        checked(path)?;
        if self.failing.iter().any(|p| p == path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("write denied: {path}"),
            ));
        }
        Ok(())
    }
}

impl Workspace for MemoryWorkspace {
    fn read_file(&self, path: &str) -> io::Result<Option<String>> {
        checked(path)?;
        Ok(self.files.get(path).cloned())
    }

    fn write_file(&mut self, path: &str, contents: &str) -> io::Result<()> {
        self.check_writable(path)?;
        self.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn delete(&mut self, path: &str) -> io::Result<bool> {
        self.check_writable(path)?;
        Ok(self.files.remove(path).is_some())
    }

    fn create_dir_all(&mut self, path: &str) -> io::Result<()> {
        checked(path).map(|_| ())
    }

    fn list_files(&mut self) -> io::Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }
}
