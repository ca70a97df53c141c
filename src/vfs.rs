//! Read-only virtual filesystems for the render pipeline. A build runs
//! against a [`FileSystem`] so a synthetic in-memory tree can be grafted over
//! the on-disk commit worktree without mutating it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use parking_lot::RwLock;
use path_absolutize::Absolutize as _;

/// The read surface the render engine needs. Deliberately no write methods:
/// layers are composed, never mutated through this trait.
pub trait FileSystem: Debug + Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn read_file(&self, path: &Path) -> anyhow::Result<Vec<u8>>;
    /// Canonical absolute form of a path, resolved lexically so that paths
    /// which only exist on a synthetic layer still canonicalize.
    fn cleaned_abs(&self, path: &Path) -> anyhow::Result<PathBuf>;
}

pub fn clean_abs(path: &Path) -> anyhow::Result<PathBuf> {
    Ok(path
        .absolutize()
        .with_context(|| format!("canonicalizing {path:?}"))?
        .into_owned())
}

/// The real filesystem.
#[derive(Debug, Clone, Default)]
pub struct DiskFs;

impl FileSystem for DiskFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_file(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("reading {path:?}"))
    }

    fn cleaned_abs(&self, path: &Path) -> anyhow::Result<PathBuf> {
        clean_abs(path)
    }
}

/// In-memory tree of files keyed by cleaned absolute path. This is the only
/// writable filesystem, and only through its concrete type; once stacked into
/// a [`LayeredFs`] it is read-only like everything else.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    files: Arc<RwLock<BTreeMap<PathBuf, Vec<u8>>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_file(&self, path: &Path, contents: impl Into<Vec<u8>>) -> anyhow::Result<()> {
        let path = clean_abs(path)?;
        self.files.write().insert(path, contents.into());
        Ok(())
    }
}

impl FileSystem for MemoryFs {
    fn exists(&self, path: &Path) -> bool {
        let Ok(path) = clean_abs(path) else {
            return false;
        };
        let files = self.files.read();
        // A path "exists" if it's a file or a prefix directory of one.
        files.contains_key(&path) || files.keys().any(|k| k.starts_with(&path))
    }

    fn read_file(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        let path = clean_abs(path)?;
        match self.files.read().get(&path) {
            Some(contents) => Ok(contents.clone()),
            None => bail!("file not found: {}", path.display()),
        }
    }

    fn cleaned_abs(&self, path: &Path) -> anyhow::Result<PathBuf> {
        clean_abs(path)
    }
}

/// Stack of filesystems consulted in order; the first layer where a path
/// exists answers the lookup.
#[derive(Debug, Clone)]
pub struct LayeredFs {
    layers: Vec<Arc<dyn FileSystem>>,
}

impl LayeredFs {
    pub fn new(layers: Vec<Arc<dyn FileSystem>>) -> Self {
        Self { layers }
    }
}

impl FileSystem for LayeredFs {
    fn exists(&self, path: &Path) -> bool {
        self.layers.iter().any(|fs| fs.exists(path))
    }

    fn read_file(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        for fs in &self.layers {
            if fs.exists(path) {
                return fs.read_file(path);
            }
        }
        bail!("file not found: {}", path.display())
    }

    fn cleaned_abs(&self, path: &Path) -> anyhow::Result<PathBuf> {
        for fs in &self.layers {
            if fs.exists(path) {
                return fs.cleaned_abs(path);
            }
        }
        bail!("file not found: {}", path.display())
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    #[googletest::test]
    fn test_memory_fs_roundtrip() {
        let fs = MemoryFs::new();
        fs.write_file(Path::new("/a/b/file.yaml"), "contents").unwrap();

        expect_that!(fs.exists(Path::new("/a/b/file.yaml")), eq(true));
        // Directory prefixes exist too.
        expect_that!(fs.exists(Path::new("/a/b")), eq(true));
        expect_that!(fs.exists(Path::new("/a/nope")), eq(false));
        expect_that!(
            fs.read_file(Path::new("/a/b/file.yaml")).unwrap(),
            eq(&b"contents".to_vec())
        );
        expect_that!(fs.read_file(Path::new("/a/nope")), err(anything()));
    }

    #[googletest::test]
    fn test_memory_fs_cleans_paths() {
        let fs = MemoryFs::new();
        fs.write_file(Path::new("/a/x/../b/file.yaml"), "contents").unwrap();
        expect_that!(fs.exists(Path::new("/a/b/file.yaml")), eq(true));
        expect_that!(
            fs.cleaned_abs(Path::new("/a/./b/../b/file.yaml")).unwrap(),
            eq(&PathBuf::from("/a/b/file.yaml"))
        );
    }

    #[googletest::test]
    fn test_layered_first_hit_wins() {
        let top = MemoryFs::new();
        top.write_file(Path::new("/dir/shared.yaml"), "top").unwrap();
        top.write_file(Path::new("/dir/only-top.yaml"), "top only").unwrap();
        let bottom = MemoryFs::new();
        bottom.write_file(Path::new("/dir/shared.yaml"), "bottom").unwrap();
        bottom.write_file(Path::new("/dir/only-bottom.yaml"), "bottom only").unwrap();

        let layered = LayeredFs::new(vec![Arc::new(top), Arc::new(bottom)]);
        expect_that!(
            layered.read_file(Path::new("/dir/shared.yaml")).unwrap(),
            eq(&b"top".to_vec())
        );
        expect_that!(
            layered.read_file(Path::new("/dir/only-bottom.yaml")).unwrap(),
            eq(&b"bottom only".to_vec())
        );
        expect_that!(layered.exists(Path::new("/dir/only-top.yaml")), eq(true));
        expect_that!(layered.read_file(Path::new("/dir/missing.yaml")), err(anything()));
    }
}
