use std::fmt::Display;
use std::path::{Component, Path, PathBuf};

#[allow(unused_imports)]
use log::{debug, error};

pub trait ResultExt {
    // Log an error if it occurs, prefixed with s, otherwise return nothing.
    fn or_log_error(&self, s: &str);
}

impl<T, E> ResultExt for Result<T, E>
where
    E: Display,
{
    fn or_log_error(&self, s: &str) {
        if let Err(e) = self {
            error!("{} - {}", s, e);
        }
    }
}

// Lexical equivalent of filepath.Rel: express `target` relative to `base`.
// Both paths must be absolute; no filesystem access happens, so this also
// works for paths that only exist on a virtual filesystem.
pub fn relative_path(base: &Path, target: &Path) -> anyhow::Result<PathBuf> {
    anyhow::ensure!(
        base.is_absolute() && target.is_absolute(),
        "cannot relativize {target:?} against {base:?}: both must be absolute"
    );
    let base: Vec<Component> = base.components().collect();
    let target: Vec<Component> = target.components().collect();
    let common = base
        .iter()
        .zip(target.iter())
        .take_while(|(b, t)| b == t)
        .count();
    let mut rel = PathBuf::new();
    for _ in common..base.len() {
        rel.push("..");
    }
    for component in &target[common..] {
        rel.push(component);
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    Ok(rel)
}
