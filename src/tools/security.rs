use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

/// Resolves `path` (absolute or relative to `root`) and rejects anything that
/// lands outside `root` once symlinks and `..` are resolved.
pub fn resolve_within_root(root: &Path, path: &str) -> Result<PathBuf> {
    let root = root
        .canonicalize()
        .with_context(|| format!("resolve project root {}", root.display()))?;
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let canonical = joined
        .canonicalize()
        .with_context(|| format!("resolve {path}"))?;
    if !canonical.starts_with(&root) {
        bail!("Access to files outside the project root is not allowed: {path}");
    }
    Ok(canonical)
}
