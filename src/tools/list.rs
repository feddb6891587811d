use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::tools::TypedTool;
use crate::tools::security::resolve_within_root;

/// Lists files and directories within a specified path.
///
/// # Arguments
///
/// * `root` - The project root; results are relative to it.
/// * `path` - The directory to list, relative to `root` or absolute inside it.
/// * `max_depth` - The maximum depth to traverse. Defaults to 1.
/// * `pattern` - An optional glob pattern matched against the relative path or the file name.
pub fn fs_list(
    root: &Path,
    path: &str,
    max_depth: Option<usize>,
    pattern: Option<&str>,
) -> Result<Vec<String>> {
    let start = resolve_within_root(root, path)?;
    let canonical_root = root.canonicalize()?;
    let matcher = pattern
        .map(glob::Pattern::new)
        .transpose()
        .context("invalid glob pattern")?;
    let mut out = Vec::new();
    walk(
        &start,
        &canonical_root,
        max_depth.unwrap_or(1).max(1),
        1,
        matcher.as_ref(),
        &mut out,
    )?;
    out.sort();
    Ok(out)
}

fn walk(
    dir: &Path,
    root: &Path,
    max_depth: usize,
    depth: usize,
    matcher: Option<&glob::Pattern>,
    out: &mut Vec<String>,
) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let p = entry.path();
        let rel = p.strip_prefix(root).unwrap_or(&p).to_string_lossy().to_string();
        let name = entry.file_name().to_string_lossy().to_string();
        if matcher.is_none_or(|m| m.matches(&rel) || m.matches(&name)) {
            out.push(rel);
        }
        if depth < max_depth && entry.file_type()?.is_dir() {
            walk(&p, root, max_depth, depth + 1, matcher, out)?;
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FsListArgs {
    /// Directory to list, relative to the project root. Defaults to the root.
    #[serde(default)]
    pub path: Option<String>,
    /// How many directory levels to descend. Defaults to 1.
    #[serde(default)]
    pub max_depth: Option<usize>,
    /// Glob filter such as `*.rs` or `src/**/*.toml`.
    #[serde(default)]
    pub pattern: Option<String>,
}

pub struct FsList {
    pub root: PathBuf,
}

#[async_trait]
impl TypedTool for FsList {
    type Args = FsListArgs;

    fn name(&self) -> &str {
        "fs_list"
    }

    fn description(&self) -> &str {
        "Lists files and directories within a path of the project. You can limit the depth of recursion (default 1) and filter results by a glob pattern. Use it to explore the project structure before reading files."
    }

    async fn call(&self, args: FsListArgs) -> Result<String> {
        let entries = fs_list(
            &self.root,
            args.path.as_deref().unwrap_or("."),
            args.max_depth,
            args.pattern.as_deref(),
        )?;
        if entries.is_empty() {
            return Ok("(no entries)".into());
        }
        Ok(entries.join("\n"))
    }
}
