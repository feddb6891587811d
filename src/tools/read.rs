use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::min;
use std::fs;
use std::path::{Path, PathBuf};

use crate::tools::TypedTool;
use crate::tools::security::resolve_within_root;

const DEFAULT_LINE_LIMIT: usize = 400;
const DEFAULT_BUDGET_CHARS: usize = 6_000;

#[derive(Debug, Serialize)]
pub struct FsReadResult {
    pub path: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub total_lines: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_start_line: Option<usize>,
}

pub fn fs_read(
    root: &Path,
    path: &str,
    start_line: Option<usize>,
    limit: Option<usize>,
) -> Result<FsReadResult> {
    let p = resolve_within_root(root, path)?;
    let meta = fs::metadata(&p).with_context(|| format!("metadata {}", p.display()))?;
    if !meta.is_file() {
        bail!("not a file: {path}");
    }
    let s = fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;

    let lines: Vec<&str> = s.lines().collect();
    let total_lines = lines.len();
    let start_line = start_line.unwrap_or(0).min(total_lines);
    let end_line = min(
        start_line.saturating_add(limit.unwrap_or(DEFAULT_LINE_LIMIT)),
        total_lines,
    );

    let mut content = lines[start_line..end_line].join("\n");
    let mut truncated = end_line < total_lines;
    let mut shown_end = end_line;
    if content.len() > DEFAULT_BUDGET_CHARS {
        let mut cut = DEFAULT_BUDGET_CHARS;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
        // The last, partially shown line is served again on the next page,
        // unless it is the only line: then its tail is dropped.
        shown_end = (start_line + content.matches('\n').count()).max(start_line + 1);
        content.push_str("\n[[TRUNCATED BY BUDGET]]");
        truncated = true;
    }

    Ok(FsReadResult {
        path: path.to_string(),
        content,
        start_line,
        end_line: shown_end,
        total_lines,
        truncated,
        next_start_line: truncated.then_some(shown_end),
    })
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FsReadArgs {
    /// File to read, relative to the project root.
    pub path: String,
    /// Zero-based line to start from.
    #[serde(default)]
    pub start_line: Option<usize>,
    /// Maximum number of lines to return (default 400).
    #[serde(default)]
    pub limit: Option<usize>,
}

pub struct FsRead {
    pub root: PathBuf,
}

#[async_trait]
impl TypedTool for FsRead {
    type Args = FsReadArgs;

    fn name(&self) -> &str {
        "fs_read"
    }

    fn description(&self) -> &str {
        "Reads a text file inside the project. You can specify a starting line and a maximum number of lines; long results are truncated and report `next_start_line` for paging. Do not use this for binary files."
    }

    async fn call(&self, args: FsReadArgs) -> Result<String> {
        let res = fs_read(&self.root, &args.path, args.start_line, args.limit)?;
        Ok(serde_json::to_string(&res)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_a_window_of_lines() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), "l0\nl1\nl2\nl3\n").unwrap();
        let res = fs_read(dir.path(), "f.txt", Some(1), Some(2)).unwrap();
        assert_eq!(res.content, "l1\nl2");
        assert_eq!(res.total_lines, 4);
        assert!(res.truncated);
        assert_eq!(res.next_start_line, Some(3));
    }

    #[test]
    fn whole_small_file_is_not_truncated() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), "only\n").unwrap();
        let res = fs_read(dir.path(), "f.txt", None, None).unwrap();
        assert_eq!(res.content, "only");
        assert!(!res.truncated);
        assert_eq!(res.next_start_line, None);
    }

    #[test]
    fn large_content_is_cut_to_budget() {
        let dir = tempdir().unwrap();
        let line = "x".repeat(100);
        let body = vec![line.as_str(); 200].join("\n");
        fs::write(dir.path().join("big.txt"), body).unwrap();
        let res = fs_read(dir.path(), "big.txt", None, None).unwrap();
        assert!(res.truncated);
        assert!(res.content.ends_with("[[TRUNCATED BY BUDGET]]"));
        assert!(res.next_start_line.unwrap() < 200);
    }

    #[test]
    fn oversized_single_line_still_advances() {
        let dir = tempdir().unwrap();
        let body = format!("{}\nnext\n", "y".repeat(DEFAULT_BUDGET_CHARS * 2));
        fs::write(dir.path().join("wide.txt"), body).unwrap();
        let res = fs_read(dir.path(), "wide.txt", Some(0), None).unwrap();
        assert!(res.truncated);
        assert_eq!(res.end_line, 1);
        assert_eq!(res.next_start_line, Some(1));
        let next = fs_read(dir.path(), "wide.txt", res.next_start_line, None).unwrap();
        assert_eq!(next.content, "next");
        assert!(!next.truncated);
    }

    #[test]
    fn directories_are_rejected() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let err = fs_read(dir.path(), "sub", None, None).unwrap_err();
        assert!(err.to_string().contains("not a file"));
    }
}
