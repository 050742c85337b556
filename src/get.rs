//! Snippet retrieval by path.
//!
//! Reads a memory file (or a line window of it) straight from the
//! workspace, so callers can expand a search hit to its surrounding
//! context. Only `MEMORY.md` and `.md` files under `memory/` are
//! readable; anything else is rejected before the filesystem is touched.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Result};
use serde::Serialize;

/// A line window of a memory file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSlice {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub total_lines: usize,
    pub text: String,
}

/// Resolve `rel_path` under `workspace`, rejecting paths outside the
/// memory area.
fn resolve_memory_path(workspace: &Path, rel_path: &str) -> Result<PathBuf> {
    let rel = rel_path.trim().trim_start_matches("./");
    if rel.is_empty() {
        bail!("path is required");
    }

    let candidate = Path::new(rel);
    if candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("path must be workspace-relative without '..': {}", rel_path);
    }

    let allowed = rel == "MEMORY.md" || (rel.starts_with("memory/") && rel.ends_with(".md"));
    if !allowed {
        bail!("path is not a memory file: {}", rel_path);
    }

    Ok(workspace.join(candidate))
}

/// Read `lines` lines of `rel_path` starting at 1-based `from_line`.
///
/// `from_line` defaults to 1 and `lines` to the rest of the file. A
/// missing file is `Ok(None)`. A window past the end yields an empty
/// slice.
pub fn read_file(
    workspace: &Path,
    rel_path: &str,
    from_line: Option<usize>,
    lines: Option<usize>,
) -> Result<Option<FileSlice>> {
    let full = resolve_memory_path(workspace, rel_path)?;
    let content = match std::fs::read_to_string(&full) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let all: Vec<&str> = content.lines().collect();
    let total_lines = all.len();
    let start = from_line.unwrap_or(1).max(1);
    let begin = (start - 1).min(total_lines);
    let end = match lines {
        Some(n) => begin.saturating_add(n).min(total_lines),
        None => total_lines,
    };

    Ok(Some(FileSlice {
        path: rel_path.trim().trim_start_matches("./").to_string(),
        start_line: start,
        end_line: if end > begin { end } else { start.saturating_sub(1) },
        total_lines,
        text: all[begin..end].join("\n"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("memory")).unwrap();
        fs::write(tmp.path().join("MEMORY.md"), "a\nb\nc\nd\n").unwrap();
        fs::write(tmp.path().join("memory/notes.md"), "one\ntwo\n").unwrap();
        fs::write(tmp.path().join("secret.txt"), "nope").unwrap();
        tmp
    }

    #[test]
    fn test_read_window() {
        let tmp = workspace();
        let slice = read_file(tmp.path(), "MEMORY.md", Some(2), Some(2))
            .unwrap()
            .unwrap();
        assert_eq!(slice.text, "b\nc");
        assert_eq!(slice.start_line, 2);
        assert_eq!(slice.end_line, 3);
        assert_eq!(slice.total_lines, 4);
    }

    #[test]
    fn test_read_whole_file() {
        let tmp = workspace();
        let slice = read_file(tmp.path(), "memory/notes.md", None, None)
            .unwrap()
            .unwrap();
        assert_eq!(slice.text, "one\ntwo");
        assert_eq!(slice.end_line, 2);
    }

    #[test]
    fn test_window_past_end_is_empty() {
        let tmp = workspace();
        let slice = read_file(tmp.path(), "memory/notes.md", Some(10), Some(5))
            .unwrap()
            .unwrap();
        assert!(slice.text.is_empty());
    }

    #[test]
    fn test_missing_file_is_none() {
        let tmp = workspace();
        assert!(read_file(tmp.path(), "memory/absent.md", None, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rejects_paths_outside_memory() {
        let tmp = workspace();
        assert!(read_file(tmp.path(), "secret.txt", None, None).is_err());
        assert!(read_file(tmp.path(), "memory/../secret.txt", None, None).is_err());
        assert!(read_file(tmp.path(), "/etc/passwd", None, None).is_err());
        assert!(read_file(tmp.path(), "memory/data.json", None, None).is_err());
    }
}
