//! Unified-diff parsing, rendering, and the additive per-file hunk merge
//! used by the batch coalescer.
//!
//! The overlap rule is conservative: same file, any hunk overlap is a
//! conflict. Non-overlapping hunks concatenate; adjacent hunks join.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A parsed hunk. `lines` keep their leading `' '`/`'+'`/`'-'` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: u64,
    pub old_lines: u64,
    pub new_start: u64,
    pub new_lines: u64,
    pub lines: Vec<String>,
}

impl Hunk {
    /// Inclusive range of base-file lines this hunk claims. Insertion-only
    /// hunks claim the anchor line so two insertions at the same point
    /// still conflict.
    fn old_range(&self) -> (u64, u64) {
        let len = self.old_lines.max(1);
        (self.old_start, self.old_start + len - 1)
    }
}

/// All hunks for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// Path on the `---` side (`/dev/null` for created files).
    pub old_path: String,
    /// Path on the `+++` side; the file's identity for overlap checks.
    pub path: String,
    pub hunks: Vec<Hunk>,
}

/// Errors from parsing a unified diff.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("malformed diff at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("diff-header marker embedded in content at line {line}")]
    EmbeddedHeader { line: usize },

    #[error("hunk at line {line} declares {declared} {side} lines but carries {actual}")]
    CountMismatch {
        line: usize,
        side: &'static str,
        declared: u64,
        actual: u64,
    },
}

/// A merge conflict between two diffs touching the same file region.
#[derive(Debug, Clone, thiserror::Error)]
#[error("conflicting hunks in {path}: base lines {a_start}-{a_end} and {b_start}-{b_end} overlap")]
pub struct MergeConflict {
    pub path: String,
    pub a_start: u64,
    pub a_end: u64,
    pub b_start: u64,
    pub b_end: u64,
}

fn strip_path_prefix(raw: &str) -> String {
    let raw = raw.trim_end();
    if raw == "/dev/null" {
        return raw.to_string();
    }
    raw.strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw)
        .to_string()
}

fn parse_hunk_header(header: &str, line_no: usize) -> Result<(u64, u64, u64, u64), DiffError> {
    // "@@ -old_start[,old_lines] +new_start[,new_lines] @@ ..."
    let malformed = |reason: &str| DiffError::Malformed {
        line: line_no,
        reason: reason.to_string(),
    };

    let rest = header
        .strip_prefix("@@ -")
        .ok_or_else(|| malformed("hunk header must start with '@@ -'"))?;
    let (old_part, rest) = rest
        .split_once(" +")
        .ok_or_else(|| malformed("hunk header missing '+' side"))?;
    let (new_part, _) = rest
        .split_once(" @@")
        .ok_or_else(|| malformed("hunk header missing closing '@@'"))?;

    let parse_side = |part: &str| -> Result<(u64, u64), DiffError> {
        match part.split_once(',') {
            Some((start, len)) => Ok((
                start.parse().map_err(|_| malformed("bad line number"))?,
                len.parse().map_err(|_| malformed("bad line count"))?,
            )),
            None => Ok((part.parse().map_err(|_| malformed("bad line number"))?, 1)),
        }
    };

    let (old_start, old_lines) = parse_side(old_part)?;
    let (new_start, new_lines) = parse_side(new_part)?;
    Ok((old_start, old_lines, new_start, new_lines))
}

/// Parse a unified diff into per-file hunks.
///
/// Accepts (and skips) `diff --git` and `index` decoration lines. Rejects
/// diffs whose added content embeds diff-header markers, and hunks whose
/// declared line counts do not match their content.
pub fn parse_unified_diff(text: &str) -> Result<Vec<FileDiff>, DiffError> {
    let mut files: Vec<FileDiff> = Vec::new();
    let mut current_file: Option<FileDiff> = None;
    let mut current_hunk: Option<(usize, Hunk)> = None;
    let mut pending_old: Option<String> = None;

    let finish_hunk =
        |file: &mut Option<FileDiff>, hunk: Option<(usize, Hunk)>| -> Result<(), DiffError> {
            let Some((header_line, hunk)) = hunk else {
                return Ok(());
            };
            let actual_old = hunk
                .lines
                .iter()
                .filter(|l| l.starts_with(' ') || l.starts_with('-'))
                .count() as u64;
            let actual_new = hunk
                .lines
                .iter()
                .filter(|l| l.starts_with(' ') || l.starts_with('+'))
                .count() as u64;
            if actual_old != hunk.old_lines {
                return Err(DiffError::CountMismatch {
                    line: header_line,
                    side: "old",
                    declared: hunk.old_lines,
                    actual: actual_old,
                });
            }
            if actual_new != hunk.new_lines {
                return Err(DiffError::CountMismatch {
                    line: header_line,
                    side: "new",
                    declared: hunk.new_lines,
                    actual: actual_new,
                });
            }
            file.as_mut()
                .expect("hunk without file header")
                .hunks
                .push(hunk);
            Ok(())
        };

    // A hunk still short of its declared counts owns every content line,
    // even ones that look like headers (a removed line starting "-- "
    // renders as "--- ...").
    let hunk_satisfied = |hunk: &Option<(usize, Hunk)>| -> bool {
        match hunk {
            None => true,
            Some((_, h)) => {
                let old = h
                    .lines
                    .iter()
                    .filter(|l| l.starts_with(' ') || l.starts_with('-'))
                    .count() as u64;
                let new = h
                    .lines
                    .iter()
                    .filter(|l| l.starts_with(' ') || l.starts_with('+'))
                    .count() as u64;
                old >= h.old_lines && new >= h.new_lines
            }
        }
    };

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let at_boundary = hunk_satisfied(&current_hunk);

        if at_boundary && (line.starts_with("diff --git ") || line.starts_with("index ")) {
            continue;
        }

        if let Some(old) = line.strip_prefix("--- ").filter(|_| at_boundary) {
            finish_hunk(&mut current_file, current_hunk.take())?;
            if let Some(file) = current_file.take() {
                files.push(file);
            }
            pending_old = Some(strip_path_prefix(old));
            continue;
        }

        if let Some(new) = line.strip_prefix("+++ ").filter(|_| pending_old.is_some()) {
            let old_path = pending_old.take().ok_or(DiffError::Malformed {
                line: line_no,
                reason: "'+++' without preceding '---'".to_string(),
            })?;
            let new_path = strip_path_prefix(new);
            let path = if new_path == "/dev/null" {
                old_path.clone()
            } else {
                new_path
            };
            current_file = Some(FileDiff {
                old_path,
                path,
                hunks: Vec::new(),
            });
            continue;
        }

        if at_boundary && line.starts_with("@@ -") {
            if current_file.is_none() {
                return Err(DiffError::Malformed {
                    line: line_no,
                    reason: "hunk header before file header".to_string(),
                });
            }
            finish_hunk(&mut current_file, current_hunk.take())?;
            let (old_start, old_lines, new_start, new_lines) =
                parse_hunk_header(line, line_no)?;
            current_hunk = Some((
                line_no,
                Hunk {
                    old_start,
                    old_lines,
                    new_start,
                    new_lines,
                    lines: Vec::new(),
                },
            ));
            continue;
        }

        match current_hunk {
            Some((_, ref mut hunk)) => {
                if line.starts_with('\\') {
                    // "\ No newline at end of file"
                    continue;
                }
                if at_boundary && line.trim().is_empty() {
                    // Separator between file sections.
                    continue;
                }
                let Some(marker) = line.chars().next() else {
                    // Some generators emit a bare empty line for an empty
                    // context line; normalize it.
                    hunk.lines.push(" ".to_string());
                    continue;
                };
                if !matches!(marker, ' ' | '+' | '-') {
                    return Err(DiffError::Malformed {
                        line: line_no,
                        reason: format!("unexpected content marker {marker:?}"),
                    });
                }
                let content = &line[1..];
                if marker == '+' && (content.starts_with("diff --git ") || content.starts_with("@@ -"))
                {
                    return Err(DiffError::EmbeddedHeader { line: line_no });
                }
                hunk.lines.push(line.to_string());
            }
            None if line.trim().is_empty() => continue,
            None => {
                return Err(DiffError::Malformed {
                    line: line_no,
                    reason: "content outside any hunk".to_string(),
                });
            }
        }
    }

    finish_hunk(&mut current_file, current_hunk.take())?;
    if let Some(file) = current_file.take() {
        files.push(file);
    }

    if files.is_empty() {
        return Err(DiffError::Malformed {
            line: 0,
            reason: "no file headers found".to_string(),
        });
    }

    Ok(files)
}

/// Render per-file hunks back to unified-diff text.
pub fn render(files: &[FileDiff]) -> String {
    let mut out = String::new();
    for file in files {
        if file.old_path == "/dev/null" {
            out.push_str("--- /dev/null\n");
        } else {
            out.push_str(&format!("--- a/{}\n", file.old_path));
        }
        out.push_str(&format!("+++ b/{}\n", file.path));
        for hunk in &file.hunks {
            out.push_str(&format!(
                "@@ -{},{} +{},{} @@\n",
                hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines
            ));
            for line in &hunk.lines {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

/// Count of added plus removed lines across all files.
pub fn changed_lines(files: &[FileDiff]) -> usize {
    files
        .iter()
        .flat_map(|f| &f.hunks)
        .flat_map(|h| &h.lines)
        .filter(|l| l.starts_with('+') || l.starts_with('-'))
        .count()
}

/// Paths touched by a set of file diffs, deduplicated and sorted.
pub fn touched_paths(files: &[FileDiff]) -> Vec<String> {
    let mut paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
    paths.sort();
    paths.dedup();
    paths
}

/// Merge several parsed diffs (all against the same base) into one.
///
/// Hunks for the same file are sorted by base position; non-overlapping
/// hunks concatenate, hunks adjacent on the base join into one, and any
/// base-range overlap is a [`MergeConflict`].
pub fn merge_diffs(sources: &[Vec<FileDiff>]) -> Result<Vec<FileDiff>, MergeConflict> {
    // path -> (old_path, hunks)
    let mut by_path: BTreeMap<String, (String, Vec<Hunk>)> = BTreeMap::new();

    for source in sources {
        for file in source {
            let entry = by_path
                .entry(file.path.clone())
                .or_insert_with(|| (file.old_path.clone(), Vec::new()));
            entry.1.extend(file.hunks.iter().cloned());
        }
    }

    let mut merged = Vec::new();
    for (path, (old_path, mut hunks)) in by_path {
        hunks.sort_by_key(|h| h.old_start);

        let mut combined: Vec<Hunk> = Vec::new();
        for hunk in hunks {
            match combined.last_mut() {
                Some(prev) => {
                    let (prev_start, prev_end) = prev.old_range();
                    let (start, end) = hunk.old_range();
                    if start <= prev_end {
                        return Err(MergeConflict {
                            path,
                            a_start: prev_start,
                            a_end: prev_end,
                            b_start: start,
                            b_end: end,
                        });
                    }
                    if start == prev_end + 1 && prev.old_lines > 0 && hunk.old_lines > 0 {
                        // Adjacent on the base: join into one hunk.
                        prev.old_lines += hunk.old_lines;
                        prev.new_lines += hunk.new_lines;
                        prev.lines.extend(hunk.lines);
                    } else {
                        combined.push(hunk);
                    }
                }
                None => combined.push(hunk),
            }
        }

        // Recompute new-side starts with the cumulative line delta.
        let mut delta: i64 = 0;
        for hunk in &mut combined {
            let base = hunk.old_start as i64 + delta;
            hunk.new_start = if hunk.old_lines == 0 {
                (base + 1) as u64
            } else {
                base as u64
            };
            delta += hunk.new_lines as i64 - hunk.old_lines as i64;
        }

        merged.push(FileDiff {
            old_path,
            path,
            hunks: combined,
        });
    }

    Ok(merged)
}
