//! Strict, line-oriented unified-diff application.
//!
//! The patch pipeline feeds model-generated diffs through this crate before
//! trusting them: every context and deletion line of a hunk must match the
//! source at the offset-adjusted position, otherwise the whole patch is
//! refused. There is deliberately no fuzzy matching and no partial
//! application; a diff either applies cleanly or not at all.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("diff contains no hunks")]
    EmptyDiff,

    #[error("malformed hunk header at diff line {diff_line}: {header}")]
    MalformedHunkHeader { diff_line: usize, header: String },

    #[error("malformed hunk body at diff line {diff_line}: {line}")]
    MalformedHunkBody { diff_line: usize, line: String },

    #[error("hunk starting at source line {start_line} exceeds source length {source_len}")]
    HunkOutOfBounds { start_line: usize, source_len: usize },

    #[error("context mismatch at source line {line}: expected {expected:?}, found {found:?}")]
    ContextMismatch {
        line: usize,
        expected: String,
        found: String,
    },

    #[error("hunks are not ordered by ascending source line")]
    UnorderedHunks,
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    /// A ` `-prefixed line: must match the source and is preserved.
    Context(String),
    /// A `-`-prefixed line: must match the source and is removed.
    Removed(String),
    /// A `+`-prefixed line: inserted into the output.
    Added(String),
}

/// A parsed `@@ -old_start[,old_len] +new_start[,new_len] @@` hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based first line of the hunk in the original source.
    pub old_start: usize,
    pub old_len: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Lines of the original source consumed by this hunk (context + removed).
    fn source_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            HunkLine::Context(text) | HunkLine::Removed(text) => Some(text.as_str()),
            HunkLine::Added(_) => None,
        })
    }

    /// Lines emitted into the patched output (context + added).
    fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            HunkLine::Context(text) | HunkLine::Added(text) => Some(text.as_str()),
            HunkLine::Removed(_) => None,
        })
    }
}

/// Parse the hunks of a unified diff.
///
/// `---`/`+++` file headers, `diff --git` lines, and `index` lines are
/// tolerated and ignored; only `@@` hunks carry semantics here. The caller
/// already knows which file the diff targets.
pub fn parse_unified_diff(diff: &str) -> Result<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for (idx, raw) in diff.lines().enumerate() {
        let diff_line = idx + 1;
        if raw.starts_with("@@") {
            if let Some(done) = current.take() {
                hunks.push(done);
            }
            current = Some(parse_hunk_header(raw, diff_line)?);
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            // Preamble before the first hunk (file headers, commentary).
            continue;
        };

        if let Some(text) = raw.strip_prefix('+') {
            hunk.lines.push(HunkLine::Added(text.to_string()));
        } else if let Some(text) = raw.strip_prefix('-') {
            hunk.lines.push(HunkLine::Removed(text.to_string()));
        } else if let Some(text) = raw.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(text.to_string()));
        } else if raw.is_empty() {
            // Some producers emit empty context lines without the leading space.
            hunk.lines.push(HunkLine::Context(String::new()));
        } else if raw == r"\ No newline at end of file" {
            continue;
        } else {
            return Err(PatchError::MalformedHunkBody {
                diff_line,
                line: raw.to_string(),
            });
        }
    }

    if let Some(done) = current.take() {
        hunks.push(done);
    }
    if hunks.is_empty() {
        return Err(PatchError::EmptyDiff);
    }
    // Declared header lengths are advisory in model output; the body is what
    // gets verified line-by-line at apply time.
    Ok(hunks)
}

fn parse_hunk_header(header: &str, diff_line: usize) -> Result<Hunk> {
    let malformed = || PatchError::MalformedHunkHeader {
        diff_line,
        header: header.to_string(),
    };

    // `@@ -12,4 +12,6 @@ optional section heading`
    let rest = header.strip_prefix("@@").ok_or_else(malformed)?;
    let (ranges, _) = rest.split_once("@@").ok_or_else(malformed)?;
    let mut parts = ranges.split_whitespace();
    let old = parts.next().ok_or_else(malformed)?;
    let new = parts.next().ok_or_else(malformed)?;

    let (old_start, old_len) = parse_range(old.strip_prefix('-').ok_or_else(malformed)?)
        .ok_or_else(malformed)?;
    let (_, new_len) =
        parse_range(new.strip_prefix('+').ok_or_else(malformed)?).ok_or_else(malformed)?;

    if old_start == 0 && old_len != 0 {
        return Err(malformed());
    }

    Ok(Hunk {
        old_start,
        old_len,
        new_len,
        lines: Vec::new(),
    })
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

/// Apply `diff` to `source`, verifying every context and deletion line.
///
/// Hunk positions are interpreted against the *original* source; a running
/// offset accounts for lines added or removed by earlier hunks. Any mismatch
/// aborts with the first offending source line and nothing is returned.
pub fn apply_unified_diff(source: &str, diff: &str) -> Result<String> {
    let hunks = parse_unified_diff(diff)?;
    let source_lines: Vec<&str> = source.lines().collect();
    let mut patched: Vec<String> = source_lines.iter().map(|s| s.to_string()).collect();

    let mut offset: i64 = 0;
    let mut last_old_start = 0usize;
    for hunk in &hunks {
        if hunk.old_start < last_old_start {
            return Err(PatchError::UnorderedHunks);
        }
        last_old_start = hunk.old_start;

        let consumed = hunk.source_lines().count();
        // An insertion-only hunk at old_start N inserts *after* line N.
        let anchor = if consumed == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let at = anchor as i64 + offset;
        if at < 0 {
            return Err(PatchError::HunkOutOfBounds {
                start_line: hunk.old_start,
                source_len: source_lines.len(),
            });
        }
        let at = at as usize;
        if at + consumed > patched.len() {
            return Err(PatchError::HunkOutOfBounds {
                start_line: hunk.old_start,
                source_len: source_lines.len(),
            });
        }

        for (i, expected) in hunk.source_lines().enumerate() {
            let found = &patched[at + i];
            if found != expected {
                return Err(PatchError::ContextMismatch {
                    line: hunk.old_start + i,
                    expected: expected.to_string(),
                    found: found.clone(),
                });
            }
        }

        let replacement: Vec<String> = hunk.output_lines().map(|s| s.to_string()).collect();
        let produced = replacement.len();
        patched.splice(at..at + consumed, replacement);
        offset += produced as i64 - consumed as i64;
    }

    let mut out = patched.join("\n");
    if source.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SOURCE: &str = "fn main() {\n    let x = 1;\n    let y = 2;\n    println!(\"{}\", x + y);\n}\n";

    #[test]
    fn applies_single_hunk() {
        let diff = "\
--- a/main.rs
+++ b/main.rs
@@ -2,2 +2,2 @@
     let x = 1;
-    let y = 2;
+    let y = 3;
";
        let patched = apply_unified_diff(SOURCE, diff).unwrap();
        assert_eq!(
            patched,
            "fn main() {\n    let x = 1;\n    let y = 3;\n    println!(\"{}\", x + y);\n}\n"
        );
    }

    #[test]
    fn applies_multiple_hunks_with_offset() {
        let source = "a\nb\nc\nd\ne\nf\ng\nh\n";
        let diff = "\
@@ -1,2 +1,3 @@
 a
+a2
 b
@@ -6,2 +7,1 @@
-f
 g
";
        let patched = apply_unified_diff(source, diff).unwrap();
        assert_eq!(patched, "a\na2\nb\nc\nd\ne\ng\nh\n");
    }

    #[test]
    fn refuses_on_context_mismatch() {
        let diff = "\
@@ -2,2 +2,2 @@
     let x = 1;
-    let y = 999;
+    let y = 3;
";
        let err = apply_unified_diff(SOURCE, diff).unwrap_err();
        assert!(matches!(err, PatchError::ContextMismatch { line: 3, .. }));
    }

    #[test]
    fn refuses_out_of_bounds_hunk() {
        let diff = "\
@@ -40,2 +40,2 @@
 nothing here
-gone
+back
";
        let err = apply_unified_diff(SOURCE, diff).unwrap_err();
        assert!(matches!(err, PatchError::HunkOutOfBounds { .. }));
    }

    #[test]
    fn refuses_empty_diff() {
        assert_eq!(apply_unified_diff(SOURCE, "").unwrap_err(), PatchError::EmptyDiff);
        assert_eq!(
            apply_unified_diff(SOURCE, "--- a/x\n+++ b/x\n").unwrap_err(),
            PatchError::EmptyDiff
        );
    }

    #[test]
    fn refuses_malformed_header() {
        let err = apply_unified_diff(SOURCE, "@@ nonsense @@\n x\n").unwrap_err();
        assert!(matches!(err, PatchError::MalformedHunkHeader { .. }));
    }

    #[test]
    fn insertion_only_hunk_appends_after_anchor() {
        let source = "one\ntwo\n";
        let diff = "@@ -1,0 +2,1 @@\n+one and a half\n";
        let patched = apply_unified_diff(source, diff).unwrap();
        assert_eq!(patched, "one\none and a half\ntwo\n");
    }

    #[test]
    fn preserves_missing_trailing_newline() {
        let source = "a\nb";
        let diff = "@@ -2,1 +2,1 @@\n-b\n+c\n";
        assert_eq!(apply_unified_diff(source, diff).unwrap(), "a\nc");
    }

    #[test]
    fn header_section_heading_is_ignored() {
        let diff = "@@ -2,2 +2,2 @@ fn main()\n     let x = 1;\n-    let y = 2;\n+    let y = 3;\n";
        assert!(apply_unified_diff(SOURCE, diff).is_ok());
    }
}
