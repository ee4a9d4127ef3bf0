//! Line positions touched by a sequence of exact-match replacements.
//!
//! Edits apply one after another. Each edit records the byte offsets of its
//! replacements in the content it produced, and every later edit shifts the
//! offsets recorded before it, so all offsets end up valid in the final text.

use serde::{Deserialize, Serialize};

/// Default gap (in lines) under which two touched ranges merge.
pub const DEFAULT_MERGE_GAP: usize = 10;

/// One replacement request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSpec {
    pub old_string: String,
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
}

impl EditSpec {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old_string: old.into(),
            new_string: new.into(),
            replace_all: false,
        }
    }

    pub fn all(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            replace_all: true,
            ..Self::new(old, new)
        }
    }
}

/// 1-based inclusive line range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Grow by `context` lines on both sides, clamped to `[1, total]`.
    pub fn expand(self, context: usize, total: usize) -> Self {
        let total = total.max(1);
        let end = (self.end + context).min(total);
        let start = self.start.saturating_sub(context).max(1).min(end);
        Self { start, end }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EditRejection {
    #[error("old_string is empty")]
    EmptyTarget,
    #[error("old_string and new_string are identical")]
    Unchanged,
    #[error("old_string not found")]
    NotFound,
    #[error("old_string is not unique: found {0} occurrences (set replace_all to replace every occurrence)")]
    Ambiguous(usize),
}

/// The edit at `index` (0-based) could not be applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditFailure {
    pub index: usize,
    pub rejection: EditRejection,
}

/// Where one edit's replacements sit in the final content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditPositions {
    pub offsets: Vec<usize>,
    inserted_newlines: usize,
}

/// Result of applying a batch of edits in memory.
#[derive(Clone, Debug)]
pub struct AppliedEdits {
    pub content: String,
    pub edits: Vec<EditPositions>,
}

impl AppliedEdits {
    pub fn replacement_count(&self) -> usize {
        self.edits.iter().map(|e| e.offsets.len()).sum()
    }

    /// Touched line ranges in the final content, sorted and merged.
    pub fn line_ranges(&self, merge_gap: usize) -> Vec<LineRange> {
        let ranges = self
            .edits
            .iter()
            .flat_map(|edit| {
                edit.offsets.iter().map(move |&offset| {
                    let start = line_at(&self.content, offset);
                    LineRange::new(start, start + edit.inserted_newlines)
                })
            })
            .collect();
        merge_ranges(ranges, merge_gap)
    }

    /// Numbered excerpts of the final content around every touched range.
    pub fn render_context(&self, context: usize, merge_gap: usize) -> String {
        render_windows(&self.content, &self.line_ranges(merge_gap), context)
    }
}

/// Apply `edits` to `original` in order. Nothing is returned unless every
/// edit applies.
pub fn apply_edits(original: &str, edits: &[EditSpec]) -> Result<AppliedEdits, EditFailure> {
    let mut content = original.to_string();
    let mut applied: Vec<EditPositions> = Vec::with_capacity(edits.len());

    for (index, edit) in edits.iter().enumerate() {
        let fail = |rejection| EditFailure { index, rejection };
        let old = edit.old_string.as_str();
        let new = edit.new_string.as_str();
        if old.is_empty() {
            return Err(fail(EditRejection::EmptyTarget));
        }
        if old == new {
            return Err(fail(EditRejection::Unchanged));
        }

        let mut found: Vec<usize> = content.match_indices(old).map(|(o, _)| o).collect();
        match found.len() {
            0 => return Err(fail(EditRejection::NotFound)),
            n if n > 1 && !edit.replace_all => return Err(fail(EditRejection::Ambiguous(n))),
            _ => {}
        }
        if !edit.replace_all {
            found.truncate(1);
        }

        let delta = new.len() as isize - old.len() as isize;

        for earlier in &mut applied {
            for offset in &mut earlier.offsets {
                let before = found.iter().filter(|&&o| o + old.len() <= *offset).count();
                *offset = (*offset as isize + before as isize * delta) as usize;
            }
        }

        content = if edit.replace_all {
            content.replace(old, new)
        } else {
            content.replacen(old, new, 1)
        };

        let offsets = found
            .iter()
            .enumerate()
            .map(|(i, &o)| (o as isize + i as isize * delta) as usize)
            .collect();
        applied.push(EditPositions {
            offsets,
            inserted_newlines: new.matches('\n').count(),
        });
    }

    Ok(AppliedEdits {
        content,
        edits: applied,
    })
}

/// 1-based line containing byte `offset`.
pub fn line_at(content: &str, offset: usize) -> usize {
    let end = offset.min(content.len());
    content.as_bytes()[..end].iter().filter(|&&b| b == b'\n').count() + 1
}

/// Sort ranges and merge any whose gap is at most `gap` lines.
pub fn merge_ranges(mut ranges: Vec<LineRange>, gap: usize) -> Vec<LineRange> {
    ranges.sort();
    let mut merged: Vec<LineRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(current) if range.start <= current.end + gap => {
                current.end = current.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Render `ranges` of `content` with `context` lines around each, numbered
/// like the Read tool. Windows that touch are joined.
pub fn render_windows(content: &str, ranges: &[LineRange], context: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    if total == 0 {
        return "(empty file)".to_string();
    }
    let windows = merge_ranges(
        ranges.iter().map(|r| r.expand(context, total)).collect(),
        1,
    );

    let mut out = String::new();
    for (i, window) in windows.iter().enumerate() {
        if i > 0 {
            out.push_str("   ...\n");
        }
        for n in window.start..=window.end {
            out.push_str(&format!("{:>6}\t{}\n", n, lines[n - 1]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_all_offsets() {
        let applied = apply_edits("foo bar foo baz foo", &[EditSpec::all("foo", "qux")]).unwrap();
        assert_eq!(applied.content, "qux bar qux baz qux");
        assert_eq!(applied.edits[0].offsets, vec![0, 8, 16]);
    }

    #[test]
    fn replace_all_offsets_account_for_growth() {
        // Originals 0, 2, 4; each replacement grows by 2 bytes.
        let applied = apply_edits("a.a.a", &[EditSpec::all("a", "xyz")]).unwrap();
        assert_eq!(applied.content, "xyz.xyz.xyz");
        assert_eq!(applied.edits[0].offsets, vec![0, 4, 8]);
        let offsets = &applied.edits[0].offsets;
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn growing_edit_moves_later_lines() {
        let original = "l1\nl2\nl3\nl4\nl5\n";
        let applied = apply_edits(
            original,
            &[EditSpec::new("l2", "a\nb\nc"), EditSpec::new("l4", "x")],
        )
        .unwrap();
        assert_eq!(applied.content, "l1\na\nb\nc\nl3\nx\nl5\n");
        assert_eq!(line_at(&applied.content, applied.edits[0].offsets[0]), 2);
        assert_eq!(line_at(&applied.content, applied.edits[1].offsets[0]), 6);
        assert_eq!(
            applied.line_ranges(0),
            vec![LineRange::new(2, 4), LineRange::new(6, 6)]
        );
    }

    #[test]
    fn later_edit_before_earlier_touch_shifts_it() {
        let applied = apply_edits(
            "a\nb\nc\n",
            &[EditSpec::new("c", "C"), EditSpec::new("a", "a\na\na")],
        )
        .unwrap();
        assert_eq!(applied.content, "a\na\na\nb\nC\n");
        assert_eq!(applied.edits[0].offsets, vec![8]);
        assert_eq!(line_at(&applied.content, 8), 5);
    }

    #[test]
    fn batch_matches_sequential_application() {
        let original = "alpha\nbeta\ngamma\ndelta\n";
        let edits = [
            EditSpec::new("beta", "BETA\nextra"),
            EditSpec::new("delta", "omega"),
            EditSpec::new("alpha", "first"),
        ];
        let batch = apply_edits(original, &edits).unwrap();

        let mut sequential = original.to_string();
        for edit in &edits {
            sequential = apply_edits(&sequential, std::slice::from_ref(edit))
                .unwrap()
                .content;
        }
        assert_eq!(batch.content, sequential);
        assert_eq!(batch.replacement_count(), 3);
    }

    #[test]
    fn failures_report_index_and_reason() {
        let err = apply_edits(
            "one two one",
            &[EditSpec::new("two", "2"), EditSpec::new("three", "3")],
        )
        .unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.rejection, EditRejection::NotFound);

        let err = apply_edits("one two one", &[EditSpec::new("one", "1")]).unwrap_err();
        assert_eq!(err.rejection, EditRejection::Ambiguous(2));

        let err = apply_edits("x", &[EditSpec::new("", "y")]).unwrap_err();
        assert_eq!(err.rejection, EditRejection::EmptyTarget);

        let err = apply_edits("x", &[EditSpec::new("x", "x")]).unwrap_err();
        assert_eq!(err.rejection, EditRejection::Unchanged);
    }

    #[test]
    fn later_edit_sees_earlier_output() {
        let applied = apply_edits(
            "start",
            &[EditSpec::new("start", "middle"), EditSpec::new("middle", "end")],
        )
        .unwrap();
        assert_eq!(applied.content, "end");
    }

    #[test]
    fn merge_respects_gap() {
        let ranges = vec![LineRange::new(12, 13), LineRange::new(1, 2)];
        assert_eq!(merge_ranges(ranges.clone(), 10), vec![LineRange::new(1, 13)]);
        assert_eq!(
            merge_ranges(vec![LineRange::new(1, 2), LineRange::new(14, 15)], 10),
            vec![LineRange::new(1, 2), LineRange::new(14, 15)]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let ranges = vec![
            LineRange::new(30, 31),
            LineRange::new(1, 3),
            LineRange::new(5, 9),
            LineRange::new(8, 12),
        ];
        let once = merge_ranges(ranges, 2);
        let twice = merge_ranges(once.clone(), 2);
        assert_eq!(once, twice);
        assert_eq!(once, vec![LineRange::new(1, 12), LineRange::new(30, 31)]);
    }

    #[test]
    fn expand_clamps_to_file() {
        let range = LineRange::new(2, 3);
        assert_eq!(range.expand(3, 10), LineRange::new(1, 6));
        assert_eq!(LineRange::new(9, 10).expand(3, 10), LineRange::new(6, 10));
        let expanded = LineRange::new(4, 5).expand(2, 20);
        assert!(expanded.start <= 4 && expanded.end >= 5);
    }

    #[test]
    fn render_numbers_lines_and_separates_windows() {
        let content: String = (1..=30).map(|i| format!("line {i}\n")).collect();
        let out = render_windows(
            &content,
            &[LineRange::new(2, 2), LineRange::new(20, 20)],
            1,
        );
        assert!(out.contains("     1\tline 1\n"));
        assert!(out.contains("     3\tline 3\n"));
        assert!(!out.contains("line 4\n"));
        assert!(out.contains("   ...\n"));
        assert!(out.contains("    21\tline 21\n"));
    }
}
