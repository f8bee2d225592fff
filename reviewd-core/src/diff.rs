//! Diff rendering for agent prompts.
//!
//! Forge adapters normalize their per-file change shapes into
//! [`FileChange`]; this module renders the annotated text the agent
//! sees. Added and context lines are prefixed with their new-file line
//! number so the agent can cite positions that map directly onto
//! inline-comment anchors; removed lines carry no number.

use serde::{Deserialize, Serialize};

/// Hard cap on a single file's rendered diff, in characters.
const MAX_FILE_CHARS: usize = 15_000;
/// Hard cap on a single file's rendered diff, in lines.
const MAX_FILE_LINES: usize = 500;
/// Hard cap on the whole rendered diff, in characters.
const MAX_TOTAL_CHARS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Added => "added",
            FileStatus::Modified => "modified",
            FileStatus::Removed => "removed",
            FileStatus::Renamed => "renamed",
        }
    }
}

/// One changed file, normalized across providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub status: FileStatus,
    pub additions: u64,
    pub deletions: u64,
    /// Unified-diff hunks for this file, without the `diff --git`
    /// preamble. `None` for binary or oversized files.
    pub patch: Option<String>,
}

/// Render one file's patch with line-number prefixes.
///
/// Hunk headers pass through unchanged. Added lines become
/// `N:+added`, context lines `N: context` (N is the new-file line
/// number), removed lines are padded with three spaces.
fn annotate_patch(patch: &str) -> String {
    let mut out = String::with_capacity(patch.len() + patch.len() / 4);
    let mut new_line: u64 = 0;
    let mut line_count = 0usize;
    let mut truncated = false;

    for raw in patch.lines() {
        if line_count >= MAX_FILE_LINES || out.len() >= MAX_FILE_CHARS {
            truncated = true;
            break;
        }

        if raw.starts_with("@@") {
            new_line = parse_new_start(raw).unwrap_or(new_line);
            out.push_str(raw);
        } else if raw.starts_with('+') {
            out.push_str(&format!("{}:{}", new_line, raw));
            new_line += 1;
        } else if raw.starts_with('-') {
            out.push_str("   ");
            out.push_str(raw);
        } else if raw.starts_with('\\') {
            // "\ No newline at end of file" markers pass through.
            out.push_str(raw);
        } else {
            out.push_str(&format!("{}:{}", new_line, raw));
            new_line += 1;
        }
        out.push('\n');
        line_count += 1;
    }

    if truncated {
        out.push_str("... (truncated)\n");
    }
    out
}

/// Extract the new-file start line from a `@@ -a,b +c,d @@` header.
fn parse_new_start(header: &str) -> Option<u64> {
    let plus = header.find('+')?;
    let rest = &header[plus + 1..];
    let end = rest.find([',', ' '])?;
    rest[..end].parse().ok()
}

/// Render the full annotated diff for a change set, applying the
/// per-file and total size caps.
pub fn format_diff(files: &[FileChange]) -> String {
    let mut out = String::new();

    for (idx, file) in files.iter().enumerate() {
        let mut section = format!(
            "### {} ({}, +{} -{})\n",
            file.path,
            file.status.as_str(),
            file.additions,
            file.deletions
        );
        if let Some(patch) = &file.patch {
            section.push_str("```diff\n");
            section.push_str(&annotate_patch(patch));
            section.push_str("```\n");
        }
        section.push('\n');

        if out.len() + section.len() > MAX_TOTAL_CHARS {
            let remaining = files.len() - idx;
            out.push_str(&format!("... ({} more files truncated)\n", remaining));
            break;
        }
        out.push_str(&section);
    }

    out
}

/// Render a comment body for posting: the message, followed by a
/// fenced suggestion block when the agent provided a replacement.
pub fn format_comment_body(message: &str, suggestion: Option<&str>) -> String {
    match suggestion {
        Some(s) if !s.is_empty() => {
            format!("{}\n\n```suggestion\n{}\n```", message, s)
        }
        _ => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, patch: &str) -> FileChange {
        FileChange {
            path: path.to_string(),
            status: FileStatus::Modified,
            additions: 1,
            deletions: 1,
            patch: Some(patch.to_string()),
        }
    }

    #[test]
    fn test_annotate_numbers_added_and_context_lines() {
        let patch = "@@ -1,3 +10,4 @@ fn main()\n context a\n-removed line\n+added line\n context b";
        let out = annotate_patch(patch);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "@@ -1,3 +10,4 @@ fn main()");
        assert_eq!(lines[1], "10: context a");
        assert_eq!(lines[2], "   -removed line");
        assert_eq!(lines[3], "11:+added line");
        assert_eq!(lines[4], "12: context b");
    }

    #[test]
    fn test_annotate_multiple_hunks_reset_numbering() {
        let patch = "@@ -1,1 +1,1 @@\n+first\n@@ -10,1 +20,1 @@\n+second";
        let out = annotate_patch(patch);
        assert!(out.contains("1:+first"));
        assert!(out.contains("20:+second"));
    }

    #[test]
    fn test_annotate_hunk_header_without_count() {
        // Single-line hunks may omit the count: "@@ -5 +7 @@".
        let patch = "@@ -5 +7 @@\n+only";
        let out = annotate_patch(patch);
        assert!(out.contains("7:+only"));
    }

    #[test]
    fn test_per_file_line_cap_appends_marker() {
        let mut patch = String::from("@@ -1,600 +1,600 @@\n");
        for i in 0..600 {
            patch.push_str(&format!(" line {}\n", i));
        }
        let out = annotate_patch(&patch);
        assert!(out.ends_with("... (truncated)\n"));
        assert!(out.lines().count() <= MAX_FILE_LINES + 1);
    }

    #[test]
    fn test_format_diff_header_line() {
        let files = vec![FileChange {
            path: "src/lib.rs".to_string(),
            status: FileStatus::Added,
            additions: 12,
            deletions: 0,
            patch: Some("@@ -0,0 +1,1 @@\n+hello".to_string()),
        }];
        let out = format_diff(&files);
        assert!(out.starts_with("### src/lib.rs (added, +12 -0)\n```diff\n"));
        assert!(out.contains("1:+hello"));
    }

    #[test]
    fn test_format_diff_total_cap() {
        let big_patch = format!("@@ -1,1 +1,400 @@\n{}", "+x\n".repeat(400));
        let files: Vec<FileChange> = (0..200)
            .map(|i| change(&format!("file{}.rs", i), &big_patch))
            .collect();
        let out = format_diff(&files);
        assert!(out.len() <= MAX_TOTAL_CHARS + 64);
        assert!(out.contains("more files truncated)"));
    }

    #[test]
    fn test_binary_file_renders_header_only() {
        let files = vec![FileChange {
            path: "logo.png".to_string(),
            status: FileStatus::Added,
            additions: 0,
            deletions: 0,
            patch: None,
        }];
        let out = format_diff(&files);
        assert!(out.contains("### logo.png (added, +0 -0)"));
        assert!(!out.contains("```diff"));
    }

    #[test]
    fn test_format_comment_body_with_suggestion() {
        let body = format_comment_body("Use a checked add here.", Some("a.checked_add(b)?"));
        assert!(body.starts_with("Use a checked add here."));
        assert!(body.contains("```suggestion\na.checked_add(b)?\n```"));
    }

    #[test]
    fn test_format_comment_body_empty_suggestion_omitted() {
        let body = format_comment_body("Just a note.", Some(""));
        assert_eq!(body, "Just a note.");
        let body = format_comment_body("Just a note.", None);
        assert_eq!(body, "Just a note.");
    }
}
