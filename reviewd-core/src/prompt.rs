//! Prompt assembly for the three agent invocations: repository
//! analysis, pull-request review, and the persona interview.

use crate::interview::InterviewAnswer;
use crate::model::ReviewComment;

/// Substituted for a missing persona or analysis profile so the
/// template never renders an empty section.
const NONE_SENTINEL: &str = "(none)";

/// Maximum length of a previously-flagged-issue line in the user
/// message.
const PRIOR_ISSUE_MAX_CHARS: usize = 120;

const REVIEW_SYSTEM_TEMPLATE: &str = r#"You are an automated code reviewer. Review the pull request diff you
are given and respond with a single JSON object of the form
{"comments": [...]} where each comment has: file, line, optional
endLine, severity (one of "critical", "warning", "suggestion"),
category, message, and an optional suggestion containing replacement
code for the flagged lines. Only comment on lines present in the
diff. Respond with JSON only.

## Team review persona

{persona}

## Codebase profile

{analysis}

## Review skills

{predefined_skills}

## Team-specific skills

{custom_skills}
"#;

/// Render the review system prompt from its four named sections.
pub fn render_review_system(
    persona: Option<&str>,
    analysis: Option<&str>,
    predefined_skills: &str,
    custom_skills: &str,
) -> String {
    fn or_none(v: Option<&str>) -> &str {
        match v {
            Some(s) if !s.trim().is_empty() => s,
            _ => NONE_SENTINEL,
        }
    }
    REVIEW_SYSTEM_TEMPLATE
        .replace("{persona}", or_none(persona))
        .replace("{analysis}", or_none(analysis))
        .replace(
            "{predefined_skills}",
            if predefined_skills.is_empty() {
                NONE_SENTINEL
            } else {
                predefined_skills
            },
        )
        .replace(
            "{custom_skills}",
            if custom_skills.is_empty() {
                NONE_SENTINEL
            } else {
                custom_skills
            },
        )
}

/// Metadata header for the review user message.
pub struct ReviewRequestHeader<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub author: &'a str,
    pub target_branch: &'a str,
    pub file_count: usize,
}

/// Build the review user message: header, previously flagged issues,
/// then the annotated diff.
pub fn build_review_user_message(
    header: &ReviewRequestHeader<'_>,
    prior: &[ReviewComment],
    diff: &str,
) -> String {
    let mut out = format!(
        "Review this pull request.\n\nTitle: {}\nAuthor: {}\nTarget branch: {}\nFiles changed: {}\n",
        header.title, header.author, header.target_branch, header.file_count
    );
    if !header.description.trim().is_empty() {
        out.push_str(&format!("\nDescription:\n{}\n", header.description));
    }

    if !prior.is_empty() {
        out.push_str("\n## Previously Flagged Issues\n\nDo not re-flag these:\n");
        for c in prior {
            let entry = format!("[{}:{}] {}", c.file, c.line, c.message);
            let entry: String = entry.chars().take(PRIOR_ISSUE_MAX_CHARS).collect();
            out.push_str(&format!("- {}\n", entry));
        }
    }

    out.push_str("\n## Diff\n\n");
    out.push_str(diff);
    out
}

/// System prompt for the one-shot repository analysis run.
pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are analyzing a codebase checked out at your working directory.
Produce a markdown profile of the repository covering: languages and
frameworks in use, directory layout and module boundaries, layering
and dependency direction, API surface, error-handling conventions,
testing approach and tooling, and anything unusual a reviewer should
know. Be concrete; cite real paths. Respond with the markdown profile
only, no preamble.
"#;

pub const INTERVIEW_SYSTEM_PROMPT: &str = r#"You conduct a short interview that turns a codebase profile and a
team's answers into a review persona: a markdown document of concrete
review rules the team wants enforced.

Respond with exactly one JSON object, nothing else. It must be one of:

- {"status": "question", "question": <question>, "questionNumber": N,
  "estimatedTotal": M} to ask the next question;
- {"status": "complete", "persona": "<markdown>"} once you have
  enough to write the persona;
- {"status": "error", "message": "<why>"} if you cannot proceed.

A question object carries a "type" of "single_select", "multi_select",
"code_opinion", "confirm_correct", or "short_text", plus a "question"
text. Select types require non-empty "options". "code_opinion" also
requires "codeSnippet" and "codeFile". "confirm_correct" requires
non-empty "detections". "short_text" may carry a "placeholder".

Ask at least 7 questions before completing; aim for about 12 and never
exceed 15. Across the interview, cover: architecture, layers, api,
testing, errors, review_philosophy, and what to ignore.
"#;

/// Build the interview user message from the stored profile and the
/// transcript so far.
pub fn build_interview_user_message(
    analysis_profile: Option<&str>,
    answers: &[InterviewAnswer],
) -> String {
    let mut out = String::from("## Codebase profile\n\n");
    match analysis_profile {
        Some(p) if !p.trim().is_empty() => out.push_str(p),
        _ => out.push_str(
            "(no profile available; ask broader questions about the team's stack and practices)",
        ),
    }
    out.push_str("\n\n## Answers so far\n\n");
    if answers.is_empty() {
        out.push_str("(none yet; ask the first question)\n");
    } else {
        for (i, a) in answers.iter().enumerate() {
            out.push_str(&format!("Q{}: {}\nA{}: {}\n\n", i + 1, a.question, i + 1, a.answer));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;

    #[test]
    fn test_render_review_system_substitutes_all_placeholders() {
        let prompt = render_review_system(
            Some("persona text"),
            Some("analysis text"),
            "skills text",
            "custom text",
        );
        assert!(prompt.contains("persona text"));
        assert!(prompt.contains("analysis text"));
        assert!(prompt.contains("skills text"));
        assert!(prompt.contains("custom text"));
        assert!(!prompt.contains('{'));
    }

    #[test]
    fn test_render_review_system_none_sentinel() {
        let prompt = render_review_system(None, Some("   "), "", "");
        assert_eq!(prompt.matches("(none)").count(), 4);
    }

    #[test]
    fn test_user_message_truncates_prior_issues() {
        let prior = vec![ReviewComment {
            file: "a.ts".to_string(),
            line: 12,
            end_line: None,
            severity: Severity::Warning,
            category: "style".to_string(),
            message: "m".repeat(300),
            suggestion: None,
        }];
        let header = ReviewRequestHeader {
            title: "t",
            description: "",
            author: "dev",
            target_branch: "main",
            file_count: 1,
        };
        let msg = build_review_user_message(&header, &prior, "diff body");
        let line = msg
            .lines()
            .find(|l| l.starts_with("- ["))
            .expect("prior issue line");
        assert!(line.len() <= PRIOR_ISSUE_MAX_CHARS + 2);
        assert!(msg.contains("Previously Flagged Issues"));
        assert!(msg.ends_with("diff body"));
    }

    #[test]
    fn test_user_message_omits_prior_section_when_empty() {
        let header = ReviewRequestHeader {
            title: "t",
            description: "d",
            author: "dev",
            target_branch: "main",
            file_count: 3,
        };
        let msg = build_review_user_message(&header, &[], "diff");
        assert!(!msg.contains("Previously Flagged Issues"));
        assert!(msg.contains("Files changed: 3"));
        assert!(msg.contains("Description:\nd"));
    }

    #[test]
    fn test_interview_user_message_without_profile() {
        let msg = build_interview_user_message(None, &[]);
        assert!(msg.contains("no profile available"));
        assert!(msg.contains("ask the first question"));
    }

    #[test]
    fn test_interview_user_message_transcript() {
        let answers = vec![InterviewAnswer {
            question: "How strict?".to_string(),
            answer: "Very".to_string(),
        }];
        let msg = build_interview_user_message(Some("profile"), &answers);
        assert!(msg.contains("Q1: How strict?"));
        assert!(msg.contains("A1: Very"));
    }
}
