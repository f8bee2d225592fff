//! Persona interview step types.
//!
//! The interview is a stateless step function: given the stored
//! analysis profile and the answers so far, one model call yields
//! either the next question or the finished persona. The model's JSON
//! is decoded into [`InterviewStep`] and validated before anything is
//! shown to a user.

use serde::{Deserialize, Serialize};

/// A single question, distinguished by its `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterviewQuestion {
    SingleSelect {
        question: String,
        options: Vec<String>,
    },
    MultiSelect {
        question: String,
        options: Vec<String>,
    },
    CodeOpinion {
        question: String,
        options: Vec<String>,
        #[serde(rename = "codeSnippet")]
        code_snippet: String,
        #[serde(rename = "codeFile")]
        code_file: String,
    },
    ConfirmCorrect {
        question: String,
        detections: Vec<String>,
    },
    ShortText {
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
    },
}

/// One prior question/answer pair in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewAnswer {
    pub question: String,
    pub answer: String,
}

/// The model's response for one interview step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum InterviewStep {
    Question {
        question: InterviewQuestion,
        #[serde(rename = "questionNumber")]
        question_number: u32,
        #[serde(rename = "estimatedTotal")]
        estimated_total: u32,
    },
    Complete {
        persona: String,
    },
    Error {
        message: String,
    },
}

impl InterviewStep {
    /// Reject steps missing required per-type fields.
    pub fn validate(&self) -> Result<(), String> {
        let question = match self {
            InterviewStep::Question { question, .. } => question,
            InterviewStep::Complete { persona } => {
                if persona.trim().is_empty() {
                    return Err("complete step has empty persona".to_string());
                }
                return Ok(());
            }
            InterviewStep::Error { .. } => return Ok(()),
        };

        match question {
            InterviewQuestion::SingleSelect { options, .. }
            | InterviewQuestion::MultiSelect { options, .. } => {
                if options.is_empty() {
                    return Err("select question has no options".to_string());
                }
            }
            InterviewQuestion::CodeOpinion {
                options,
                code_snippet,
                code_file,
                ..
            } => {
                if options.is_empty() {
                    return Err("code_opinion question has no options".to_string());
                }
                if code_snippet.is_empty() || code_file.is_empty() {
                    return Err("code_opinion question missing snippet or file".to_string());
                }
            }
            InterviewQuestion::ConfirmCorrect { detections, .. } => {
                if detections.is_empty() {
                    return Err("confirm_correct question has no detections".to_string());
                }
            }
            InterviewQuestion::ShortText { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_step_decodes() {
        let json = r#"{
            "status": "question",
            "question": {
                "type": "single_select",
                "question": "How strict should reviews be?",
                "options": ["Strict", "Balanced", "Lenient"]
            },
            "questionNumber": 3,
            "estimatedTotal": 12
        }"#;
        let step: InterviewStep = serde_json::from_str(json).unwrap();
        step.validate().unwrap();
        match step {
            InterviewStep::Question {
                question_number,
                estimated_total,
                ..
            } => {
                assert_eq!(question_number, 3);
                assert_eq!(estimated_total, 12);
            }
            _ => panic!("expected question step"),
        }
    }

    #[test]
    fn test_complete_step_decodes() {
        let json = r##"{"status": "complete", "persona": "# Review persona\nBe strict."}"##;
        let step: InterviewStep = serde_json::from_str(json).unwrap();
        step.validate().unwrap();
    }

    #[test]
    fn test_complete_step_rejects_empty_persona() {
        let json = r#"{"status": "complete", "persona": "  "}"#;
        let step: InterviewStep = serde_json::from_str(json).unwrap();
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_select_without_options_rejected() {
        let json = r#"{
            "status": "question",
            "question": {"type": "multi_select", "question": "Pick", "options": []},
            "questionNumber": 1,
            "estimatedTotal": 10
        }"#;
        let step: InterviewStep = serde_json::from_str(json).unwrap();
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_code_opinion_requires_snippet_and_file() {
        let json = r#"{
            "status": "question",
            "question": {
                "type": "code_opinion",
                "question": "Thoughts on this error handling?",
                "options": ["Fine", "Too loose"],
                "codeSnippet": "",
                "codeFile": "src/api.ts"
            },
            "questionNumber": 2,
            "estimatedTotal": 10
        }"#;
        let step: InterviewStep = serde_json::from_str(json).unwrap();
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_confirm_correct_requires_detections() {
        let json = r#"{
            "status": "question",
            "question": {"type": "confirm_correct", "question": "Did we get these right?", "detections": []},
            "questionNumber": 4,
            "estimatedTotal": 10
        }"#;
        let step: InterviewStep = serde_json::from_str(json).unwrap();
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_short_text_placeholder_optional() {
        let json = r#"{
            "status": "question",
            "question": {"type": "short_text", "question": "Anything else?"},
            "questionNumber": 7,
            "estimatedTotal": 8
        }"#;
        let step: InterviewStep = serde_json::from_str(json).unwrap();
        step.validate().unwrap();
    }

    #[test]
    fn test_unknown_status_rejected() {
        let json = r#"{"status": "thinking"}"#;
        assert!(serde_json::from_str::<InterviewStep>(json).is_err());
    }
}
