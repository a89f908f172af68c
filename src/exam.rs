//! Exam vocabulary: the four exam types, the authored content shapes, and the
//! stripped views embedded into a session at start.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamType {
    Reading,
    Listening,
    Writing,
    Speaking,
}

impl ExamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Listening => "listening",
            Self::Writing => "writing",
            Self::Speaking => "speaking",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reading" => Some(Self::Reading),
            "listening" => Some(Self::Listening),
            "writing" => Some(Self::Writing),
            "speaking" => Some(Self::Speaking),
            _ => None,
        }
    }

    /// Time the candidate gets once the session is started.
    pub fn duration_seconds(&self) -> u32 {
        match self {
            Self::Reading => 3600,
            Self::Listening => 1800,
            Self::Writing => 3600,
            Self::Speaking => 840,
        }
    }

    /// Objective types are graded from stored answer keys; the rest go to the
    /// external grading service.
    pub fn is_objective(&self) -> bool {
        matches!(self, Self::Reading | Self::Listening)
    }

    /// Speaking content is authored per part; every other type lives in part 0.
    pub fn part_range(&self) -> std::ops::RangeInclusive<u8> {
        match self {
            Self::Speaking => 1..=3,
            _ => 0..=0,
        }
    }
}

impl std::fmt::Display for ExamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A question as authored, answer key included. The key is a JSON value so a
/// single shape covers single-blank strings, multi-blank arrays, and
/// true/false items.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prompt: String,
    pub answer: Value,
}

/// The same question with the answer key stripped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionView {
    pub id: String,
    pub prompt: String,
}

impl Question {
    fn view(&self) -> QuestionView {
        QuestionView {
            id: self.id.clone(),
            prompt: self.prompt.clone(),
        }
    }
}

/// Authored content payload, one shape per exam type. Speaking items are
/// authored one question at a time and assigned to a part via the content
/// row's `part` column.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ContentPayload {
    Reading {
        title: String,
        passage: String,
        questions: Vec<Question>,
    },
    Listening {
        title: String,
        audio_url: String,
        questions: Vec<Question>,
    },
    Writing {
        prompt: String,
        #[serde(default)]
        min_words: u32,
    },
    Speaking {
        prompt: String,
    },
}

impl ContentPayload {
    pub fn exam_type(&self) -> ExamType {
        match self {
            Self::Reading { .. } => ExamType::Reading,
            Self::Listening { .. } => ExamType::Listening,
            Self::Writing { .. } => ExamType::Writing,
            Self::Speaking { .. } => ExamType::Speaking,
        }
    }
}

/// One question of a speaking exam, with its source content id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpeakingPart {
    pub content_id: String,
    pub part: u8,
    pub prompt: String,
}

/// Content as embedded into an exam session and returned to the candidate.
/// Answer keys never appear here.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "exam_type", rename_all = "snake_case")]
pub enum ExamContent {
    Reading {
        content_id: String,
        title: String,
        passage: String,
        questions: Vec<QuestionView>,
    },
    Listening {
        content_id: String,
        title: String,
        audio_url: String,
        questions: Vec<QuestionView>,
    },
    Writing {
        content_id: String,
        prompt: String,
        min_words: u32,
    },
    Speaking {
        parts: [SpeakingPart; 3],
    },
}

/// A published content row picked for a session, payload already parsed and
/// validated against its `exam_type`/`part` columns.
#[derive(Clone, Debug)]
pub struct SelectedItem {
    pub content_id: String,
    pub part: u8,
    pub payload: ContentPayload,
}

fn answer_key(questions: &[Question]) -> Value {
    let mut map = serde_json::Map::new();
    for question in questions {
        map.insert(question.id.clone(), question.answer.clone());
    }
    Value::Object(map)
}

/// Builds the stripped session content plus, for objective types, the answer
/// key extracted from the picked item. Returns `None` when the picks do not
/// match the requested type (a content row was mislabeled).
pub fn assemble_content(
    exam_type: ExamType,
    picks: &[SelectedItem],
) -> Option<(ExamContent, Option<Value>)> {
    match exam_type {
        ExamType::Speaking => {
            let mut parts: Vec<SpeakingPart> = Vec::with_capacity(3);
            for want in 1..=3u8 {
                let item = picks.iter().find(|item| item.part == want)?;
                let ContentPayload::Speaking { prompt } = &item.payload else {
                    return None;
                };
                parts.push(SpeakingPart {
                    content_id: item.content_id.clone(),
                    part: want,
                    prompt: prompt.clone(),
                });
            }
            let parts: [SpeakingPart; 3] = parts.try_into().ok()?;
            Some((ExamContent::Speaking { parts }, None))
        }
        _ => {
            let item = picks.first()?;
            match (&item.payload, exam_type) {
                (
                    ContentPayload::Reading {
                        title,
                        passage,
                        questions,
                    },
                    ExamType::Reading,
                ) => Some((
                    ExamContent::Reading {
                        content_id: item.content_id.clone(),
                        title: title.clone(),
                        passage: passage.clone(),
                        questions: questions.iter().map(Question::view).collect(),
                    },
                    Some(answer_key(questions)),
                )),
                (
                    ContentPayload::Listening {
                        title,
                        audio_url,
                        questions,
                    },
                    ExamType::Listening,
                ) => Some((
                    ExamContent::Listening {
                        content_id: item.content_id.clone(),
                        title: title.clone(),
                        audio_url: audio_url.clone(),
                        questions: questions.iter().map(Question::view).collect(),
                    },
                    Some(answer_key(questions)),
                )),
                (ContentPayload::Writing { prompt, min_words }, ExamType::Writing) => Some((
                    ExamContent::Writing {
                        content_id: item.content_id.clone(),
                        prompt: prompt.clone(),
                        min_words: *min_words,
                    },
                    None,
                )),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reading_item() -> SelectedItem {
        SelectedItem {
            content_id: "c-1".to_string(),
            part: 0,
            payload: ContentPayload::Reading {
                title: "Tides".to_string(),
                passage: "…".to_string(),
                questions: vec![
                    Question {
                        id: "q1".to_string(),
                        prompt: "Capital of France?".to_string(),
                        answer: json!("Paris"),
                    },
                    Question {
                        id: "q2".to_string(),
                        prompt: "True or false?".to_string(),
                        answer: json!(true),
                    },
                ],
            },
        }
    }

    #[test]
    fn assemble_strips_answer_keys_from_content() {
        let (content, key) = assemble_content(ExamType::Reading, &[reading_item()]).expect("ok");
        let rendered = serde_json::to_string(&content).expect("json");
        assert!(!rendered.contains("Paris"));
        assert!(!rendered.contains("answer"));

        let key = key.expect("objective key");
        assert_eq!(key["q1"], json!("Paris"));
        assert_eq!(key["q2"], json!(true));
    }

    #[test]
    fn assemble_rejects_mislabeled_payload() {
        let mut item = reading_item();
        item.payload = ContentPayload::Writing {
            prompt: "Describe a chart".to_string(),
            min_words: 150,
        };
        assert!(assemble_content(ExamType::Reading, &[item]).is_none());
    }

    #[test]
    fn assemble_speaking_requires_all_three_parts() {
        let part = |n: u8| SelectedItem {
            content_id: format!("s-{n}"),
            part: n,
            payload: ContentPayload::Speaking {
                prompt: format!("part {n} question"),
            },
        };

        assert!(assemble_content(ExamType::Speaking, &[part(1), part(2)]).is_none());

        let (content, key) =
            assemble_content(ExamType::Speaking, &[part(3), part(1), part(2)]).expect("ok");
        assert!(key.is_none());
        let ExamContent::Speaking { parts } = content else {
            panic!("expected speaking content");
        };
        assert_eq!(parts[0].part, 1);
        assert_eq!(parts[2].part, 3);
    }
}
