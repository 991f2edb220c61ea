use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VoiceMode {
    #[default]
    None,
    Typing,
    Voiceline,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Character {
    pub name: String,
    pub portrait_image: Option<String>,
    pub voice_asset_ref: Option<String>,
    pub voice_mode: VoiceMode,
    #[serde(default = "default_display_window")]
    pub display_window: u8,
}

fn default_display_window() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub text: String,
}

/// One slot of a conversation. The normalizing parser builds these once at
/// load time; downstream code matches on the variant and never re-sniffs
/// the wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Simple {
        speaker: String,
        text: String,
        image: Option<String>,
        fake_name: Option<String>,
    },
    Choice {
        speaker: String,
        text: String,
        image: Option<String>,
        fake_name: Option<String>,
        choice_id: String,
        options: Vec<ChoiceOption>,
    },
    BranchPointer {
        choice_id: String,
        responses: Vec<(String, Vec<Line>)>,
    },
    /// Unrecognized wire shape. Kept so the cursor math stays intact; the
    /// session skips these with a warning.
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Branch {
    pub choice_id: String,
    pub responses: Vec<(String, Vec<Line>)>,
}

#[derive(Debug, Clone, Default)]
pub struct Dialogue {
    pub characters: Vec<Character>,
    pub conversations: Vec<Line>,
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    /// The slot at the cursor was replaced by the first response line and
    /// the remainder spliced in after it.
    Substituted,
    /// The resolved response array was empty; nothing was rendered or
    /// inserted and the caller should step past the slot.
    SkippedEmpty,
    NotABranch,
}

impl Dialogue {
    pub fn character(&self, name: &str) -> Option<&Character> {
        self.characters.iter().find(|ch| ch.name == name)
    }

    /// Resolve a branch pointer sitting at `cursor`, substituting the chosen
    /// response in place. `chosen` is the option id recorded for this
    /// choice, if any; with no usable recorded choice the first declared
    /// option wins so playback never dead-ends.
    pub fn resolve_branch_at(&mut self, cursor: usize, chosen: Option<&str>) -> BranchOutcome {
        let Some(Line::BranchPointer {
            choice_id,
            responses,
        }) = self.conversations.get(cursor)
        else {
            return BranchOutcome::NotABranch;
        };

        let responses = if responses.is_empty() {
            let choice_id = choice_id.clone();
            self.branches
                .iter()
                .find(|branch| branch.choice_id == choice_id)
                .map(|branch| branch.responses.clone())
                .unwrap_or_default()
        } else {
            responses.clone()
        };

        let picked = chosen
            .and_then(|id| {
                responses
                    .iter()
                    .find(|(option_id, lines)| option_id == id && !lines.is_empty())
            })
            .or_else(|| responses.first())
            .map(|(_, lines)| lines.clone())
            .unwrap_or_default();

        if picked.is_empty() {
            return BranchOutcome::SkippedEmpty;
        }

        self.conversations
            .splice(cursor..cursor + 1, picked.into_iter());
        BranchOutcome::Substituted
    }
}

/// Parse a full dialogue document. Accepts both the current object-encoded
/// line form and the legacy array form; anything unrecognized becomes
/// `Line::Unknown` rather than failing the whole script.
pub fn parse_dialogue(raw: &Value) -> Dialogue {
    let characters = raw
        .get("characters")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    serde_json::from_value::<Character>(entry.clone())
                        .map_err(|err| warn!(?err, "dropping malformed character entry"))
                        .ok()
                })
                .collect()
        })
        .unwrap_or_default();

    let conversations = raw
        .get("conversations")
        .and_then(Value::as_array)
        .map(|entries| entries.iter().map(parse_line).collect())
        .unwrap_or_default();

    let branches = raw
        .get("branches")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(choice_id, responses)| Branch {
                    choice_id: choice_id.clone(),
                    responses: parse_responses(responses),
                })
                .collect()
        })
        .unwrap_or_default();

    Dialogue {
        characters,
        conversations,
        branches,
    }
}

pub fn parse_line(raw: &Value) -> Line {
    match raw {
        Value::Array(fields) => parse_array_line(fields),
        Value::Object(_) => parse_object_line(raw),
        other => {
            warn!(shape = ?other, "unrecognized line shape");
            Line::Unknown
        }
    }
}

/// Legacy form: `[speaker, text, image, fakeName, choiceMeta?]`, trailing
/// entries optional and nullable.
fn parse_array_line(fields: &[Value]) -> Line {
    let speaker = fields.first().and_then(Value::as_str);
    let text = fields.get(1).and_then(Value::as_str);
    let (Some(speaker), Some(text)) = (speaker, text) else {
        warn!("array-encoded line missing speaker or text");
        return Line::Unknown;
    };
    let image = fields.get(2).and_then(Value::as_str).map(str::to_owned);
    let fake_name = fields.get(3).and_then(Value::as_str).map(str::to_owned);

    if let Some(meta) = fields.get(4).filter(|meta| meta.is_object()) {
        if let Some((choice_id, options)) = parse_choice_meta(meta) {
            return Line::Choice {
                speaker: speaker.to_owned(),
                text: text.to_owned(),
                image,
                fake_name,
                choice_id,
                options,
            };
        }
        warn!("array-encoded line carries unusable choice metadata; treating as simple");
    }

    Line::Simple {
        speaker: speaker.to_owned(),
        text: text.to_owned(),
        image,
        fake_name,
    }
}

fn parse_object_line(raw: &Value) -> Line {
    let choice_id = string_field(raw, &["choiceId", "choice_id"]);
    let speaker = string_field(raw, &["speaker"]);
    let text = string_field(raw, &["text"]);

    // A pointer carries a choice id but no renderable text of its own.
    if let Some(choice_id) = choice_id.clone().filter(|_| text.is_none()) {
        let responses = raw
            .get("responses")
            .map(parse_responses)
            .unwrap_or_default();
        return Line::BranchPointer {
            choice_id,
            responses,
        };
    }

    let (Some(speaker), Some(text)) = (speaker, text) else {
        warn!("object-encoded line missing speaker or text");
        return Line::Unknown;
    };
    let image = string_field(raw, &["image"]);
    let fake_name = string_field(raw, &["fakeName", "fake_name"]);

    if let Some(choice_id) = choice_id {
        let options = raw
            .get("options")
            .map(parse_options)
            .unwrap_or_default();
        if !options.is_empty() {
            return Line::Choice {
                speaker,
                text,
                image,
                fake_name,
                choice_id,
                options,
            };
        }
        warn!(choice_id = %choice_id, "choice line without options; treating as simple");
    }

    Line::Simple {
        speaker,
        text,
        image,
        fake_name,
    }
}

fn parse_choice_meta(meta: &Value) -> Option<(String, Vec<ChoiceOption>)> {
    let choice_id = string_field(meta, &["choiceId", "choice_id"])?;
    let options = meta.get("options").map(parse_options).unwrap_or_default();
    if options.is_empty() {
        return None;
    }
    Some((choice_id, options))
}

fn parse_options(raw: &Value) -> Vec<ChoiceOption> {
    raw.as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let id = string_field(entry, &["id"])?;
                    let text = string_field(entry, &["text"]).unwrap_or_else(|| id.clone());
                    Some(ChoiceOption { id, text })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Response arrays keyed by option id. Declaration order is load-bearing:
/// the first declared option is the fallback when no choice is recorded.
fn parse_responses(raw: &Value) -> Vec<(String, Vec<Line>)> {
    raw.as_object()
        .map(|map| {
            map.iter()
                .map(|(option_id, lines)| {
                    let lines = lines
                        .as_array()
                        .map(|entries| entries.iter().map(parse_line).collect())
                        .unwrap_or_default();
                    (option_id.clone(), lines)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn string_field(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        raw.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_dialogue, parse_line, BranchOutcome, Line};
    use serde_json::json;

    fn simple(speaker: &str, text: &str) -> Line {
        Line::Simple {
            speaker: speaker.to_owned(),
            text: text.to_owned(),
            image: None,
            fake_name: None,
        }
    }

    #[test]
    fn parses_legacy_array_line() {
        let line = parse_line(&json!(["operator", "Do you copy?", null, "???"]));
        match line {
            Line::Simple {
                speaker,
                text,
                image,
                fake_name,
            } => {
                assert_eq!(speaker, "operator");
                assert_eq!(text, "Do you copy?");
                assert!(image.is_none());
                assert_eq!(fake_name.as_deref(), Some("???"));
            }
            other => panic!("expected simple line, got {other:?}"),
        }
    }

    #[test]
    fn parses_legacy_array_choice_line() {
        let line = parse_line(&json!([
            "operator",
            "Stay or go?",
            null,
            null,
            {"choiceId": "c1", "options": [{"id": "stay", "text": "Stay"}, {"id": "go", "text": "Go"}]}
        ]));
        match line {
            Line::Choice {
                choice_id, options, ..
            } => {
                assert_eq!(choice_id, "c1");
                assert_eq!(options.len(), 2);
                assert_eq!(options[0].id, "stay");
            }
            other => panic!("expected choice line, got {other:?}"),
        }
    }

    #[test]
    fn object_and_array_forms_normalize_identically() {
        let from_array = parse_line(&json!(["ghost", "static...", "ghost.png", null]));
        let from_object = parse_line(&json!({
            "speaker": "ghost",
            "text": "static...",
            "image": "ghost.png"
        }));
        assert_eq!(from_array, from_object);
    }

    #[test]
    fn pointer_without_text_parses_as_branch_pointer() {
        let line = parse_line(&json!({
            "choiceId": "c1",
            "responses": {"go": [["op", "You went."]], "stay": [["op", "You stayed."]]}
        }));
        match line {
            Line::BranchPointer {
                choice_id,
                responses,
            } => {
                assert_eq!(choice_id, "c1");
                assert_eq!(responses[0].0, "go");
                assert_eq!(responses[1].0, "stay");
            }
            other => panic!("expected branch pointer, got {other:?}"),
        }
    }

    #[test]
    fn malformed_line_becomes_unknown() {
        assert_eq!(parse_line(&json!(42)), Line::Unknown);
        assert_eq!(parse_line(&json!([null, null])), Line::Unknown);
        assert_eq!(parse_line(&json!({"weird": true})), Line::Unknown);
    }

    #[test]
    fn branch_substitution_replaces_slot_and_splices_rest() {
        let mut dialogue = parse_dialogue(&json!({
            "conversations": [
                ["op", "line0"],
                {"choiceId": "c1", "responses": {
                    "x": [["op", "b0"], ["op", "b1"]],
                    "y": [["op", "c0"]]
                }},
                ["op", "line2"]
            ]
        }));

        let outcome = dialogue.resolve_branch_at(1, Some("x"));
        assert_eq!(outcome, BranchOutcome::Substituted);
        assert_eq!(
            dialogue.conversations,
            vec![
                simple("op", "line0"),
                simple("op", "b0"),
                simple("op", "b1"),
                simple("op", "line2"),
            ]
        );
    }

    #[test]
    fn branch_fallback_is_first_declared_option() {
        let raw = json!({
            "conversations": [
                {"choiceId": "c1", "responses": {
                    "a": [["op", "first-wins"]],
                    "b": [["op", "never"]]
                }}
            ]
        });
        // No recorded choice: the first declared option must win, and must
        // keep winning across repeated resolutions of fresh copies.
        for _ in 0..3 {
            let mut dialogue = parse_dialogue(&raw);
            assert_eq!(
                dialogue.resolve_branch_at(0, None),
                BranchOutcome::Substituted
            );
            assert_eq!(dialogue.conversations[0], simple("op", "first-wins"));
        }
    }

    #[test]
    fn chosen_option_without_responses_falls_back() {
        let mut dialogue = parse_dialogue(&json!({
            "conversations": [
                {"choiceId": "c1", "responses": {
                    "a": [["op", "fallback"]],
                    "b": []
                }}
            ]
        }));
        assert_eq!(
            dialogue.resolve_branch_at(0, Some("b")),
            BranchOutcome::Substituted
        );
        assert_eq!(dialogue.conversations[0], simple("op", "fallback"));
    }

    #[test]
    fn empty_branch_resolves_to_silent_skip() {
        let mut dialogue = parse_dialogue(&json!({
            "conversations": [{"choiceId": "c1", "responses": {}}]
        }));
        assert_eq!(
            dialogue.resolve_branch_at(0, None),
            BranchOutcome::SkippedEmpty
        );
        assert_eq!(dialogue.conversations.len(), 1);
    }

    #[test]
    fn pointer_falls_back_to_named_branch_table() {
        let mut dialogue = parse_dialogue(&json!({
            "conversations": [{"choiceId": "c1"}],
            "branches": {"c1": {"x": [["op", "from-table"]]}}
        }));
        assert_eq!(
            dialogue.resolve_branch_at(0, Some("x")),
            BranchOutcome::Substituted
        );
        assert_eq!(dialogue.conversations[0], simple("op", "from-table"));
    }

    #[test]
    fn parses_characters_with_defaults() {
        let dialogue = parse_dialogue(&json!({
            "characters": [
                {"name": "operator", "voiceMode": "typing", "displayWindow": 2},
                {"name": "ghost"}
            ],
            "conversations": []
        }));
        assert_eq!(dialogue.characters.len(), 2);
        assert_eq!(dialogue.characters[0].display_window, 2);
        assert_eq!(dialogue.characters[1].display_window, 1);
        assert!(dialogue.character("ghost").is_some());
        assert!(dialogue.character("nobody").is_none());
    }
}
