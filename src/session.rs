use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::script::{BranchOutcome, ChoiceOption, Dialogue, Line, VoiceMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the first line of the transmission is shown.
    Idle,
    /// The typewriter is revealing the current line; a click skips.
    Typing,
    /// Reveal finished; a click advances to the next line.
    AwaitingLine,
    /// Choice buttons are up; automatic advance is blocked.
    AwaitingChoice,
    /// Terminal line acknowledged. Only replay or a retune exits.
    Ended,
    /// Both the live fetch and the static catalog failed. Dead air.
    NoSignal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressRecord {
    pub position: usize,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChoice {
    pub frequency: String,
    #[serde(rename = "choiceId")]
    pub choice_id: String,
    #[serde(rename = "optionId")]
    pub option_id: String,
    pub text: String,
}

/// What the renderer needs to put one line on the air. Voice and window
/// placement come from the speaking character's entry; `display_name` is
/// the character name unless the line carries a fake one.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedLine {
    pub display_name: String,
    pub text: String,
    pub portrait: Option<String>,
    pub display_window: u8,
    pub voice_mode: VoiceMode,
    pub voice_asset: Option<String>,
    pub choice: Option<(String, Vec<ChoiceOption>)>,
}

/// Side effects the session asks its owner to perform. The session itself
/// never touches the network, timers, or the screen.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    RenderLine(RenderedLine),
    SaveProgress { position: usize, completed: bool },
    SaveChoice(UserChoice),
    PersistRepeat(u32),
    Ended { offer_replay: bool },
}

/// Playback state for one open transmission. One instance per tuned
/// frequency; a retune drops it wholesale.
pub struct PlaybackSession {
    frequency: String,
    dialogue: Dialogue,
    choices: HashMap<String, UserChoice>,
    cursor: usize,
    ended: bool,
    phase: Phase,
    current_choice: Option<String>,
    repeat_count: u32,
}

impl PlaybackSession {
    pub fn new(
        frequency: impl Into<String>,
        dialogue: Dialogue,
        choices: Vec<UserChoice>,
        repeat_count: u32,
    ) -> Self {
        Self {
            frequency: frequency.into(),
            dialogue,
            choices: choices
                .into_iter()
                .map(|choice| (choice.choice_id.clone(), choice))
                .collect(),
            cursor: 0,
            ended: false,
            phase: Phase::Idle,
            current_choice: None,
            repeat_count,
        }
    }

    pub fn no_signal(frequency: impl Into<String>) -> Self {
        let mut session = Self::new(frequency, Dialogue::default(), Vec::new(), 0);
        session.phase = Phase::NoSignal;
        session
    }

    pub fn frequency(&self) -> &str {
        &self.frequency
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[cfg(test)]
    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn replay_available(&self) -> bool {
        self.phase == Phase::Ended && self.repeat_count == 0
    }

    /// Start or resume playback. A saved in-progress position is stepped
    /// back by one so the operator re-sees the line whose completion may
    /// never have been observed before the last unload.
    pub fn begin(&mut self, resume: Option<ProgressRecord>) -> Vec<SessionEffect> {
        if self.phase == Phase::NoSignal {
            return Vec::new();
        }
        if self.dialogue.conversations.is_empty() {
            self.phase = Phase::NoSignal;
            return Vec::new();
        }

        let len = self.dialogue.conversations.len();
        match resume {
            Some(record) if record.completed => {
                self.cursor = len;
                self.ended = true;
                self.phase = Phase::Ended;
                vec![SessionEffect::Ended {
                    offer_replay: self.repeat_count == 0,
                }]
            }
            Some(record) => {
                let restored = record.position.saturating_sub(1);
                // An out-of-range save is clamped, never treated as
                // completed; completion comes only from the final click.
                self.cursor = restored.min(len - 1);
                self.dispatch()
            }
            None => {
                self.cursor = 0;
                self.dispatch()
            }
        }
    }

    /// Interpret the line under the cursor, resolving branch pointers in
    /// place until a renderable line (or the end of the script) is reached.
    fn dispatch(&mut self) -> Vec<SessionEffect> {
        loop {
            if self.cursor >= self.dialogue.conversations.len() {
                // Trailing no-op lines were skipped past the end; close the
                // transmission rather than strand the operator.
                return self.finish();
            }
            match &self.dialogue.conversations[self.cursor] {
                Line::Simple { .. } | Line::Choice { .. } => {
                    self.phase = Phase::Typing;
                    let rendered = self.rendered_current();
                    return vec![SessionEffect::RenderLine(rendered)];
                }
                Line::BranchPointer { choice_id, .. } => {
                    let chosen = self
                        .choices
                        .get(choice_id)
                        .map(|choice| choice.option_id.clone());
                    match self
                        .dialogue
                        .resolve_branch_at(self.cursor, chosen.as_deref())
                    {
                        BranchOutcome::Substituted => continue,
                        BranchOutcome::SkippedEmpty | BranchOutcome::NotABranch => {
                            self.cursor += 1;
                        }
                    }
                }
                Line::Unknown => {
                    warn!(
                        frequency = %self.frequency,
                        cursor = self.cursor,
                        "skipping unrecognized line"
                    );
                    self.cursor += 1;
                }
            }
        }
    }

    /// The renderer's sole completion hook. Persists the cursor and either
    /// unblocks the advance click or raises the choice buttons.
    pub fn line_completed(&mut self) -> Vec<SessionEffect> {
        if self.phase != Phase::Typing {
            return Vec::new();
        }
        let save = SessionEffect::SaveProgress {
            position: self.cursor,
            completed: false,
        };
        match &self.dialogue.conversations[self.cursor] {
            Line::Choice { choice_id, .. } => {
                self.current_choice = Some(choice_id.clone());
                self.phase = Phase::AwaitingChoice;
            }
            _ => self.phase = Phase::AwaitingLine,
        }
        vec![save]
    }

    /// Click-to-advance from a finished line. Clicking past the terminal
    /// line is the explicit acknowledgment that completes the transmission.
    pub fn advance(&mut self) -> Vec<SessionEffect> {
        if self.phase != Phase::AwaitingLine {
            return Vec::new();
        }
        self.cursor += 1;
        self.dispatch()
    }

    /// Resolve the pending choice. Recording is idempotent per choice id
    /// (a later pick overwrites) and playback advances immediately; the
    /// write behind `SaveChoice` is fire-and-forget.
    pub fn choose(&mut self, option_id: &str) -> Vec<SessionEffect> {
        if self.phase != Phase::AwaitingChoice {
            return Vec::new();
        }
        let Some(choice_id) = self.current_choice.take() else {
            return Vec::new();
        };
        let text = match &self.dialogue.conversations[self.cursor] {
            Line::Choice { options, .. } => options
                .iter()
                .find(|option| option.id == option_id)
                .map(|option| option.text.clone())
                .unwrap_or_default(),
            _ => String::new(),
        };
        let choice = UserChoice {
            frequency: self.frequency.clone(),
            choice_id: choice_id.clone(),
            option_id: option_id.to_owned(),
            text,
        };
        self.choices.insert(choice_id, choice.clone());

        let mut effects = vec![SessionEffect::SaveChoice(choice)];
        self.cursor += 1;
        effects.extend(self.dispatch());
        effects
    }

    /// Restart from the top with a pristine script. Gated: replay is
    /// offered exactly once, when no prior repeat has been recorded.
    pub fn replay(&mut self, pristine: Dialogue) -> Vec<SessionEffect> {
        if !self.replay_available() {
            return Vec::new();
        }
        self.repeat_count += 1;
        self.dialogue = pristine;
        self.cursor = 0;
        self.ended = false;
        self.current_choice = None;
        self.phase = Phase::Idle;

        let mut effects = vec![SessionEffect::PersistRepeat(self.repeat_count)];
        effects.extend(self.begin(None));
        effects
    }

    fn finish(&mut self) -> Vec<SessionEffect> {
        self.ended = true;
        self.phase = Phase::Ended;
        vec![
            SessionEffect::SaveProgress {
                position: self.cursor,
                completed: true,
            },
            SessionEffect::Ended {
                offer_replay: self.repeat_count == 0,
            },
        ]
    }

    fn rendered_current(&self) -> RenderedLine {
        let (speaker, text, image, fake_name, choice) =
            match &self.dialogue.conversations[self.cursor] {
                Line::Simple {
                    speaker,
                    text,
                    image,
                    fake_name,
                } => (speaker, text, image, fake_name, None),
                Line::Choice {
                    speaker,
                    text,
                    image,
                    fake_name,
                    choice_id,
                    options,
                } => (
                    speaker,
                    text,
                    image,
                    fake_name,
                    Some((choice_id.clone(), options.clone())),
                ),
                _ => unreachable!("rendered_current called on non-renderable line"),
            };
        let character = self.dialogue.character(speaker);
        RenderedLine {
            display_name: fake_name.clone().unwrap_or_else(|| speaker.clone()),
            text: text.clone(),
            portrait: image
                .clone()
                .or_else(|| character.and_then(|ch| ch.portrait_image.clone())),
            display_window: character.map(|ch| ch.display_window).unwrap_or(1),
            voice_mode: character.map(|ch| ch.voice_mode).unwrap_or_default(),
            voice_asset: character.and_then(|ch| ch.voice_asset_ref.clone()),
            choice,
        }
    }
}
