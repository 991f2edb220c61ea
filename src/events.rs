use crate::script::ChoiceOption;
use crate::session::Phase;

/// Operator input, forwarded from the egui shell to the engine task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    /// Click on the transmission panel: skip during Typing, advance when
    /// a line is waiting, acknowledge at the end.
    Advance,
    Choose(String),
    Replay,
    TuneNext,
    TunePrev,
    Tune(String),
}

/// Snapshot of everything the shell needs to draw one frame. The engine
/// owns all playback state; the shell only renders the latest snapshot.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub frequency: String,
    pub username: Option<String>,
    pub connected: bool,
    pub phase: Phase,
    pub display_name: String,
    pub portrait: Option<String>,
    pub display_window: u8,
    pub full_text: String,
    pub revealed_chars: usize,
    pub options: Vec<ChoiceOption>,
    pub replay_offered: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            frequency: String::new(),
            username: None,
            connected: false,
            phase: Phase::Idle,
            display_name: String::new(),
            portrait: None,
            display_window: 1,
            full_text: String::new(),
            revealed_chars: 0,
            options: Vec::new(),
            replay_offered: false,
        }
    }
}

impl ViewState {
    pub fn revealed_text(&self) -> String {
        self.full_text.chars().take(self.revealed_chars).collect()
    }
}

/// Engine-to-shell notifications, drained each frame.
#[derive(Debug, Clone)]
pub enum UiEvent {
    View(Box<ViewState>),
    /// A named easter-egg cue stripped from the line text.
    Effect(String),
}

#[cfg(test)]
mod tests {
    use super::ViewState;

    #[test]
    fn revealed_text_is_a_char_prefix() {
        let view = ViewState {
            full_text: "héllo".to_owned(),
            revealed_chars: 2,
            ..ViewState::default()
        };
        assert_eq!(view.revealed_text(), "hé");
    }
}
