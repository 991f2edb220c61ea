use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle, time::sleep};
use tracing::debug;

/// Additive delay after sentence punctuation, heaviest first.
const PERIOD_BONUS_MS: u64 = 320;
const EXCLAIM_BONUS_MS: u64 = 260;
const COLON_BONUS_MS: u64 = 180;
const COMMA_BONUS_MS: u64 = 120;

#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub min_char_delay_ms: u64,
    pub max_char_delay_ms: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            min_char_delay_ms: 18,
            max_char_delay_ms: 42,
        }
    }
}

/// A fully measured reveal: directive-free text plus one delay per
/// character. Pause directives `[2s]` fire before the character at their
/// offset; effect markers `[fx:name]` are stripped and surfaced as cues.
/// Directives sitting past the last character still count: trailing
/// pauses hold the line before completion and trailing cues fire then.
#[derive(Debug, Clone, Default)]
pub struct RevealPlan {
    pub text: String,
    pub delays: Vec<Duration>,
    pub effects: Vec<(usize, String)>,
    pub sounded: Vec<bool>,
    pub trailing_pause: Duration,
}

impl RevealPlan {
    pub fn char_count(&self) -> usize {
        self.delays.len()
    }
}

pub fn build_plan(raw: &str, pacing: Pacing, rng: &mut impl Rng) -> RevealPlan {
    let (text, pauses, effects) = strip_directives(raw);
    let chars: Vec<char> = text.chars().collect();

    let mut delays = Vec::with_capacity(chars.len());
    let mut sounded = Vec::with_capacity(chars.len());
    let lo = pacing.min_char_delay_ms.min(pacing.max_char_delay_ms);
    let hi = pacing.max_char_delay_ms.max(lo + 1);

    for (idx, ch) in chars.iter().enumerate() {
        let mut delay_ms = rng.gen_range(lo..hi);
        if idx > 0 {
            delay_ms += punctuation_bonus_ms(chars[idx - 1]);
        }
        let mut delay = Duration::from_millis(delay_ms);
        for (_, pause) in pauses.iter().filter(|(offset, _)| *offset == idx) {
            delay += *pause;
        }
        delays.push(delay);
        sounded.push(!ch.is_whitespace());
    }

    let trailing_pause = pauses
        .iter()
        .filter(|(offset, _)| *offset >= chars.len())
        .map(|(_, pause)| *pause)
        .sum();

    RevealPlan {
        text,
        delays,
        effects,
        sounded,
        trailing_pause,
    }
}

fn punctuation_bonus_ms(ch: char) -> u64 {
    match ch {
        '.' => PERIOD_BONUS_MS,
        '!' | '?' => EXCLAIM_BONUS_MS,
        ':' | ';' => COLON_BONUS_MS,
        ',' => COMMA_BONUS_MS,
        _ => 0,
    }
}

type Pauses = Vec<(usize, Duration)>;
type Effects = Vec<(usize, String)>;

/// Remove `[Ns]` pauses and `[fx:name]` markers, recording each against the
/// character offset it sat at in the cleaned text. Bracketed text that is
/// neither directive is kept verbatim.
fn strip_directives(raw: &str) -> (String, Pauses, Effects) {
    let mut text = String::with_capacity(raw.len());
    let mut pauses = Pauses::new();
    let mut effects = Effects::new();
    let mut offset = 0usize;

    let chars: Vec<char> = raw.chars().collect();
    let mut idx = 0;
    while idx < chars.len() {
        let ch = chars[idx];
        if ch == '[' {
            if let Some(close) = chars[idx..].iter().position(|c| *c == ']') {
                let inner: String = chars[idx + 1..idx + close].iter().collect();
                if let Some(pause) = parse_pause(&inner) {
                    pauses.push((offset, pause));
                    idx += close + 1;
                    continue;
                }
                if let Some(name) = inner.strip_prefix("fx:") {
                    effects.push((offset, name.trim().to_owned()));
                    idx += close + 1;
                    continue;
                }
            }
        }
        text.push(ch);
        offset += 1;
        idx += 1;
    }

    (text, pauses, effects)
}

fn parse_pause(inner: &str) -> Option<Duration> {
    let seconds = inner.strip_suffix('s')?.trim().parse::<f32>().ok()?;
    if !(0.0..=60.0).contains(&seconds) {
        return None;
    }
    Some(Duration::from_secs_f32(seconds))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypewriterEvent {
    Reveal { seq: u64, upto: usize },
    Effect { seq: u64, name: String },
    Completed { seq: u64 },
}

/// A running reveal task. Cancellation is explicit: the flag stops the loop
/// at the next tick and the abort tears down a pending sleep, so a skip or
/// retune leaves no stray timer behind.
pub struct TypewriterHandle {
    seq: u64,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TypewriterHandle {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn cancel(self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}

pub fn spawn_reveal(
    plan: RevealPlan,
    seq: u64,
    tx: UnboundedSender<TypewriterEvent>,
) -> TypewriterHandle {
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancel.clone();
    let handle = tokio::spawn(async move {
        for (idx, delay) in plan.delays.iter().enumerate() {
            if cancel_flag.load(Ordering::Relaxed) {
                debug!(seq, "reveal cancelled");
                return;
            }
            sleep(*delay).await;
            if cancel_flag.load(Ordering::Relaxed) {
                return;
            }
            for (_, name) in plan.effects.iter().filter(|(offset, _)| *offset == idx) {
                let _ = tx.send(TypewriterEvent::Effect {
                    seq,
                    name: name.clone(),
                });
            }
            if tx.send(TypewriterEvent::Reveal { seq, upto: idx + 1 }).is_err() {
                return;
            }
        }
        // Cues past the last character fire now, and a trailing pause
        // holds the line open before completion is announced.
        for (_, name) in plan
            .effects
            .iter()
            .filter(|(offset, _)| *offset >= plan.delays.len())
        {
            let _ = tx.send(TypewriterEvent::Effect {
                seq,
                name: name.clone(),
            });
        }
        if !plan.trailing_pause.is_zero() {
            sleep(plan.trailing_pause).await;
            if cancel_flag.load(Ordering::Relaxed) {
                return;
            }
        }
        let _ = tx.send(TypewriterEvent::Completed { seq });
    });
    TypewriterHandle { seq, cancel, handle }
}

#[cfg(test)]
mod tests {
    use super::{build_plan, spawn_reveal, strip_directives, Pacing, TypewriterEvent};
    use rand::rngs::mock::StepRng;
    use std::time::Duration;

    fn flat_rng() -> StepRng {
        // Always yields the low end of the range: bonuses become directly
        // observable in the per-char delays.
        StepRng::new(0, 0)
    }

    fn fixed_pacing() -> Pacing {
        Pacing {
            min_char_delay_ms: 20,
            max_char_delay_ms: 20,
        }
    }

    #[test]
    fn strips_pause_directive_and_records_offset() {
        let (text, pauses, effects) = strip_directives("Hold on.[2s] Okay.");
        assert_eq!(text, "Hold on. Okay.");
        assert_eq!(pauses, vec![(8, Duration::from_secs(2))]);
        assert!(effects.is_empty());
    }

    #[test]
    fn strips_effect_marker_and_keeps_plain_brackets() {
        let (text, pauses, effects) = strip_directives("[fx:glitch]signal [lost]");
        assert_eq!(text, "signal [lost]");
        assert!(pauses.is_empty());
        assert_eq!(effects, vec![(0, "glitch".to_owned())]);
    }

    #[test]
    fn fractional_pause_parses() {
        let (_, pauses, _) = strip_directives("a[0.5s]b");
        assert_eq!(pauses, vec![(1, Duration::from_secs_f32(0.5))]);
    }

    #[test]
    fn plan_measures_cleaned_text() {
        let mut rng = flat_rng();
        let plan = build_plan("Hi.[1s] Bye", fixed_pacing(), &mut rng);
        assert_eq!(plan.text, "Hi. Bye");
        assert_eq!(plan.char_count(), 7);
        assert_eq!(plan.delays.len(), plan.sounded.len());
    }

    #[test]
    fn pause_is_added_before_char_at_offset() {
        let mut rng = flat_rng();
        let plan = build_plan("ab[3s]cd", fixed_pacing(), &mut rng);
        // Pause lands on 'c' (offset 2), before it is revealed.
        assert!(plan.delays[2] >= Duration::from_secs(3));
        assert!(plan.delays[1] < Duration::from_secs(1));
        assert!(plan.delays[3] < Duration::from_secs(1));
    }

    #[test]
    fn punctuation_bonuses_descend_period_first() {
        let mut rng = flat_rng();
        let plan = build_plan("a.b!c:d,e f", fixed_pacing(), &mut rng);
        let after_period = plan.delays[2];
        let after_exclaim = plan.delays[4];
        let after_colon = plan.delays[6];
        let after_comma = plan.delays[8];
        let after_plain = plan.delays[10];
        assert!(after_period > after_exclaim);
        assert!(after_exclaim > after_colon);
        assert!(after_colon > after_comma);
        assert!(after_comma > after_plain);
    }

    #[test]
    fn adjacent_pauses_at_one_offset_accumulate() {
        let mut rng = flat_rng();
        let plan = build_plan("a[1s][1s]b", fixed_pacing(), &mut rng);
        assert!(plan.delays[1] >= Duration::from_secs(2));
    }

    #[test]
    fn trailing_pause_holds_the_line_open() {
        let mut rng = flat_rng();
        let plan = build_plan("a[2s]", fixed_pacing(), &mut rng);
        assert_eq!(plan.char_count(), 1);
        assert_eq!(plan.trailing_pause, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_effect_cue_fires_before_completion() {
        let mut rng = flat_rng();
        let plan = build_plan("abc[fx:end]", fixed_pacing(), &mut rng);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = spawn_reveal(plan, 4, tx);

        let mut cue_seen = false;
        while let Some(event) = rx.recv().await {
            match event {
                TypewriterEvent::Effect { name, .. } => {
                    assert_eq!(name, "end");
                    cue_seen = true;
                }
                TypewriterEvent::Completed { .. } => {
                    assert!(cue_seen, "end-of-line cue must fire before completion");
                }
                TypewriterEvent::Reveal { .. } => {}
            }
        }
        assert!(cue_seen);
    }

    #[test]
    fn whitespace_is_not_sounded() {
        let mut rng = flat_rng();
        let plan = build_plan("a b", fixed_pacing(), &mut rng);
        assert_eq!(plan.sounded, vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn reveal_task_emits_every_char_then_completes_once() {
        let mut rng = flat_rng();
        let plan = build_plan("abc", fixed_pacing(), &mut rng);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = spawn_reveal(plan, 7, tx);

        let mut reveals = 0;
        let mut completions = 0;
        while let Some(event) = rx.recv().await {
            match event {
                TypewriterEvent::Reveal { seq, upto } => {
                    assert_eq!(seq, 7);
                    reveals = reveals.max(upto);
                }
                TypewriterEvent::Completed { seq } => {
                    assert_eq!(seq, 7);
                    completions += 1;
                }
                TypewriterEvent::Effect { .. } => {}
            }
        }
        assert_eq!(reveals, 3);
        assert_eq!(completions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reveal_never_completes() {
        let mut rng = flat_rng();
        let plan = build_plan("abcdef", fixed_pacing(), &mut rng);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_reveal(plan, 1, tx);

        // Let at least one char through, then cancel mid-reveal.
        let first = rx.recv().await;
        assert!(matches!(first, Some(TypewriterEvent::Reveal { .. })));
        handle.cancel();

        while let Some(event) = rx.recv().await {
            assert!(
                !matches!(event, TypewriterEvent::Completed { .. }),
                "cancelled reveal must not complete"
            );
        }
    }
}
