use std::{collections::HashMap, path::PathBuf, sync::Arc};

use crossbeam_channel::Sender as UiSender;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::{
    api::RadioApi,
    audio::{VoicePlayer, VoiceRequest},
    catalog::{self, Catalog, CatalogLoader},
    config::TerminalConfig,
    events::{UiCommand, UiEvent, ViewState},
    local_store::LocalStore,
    progress::ProgressStore,
    script::{parse_dialogue, Dialogue, VoiceMode},
    session::{Phase, PlaybackSession, ProgressRecord, SessionEffect, UserChoice},
    typewriter::{self, Pacing, RevealPlan, TypewriterEvent, TypewriterHandle},
};

const ANONYMOUS_USER: &str = "anonymous";

/// Results of background fetches, tagged with the tune generation they
/// were started under so stale loads are dropped after a retune.
enum NetEvent {
    DialogueLoaded {
        generation: u64,
        frequency: String,
        dialogue: Option<Dialogue>,
        choices: Vec<UserChoice>,
    },
}

/// The controller task: owns the playback session, all adapters, and the
/// typewriter; the UI only exchanges commands and view snapshots with it.
pub struct Engine {
    api: RadioApi,
    catalog_loader: CatalogLoader,
    store: Arc<ProgressStore<RadioApi>>,
    local: Option<LocalStore>,
    audio: Option<VoicePlayer>,
    config: TerminalConfig,

    session: Option<PlaybackSession>,
    pristine: HashMap<String, Dialogue>,
    choices_cache: HashMap<String, Vec<UserChoice>>,
    progress: HashMap<String, ProgressRecord>,
    repeats: HashMap<String, u32>,
    catalog: Catalog,
    available: Option<Vec<String>>,
    user_id: String,
    connected: bool,

    view: ViewState,
    plan: Option<RevealPlan>,
    current_voice: (VoiceMode, Option<String>),
    typewriter: Option<TypewriterHandle>,
    seq: u64,
    generation: u64,

    ui_tx: UiSender<UiEvent>,
    cmd_rx: UnboundedReceiver<UiCommand>,
    tw_tx: UnboundedSender<TypewriterEvent>,
    tw_rx: UnboundedReceiver<TypewriterEvent>,
    net_tx: UnboundedSender<NetEvent>,
    net_rx: UnboundedReceiver<NetEvent>,
}

/// Spawn the engine task; the returned sender is the shell's command line
/// into it.
pub fn spawn(config: TerminalConfig, ui_tx: UiSender<UiEvent>) -> UnboundedSender<UiCommand> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (tw_tx, tw_rx) = mpsc::unbounded_channel();
    let (net_tx, net_rx) = mpsc::unbounded_channel();

    let api = RadioApi::new(&config.server_url);
    let audio = config.play_voice_audio.then(VoicePlayer::new);
    let local = LocalStore::open_default()
        .map_err(|err| warn!(?err, "local store unavailable; running without fallback"))
        .ok();

    let engine = Engine {
        store: Arc::new(ProgressStore::new(api.clone())),
        api,
        catalog_loader: CatalogLoader::new(),
        local,
        audio,
        config,
        session: None,
        pristine: HashMap::new(),
        choices_cache: HashMap::new(),
        progress: HashMap::new(),
        repeats: HashMap::new(),
        catalog: Catalog::default(),
        available: None,
        user_id: ANONYMOUS_USER.to_owned(),
        connected: false,
        view: ViewState::default(),
        plan: None,
        current_voice: (VoiceMode::None, None),
        typewriter: None,
        seq: 0,
        generation: 0,
        ui_tx,
        cmd_rx,
        tw_tx,
        tw_rx,
        net_tx,
        net_rx,
    };
    tokio::spawn(engine.run());
    cmd_tx
}

impl Engine {
    async fn run(mut self) {
        self.bootstrap().await;
        if let Some(first) = self.first_tunable() {
            self.tune(&first);
        }

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }
                event = self.tw_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_typewriter(event);
                    }
                }
                event = self.net_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_net(event);
                    }
                }
            }
        }
        self.teardown_playback();
        info!("engine shut down");
    }

    /// One-shot startup fetches. Every failure degrades: missing auth means
    /// the anonymous identity, missing progress means a fresh start, and
    /// the local mirror covers repeat counts through an outage.
    async fn bootstrap(&mut self) {
        match self.api.fetch_auth_status().await {
            Ok(auth) if auth.authenticated => {
                self.connected = true;
                self.view.username = auth.username.clone();
                self.user_id = auth
                    .user_id
                    .or(auth.username)
                    .unwrap_or_else(|| ANONYMOUS_USER.to_owned());
            }
            Ok(_) => {
                self.connected = true;
                debug!("not authenticated; using anonymous identity");
            }
            Err(err) => warn!(?err, "auth status unavailable"),
        }

        self.catalog = self.catalog_loader.load(&self.api).await;

        self.available = match self.api.fetch_available(&self.user_id).await {
            Ok(list) if !list.is_empty() => Some(list),
            Ok(_) => None,
            Err(err) => {
                debug!(?err, "available-frequency fetch failed; treating access as wildcard");
                None
            }
        };

        // Fetch errors read as "no progress": playback starts fresh and
        // retries only on the next explicit load.
        self.progress = self.api.fetch_progress(&self.user_id).await.unwrap_or_else(|err| {
            warn!(?err, "progress fetch failed; starting fresh");
            HashMap::new()
        });

        let server_repeats = self.api.fetch_repeats(&self.user_id).await.unwrap_or_else(|err| {
            debug!(?err, "repeat-count fetch failed; using local mirror only");
            HashMap::new()
        });
        self.repeats = match &self.local {
            Some(local) => local
                .reconcile_repeats(&self.user_id, &server_repeats)
                .unwrap_or_else(|err| {
                    warn!(?err, "repeat-count reconcile failed");
                    server_repeats
                }),
            None => server_repeats,
        };

        self.view.connected = self.connected;
        self.push_view();
    }

    fn first_tunable(&self) -> Option<String> {
        self.catalog
            .frequencies
            .iter()
            .find(|freq| {
                self.available
                    .as_deref()
                    .map(|allowed| allowed.iter().any(|a| a == *freq))
                    .unwrap_or(true)
            })
            .cloned()
    }

    fn handle_command(&mut self, command: UiCommand) {
        match command {
            UiCommand::Advance => self.advance_clicked(),
            UiCommand::Choose(option_id) => {
                if let Some(session) = self.session.as_mut() {
                    let effects = session.choose(&option_id);
                    self.apply_effects(effects);
                }
            }
            UiCommand::Replay => self.replay_clicked(),
            UiCommand::TuneNext => self.step_dial(true),
            UiCommand::TunePrev => self.step_dial(false),
            UiCommand::Tune(frequency) => self.tune(&frequency),
        }
    }

    fn advance_clicked(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.phase() {
            Phase::Typing => {
                // Skip: full text instantly, timers and audio cancelled,
                // completion dispatched exactly once from here.
                if let Some(handle) = self.typewriter.take() {
                    handle.cancel();
                }
                if let Some(audio) = &self.audio {
                    audio.stop_all();
                }
                self.view.revealed_chars = self
                    .plan
                    .as_ref()
                    .map(|plan| plan.char_count())
                    .unwrap_or(0);
                let effects = session.line_completed();
                self.apply_effects(effects);
            }
            Phase::AwaitingLine => {
                let effects = session.advance();
                self.apply_effects(effects);
            }
            _ => {}
        }
    }

    fn replay_clicked(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(pristine) = self.pristine.get(session.frequency()).cloned() else {
            return;
        };
        let effects = session.replay(pristine);
        if !effects.is_empty() {
            self.view.replay_offered = false;
            self.apply_effects(effects);
        }
    }

    fn step_dial(&mut self, forward: bool) {
        let current = self.view.frequency.clone();
        if let Some(next) = catalog::step_frequency(
            &self.catalog.frequencies,
            self.available.as_deref(),
            &current,
            forward,
        ) {
            if next != current {
                self.tune(&next);
            }
        }
    }

    /// Full teardown and retune. Any state exits to Idle here: pending
    /// timers and audio are cancelled before the new channel loads.
    fn tune(&mut self, frequency: &str) {
        self.teardown_playback();
        self.generation += 1;
        self.session = None;

        self.view = ViewState {
            frequency: frequency.to_owned(),
            username: self.view.username.clone(),
            connected: self.connected,
            ..ViewState::default()
        };
        self.push_view();

        if self.pristine.contains_key(frequency) {
            self.begin_session(frequency.to_owned());
            return;
        }

        let api = self.api.clone();
        let local = self.local.clone();
        let net_tx = self.net_tx.clone();
        let generation = self.generation;
        let user_id = self.user_id.clone();
        let frequency = frequency.to_owned();
        tokio::spawn(async move {
            let dialogue = match api.fetch_dialogue(&frequency).await {
                Ok(raw) => Some(parse_dialogue(&raw)),
                Err(err) => {
                    warn!(?err, frequency = %frequency, "dialogue fetch failed; trying static catalog");
                    catalog::static_dialogue(&frequency)
                }
            };
            let mut choices = api.fetch_choices(&user_id, &frequency).await.unwrap_or_else(|err| {
                debug!(?err, frequency = %frequency, "choice fetch failed");
                Vec::new()
            });
            if let Some(local) = &local {
                if let Ok(cached) = local.cached_choices(&user_id, &frequency) {
                    for choice in cached {
                        if !choices.iter().any(|c| c.choice_id == choice.choice_id) {
                            choices.push(choice);
                        }
                    }
                }
            }
            let _ = net_tx.send(NetEvent::DialogueLoaded {
                generation,
                frequency,
                dialogue,
                choices,
            });
        });
    }

    fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::DialogueLoaded {
                generation,
                frequency,
                dialogue,
                choices,
            } => {
                if generation != self.generation {
                    debug!(frequency = %frequency, "dropping stale dialogue load");
                    return;
                }
                if let Some(dialogue) = dialogue {
                    self.pristine.insert(frequency.clone(), dialogue);
                }
                self.choices_cache.insert(frequency.clone(), choices);
                self.begin_session(frequency);
            }
        }
    }

    fn begin_session(&mut self, frequency: String) {
        let mut session = match self.pristine.get(&frequency) {
            Some(dialogue) => PlaybackSession::new(
                frequency.clone(),
                dialogue.clone(),
                self.choices_cache.get(&frequency).cloned().unwrap_or_default(),
                self.repeats.get(&frequency).copied().unwrap_or(0),
            ),
            None => PlaybackSession::no_signal(frequency.clone()),
        };
        let resume = self.progress.get(&frequency).copied();
        let effects = session.begin(resume);
        self.session = Some(session);
        self.apply_effects(effects);
    }

    fn apply_effects(&mut self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::RenderLine(line) => self.start_reveal(line),
                SessionEffect::SaveProgress {
                    position,
                    completed,
                } => self.persist_progress(position, completed),
                SessionEffect::SaveChoice(choice) => self.persist_choice(choice),
                SessionEffect::PersistRepeat(count) => self.persist_repeat(count),
                SessionEffect::Ended { offer_replay } => {
                    self.view.replay_offered = offer_replay;
                }
            }
        }
        if let Some(session) = &self.session {
            self.view.phase = session.phase();
        }
        self.push_view();
    }

    fn start_reveal(&mut self, line: crate::session::RenderedLine) {
        let pacing = Pacing {
            min_char_delay_ms: self.config.typing.min_char_delay_ms,
            max_char_delay_ms: self.config.typing.max_char_delay_ms,
        };
        let plan = typewriter::build_plan(&line.text, pacing, &mut rand::thread_rng());

        self.seq += 1;
        if let Some(handle) = self.typewriter.take() {
            handle.cancel();
        }
        self.typewriter = Some(typewriter::spawn_reveal(
            plan.clone(),
            self.seq,
            self.tw_tx.clone(),
        ));

        if line.voice_mode == VoiceMode::Voiceline {
            if let (Some(audio), Some(asset)) = (&self.audio, &line.voice_asset) {
                audio.play(VoiceRequest::Voiceline {
                    path: self.asset_path(asset),
                    volume: self.config.voice_master_volume,
                });
            }
        }

        self.view.display_name = line.display_name;
        self.view.portrait = line.portrait;
        self.view.display_window = line.display_window;
        self.view.full_text = plan.text.clone();
        self.view.revealed_chars = 0;
        self.view.options = line
            .choice
            .map(|(_, options)| options)
            .unwrap_or_default();
        self.view.replay_offered = false;

        self.plan = Some(plan);
        self.current_voice = (line.voice_mode, line.voice_asset);
    }

    fn handle_typewriter(&mut self, event: TypewriterEvent) {
        let current = self.typewriter.as_ref().map(TypewriterHandle::seq);
        match event {
            TypewriterEvent::Reveal { seq, upto } => {
                if current != Some(seq) {
                    return;
                }
                self.view.revealed_chars = upto;
                self.play_typing_blip(upto);
                self.push_view();
            }
            TypewriterEvent::Effect { seq, name } => {
                if current == Some(seq) {
                    let _ = self.ui_tx.send(UiEvent::Effect(name));
                }
            }
            TypewriterEvent::Completed { seq } => {
                if current != Some(seq) {
                    return;
                }
                self.typewriter = None;
                self.view.revealed_chars = self
                    .plan
                    .as_ref()
                    .map(RevealPlan::char_count)
                    .unwrap_or(self.view.revealed_chars);
                if let Some(session) = self.session.as_mut() {
                    if session.phase() == Phase::Typing {
                        let effects = session.line_completed();
                        self.apply_effects(effects);
                    }
                }
            }
        }
    }

    fn play_typing_blip(&self, upto: usize) {
        let (mode, asset) = &self.current_voice;
        if *mode != VoiceMode::Typing {
            return;
        }
        let (Some(audio), Some(asset)) = (&self.audio, asset) else {
            return;
        };
        let sounded = self
            .plan
            .as_ref()
            .and_then(|plan| plan.sounded.get(upto.saturating_sub(1)))
            .copied()
            .unwrap_or(false);
        if sounded {
            audio.play(VoiceRequest::TypingBlip {
                path: self.asset_path(asset),
                volume: self.config.voice_master_volume * 0.6,
            });
        }
    }

    fn persist_progress(&mut self, position: usize, completed: bool) {
        let Some(frequency) = self.session.as_ref().map(|s| s.frequency().to_owned()) else {
            return;
        };
        // Optimistic in-memory record; completion is monotonic here too.
        let entry = self.progress.entry(frequency.clone()).or_default();
        entry.position = position;
        entry.completed |= completed;

        let store = self.store.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            match store
                .save_progress(&user_id, &frequency, position, completed)
                .await
            {
                Ok(outcome) => debug!(frequency = %frequency, position, ?outcome, "progress save"),
                Err(err) => warn!(?err, frequency = %frequency, "progress save failed"),
            }
        });
    }

    fn persist_choice(&mut self, choice: UserChoice) {
        let cache = self
            .choices_cache
            .entry(choice.frequency.clone())
            .or_default();
        cache.retain(|existing| existing.choice_id != choice.choice_id);
        cache.push(choice.clone());

        if let Some(local) = &self.local {
            if let Err(err) = local.cache_choice(&self.user_id, &choice) {
                warn!(?err, "failed caching choice locally");
            }
        }

        // Fire-and-forget relative to the advancing cursor.
        let store = self.store.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            store.save_user_choice(&user_id, &choice).await;
        });
    }

    fn persist_repeat(&mut self, count: u32) {
        let Some(frequency) = self.session.as_ref().map(|s| s.frequency().to_owned()) else {
            return;
        };
        let entry = self.repeats.entry(frequency.clone()).or_insert(0);
        *entry = (*entry).max(count);

        if let Some(local) = &self.local {
            if let Err(err) = local.record_repeat(&self.user_id, &frequency, count) {
                warn!(?err, "failed mirroring repeat count locally");
            }
        }

        let api = self.api.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            if let Err(err) = api.post_repeat(&user_id, &frequency, count).await {
                debug!(?err, frequency = %frequency, "repeat-count sync failed");
            }
        });
    }

    fn teardown_playback(&mut self) {
        if let Some(handle) = self.typewriter.take() {
            handle.cancel();
        }
        if let Some(audio) = &self.audio {
            audio.stop_all();
        }
        self.plan = None;
        self.current_voice = (VoiceMode::None, None);
    }

    /// Config override wins, then the catalog's advertised asset base,
    /// then `assets/` next to the executable.
    fn asset_path(&self, asset: &str) -> PathBuf {
        let base = self
            .config
            .asset_dir
            .clone()
            .or_else(|| self.catalog.asset_base_url.clone())
            .unwrap_or_else(|| "assets".to_owned());
        PathBuf::from(base).join(asset)
    }

    fn push_view(&self) {
        let _ = self.ui_tx.send(UiEvent::View(Box::new(self.view.clone())));
    }
}

#[cfg(test)]
mod tests {
    use crate::script::parse_dialogue;
    use crate::session::{Phase, PlaybackSession, SessionEffect};
    use crate::typewriter::{build_plan, spawn_reveal, Pacing, TypewriterEvent};
    use rand::rngs::mock::StepRng;
    use serde_json::json;

    // The same sequence `advance_clicked` runs for a click during Typing:
    // cancel the reveal task, show the full text, complete the line once.
    #[tokio::test(start_paused = true)]
    async fn skip_mid_reveal_shows_full_text_and_completes_once() {
        let text = "x".repeat(50);
        let dialogue = parse_dialogue(&json!({ "conversations": [["op", text]] }));
        let mut session = PlaybackSession::new("A", dialogue, Vec::new(), 0);
        let line = session
            .begin(None)
            .into_iter()
            .find_map(|effect| match effect {
                SessionEffect::RenderLine(line) => Some(line.text),
                _ => None,
            })
            .expect("first line renders");

        let mut rng = StepRng::new(0, 0);
        let plan = build_plan(&line, Pacing::default(), &mut rng);
        let total = plan.char_count();
        assert_eq!(total, 50);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_reveal(plan, 1, tx);
        let mut revealed = 0;
        while revealed < 3 {
            if let Some(TypewriterEvent::Reveal { upto, .. }) = rx.recv().await {
                revealed = upto;
            }
        }

        handle.cancel();
        let shown = total;
        let effects = session.line_completed();
        assert_eq!(
            effects,
            vec![SessionEffect::SaveProgress {
                position: 0,
                completed: false
            }]
        );
        assert_eq!(session.phase(), Phase::AwaitingLine);
        assert_eq!(shown, 50);

        // The cancelled task must never deliver a late completion, and a
        // stray second completion is a no-op on the session.
        while let Some(event) = rx.recv().await {
            assert!(!matches!(event, TypewriterEvent::Completed { .. }));
        }
        assert!(session.line_completed().is_empty());
    }
}
