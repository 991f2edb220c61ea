use std::{
    fs::File,
    io::BufReader,
    path::PathBuf,
    sync::mpsc::{self, Sender},
    thread,
};

use rand::Rng;
use rodio::{Decoder, OutputStream, Sink};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum VoiceRequest {
    /// One clip at line start, independent of typing speed.
    Voiceline { path: PathBuf, volume: f32 },
    /// Short per-character blip. Volume and pitch jitter so a long line
    /// does not sound like a metronome.
    TypingBlip { path: PathBuf, volume: f32 },
    /// Cancel everything currently sounding: skip and retune both route
    /// through here so no audio outlives its line.
    StopAll,
}

#[derive(Clone)]
pub struct VoicePlayer {
    tx: Sender<VoiceRequest>,
}

impl VoicePlayer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<VoiceRequest>();
        thread::spawn(move || {
            let mut output = OutputStream::try_default().ok();
            if output.is_none() {
                warn!("audio output unavailable; voice playback disabled until device is available");
            }
            let mut active_sinks: Vec<Sink> = Vec::new();
            let mut rng = rand::thread_rng();

            while let Ok(req) = rx.recv() {
                active_sinks.retain(|sink| !sink.empty());

                if matches!(req, VoiceRequest::StopAll) {
                    for sink in active_sinks.drain(..) {
                        sink.stop();
                    }
                    continue;
                }

                if output.is_none() {
                    output = OutputStream::try_default().ok();
                    if output.is_none() {
                        continue;
                    }
                }
                let Some((_, handle)) = output.as_ref() else {
                    continue;
                };

                let (path, volume, speed) = match &req {
                    VoiceRequest::Voiceline { path, volume } => (path.clone(), *volume, 1.0),
                    VoiceRequest::TypingBlip { path, volume } => (
                        path.clone(),
                        volume * rng.gen_range(0.8..1.2),
                        rng.gen_range(0.9..1.15),
                    ),
                    VoiceRequest::StopAll => continue,
                };

                let file = match File::open(&path) {
                    Ok(file) => file,
                    Err(err) => {
                        debug!(?err, path = %path.display(), "failed opening voice file");
                        continue;
                    }
                };
                let decoder = match Decoder::new(BufReader::new(file)) {
                    Ok(decoder) => decoder,
                    Err(err) => {
                        debug!(?err, path = %path.display(), "failed decoding voice file");
                        continue;
                    }
                };

                match Sink::try_new(handle) {
                    Ok(sink) => {
                        sink.set_volume(volume.clamp(0.0, 2.0));
                        sink.set_speed(speed);
                        sink.append(decoder);
                        active_sinks.push(sink);
                    }
                    Err(err) => {
                        warn!(?err, "failed to create voice sink");
                        output = None;
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn play(&self, req: VoiceRequest) {
        let _ = self.tx.send(req);
    }

    pub fn stop_all(&self) {
        let _ = self.tx.send(VoiceRequest::StopAll);
    }
}
