use std::time::Duration;

use crossbeam_channel::Receiver;
use eframe::egui::{self, Color32, FontId, Margin, RichText, Stroke};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::{
    events::{UiCommand, UiEvent, ViewState},
    session::Phase,
};

const AMBER: Color32 = Color32::from_rgb(255, 176, 0);
const AMBER_DIM: Color32 = Color32::from_rgb(140, 96, 0);
const PANEL_BG: Color32 = Color32::from_rgb(16, 12, 4);
const SIGNAL_RED: Color32 = Color32::from_rgb(200, 60, 40);

/// How long a named screen effect keeps tinting the panel after its cue.
const EFFECT_LINGER: Duration = Duration::from_millis(450);

pub struct TerminalApp {
    events: Receiver<UiEvent>,
    commands: UnboundedSender<UiCommand>,
    view: ViewState,
    active_effect: Option<(String, std::time::Instant)>,
}

impl TerminalApp {
    pub fn new(events: Receiver<UiEvent>, commands: UnboundedSender<UiCommand>) -> Self {
        Self {
            events,
            commands,
            view: ViewState::default(),
            active_effect: None,
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                UiEvent::View(view) => self.view = *view,
                UiEvent::Effect(name) => {
                    debug!(%name, "screen effect cue");
                    self.active_effect = Some((name, std::time::Instant::now()));
                }
            }
        }
        if let Some((_, started)) = &self.active_effect {
            if started.elapsed() > EFFECT_LINGER {
                self.active_effect = None;
            }
        }
    }

    fn send(&self, command: UiCommand) {
        let _ = self.commands.send(command);
    }

    fn draw_dial(&self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            if ui
                .button(RichText::new("<<").font(FontId::monospace(18.0)).color(AMBER))
                .clicked()
            {
                self.send(UiCommand::TunePrev);
            }
            ui.add_space(12.0);
            let freq = if self.view.frequency.is_empty() {
                "---.--"
            } else {
                &self.view.frequency
            };
            // Clicking the readout re-tunes the current frequency, which
            // doubles as a retry on a dead channel.
            let readout = ui.label(
                RichText::new(format!("[ {freq} ]"))
                    .font(FontId::monospace(26.0))
                    .color(AMBER),
            );
            if readout.interact(egui::Sense::click()).clicked() && !self.view.frequency.is_empty() {
                self.send(UiCommand::Tune(self.view.frequency.clone()));
            }
            ui.add_space(12.0);
            if ui
                .button(RichText::new(">>").font(FontId::monospace(18.0)).color(AMBER))
                .clicked()
            {
                self.send(UiCommand::TuneNext);
            }
        });
    }

    fn draw_transmission(&self, ui: &mut egui::Ui) {
        let glitching = self
            .active_effect
            .as_ref()
            .map(|(name, _)| name == "glitch")
            .unwrap_or(false);

        let frame = egui::Frame::none()
            .fill(PANEL_BG)
            .stroke(Stroke::new(1.0, if glitching { SIGNAL_RED } else { AMBER_DIM }))
            .inner_margin(Margin::same(16.0));

        frame.show(ui, |ui| {
            ui.set_min_height(220.0);
            match self.view.phase {
                Phase::NoSignal => {
                    ui.centered_and_justified(|ui| {
                        ui.label(
                            RichText::new("-- NO SIGNAL --")
                                .font(FontId::monospace(22.0))
                                .color(SIGNAL_RED),
                        );
                    });
                    return;
                }
                Phase::Idle => {
                    ui.centered_and_justified(|ui| {
                        ui.label(
                            RichText::new("tuning...")
                                .font(FontId::monospace(16.0))
                                .color(AMBER_DIM),
                        );
                    });
                    return;
                }
                _ => {}
            }

            if !self.view.display_name.is_empty() {
                ui.horizontal(|ui| {
                    ui.label(
                        RichText::new(format!("{} >", self.view.display_name.to_uppercase()))
                            .font(FontId::monospace(14.0))
                            .color(AMBER_DIM),
                    );
                    // Portraits render as an id badge; the terminal has no
                    // raster display.
                    if let Some(portrait) = &self.view.portrait {
                        ui.label(
                            RichText::new(format!("◉ {portrait}"))
                                .font(FontId::monospace(11.0))
                                .color(AMBER_DIM),
                        );
                    }
                });
                ui.add_space(6.0);
            }

            // The second window is indented, like a far side of the line.
            let indent = if self.view.display_window >= 2 { 48.0 } else { 0.0 };
            ui.horizontal(|ui| {
                ui.add_space(indent);
                let mut text = self.view.revealed_text();
                if self.view.phase == Phase::Typing {
                    text.push('_');
                }
                ui.label(
                    RichText::new(text)
                        .font(FontId::monospace(16.0))
                        .color(AMBER),
                );
            });

            ui.add_space(12.0);
            match self.view.phase {
                Phase::AwaitingChoice => self.draw_choices(ui),
                Phase::AwaitingLine => {
                    ui.label(
                        RichText::new("[ click to continue ]")
                            .font(FontId::monospace(12.0))
                            .color(AMBER_DIM),
                    );
                }
                Phase::Ended => {
                    ui.label(
                        RichText::new("-- transmission ends --")
                            .font(FontId::monospace(12.0))
                            .color(AMBER_DIM),
                    );
                    if self.view.replay_offered
                        && ui
                            .button(
                                RichText::new("[ listen again ]")
                                    .font(FontId::monospace(14.0))
                                    .color(AMBER),
                            )
                            .clicked()
                    {
                        self.send(UiCommand::Replay);
                    }
                }
                _ => {}
            }
        });
    }

    fn draw_choices(&self, ui: &mut egui::Ui) {
        for option in &self.view.options {
            if ui
                .button(
                    RichText::new(format!("> {}", option.text))
                        .font(FontId::monospace(15.0))
                        .color(AMBER),
                )
                .clicked()
            {
                self.send(UiCommand::Choose(option.id.clone()));
            }
        }
    }

    fn draw_footer(&self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            let (label, color) = if self.view.connected {
                ("LINK ESTABLISHED", AMBER_DIM)
            } else {
                ("LINK DOWN", SIGNAL_RED)
            };
            ui.label(RichText::new(label).font(FontId::monospace(11.0)).color(color));
            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                let operator = self.view.username.as_deref().unwrap_or("guest operator");
                ui.label(
                    RichText::new(operator)
                        .font(FontId::monospace(11.0))
                        .color(AMBER_DIM),
                );
            });
        });
    }
}

impl eframe::App for TerminalApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_events();
        ctx.request_repaint_after(Duration::from_millis(33));

        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(Color32::from_rgb(8, 6, 2)).inner_margin(Margin::same(18.0)))
            .show(ctx, |ui| {
                self.draw_dial(ui);
                ui.add_space(14.0);

                // Catch clicks anywhere on the transmission area; buttons
                // inside consume theirs first.
                let response = ui
                    .scope(|ui| self.draw_transmission(ui))
                    .response
                    .interact(egui::Sense::click());
                if response.clicked()
                    && matches!(self.view.phase, Phase::Typing | Phase::AwaitingLine)
                {
                    self.send(UiCommand::Advance);
                }

                ui.add_space(10.0);
                self.draw_footer(ui);
            });
    }
}
