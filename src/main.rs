mod api;
mod app;
mod audio;
mod catalog;
mod config;
mod engine;
mod events;
mod local_store;
mod progress;
mod script;
mod session;
mod typewriter;

use anyhow::Result;
use tracing::info;

use crate::{app::TerminalApp, config::TerminalConfig, events::UiEvent};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (config, config_path) = TerminalConfig::load_or_create()?;
    info!(path = %config_path.display(), server = %config.server_url, "radio terminal starting");

    let (ui_tx, ui_rx) = crossbeam_channel::unbounded::<UiEvent>();
    let command_tx = engine::spawn(config.clone(), ui_tx);

    let startup_width = config.window.width.clamp(480.0, 4096.0);
    let startup_height = config.window.height.clamp(360.0, 4096.0);
    let mut viewport = egui::ViewportBuilder::default()
        .with_resizable(true)
        .with_inner_size([startup_width, startup_height])
        .with_title("Radio Terminal");
    if let (Some(x), Some(y)) = (config.window.pos_x, config.window.pos_y) {
        viewport = viewport.with_position(egui::pos2(x, y));
    }

    let native_options = eframe::NativeOptions {
        viewport,
        renderer: eframe::Renderer::Glow,
        ..Default::default()
    };

    eframe::run_native(
        "Radio Terminal",
        native_options,
        Box::new(move |_cc| Ok(Box::new(TerminalApp::new(ui_rx, command_tx)))),
    )
    .map_err(|err| anyhow::anyhow!("failed starting terminal window: {err}"))?;

    Ok(())
}
