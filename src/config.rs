use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: f32,
    pub height: f32,
    pub pos_x: Option<f32>,
    pub pos_y: Option<f32>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 900.0,
            height: 640.0,
            pos_x: None,
            pos_y: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    pub min_char_delay_ms: u64,
    pub max_char_delay_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            min_char_delay_ms: 18,
            max_char_delay_ms: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub server_url: String,
    pub play_voice_audio: bool,
    pub voice_master_volume: f32,
    pub typing: TypingConfig,
    pub window: WindowConfig,
    /// Asset directory override; when unset, clips resolve relative to the
    /// catalog's asset base URL mirror next to the executable.
    pub asset_dir: Option<String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8420".to_owned(),
            play_voice_audio: true,
            voice_master_volume: 0.9,
            typing: TypingConfig::default(),
            window: WindowConfig::default(),
            asset_dir: None,
        }
    }
}

impl TerminalConfig {
    pub fn load_or_create() -> Result<(Self, PathBuf)> {
        let config_dir = dirs::config_dir()
            .context("unable to locate OS config directory")?
            .join("radio-terminal");
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed creating config dir at {}", config_dir.display()))?;

        let config_path = config_dir.join("config.json");
        if !config_path.exists() {
            let default = Self::default();
            default.save(&config_path)?;
            return Ok((default, config_path));
        }

        let text = fs::read_to_string(&config_path)
            .with_context(|| format!("failed reading {}", config_path.display()))?;
        let config = serde_json::from_str::<Self>(&text)
            .with_context(|| format!("invalid json in {}", config_path.display()))?;
        Ok((config, config_path))
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let payload = serde_json::to_string_pretty(self).context("failed serializing config")?;
        fs::write(path, payload).with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TerminalConfig;

    #[test]
    fn parses_partial_config_with_defaults() {
        let raw = r#"{
            "server_url": "https://radio.example"
        }"#;
        let parsed: TerminalConfig = serde_json::from_str(raw).expect("config should parse");
        assert_eq!(parsed.server_url, "https://radio.example");
        assert!(parsed.play_voice_audio);
        assert_eq!(parsed.typing.min_char_delay_ms, 18);
        assert_eq!(parsed.window.width, 900.0);
        assert!(parsed.window.pos_x.is_none());
    }

    #[test]
    fn typing_defaults_keep_a_sane_range() {
        let config = TerminalConfig::default();
        assert!(config.typing.min_char_delay_ms < config.typing.max_char_delay_ms);
    }
}
