use std::path::Path;
use std::sync::LazyLock;

use ffmpeg_ts::StreamerConfig;
use serde::{Deserialize, Serialize};

const CONFIG_PATH_ENV: &str = "TS_STREAMER_CONFIG";
const PORT_ENV: &str = "TS_STREAMER_PORT";
const API_PORT_ENV: &str = "TS_STREAMER_API_PORT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub streamer: StreamerConfig,
    pub api_port: u16,
    /// Start streaming as soon as the process is up.
    pub autostart: bool,
    /// Frequency of the generated test tone.
    pub tone_hz: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            streamer: StreamerConfig::default(),
            api_port: 8081,
            autostart: true,
            tone_hz: 440.0,
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read {}: {}", path.display(), e))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Applies `TS_STREAMER_PORT`/`TS_STREAMER_API_PORT` style overrides.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(port) = lookup(PORT_ENV) {
            self.streamer.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("{}={}: {}", PORT_ENV, port, e))?;
        }
        if let Some(port) = lookup(API_PORT_ENV) {
            self.api_port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("{}={}: {}", API_PORT_ENV, port, e))?;
        }
        Ok(())
    }

    fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.streamer.validate()?;
        Ok(config)
    }
}

pub fn config() -> &'static AppConfig {
    static CONFIG: LazyLock<AppConfig> = LazyLock::new(|| {
        AppConfig::load().unwrap_or_else(|e| {
            eprintln!("Error loading config: {:#}", e);
            std::process::exit(1);
        })
    });
    &CONFIG
}
