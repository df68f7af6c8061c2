//! Layered runtime configuration
//!
//! Built-in defaults, then an optional TOML file (`huddle.toml` or the path
//! in `HUDDLE_CONFIG`), then `HUDDLE_*` environment variables with `__` as
//! the nesting separator, e.g. `HUDDLE_COMPOSITOR__FPS=15`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use huddle_protocol::IceServer;
use serde::{Deserialize, Serialize};

const CONFIG_PATH_VAR: &str = "HUDDLE_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "huddle.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name announced to peers
    pub display_name: String,
    pub signaling: SignalingSettings,
    pub ice_servers: Vec<IceServer>,
    pub compositor: CompositorSettings,
    pub recording: RecordingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingSettings {
    /// Websocket endpoint of the signaling relay
    pub url: String,
    /// API key expected by the relay
    pub key: String,
    pub heartbeat_secs: u64,
    /// Identity to request; a random one is generated when unset
    pub requested_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorSettings {
    pub fps: u32,
    /// Delay before retrying when the segmentation model is not loaded
    pub ready_backoff_ms: u64,
    pub blur_sigma: f32,
    pub background_image: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub directory: PathBuf,
    pub file_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: "Guest".to_string(),
            signaling: SignalingSettings::default(),
            ice_servers: vec![IceServer::default()],
            compositor: CompositorSettings::default(),
            recording: RecordingSettings::default(),
        }
    }
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            url: "wss://0.peerjs.com:443/peerjs".to_string(),
            key: "peerjs".to_string(),
            heartbeat_secs: 5,
            requested_id: None,
        }
    }
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            ready_backoff_ms: 500,
            blur_sigma: 12.0,
            background_image: None,
        }
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            directory: dirs::video_dir().unwrap_or_else(|| PathBuf::from(".")),
            file_prefix: "huddle-recording".to_string(),
        }
    }
}

impl CompositorSettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.fps.max(1)))
    }

    pub fn ready_backoff(&self) -> Duration {
        Duration::from_millis(self.ready_backoff_ms)
    }
}

impl SignalingSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Settings {
    /// Load from the default file location and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Some(Path::new(&path)))
    }

    /// Load with an explicit (optional, possibly missing) config file
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            tracing::debug!("Reading configuration from {:?}", path);
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .add_source(
                Environment::with_prefix("HUDDLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let settings = Settings::load_from(None).unwrap();
        assert_eq!(settings.compositor.fps, 30);
        assert_eq!(settings.compositor.ready_backoff(), Duration::from_millis(500));
        assert_eq!(settings.recording.file_prefix, "huddle-recording");
        assert_eq!(settings.ice_servers.len(), 1);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
display_name = "Ada"

[compositor]
fps = 15
background_image = "/tmp/beach.png"
"#
        )
        .unwrap();

        let settings = Settings::load_from(Some(file.path())).unwrap();
        assert_eq!(settings.display_name, "Ada");
        assert_eq!(settings.compositor.fps, 15);
        assert_eq!(settings.compositor.blur_sigma, 12.0);
        assert_eq!(
            settings.compositor.background_image,
            Some(PathBuf::from("/tmp/beach.png"))
        );
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let settings = Settings::load_from(Some(Path::new("/definitely/not/here.toml"))).unwrap();
        assert_eq!(settings.signaling.heartbeat_interval(), Duration::from_secs(5));
    }

    #[test]
    fn frame_interval_tracks_fps() {
        let compositor = CompositorSettings {
            fps: 25,
            ..Default::default()
        };
        assert_eq!(compositor.frame_interval(), Duration::from_millis(40));
    }
}
