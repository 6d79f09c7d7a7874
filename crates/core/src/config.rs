//! Render configuration, loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration:
//!
//! ```toml
//! log_filter = "info,cadence_rhi=trace"
//!
//! [scheduler]
//! command_buffers_per_chunk = 4
//! max_command_chunks = 16
//! wait_poll_ms = 100
//! stall_timeout_ms = 10000
//!
//! [presentation]
//! width = 1280
//! height = 720
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration for the submission layer and presentation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Optional tracing filter directive; `RUST_LOG` overrides it.
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub presentation: PresentationConfig,
}

/// Command-buffer pooling and completion-wait settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Command buffers allocated together from one command allocator.
    pub command_buffers_per_chunk: usize,
    /// Upper bound on chunks before the pool blocks instead of growing.
    pub max_command_chunks: usize,
    /// Length of each bounded wait slice while blocking on a tick.
    pub wait_poll_ms: u64,
    /// Time without reaching a waited tick after which the device is
    /// considered lost. `None` waits forever.
    pub stall_timeout_ms: Option<u64>,
}

/// Render-target settings for the frame slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_buffers_per_chunk: 4,
            max_command_chunks: 16,
            wait_poll_ms: 100,
            stall_timeout_ms: Some(10_000),
        }
    }
}

impl SchedulerConfig {
    /// Duration of one wait slice.
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }

    /// Stall timeout as a duration, if one is configured.
    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.command_buffers_per_chunk == 0 {
            return Err(Error::Config(
                "scheduler.command_buffers_per_chunk must be at least 1".to_string(),
            ));
        }
        if self.max_command_chunks < 2 {
            return Err(Error::Config(
                "scheduler.max_command_chunks must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl PresentationConfig {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "presentation extent must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

impl RenderConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load configuration from `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RenderConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section for values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.presentation.validate()
    }
}
