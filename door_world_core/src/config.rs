use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::EntityId;
use crate::action_map::ControlScheme;

pub const ENV_LLM_BASE_URL: &str = "DOOR_WORLD_LLM_BASE_URL";
pub const ENV_LLM_MODEL: &str = "DOOR_WORLD_LLM_MODEL";
pub const ENV_LLM_API_KEY: &str = "DOOR_WORLD_LLM_API_KEY";
pub const ENV_LLM_TIMEOUT_MS: &str = "DOOR_WORLD_LLM_TIMEOUT_MS";

pub const DEFAULT_CONFIG_FILE_NAME: &str = "door_world.toml";

/// Agents are labelled with a single digit on the ASCII grid.
pub const MAX_AGENTS: usize = 9;

/// Represents errors raised while loading or validating the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("read config file failed ({path}): {message}")]
    ReadFile { path: String, message: String },
    #[error("parse config file failed ({path}): {message}")]
    ParseFile { path: String, message: String },
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("grid must be at least 3x3 including borders, got {rows}x{cols}")]
    GridTooSmall { rows: usize, cols: usize },
    #[error("number of agents must be at least 1")]
    TooFewAgents,
    #[error("number of agents must be 9 or less, got {count}")]
    TooManyAgents { count: usize },
    #[error("{count} agents do not fit into {interior} interior cells")]
    NotEnoughRoom { count: usize, interior: usize },
    #[error("door span must be at least 1")]
    DoorSpanTooSmall,
    #[error("door span must be odd, got {span}")]
    EvenDoorSpan { span: usize },
    #[error("button count must be 4 or 6, got {count}")]
    InvalidButtonCount { count: usize },
    #[error("controlled agent {id} is not in 1..={count}")]
    ControlledAgentOutOfRange { id: EntityId, count: usize },
    #[error("tick rate must be at least 1ms")]
    InvalidTickRate,
}

/// Checks grid dimensions (including borders), agent count and door span.
pub fn validate_layout(
    rows: usize,
    cols: usize,
    agent_count: usize,
    door_span: usize,
) -> Result<(), ConfigError> {
    if rows < 3 || cols < 3 {
        return Err(ConfigError::GridTooSmall { rows, cols });
    }
    if agent_count < 1 {
        return Err(ConfigError::TooFewAgents);
    }
    if agent_count > MAX_AGENTS {
        return Err(ConfigError::TooManyAgents { count: agent_count });
    }
    let interior = (rows - 2) * (cols - 2);
    if agent_count > interior {
        return Err(ConfigError::NotEnoughRoom {
            count: agent_count,
            interior,
        });
    }
    if door_span < 1 {
        return Err(ConfigError::DoorSpanTooSmall);
    }
    if door_span % 2 == 0 {
        return Err(ConfigError::EvenDoorSpan { span: door_span });
    }
    Ok(())
}

/// Grid layout. `rows` and `cols` describe the interior; walls are added around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub rows: usize,
    pub cols: usize,
    pub door_span: usize,
    pub agent_count: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            rows: 8,
            cols: 16,
            door_span: 3,
            agent_count: 4,
        }
    }
}

impl GridConfig {
    /// Total rows including the wall ring.
    pub fn total_rows(&self) -> usize {
        self.rows + 2
    }

    /// Total columns including the wall ring.
    pub fn total_cols(&self) -> usize {
        self.cols + 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// 4 (movement only, door always open) or 6 (adds open/close door).
    pub buttons: usize,
    /// Fixed controlled agent id; picked uniformly at random when absent.
    pub controlled_agent: Option<EntityId>,
    pub seed: Option<u64>,
    /// Consecutive rejected replies tolerated for one turn; unbounded when absent.
    pub max_retries: Option<u32>,
    pub tick_rate_ms: u64,
    pub log_dir: PathBuf,
}

impl Default for GameConfig {
    fn default() -> Self {
        GameConfig {
            buttons: 6,
            controlled_agent: None,
            seed: None,
            max_retries: None,
            tick_rate_ms: 16,
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout_ms: u64,
    /// Replaces the built-in context preamble when set.
    pub preamble: Option<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "deepseek/deepseek-chat-v3-0324:free".to_string(),
            api_key: String::new(),
            timeout_ms: 60_000,
            preamble: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub grid: GridConfig,
    pub game: GameConfig,
    pub oracle: OracleConfig,
}

impl SimConfig {
    /// Loads `path` if it exists, otherwise starts from defaults. Environment overrides
    /// are applied in both cases.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            info!(path = %path.display(), "no config file, using defaults");
            SimConfig::default()
        };
        config.apply_env_overrides_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|err| ConfigError::ReadFile {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_toml_str(&content).map_err(|err| match err {
            ConfigError::ParseFile { message, .. } => ConfigError::ParseFile {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|err| ConfigError::ParseFile {
            path: "<inline>".to_string(),
            message: err.to_string(),
        })
    }

    /// Overrides oracle settings from environment-like key lookups.
    pub fn apply_env_overrides_with<F>(&mut self, mut getter: F) -> Result<(), ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut non_empty = |key: &str| getter(key).filter(|value| !value.trim().is_empty());

        if let Some(base_url) = non_empty(ENV_LLM_BASE_URL) {
            self.oracle.base_url = base_url;
        }
        if let Some(model) = non_empty(ENV_LLM_MODEL) {
            self.oracle.model = model;
        }
        if let Some(api_key) = non_empty(ENV_LLM_API_KEY) {
            self.oracle.api_key = api_key;
        }
        if let Some(value) = non_empty(ENV_LLM_TIMEOUT_MS) {
            self.oracle.timeout_ms = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: ENV_LLM_TIMEOUT_MS,
                    value,
                })?;
        }
        Ok(())
    }

    /// Checks every setup constraint and returns the config with an oversized door span
    /// reduced to the largest odd length that fits the shorter wall.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        let grid = &self.grid;
        validate_layout(
            grid.total_rows(),
            grid.total_cols(),
            grid.agent_count,
            grid.door_span,
        )?;

        let longest_fit = grid.rows.min(grid.cols);
        if grid.door_span > longest_fit {
            let reduced = if longest_fit % 2 == 0 {
                longest_fit - 1
            } else {
                longest_fit
            };
            warn!(
                requested = grid.door_span,
                reduced, "door span exceeds wall length, adjusting to fit"
            );
            self.grid.door_span = reduced;
        }

        self.control_scheme()?;

        if let Some(id) = self.game.controlled_agent {
            if id < 1 || id > self.grid.agent_count {
                return Err(ConfigError::ControlledAgentOutOfRange {
                    id,
                    count: self.grid.agent_count,
                });
            }
        }
        if self.game.tick_rate_ms < 1 {
            return Err(ConfigError::InvalidTickRate);
        }
        Ok(self)
    }

    /// Log directory named in the file at `path`, or the default one.
    ///
    /// Reads quietly so that logging can be set up before [`SimConfig::load`] runs.
    pub fn log_dir_hint(path: &Path) -> PathBuf {
        Self::from_file(path)
            .map(|config| config.game.log_dir)
            .unwrap_or_else(|_| GameConfig::default().log_dir)
    }

    pub fn control_scheme(&self) -> Result<ControlScheme, ConfigError> {
        ControlScheme::from_button_count(self.game.buttons).ok_or(
            ConfigError::InvalidButtonCount {
                count: self.game.buttons,
            },
        )
    }
}
