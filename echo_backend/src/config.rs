use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::proactive::arbitrator::{
    ArbitratorPolicy, DEFAULT_COOLDOWN_MINS, DEFAULT_RETENTION_HOURS,
};
use crate::proactive::evaluators::GateChances;

/// Upper bounds applied when converting to durations: one year.
const MAX_COOLDOWN_MINS: u64 = 365 * 24 * 60;
const MAX_RETENTION_HOURS: u64 = 365 * 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_cooldown_mins")]
    pub cooldown_mins: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Mark candidates dismissed as soon as they are emitted.
    #[serde(default = "default_true")]
    pub dismiss_on_emit: bool,

    // Message enhancement (LLM rewrite of the raw payload)
    #[serde(default = "default_true")]
    pub enable_enhancement: bool,
    #[serde(default = "default_enhancement_timeout_secs")]
    pub enhancement_timeout_secs: u64,
    #[serde(default)]
    pub enhancement_model: Option<String>,

    // Randomized evaluators
    #[serde(default = "default_curiosity_chance")]
    pub curiosity_chance: f64,
    #[serde(default = "default_profound_thought_chance")]
    pub profound_thought_chance: f64,
    #[serde(default = "default_ordinary_thought_chance")]
    pub ordinary_thought_chance: f64,

    // Housekeeping jobs
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_signal_retention_interval_secs")]
    pub signal_retention_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_cycle_interval_secs() -> u64 {
    300
}

fn default_cooldown_mins() -> u64 {
    DEFAULT_COOLDOWN_MINS as u64
}

fn default_retention_hours() -> u64 {
    DEFAULT_RETENTION_HOURS as u64
}

fn default_enhancement_timeout_secs() -> u64 {
    20
}

fn default_curiosity_chance() -> f64 {
    GateChances::default().curiosity
}

fn default_profound_thought_chance() -> f64 {
    GateChances::default().profound_thought
}

fn default_ordinary_thought_chance() -> f64 {
    GateChances::default().ordinary_thought
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_signal_retention_interval_secs() -> u64 {
    86_400
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cycle_interval_secs: default_cycle_interval_secs(),
            cooldown_mins: default_cooldown_mins(),
            retention_hours: default_retention_hours(),
            dismiss_on_emit: true,
            enable_enhancement: true,
            enhancement_timeout_secs: default_enhancement_timeout_secs(),
            enhancement_model: None,
            curiosity_chance: default_curiosity_chance(),
            profound_thought_chance: default_profound_thought_chance(),
            ordinary_thought_chance: default_ordinary_thought_chance(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            signal_retention_interval_secs: default_signal_retention_interval_secs(),
        }
    }
}

impl ProactiveConfig {
    pub fn policy(&self) -> ArbitratorPolicy {
        ArbitratorPolicy {
            cooldown: ChronoDuration::minutes(self.cooldown_mins.min(MAX_COOLDOWN_MINS) as i64),
            retention: ChronoDuration::hours(self.retention_hours.min(MAX_RETENTION_HOURS) as i64),
            dismiss_on_emit: self.dismiss_on_emit,
        }
    }

    pub fn gate_chances(&self) -> GateChances {
        GateChances {
            curiosity: self.curiosity_chance.clamp(0.0, 1.0),
            profound_thought: self.profound_thought_chance.clamp(0.0, 1.0),
            ordinary_thought: self.ordinary_thought_chance.clamp(0.0, 1.0),
        }
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn signal_retention_interval(&self) -> Duration {
        Duration::from_secs(self.signal_retention_interval_secs.max(1))
    }

    pub fn enhancement_timeout(&self) -> Duration {
        Duration::from_secs(self.enhancement_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Companion identity
    #[serde(default = "default_companion_name", alias = "agent_name")]
    pub companion_name: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub proactive: ProactiveConfig,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_companion_name() -> String {
    "Echo".to_string()
}

fn default_system_prompt() -> String {
    "You are Echo, a warm AI companion who remembers past conversations, \
     dreams, and reflects on how you are changing. Speak in the first person, \
     briefly and naturally."
        .to_string()
}

fn default_database_path() -> String {
    "echo_memory.db".to_string()
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            companion_name: default_companion_name(),
            system_prompt: default_system_prompt(),
            database_path: default_database_path(),
            proactive: ProactiveConfig::default(),
        }
    }
}

fn parse_env_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}

impl EchoConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("echo_config.toml")
    }

    /// Load config from echo_config.toml next to the executable.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match Self::from_toml_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<EchoConfig>(contents).context("Invalid echo config")
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(path) = env::var("ECHO_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        let proactive = &mut config.proactive;

        if let Ok(enabled) = env::var("ECHO_PROACTIVE_ENABLED") {
            proactive.enabled = parse_env_flag(&enabled);
        }

        if let Some(seconds) = env_parsed("ECHO_PROACTIVE_CYCLE_INTERVAL_SECS") {
            proactive.cycle_interval_secs = seconds;
        }

        if let Some(minutes) = env_parsed("ECHO_PROACTIVE_COOLDOWN_MINS") {
            proactive.cooldown_mins = minutes;
        }

        if let Some(hours) = env_parsed("ECHO_PROACTIVE_RETENTION_HOURS") {
            proactive.retention_hours = hours;
        }

        if let Ok(enabled) = env::var("ECHO_PROACTIVE_DISMISS_ON_EMIT") {
            proactive.dismiss_on_emit = parse_env_flag(&enabled);
        }

        if let Ok(enabled) = env::var("ECHO_PROACTIVE_ENABLE_ENHANCEMENT") {
            proactive.enable_enhancement = parse_env_flag(&enabled);
        }

        if let Some(seconds) = env_parsed("ECHO_PROACTIVE_ENHANCEMENT_TIMEOUT_SECS") {
            proactive.enhancement_timeout_secs = seconds;
        }

        if let Ok(model) = env::var("ECHO_PROACTIVE_ENHANCEMENT_MODEL") {
            if !model.trim().is_empty() {
                proactive.enhancement_model = Some(model);
            }
        }

        config
    }
}
