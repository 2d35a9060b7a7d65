use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub user_name: String,
    /// IANA timezone used when rendering human-readable local times.
    pub timezone: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Minder".to_string(),
            user_name: String::new(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the reasoning-engine session API inside the sandbox.
    pub base_url: String,
    pub model: String,
    /// Cheaper model used for strict-JSON classification calls.
    pub fast_model: String,
    pub prompt_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4096".to_string(),
            model: "claude-sonnet-4".to_string(),
            fast_model: "claude-haiku-4".to_string(),
            prompt_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub db_path: String,
    /// Approx-token threshold above which the conversation buffer asks for
    /// compaction.
    pub compact_threshold: usize,
    /// Maximum number of most-recent entries scanned by semantic search.
    pub candidate_cap: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: ".minder/store.redb".to_string(),
            compact_threshold: 50_000,
            candidate_cap: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub webhook_bind: String,
    /// Static allow-list of Telegram user ids permitted to trigger the agent.
    pub allowed_user_ids: Vec<i64>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            webhook_bind: "127.0.0.1:8787".to_string(),
            allowed_user_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbientConfig {
    /// Minutes between ambient ticks.  Zero disables the loop.
    pub interval_minutes: u64,
}

impl Default for AmbientConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodingConfig {
    /// Hours after which a coding-task continuation is abandoned for a fresh
    /// branch.
    pub stale_hours: i64,
    pub branch_prefix: String,
}

impl Default for CodingConfig {
    fn default() -> Self {
        Self {
            stale_hours: 24,
            branch_prefix: "outie".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Host the sandbox's forwarded ports are reachable on.
    pub host: String,
    /// Port of the bridge's WS-UPLINK listener inside the sandbox.
    pub uplink_port: u16,
    /// Working directory for sandbox commands and engine sessions.
    pub workdir: String,
    /// Readiness poll: attempts × interval.
    pub ready_attempts: u32,
    pub ready_interval_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            uplink_port: 9292,
            workdir: ".".to_string(),
            ready_attempts: 30,
            ready_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// When non-empty, a daily-rotated log file is written here in addition
    /// to stderr.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub engine: EngineConfig,
    pub embedding: EmbeddingConfig,
    pub memory: MemoryConfig,
    pub telegram: TelegramConfig,
    pub ambient: AmbientConfig,
    pub coding: CodingConfig,
    pub sandbox: SandboxConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.embedding.base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

/// Secrets are never written to the config file; they are read from the
/// environment once at startup.  Every field is optional — the subsystems
/// that need a missing secret degrade per their own rules (e.g. the outbound
/// sink becomes a logged no-op without a bot token).
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub telegram_bot_token: Option<String>,
    pub owner_chat_id: Option<i64>,
    pub webhook_secret: Option<String>,
    pub engine_api_key: Option<String>,
    pub brave_api_key: Option<String>,
    pub github_client_id: Option<String>,
    pub github_private_key_pem: Option<String>,
    pub github_installation_id: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        fn non_empty(name: &str) -> Option<String> {
            env::var(name).ok().filter(|v| !v.trim().is_empty())
        }

        Self {
            telegram_bot_token: non_empty("TELEGRAM_BOT_TOKEN"),
            owner_chat_id: non_empty("TELEGRAM_CHAT_ID").and_then(|v| v.parse().ok()),
            webhook_secret: non_empty("WEBHOOK_SECRET"),
            engine_api_key: non_empty("ANTHROPIC_API_KEY"),
            brave_api_key: non_empty("BRAVE_API_KEY"),
            github_client_id: non_empty("GITHUB_CLIENT_ID"),
            github_private_key_pem: non_empty("GITHUB_PRIVATE_KEY_PEM"),
            github_installation_id: non_empty("GITHUB_INSTALLATION_ID"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.memory.compact_threshold, 50_000);
        assert_eq!(config.memory.candidate_cap, 500);
        assert_eq!(config.coding.stale_hours, 24);
        assert_eq!(config.sandbox.ready_attempts, 30);
    }

    #[test]
    fn round_trips_through_toml() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("minder.toml");

        let mut config = AppConfig::default();
        config.agent.name = "Edge".to_string();
        config.telegram.allowed_user_ids = vec![42, 1337];
        config.save_to(&path)?;

        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.agent.name, "Edge");
        assert_eq!(loaded.telegram.allowed_user_ids, vec![42, 1337]);
        Ok(())
    }

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let loaded = AppConfig::load_from("/definitely/not/here.toml")?;
        assert_eq!(loaded.agent.name, "Minder");
        Ok(())
    }

    #[test]
    fn partial_toml_keeps_section_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("minder.toml");
        fs::write(&path, "[agent]\nname = \"Partial\"\n")?;

        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.agent.name, "Partial");
        assert_eq!(loaded.memory.compact_threshold, 50_000);
        Ok(())
    }
}
