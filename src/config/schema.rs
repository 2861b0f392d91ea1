use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub history: HistoryConfig,
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway port (default: 8080)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
        }
    }
}

// ── Agent (claude CLI) ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path to the claude executable. Looked up on PATH when unset.
    #[serde(default)]
    pub cli_path: Option<PathBuf>,
    /// Seconds between keep-alive records on an idle chat stream
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Give up on an unanswered question after this many seconds.
    /// Unset means wait until the request ends.
    #[serde(default)]
    pub question_timeout_secs: Option<u64>,
    /// Permission mode passed to the agent when the request names none
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    /// Tools the agent may use when the request names none
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
    /// Tools the agent must never use
    #[serde(default = "default_disallowed_tools")]
    pub disallowed_tools: Vec<String>,
    /// Extra system prompt appended to every invocation
    #[serde(default = "default_append_system_prompt")]
    pub append_system_prompt: String,
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_permission_mode() -> String {
    "bypassPermissions".into()
}

fn default_allowed_tools() -> Vec<String> {
    [
        "Bash",
        "Read",
        "Write",
        "Edit",
        "Glob",
        "Grep",
        "WebFetch",
        "WebSearch",
        "Task",
        "NotebookEdit",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_disallowed_tools() -> Vec<String> {
    vec!["AskUserQuestion".into()]
}

fn default_append_system_prompt() -> String {
    format!(
        "IMPORTANT: When you need to ask the user a question with options, use the {} tool. \
         This is the correct tool for asking user questions in this web interface.",
        crate::agent::ASK_USER_QUALIFIED_TOOL
    )
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn question_timeout(&self) -> Option<Duration> {
        self.question_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cli_path: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            question_timeout_secs: None,
            permission_mode: default_permission_mode(),
            allowed_tools: default_allowed_tools(),
            disallowed_tools: default_disallowed_tools(),
            append_system_prompt: default_append_system_prompt(),
        }
    }
}

// ── History ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Root holding one directory per encoded project (default: ~/.claude/projects)
    #[serde(default)]
    pub projects_dir: Option<PathBuf>,
    /// Agent config file listing known projects (default: ~/.claude.json)
    #[serde(default)]
    pub agent_config_path: Option<PathBuf>,
    /// Characters kept in a conversation preview
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

fn default_preview_chars() -> usize {
    100
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            projects_dir: None,
            agent_config_path: None,
            preview_chars: default_preview_chars(),
        }
    }
}

impl HistoryConfig {
    pub fn resolved_projects_dir(&self) -> Result<PathBuf> {
        match &self.projects_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(home_dir()?.join(".claude").join("projects")),
        }
    }

    pub fn resolved_agent_config_path(&self) -> Result<PathBuf> {
        match &self.agent_config_path {
            Some(path) => Ok(path.clone()),
            None => Ok(home_dir()?.join(".claude.json")),
        }
    }
}

fn home_dir() -> Result<PathBuf> {
    UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")
}

// ── Loading & saving ─────────────────────────────────────────────

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let config_path = home_dir()?.join(".chatrelay").join("config.toml");
        Self::load_or_init_at(&config_path)
    }

    /// Load the config at `config_path`, writing defaults there first if absent.
    pub fn load_or_init_at(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.to_path_buf();
            config
        } else {
            let config = Config {
                config_path: config_path.to_path_buf(),
                ..Config::default()
            };
            config.save()?;
            config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("CHATRELAY_HOST") {
            if !host.is_empty() {
                self.gateway.host = host;
            }
        }

        // Port: CHATRELAY_PORT or PORT (generic)
        if let Ok(port) = std::env::var("CHATRELAY_PORT").or_else(|_| std::env::var("PORT")) {
            match port.parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!("Ignoring invalid port from environment: {port}"),
            }
        }

        if let Ok(path) = std::env::var("CHATRELAY_CLAUDE_PATH") {
            if !path.is_empty() {
                self.agent.cli_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(dir) = std::env::var("CHATRELAY_PROJECTS_DIR") {
            if !dir.is_empty() {
                self.history.projects_dir = Some(PathBuf::from(dir));
            }
        }
    }

    /// Write the config atomically: temp file in the same directory, then rename.
    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", std::process::id()));

        let mut temp_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        Ok(())
    }
}
