use anyhow::{Context, Result};
use quill_core::{ChatConfig, Provider};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_CONFIG: &str = r#"# quill configuration

[notes]
# Root of your notes checkout. ${HOME}, ${USER}, ${QUILL_NOTES_DIR} and ~/ are expanded.
dir = "~/notes"
extensions = ["md", "txt"]

[chat]
# Tool-call continuations allowed per turn before giving up
max_tool_rounds = 8
# Relevant files loaded automatically per turn (0 disables)
auto_load_limit = 5
max_tokens = 8192

[endpoints]
# Optional base-URL overrides, e.g. for a proxy
# anthropic = "https://api.anthropic.com"
# openai = "https://api.openai.com"
# gemini = "https://generativelanguage.googleapis.com"
"#;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuillConfig {
    #[serde(default)]
    pub notes: NotesConfig,
    #[serde(default)]
    pub chat: ChatSection,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotesConfig {
    #[serde(default)]
    pub dir: String,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_extensions() -> Vec<String> {
    vec!["md".to_string(), "txt".to_string()]
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            extensions: default_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSection {
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_auto_load_limit")]
    pub auto_load_limit: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tool_rounds() -> usize {
    8
}

fn default_auto_load_limit() -> usize {
    5
}

fn default_max_tokens() -> u32 {
    8192
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            auto_load_limit: default_auto_load_limit(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default)]
    pub anthropic: Option<String>,
    #[serde(default)]
    pub openai: Option<String>,
    #[serde(default)]
    pub gemini: Option<String>,
}

impl EndpointsConfig {
    pub fn for_provider(&self, provider: Provider) -> Option<&str> {
        let url = match provider {
            Provider::Anthropic => &self.anthropic,
            Provider::OpenAi => &self.openai,
            Provider::Gemini => &self.gemini,
        };
        url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

/// Mask a secret string for safe display.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quill")
}

pub fn prefs_path() -> PathBuf {
    config_dir().join("prefs.json")
}

impl QuillConfig {
    /// Load from `custom_path` or `~/.quill/config.toml`; a missing file
    /// yields defaults
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    warn!(
                        "Config file {:?} is readable by others ({:o}). Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    );
                }
            }
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        Ok(toml::from_str(&expanded)?)
    }

    /// Resolved notes root, if one is configured
    pub fn notes_dir(&self) -> Option<PathBuf> {
        let dir = self.notes.dir.trim();
        if dir.is_empty() {
            return None;
        }
        Some(expand_home(dir))
    }

    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            max_tool_rounds: self.chat.max_tool_rounds,
            max_tokens: self.chat.max_tokens,
            auto_load_limit: self.chat.auto_load_limit,
        }
    }
}

/// Write the default config, readable by the owner only
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn expand_home(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

/// Allowlist of environment variable names that may be expanded in config files.
const ALLOWED_ENV_VARS: &[&str] = &["HOME", "USER", "QUILL_NOTES_DIR"];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len;
    }
    result
}
