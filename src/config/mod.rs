use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    /// Config file this was loaded from (not serialized)
    #[serde(skip)]
    pub source: Option<PathBuf>,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub animation: AnimationConfig,

    #[serde(default)]
    pub renderer: RendererConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: Option<OpenAIConfig>,

    /// Text-generation endpoint serving a model fine-tuned to emit Manim code
    #[serde(default)]
    pub finetuned: Option<FineTunedConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    pub api_key: String,

    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTunedConfig {
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_model")]
    pub model: String,

    #[serde(default = "default_chat_temperature")]
    pub temperature: f32,

    #[serde(default = "default_chat_max_tokens")]
    pub max_tokens: u32,

    /// Previous exchanges (question plus answer, two messages each) sent along
    /// with a new query (0 = none)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationConfig {
    /// Model that writes Manim code for each step
    #[serde(default = "default_code_model")]
    pub code_model: String,

    #[serde(default = "default_code_temperature")]
    pub code_temperature: f32,

    #[serde(default = "default_code_max_tokens")]
    pub code_max_tokens: u32,

    /// Send the whole explanation to the fine-tuned model as a single step
    #[serde(default)]
    pub use_finetuned_model: bool,

    /// Skip short or purely conversational replies
    #[serde(default = "default_true")]
    pub filter_trivial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    #[serde(default = "default_renderer_url")]
    pub base_url: String,

    #[serde(default = "default_execute_path")]
    pub execute_path: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    /// Retries after the first attempt on 5xx or transport errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before retry n is `backoff_base_ms * n`
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Defaults to `{base_url}/placeholder-animation.mp4`
    #[serde(default)]
    pub placeholder_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Minimum cosine similarity for reusing a cached animation
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to data_dir/visun.sqlite
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_chat_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_chat_temperature() -> f32 {
    0.7
}
fn default_chat_max_tokens() -> u32 {
    1000
}
fn default_history_limit() -> usize {
    10
}
fn default_code_model() -> String {
    "gpt-4o".to_string()
}
fn default_code_temperature() -> f32 {
    0.3
}
fn default_code_max_tokens() -> u32 {
    2000
}
fn default_true() -> bool {
    true
}
fn default_renderer_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_execute_path() -> String {
    "/execute-manim".to_string()
}
fn default_request_timeout() -> u64 {
    300 // rendering a scene can take minutes
}
fn default_health_timeout() -> u64 {
    15
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    2000
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_match_threshold() -> f32 {
    0.78
}
fn default_port() -> u16 {
    3000
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            temperature: default_chat_temperature(),
            max_tokens: default_chat_max_tokens(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            code_model: default_code_model(),
            code_temperature: default_code_temperature(),
            code_max_tokens: default_code_max_tokens(),
            use_finetuned_model: false,
            filter_trivial: default_true(),
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            base_url: default_renderer_url(),
            execute_path: default_execute_path(),
            request_timeout_secs: default_request_timeout(),
            health_timeout_secs: default_health_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            placeholder_url: None,
        }
    }
}

impl RendererConfig {
    pub fn placeholder_url(&self) -> String {
        self.placeholder_url.clone().unwrap_or_else(|| {
            format!(
                "{}/placeholder-animation.mp4",
                self.base_url.trim_end_matches('/')
            )
        })
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            embedding_model: default_embedding_model(),
            match_threshold: default_match_threshold(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load from the default location, creating a commented template on first run.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from an explicit file, or the default location when `path` is None.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;

        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths.config_file());

        let mut config = if file.exists() {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read config {}", file.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Invalid config {}", file.display()))?
        } else if path.is_some() {
            anyhow::bail!("Config file not found: {}", file.display());
        } else {
            write_template(&file)?;
            Config::default()
        };

        config.paths = paths;
        config.source = Some(file);
        config.apply_env_overrides(|key| std::env::var(key));

        Ok(config)
    }

    /// Parse TOML content and expand `${VAR}` references in secrets.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.expand_env_vars();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.source
            .clone()
            .unwrap_or_else(|| self.paths.config_file())
    }

    pub fn database_path(&self) -> PathBuf {
        match self.database.path {
            Some(ref p) => PathBuf::from(shellexpand::tilde(p).to_string()),
            None => self.paths.database(),
        }
    }

    pub fn placeholder_url(&self) -> String {
        self.renderer.placeholder_url()
    }

    fn expand_env_vars(&mut self) {
        if let Some(ref mut openai) = self.providers.openai {
            openai.api_key = expand_env(&openai.api_key);
        }
        if let Some(ref mut finetuned) = self.providers.finetuned
            && let Some(ref key) = finetuned.api_key
        {
            finetuned.api_key = Some(expand_env(key));
        }
    }

    /// Environment variables the deployed functions were configured with.
    pub fn apply_env_overrides<F>(&mut self, env_fn: F)
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        let non_empty = |key: &str| env_fn(key).ok().filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("OPENAI_API_KEY") {
            match self.providers.openai {
                Some(ref mut openai)
                    if openai.api_key.is_empty() || openai.api_key.starts_with('$') =>
                {
                    openai.api_key = key;
                }
                Some(_) => {}
                None => {
                    self.providers.openai = Some(OpenAIConfig {
                        api_key: key,
                        base_url: default_openai_base_url(),
                    });
                }
            }
        }

        if let Some(url) = non_empty("MANIM_SERVICE_URL") {
            self.renderer.base_url = url;
        }

        if let Some(flag) = non_empty("USE_FINETUNED_MODEL") {
            self.animation.use_finetuned_model = flag == "true";
        }

        if let Some(endpoint) = non_empty("FINE_TUNED_MODEL_ENDPOINT") {
            let api_key = non_empty("HF_API_KEY");
            match self.providers.finetuned {
                Some(ref mut ft) => {
                    ft.endpoint = endpoint;
                    if api_key.is_some() {
                        ft.api_key = api_key;
                    }
                }
                None => {
                    self.providers.finetuned = Some(FineTunedConfig { endpoint, api_key });
                }
            }
        }
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["chat", "model"] => Ok(self.chat.model.clone()),
            ["chat", "temperature"] => Ok(self.chat.temperature.to_string()),
            ["chat", "max_tokens"] => Ok(self.chat.max_tokens.to_string()),
            ["chat", "history_limit"] => Ok(self.chat.history_limit.to_string()),
            ["animation", "code_model"] => Ok(self.animation.code_model.clone()),
            ["animation", "use_finetuned_model"] => {
                Ok(self.animation.use_finetuned_model.to_string())
            }
            ["animation", "filter_trivial"] => Ok(self.animation.filter_trivial.to_string()),
            ["renderer", "base_url"] => Ok(self.renderer.base_url.clone()),
            ["renderer", "max_retries"] => Ok(self.renderer.max_retries.to_string()),
            ["renderer", "backoff_base_ms"] => Ok(self.renderer.backoff_base_ms.to_string()),
            ["cache", "enabled"] => Ok(self.cache.enabled.to_string()),
            ["cache", "match_threshold"] => Ok(self.cache.match_threshold.to_string()),
            ["database", "path"] => Ok(self.database_path().display().to_string()),
            ["server", "port"] => Ok(self.server.port.to_string()),
            ["server", "bind"] => Ok(self.server.bind.clone()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["chat", "model"] => self.chat.model = value.to_string(),
            ["chat", "temperature"] => self.chat.temperature = value.parse()?,
            ["chat", "max_tokens"] => self.chat.max_tokens = value.parse()?,
            ["chat", "history_limit"] => self.chat.history_limit = value.parse()?,
            ["animation", "code_model"] => self.animation.code_model = value.to_string(),
            ["animation", "use_finetuned_model"] => {
                self.animation.use_finetuned_model = value.parse()?
            }
            ["animation", "filter_trivial"] => self.animation.filter_trivial = value.parse()?,
            ["renderer", "base_url"] => self.renderer.base_url = value.to_string(),
            ["renderer", "max_retries"] => self.renderer.max_retries = value.parse()?,
            ["renderer", "backoff_base_ms"] => self.renderer.backoff_base_ms = value.parse()?,
            ["cache", "enabled"] => self.cache.enabled = value.parse()?,
            ["cache", "match_threshold"] => self.cache.match_threshold = value.parse()?,
            ["database", "path"] => self.database.path = Some(value.to_string()),
            ["server", "port"] => self.server.port = value.parse()?,
            ["server", "bind"] => self.server.bind = value.to_string(),
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn write_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    eprintln!("Created default config at {}", path.display());
    Ok(())
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Visun Configuration
# Auto-created on first run. Edit as needed.

# OpenAI-compatible API for chat, code generation and embeddings
# [providers.openai]
# api_key = "${OPENAI_API_KEY}"

# Fine-tuned Manim model (used when animation.use_finetuned_model = true)
# [providers.finetuned]
# endpoint = "https://example.com/models/manim"
# api_key = "${HF_API_KEY}"

[chat]
model = "gpt-3.5-turbo"
temperature = 0.7
max_tokens = 1000
history_limit = 10

[animation]
code_model = "gpt-4o"
use_finetuned_model = false
filter_trivial = true

[renderer]
# Manim execution service (MANIM_SERVICE_URL overrides)
base_url = "http://127.0.0.1:8080"
max_retries = 2
backoff_base_ms = 2000
# placeholder_url = "https://cdn.example.com/placeholder-animation.mp4"

[cache]
enabled = true
embedding_model = "text-embedding-3-small"
match_threshold = 0.78

# [database]
# path = "~/.local/share/visun/visun.sqlite"

[server]
port = 3000
bind = "127.0.0.1"

[logging]
level = "info"
json = false
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn template_parses_to_defaults() {
        let config = Config::parse(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.chat.model, "gpt-3.5-turbo");
        assert_eq!(config.animation.code_model, "gpt-4o");
        assert_eq!(config.renderer.max_retries, 2);
        assert_eq!(config.chat.history_limit, 10);
        assert!((config.cache.match_threshold - 0.78).abs() < 1e-6);
        assert!(config.providers.openai.is_none());
    }

    #[test]
    fn empty_config_uses_field_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.renderer.execute_path, "/execute-manim");
        assert_eq!(config.renderer.request_timeout_secs, 300);
        assert_eq!(config.server.port, 3000);
        assert!(config.animation.filter_trivial);
        assert_eq!(config.chat.history_limit, 10);
    }

    #[test]
    fn env_overrides_fill_in_deployment_settings() {
        let mut config = Config::default();
        let mut env = HashMap::new();
        env.insert("OPENAI_API_KEY", "sk-test");
        env.insert("MANIM_SERVICE_URL", "https://render.example.com");
        env.insert("USE_FINETUNED_MODEL", "true");
        env.insert("FINE_TUNED_MODEL_ENDPOINT", "https://hf.example.com/model");
        env.insert("HF_API_KEY", "hf-key");

        config.apply_env_overrides(make_env(env));

        assert_eq!(config.providers.openai.as_ref().unwrap().api_key, "sk-test");
        assert_eq!(config.renderer.base_url, "https://render.example.com");
        assert!(config.animation.use_finetuned_model);
        let ft = config.providers.finetuned.as_ref().unwrap();
        assert_eq!(ft.endpoint, "https://hf.example.com/model");
        assert_eq!(ft.api_key.as_deref(), Some("hf-key"));
    }

    #[test]
    fn env_key_does_not_replace_explicit_key() {
        let mut config =
            Config::parse("[providers.openai]\napi_key = \"from-file\"\n").unwrap();
        let mut env = HashMap::new();
        env.insert("OPENAI_API_KEY", "from-env");

        config.apply_env_overrides(make_env(env));
        assert_eq!(config.providers.openai.unwrap().api_key, "from-file");
    }

    #[test]
    fn placeholder_defaults_to_renderer_asset() {
        let mut config = Config::default();
        config.renderer.base_url = "https://render.example.com/".to_string();
        assert_eq!(
            config.placeholder_url(),
            "https://render.example.com/placeholder-animation.mp4"
        );

        config.renderer.placeholder_url = Some("https://cdn/p.mp4".to_string());
        assert_eq!(config.placeholder_url(), "https://cdn/p.mp4");
    }

    #[test]
    fn get_and_set_round_trip() {
        let mut config = Config::default();
        config.set_value("renderer.max_retries", "5").unwrap();
        config.set_value("animation.use_finetuned_model", "true").unwrap();
        assert_eq!(config.get_value("renderer.max_retries").unwrap(), "5");
        assert_eq!(
            config.get_value("animation.use_finetuned_model").unwrap(),
            "true"
        );
        assert!(config.set_value("nope.key", "1").is_err());
        assert!(config.set_value("server.port", "not-a-port").is_err());
    }
}
