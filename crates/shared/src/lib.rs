pub mod error;
pub mod events;

pub mod settings {
    use anyhow::{Context, Result};
    use directories::ProjectDirs;
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    pub const DEFAULT_API_BASE: &str = "http://localhost:41434";
    pub const DEFAULT_OLLAMA_BASE: &str = "http://127.0.0.1:11434";

    /// Connection settings for the suite API and the local Ollama daemon.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct RelaySettings {
        pub api_base_url: String,
        pub ollama_base_url: String,
        pub default_model: String, // e.g., "llama3.2:latest"
        pub default_knowledge_base: String,
        /// Upper bound for a streamed chat; generation can legitimately take minutes.
        pub chat_timeout_secs: u64,
        /// Timeout for short control requests (health probes, model lists).
        pub request_timeout_secs: u64,
    }

    impl Default for RelaySettings {
        fn default() -> Self {
            Self {
                api_base_url: DEFAULT_API_BASE.into(),
                ollama_base_url: DEFAULT_OLLAMA_BASE.into(),
                default_model: "llama3.2:latest".into(),
                default_knowledge_base: "default".into(),
                chat_timeout_secs: 300,
                request_timeout_secs: 30,
            }
        }
    }

    impl RelaySettings {
        /// Defaults, then `settings.json` in the platform config dir, then env overrides.
        pub fn load() -> Result<Self> {
            let mut settings = match config_dir() {
                Some(dir) => Self::load_from(&dir.join("settings.json"))?,
                None => Self::default(),
            };
            settings.apply_env(|key| std::env::var(key).ok());
            Ok(settings)
        }

        /// Read settings from a JSON file. A missing file yields the defaults.
        pub fn load_from(path: &Path) -> Result<Self> {
            if !path.exists() {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        }

        pub fn save_to(&self, path: &Path) -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_json::to_string_pretty(self)?)?;
            Ok(())
        }

        /// Apply `AI_DEV_SUITE_*` / `OLLAMA_BASE_URL` overrides using `lookup`.
        pub fn apply_env<F>(&mut self, lookup: F)
        where
            F: Fn(&str) -> Option<String>,
        {
            let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
            if let Some(v) = non_empty("AI_DEV_SUITE_API_URL") {
                self.api_base_url = v;
            }
            if let Some(v) = non_empty("AI_DEV_SUITE_MODEL") {
                self.default_model = v;
            }
            if let Some(v) = non_empty("AI_DEV_SUITE_KB") {
                self.default_knowledge_base = v;
            }
            if let Some(v) = non_empty("OLLAMA_BASE_URL") {
                self.ollama_base_url = v;
            }
        }

        pub fn api_base(&self) -> &str {
            self.api_base_url.trim_end_matches('/')
        }

        pub fn chat_timeout(&self) -> Duration {
            Duration::from_secs(self.chat_timeout_secs)
        }

        pub fn request_timeout(&self) -> Duration {
            Duration::from_secs(self.request_timeout_secs)
        }
    }

    /// Platform config directory for the suite (e.g. `~/.config/ai-dev-suite`).
    pub fn config_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "ai-dev-suite", "ai-dev-suite")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }
}

pub mod agent_api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub role: String, // "system" | "user" | "assistant"
        pub content: String,
    }

    impl ChatMessage {
        pub fn user(content: impl Into<String>) -> Self {
            Self {
                role: "user".into(),
                content: content.into(),
            }
        }
    }

    /// Ollama-style generation parameters. Unset fields are not serialized.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct GenerationOptions {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub temperature: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub num_predict: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub num_ctx: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub top_p: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub top_k: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub repeat_penalty: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub repeat_last_n: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub seed: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub stop: Option<Vec<String>>,
    }

    impl GenerationOptions {
        pub fn is_empty(&self) -> bool {
            *self == Self::default()
        }
    }

    /// Body of `POST /api/chat/stream`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ChatRequest {
        pub model: String,
        pub messages: Vec<ChatMessage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub knowledge_bases: Option<Vec<String>>,
        /// Legacy single knowledge base; used when no list is given.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub knowledge_base: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub options: Option<GenerationOptions>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        pub internet_enabled: bool,
    }

    impl ChatRequest {
        /// New request against the `default` knowledge base.
        pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
            Self {
                model: model.into(),
                messages,
                knowledge_bases: None,
                knowledge_base: Some("default".into()),
                options: None,
                internet_enabled: false,
            }
        }

        /// Select knowledge bases. An empty list falls back to `default`.
        pub fn with_knowledge_bases(mut self, names: Vec<String>) -> Self {
            if names.is_empty() {
                self.knowledge_bases = None;
                self.knowledge_base = Some("default".into());
            } else {
                self.knowledge_bases = Some(names);
                self.knowledge_base = None;
            }
            self
        }

        pub fn with_options(mut self, options: GenerationOptions) -> Self {
            self.options = if options.is_empty() {
                None
            } else {
                Some(options)
            };
            self
        }

        pub fn with_internet(mut self, enabled: bool) -> Self {
            self.internet_enabled = enabled;
            self
        }
    }
}
