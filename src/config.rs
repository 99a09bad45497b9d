//! dnschat configuration
//!
//! Everything tunable lives here: the wire suffix, session token width,
//! history bound, poller heuristics, and the backend endpoint. Values come
//! from a TOML file, get overlaid by environment variables, and finally by
//! CLI flags.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Environment variable holding the shared encryption key
pub const ENV_KEY: &str = "DNSCHAT_KEY";

/// Environment variable overriding the DNS suffix
pub const ENV_SUFFIX: &str = "DNSCHAT_SUFFIX";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Server listen address
    pub listen_addr: SocketAddr,

    /// Domain suffix terminating every tunnel query
    pub dns_suffix: String,

    /// Width of client session tokens (base36 characters). Wider tokens
    /// shrink the collision window between concurrent sessions at the cost
    /// of query-name budget.
    pub session_token_len: usize,

    /// Conversation turns kept per session (user + assistant both count);
    /// oldest are evicted first.
    pub max_history_turns: usize,

    /// Shared encryption key (base64url, raw, or passphrase). Usually set
    /// through the environment instead of the file.
    pub key: Option<String>,

    /// Backend configuration
    pub llm: LlmConfig,

    /// Client polling behavior
    pub poll: PollConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5353".parse().expect("valid literal addr"),
            dns_suffix: "llm.local".to_string(),
            session_token_len: 6,
            max_history_turns: 20,
            key: None,
            llm: LlmConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

/// Backend (OpenAI-compatible) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// API base URL, e.g. "https://api.openai.com/v1" or a local endpoint
    pub base_url: String,

    /// Bearer token; optional for local backends
    pub api_key: Option<String>,

    /// Model used for new exchanges (switchable at runtime via /model)
    pub model: String,

    pub max_tokens: u32,

    pub temperature: f32,

    /// Optional system prompt prepended to every exchange
    pub system_prompt: Option<String>,

    /// Consume the backend as a token stream and republish partial
    /// responses; false falls back to one-shot completion.
    pub stream: bool,

    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1000,
            temperature: 0.7,
            system_prompt: None,
            stream: true,
            request_timeout_secs: 120,
        }
    }
}

/// Client poller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Wait before the first retrieval round (ms)
    pub initial_wait_ms: u64,

    /// Delay between polling rounds (ms)
    pub poll_interval_ms: u64,

    /// Per-query UDP receive timeout (ms)
    pub response_timeout_ms: u64,

    /// Consecutive NOT_FOUND replies tolerated before a scan round gives up
    pub not_found_tolerance: u32,

    /// Ceiling on chunk indices scanned per round
    pub max_scan_indices: u32,

    /// Targeted re-fetch rounds for missing indices
    pub refetch_retries: u32,

    /// Exponential backoff base between re-fetch rounds (ms)
    pub backoff_base_ms: u64,

    /// Backoff cap (ms)
    pub backoff_cap_ms: u64,

    /// Pause before the confirming re-poll after the end marker appears (ms)
    pub confirm_wait_ms: u64,

    /// Overall wall-clock budget for one exchange (secs)
    pub overall_timeout_secs: u64,

    /// Attempts in non-streaming (traditional) retrieval mode
    pub traditional_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_wait_ms: 500,
            poll_interval_ms: 400,
            response_timeout_ms: 3000,
            not_found_tolerance: 3,
            max_scan_indices: 512,
            refetch_retries: 4,
            backoff_base_ms: 250,
            backoff_cap_ms: 4000,
            confirm_wait_ms: 600,
            overall_timeout_secs: 180,
            traditional_attempts: 10,
        }
    }
}

impl ChatConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Overlay settings from the process environment.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(ENV_KEY) {
            if !key.is_empty() {
                self.key = Some(key);
            }
        }
        if let Ok(suffix) = std::env::var(ENV_SUFFIX) {
            if !suffix.is_empty() {
                self.dns_suffix = suffix;
            }
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                self.llm.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            if !url.is_empty() {
                self.llm.base_url = url;
            }
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            if !model.is_empty() {
                self.llm.model = model;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=16).contains(&self.session_token_len) {
            return Err("session_token_len must be between 1 and 16".to_string());
        }
        if self.max_history_turns == 0 {
            return Err("max_history_turns must be at least 1".to_string());
        }
        let suffix = self.dns_suffix.trim_matches('.');
        if suffix.is_empty() {
            return Err("dns_suffix must not be empty".to_string());
        }
        for label in suffix.split('.') {
            if label.is_empty() || label.len() > crate::chunking::MAX_LABEL_LEN {
                return Err(format!("dns_suffix label `{label}` is not a legal DNS label"));
            }
        }
        if self.dns_suffix.len() > 100 {
            return Err("dns_suffix leaves too little room for payload data".to_string());
        }
        if self.llm.model.is_empty() {
            return Err("llm.model must be set".to_string());
        }
        if self.poll.max_scan_indices == 0 || self.poll.traditional_attempts == 0 {
            return Err("poll limits must be at least 1".to_string());
        }
        Ok(())
    }
}
