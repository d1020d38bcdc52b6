//! Mirroring configuration.
//!
//! Timing knobs and per-pane-kind selector lists live in
//! `~/.multidesk/multidesk.toml`. Every field has a default, so a missing or
//! empty file yields a working configuration. The selector tables for the
//! supported chat services are compiled in; the config file may only
//! override them per kind.

use crate::error::MirrorError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Texts the OCR fallback looks for when no descriptor matched, appended
/// after the per-kind candidates.
pub const DEFAULT_CANDIDATE_TEXTS: &[&str] = &[
    "Ask anything",
    "what do you want to know",
    "Message",
    "Type a message",
    "Enter your message",
    "What can I help",
    "How can I help",
    "Ask me anything",
    "Type here",
    "Enter text",
    "Search",
    "Chat",
    "Send a message",
    "Start typing",
];

/// The chat services a pane can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaneKind {
    ChatGpt,
    Grok,
    Gemini,
    Claude,
}

impl PaneKind {
    pub const ALL: [PaneKind; 4] = [Self::ChatGpt, Self::Grok, Self::Gemini, Self::Claude];

    pub fn name(self) -> &'static str {
        match self {
            Self::ChatGpt => "chatgpt",
            Self::Grok => "grok",
            Self::Gemini => "gemini",
            Self::Claude => "claude",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn url(self) -> &'static str {
        match self {
            Self::ChatGpt => "https://chat.openai.com",
            Self::Grok => "https://grok.x.ai",
            Self::Gemini => "https://gemini.google.com/app",
            Self::Claude => "https://claude.ai/chats",
        }
    }

    /// Input descriptors in priority order.
    pub fn input_selectors(self) -> &'static [&'static str] {
        match self {
            Self::ChatGpt => &[
                "#prompt-textarea",
                "div[contenteditable=\"true\"]#prompt-textarea",
                "form textarea",
                "textarea",
            ],
            Self::Grok => &[
                "div[contenteditable='true'][role='textbox']",
                "textarea[aria-label*='Ask']",
                "textarea",
            ],
            Self::Gemini => &[
                "div.input-area rich-textarea > div[contenteditable='true']",
                "rich-textarea div[contenteditable='true']",
                "div[contenteditable='true'][role='textbox']",
            ],
            Self::Claude => &[
                "div[contenteditable=\"true\"][data-testid=\"chat-input\"]",
                "div[contenteditable=\"true\"][role=\"textbox\"]",
                "div[contenteditable=\"true\"][aria-label*=\"message\"]",
                "div[contenteditable=\"true\"][aria-label*=\"Message\"]",
                "div[contenteditable=\"true\"][aria-label*=\"input\"]",
                "div[contenteditable=\"true\"][aria-label*=\"Input\"]",
                "div[contenteditable=\"true\"][placeholder*=\"Message\"]",
                "div[contenteditable=\"true\"][placeholder*=\"Ask\"]",
                "div[contenteditable=\"true\"][placeholder*=\"Type\"]",
                "div.ProseMirror[contenteditable=\"true\"]",
                "div[data-testid=\"composer\"] div[contenteditable=\"true\"]",
                "div[data-testid=\"chat-input\"] div[contenteditable=\"true\"]",
                "form div[contenteditable=\"true\"]",
                "form textarea",
                "div[contenteditable=\"true\"]",
                "[contenteditable=\"true\"]",
                "textarea[placeholder*=\"Message\"]",
                "textarea[placeholder*=\"Ask\"]",
                "textarea[data-testid*=\"input\"]",
                "textarea[aria-label*=\"input\"]",
                "textarea",
                "input[type=\"text\"]",
            ],
        }
    }

    pub fn send_button_selectors(self) -> &'static [&'static str] {
        match self {
            Self::ChatGpt => &["button[data-testid='send-button']"],
            Self::Grok | Self::Gemini => &[
                "button[aria-label='Send message']",
                "button[aria-label='Submit']",
            ],
            Self::Claude => &[
                "button[aria-label*='Send']",
                "button[data-testid*='send']",
                "button[type='submit']",
                "button[title*='Send']",
            ],
        }
    }

    pub fn reply_selectors(self) -> &'static [&'static str] {
        match self {
            Self::ChatGpt => &["div[data-message-author-role='assistant'] .markdown"],
            Self::Grok => &["div.message-content"],
            Self::Gemini => &["div.model-response-text"],
            Self::Claude => &[
                "div[data-testid*='message'] .prose",
                "div.message-content",
                ".assistant-message",
            ],
        }
    }

    /// Placeholder texts shown in this service's empty input box.
    pub fn candidate_texts(self) -> &'static [&'static str] {
        match self {
            Self::ChatGpt => &["Ask anything", "Message ChatGPT"],
            Self::Grok => &["Ask anything", "What do you want to know?"],
            Self::Gemini => &["Ask Gemini", "Enter a prompt here"],
            Self::Claude => &["How can I help you today?", "Reply to Claude..."],
        }
    }
}

impl fmt::Display for PaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolved selector configuration for one pane kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneProfile {
    pub kind: PaneKind,
    pub url: String,
    pub input_selectors: Vec<String>,
    pub send_button_selectors: Vec<String>,
    pub reply_selectors: Vec<String>,
    /// Texts for the OCR fallback, per-kind first, then the shared defaults.
    pub candidate_texts: Vec<String>,
}

impl PaneProfile {
    /// The compiled-in profile for `kind`.
    pub fn builtin(kind: PaneKind) -> Self {
        Self {
            kind,
            url: kind.url().to_string(),
            input_selectors: owned(kind.input_selectors()),
            send_button_selectors: owned(kind.send_button_selectors()),
            reply_selectors: owned(kind.reply_selectors()),
            candidate_texts: merge_candidate_texts(kind.candidate_texts()),
        }
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Append [`DEFAULT_CANDIDATE_TEXTS`] to `first`, skipping duplicates and
/// preserving their order.
pub fn merge_candidate_texts<S: AsRef<str>>(first: &[S]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let all = first
        .iter()
        .map(|s| s.as_ref())
        .chain(DEFAULT_CANDIDATE_TEXTS.iter().copied());
    for text in all {
        if !merged.iter().any(|t| t == text) {
            merged.push(text.to_string());
        }
    }
    merged
}

/// Bounded fixed-interval retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay between two attempts.
    pub interval_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Reply stabilization knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default = "default_reply_poll")]
    pub poll_interval_ms: u64,
    /// Consecutive unchanged polls before a reply counts as finished.
    #[serde(default = "default_stable_checks")]
    pub stable_checks: u32,
    #[serde(default = "default_reply_timeout")]
    pub timeout_ms: u64,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_reply_poll(),
            stable_checks: default_stable_checks(),
            timeout_ms: default_reply_timeout(),
        }
    }
}

fn default_reply_poll() -> u64 {
    500
}

fn default_stable_checks() -> u32 {
    4
}

fn default_reply_timeout() -> u64 {
    60_000
}

/// Per-kind overrides of the compiled-in selector tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneOverride {
    pub input_selectors: Option<Vec<String>>,
    pub send_button_selectors: Option<Vec<String>>,
    pub reply_selectors: Option<Vec<String>>,
    pub candidate_texts: Option<Vec<String>>,
}

/// Top-level mirroring configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Input element lookup after page load.
    #[serde(default = "default_selector_retry")]
    pub selector_retry: RetryPolicy,

    /// Pane-to-host channel handshake.
    #[serde(default = "default_handshake_retry")]
    pub handshake_retry: RetryPolicy,

    /// How long a pane keeps suppressing its own notifications after a
    /// programmatic write.
    #[serde(default = "default_echo_clear_delay")]
    pub echo_clear_delay_ms: u64,

    /// Period of the per-pane resilience check.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,

    #[serde(default)]
    pub reply: ReplyConfig,

    /// Overrides keyed by pane kind name (`chatgpt`, `grok`, `gemini`, `claude`).
    #[serde(default)]
    pub panes: HashMap<String, PaneOverride>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            selector_retry: default_selector_retry(),
            handshake_retry: default_handshake_retry(),
            echo_clear_delay_ms: default_echo_clear_delay(),
            monitor_interval_ms: default_monitor_interval(),
            reply: ReplyConfig::default(),
            panes: HashMap::new(),
        }
    }
}

fn default_selector_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 20,
        interval_ms: 500,
    }
}

fn default_handshake_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        interval_ms: 1000,
    }
}

fn default_echo_clear_delay() -> u64 {
    100
}

fn default_monitor_interval() -> u64 {
    5000
}

fn default_config_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".multidesk")
        .join("multidesk.toml")
}

impl MirrorConfig {
    /// Load configuration from the default config file.
    pub fn load() -> Self {
        Self::load_from(&default_config_path())
    }

    /// Load configuration from a specific path, falling back to defaults.
    pub fn load_from(path: &Path) -> Self {
        match Self::try_load_from(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Using default mirror config: {e:#}");
                Self::default()
            }
        }
    }

    /// Load and validate configuration, surfacing read and parse errors.
    pub fn try_load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MirrorError> {
        for (name, policy) in [
            ("selector_retry", &self.selector_retry),
            ("handshake_retry", &self.handshake_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(MirrorError::Config(format!(
                    "{name}.max_attempts must be at least 1"
                )));
            }
        }
        if self.monitor_interval_ms == 0 {
            return Err(MirrorError::Config(
                "monitor_interval_ms must be positive".into(),
            ));
        }
        if self.reply.poll_interval_ms == 0 || self.reply.stable_checks == 0 {
            return Err(MirrorError::Config(
                "reply polling needs a positive interval and check count".into(),
            ));
        }
        for (kind, o) in &self.panes {
            if PaneKind::from_name(kind).is_none() {
                return Err(MirrorError::Config(format!("unknown pane kind `{kind}`")));
            }
            if o.input_selectors.as_ref().is_some_and(|s| s.is_empty()) {
                return Err(MirrorError::Config(format!(
                    "panes.{kind}.input_selectors must not be empty"
                )));
            }
        }
        Ok(())
    }

    /// The effective profile for `kind`, with overrides applied.
    pub fn profile(&self, kind: PaneKind) -> PaneProfile {
        let mut profile = PaneProfile::builtin(kind);
        if let Some(o) = self.panes.get(kind.name()) {
            if let Some(s) = &o.input_selectors {
                profile.input_selectors = s.clone();
            }
            if let Some(s) = &o.send_button_selectors {
                profile.send_button_selectors = s.clone();
            }
            if let Some(s) = &o.reply_selectors {
                profile.reply_selectors = s.clone();
            }
            if let Some(t) = &o.candidate_texts {
                profile.candidate_texts = merge_candidate_texts(t);
            }
        }
        profile
    }

    pub fn echo_clear_delay(&self) -> Duration {
        Duration::from_millis(self.echo_clear_delay_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
