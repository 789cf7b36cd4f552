use std::env;

use crate::error::{AccordResult, ConfigError};

/// Which LLM provider backs agents, the trigger classifier, and document
/// generation. The wire formats differ; the conversation model does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmProviderKind {
    #[default]
    A,
    B,
}

/// Process-wide configuration, assembled once at startup from the
/// environment and injected from the composition root. A `.env` file is
/// honored in development (`dotenvy`); missing required variables fail
/// startup with the offending variable named.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // === Payment provider (required) ===
    pub payment_secret_key: String,
    pub platform_account_id: String,

    // === LLM provider (required) ===
    pub llm_provider: LlmProviderKind,
    pub llm_api_key: String,
    pub llm_model: String,

    // === Speech-to-text ===
    pub stt_api_key: Option<String>,
    pub stt_region: Option<String>,
    pub stt_language: String,

    // === Outbound phone verification (optional) ===
    pub phone_api_key: Option<String>,
    pub phone_caller_id: Option<String>,

    // === Trigger detection ===
    pub trigger_keyword: String,
    pub semantic_detection: bool,

    // === Server ===
    pub port: u16,
}

impl AppConfig {
    /// Load the configuration from the process environment.
    pub fn from_env() -> AccordResult<Self> {
        Ok(Self {
            payment_secret_key: required("PAYMENT_SECRET_KEY")?,
            platform_account_id: required("PAYMENT_PLATFORM_ACCOUNT_ID")?,
            llm_provider: parse_llm_provider(&required("LLM_PROVIDER")?)?,
            llm_api_key: required("LLM_API_KEY")?,
            llm_model: required("LLM_MODEL")?,
            stt_api_key: optional("STT_API_KEY"),
            stt_region: optional("STT_REGION"),
            stt_language: optional("STT_LANGUAGE").unwrap_or_else(|| "en-GB".to_string()),
            phone_api_key: optional("PHONE_API_KEY"),
            phone_caller_id: optional("PHONE_CALLER_ID"),
            trigger_keyword: optional("TRIGGER_KEYWORD").unwrap_or_else(|| "handshake".to_string()),
            semantic_detection: optional("SEMANTIC_DETECTION")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            port: parse_port(optional("PORT"))?,
        })
    }

    pub fn phone_configured(&self) -> bool {
        self.phone_api_key.is_some()
    }
}

fn required(var: &str) -> AccordResult<String> {
    env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVar(var.to_string()).into())
}

fn optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_llm_provider(raw: &str) -> AccordResult<LlmProviderKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "a" => Ok(LlmProviderKind::A),
        "b" => Ok(LlmProviderKind::B),
        other => Err(ConfigError::InvalidVar {
            var: "LLM_PROVIDER".to_string(),
            msg: format!("expected 'a' or 'b', got '{other}'"),
        }
        .into()),
    }
}

fn parse_port(raw: Option<String>) -> AccordResult<u16> {
    match raw {
        None => Ok(8787),
        Some(v) => v.parse::<u16>().map_err(|e| {
            ConfigError::InvalidVar {
                var: "PORT".to_string(),
                msg: e.to_string(),
            }
            .into()
        }),
    }
}
