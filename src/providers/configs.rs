use anyhow::{anyhow, Result};

use super::ollama::{OLLAMA_HOST, OLLAMA_MODEL};

/// Unified enum to wrap different provider configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
    Ollama(OllamaProviderConfig),
}

#[derive(Debug, Clone)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

impl OpenAiProviderConfig {
    /// Build a config from OPENAI_API_KEY (required), OPENAI_HOST and
    /// OPENAI_MODEL (optional)
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY must be set"))?;
        Ok(Self {
            host: std::env::var("OPENAI_HOST")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            api_key,
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            temperature: None,
            max_tokens: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OllamaProviderConfig {
    pub host: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

impl OllamaProviderConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: std::env::var("OLLAMA_HOST").unwrap_or_else(|_| OLLAMA_HOST.to_string()),
            model: std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| OLLAMA_MODEL.to_string()),
            temperature: None,
            max_tokens: None,
        })
    }
}
