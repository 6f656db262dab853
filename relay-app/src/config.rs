//! Relay configuration loader.

use relay_llm::{ClientConfig, Provider};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub model: String,
    /// Inferred from `model` when unset.
    #[serde(default)]
    pub provider: Option<Provider>,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

#[derive(Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub xai_api_key: Option<String>,
    pub ollama_api_key: Option<String>,
    pub zai_api_key: Option<String>,
    pub nebius_api_key: Option<String>,
    /// Bedrock API key, sent as a bearer token.
    pub bedrock_api_key: Option<String>,
}

impl std::fmt::Debug for KeysConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = |k: &Option<String>| k.as_ref().map(|_| "<set>");
        f.debug_struct("KeysConfig")
            .field("openai_api_key", &set(&self.openai_api_key))
            .field("anthropic_api_key", &set(&self.anthropic_api_key))
            .field("gemini_api_key", &set(&self.gemini_api_key))
            .field("openrouter_api_key", &set(&self.openrouter_api_key))
            .field("xai_api_key", &set(&self.xai_api_key))
            .field("ollama_api_key", &set(&self.ollama_api_key))
            .field("zai_api_key", &set(&self.zai_api_key))
            .field("nebius_api_key", &set(&self.nebius_api_key))
            .field("bedrock_api_key", &set(&self.bedrock_api_key))
            .finish()
    }
}

/// Base URL overrides. Unset entries use each provider's public endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    pub openai_base_url: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub gemini_base_url: Option<String>,
    pub openrouter_base_url: Option<String>,
    pub grok_base_url: Option<String>,
    pub ollama_host: Option<String>,
    pub zai_base_url: Option<String>,
    pub nebius_base_url: Option<String>,
    /// Wins over `bedrock_region`.
    pub bedrock_base_url: Option<String>,
    pub bedrock_region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Applies to the HTTP handler, not to the streamed body.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    /// Whole-request timeout for upstream provider calls.
    #[serde(default = "default_upstream_timeout_seconds")]
    pub upstream_timeout_seconds: u64,
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

fn default_upstream_timeout_seconds() -> u64 {
    300
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            upstream_timeout_seconds: default_upstream_timeout_seconds(),
        }
    }
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("LLM_RELAY_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("LLM_RELAY_PROVIDER") {
            let provider = v
                .parse::<Provider>()
                .map_err(|e| anyhow::anyhow!("LLM_RELAY_PROVIDER: {e}"))?;
            self.general.provider = Some(provider);
        }
        for (name, slot) in [
            ("OPENAI_API_KEY", &mut self.keys.openai_api_key),
            ("ANTHROPIC_API_KEY", &mut self.keys.anthropic_api_key),
            ("GEMINI_API_KEY", &mut self.keys.gemini_api_key),
            ("OPENROUTER_API_KEY", &mut self.keys.openrouter_api_key),
            ("XAI_API_KEY", &mut self.keys.xai_api_key),
            ("ZAI_API_KEY", &mut self.keys.zai_api_key),
            ("NEBIUS_API_KEY", &mut self.keys.nebius_api_key),
            ("AWS_BEARER_TOKEN_BEDROCK", &mut self.keys.bedrock_api_key),
            ("OLLAMA_HOST", &mut self.providers.ollama_host),
        ] {
            if let Some(v) = var(name) {
                *slot = Some(v);
            }
        }
        if self.providers.bedrock_region.is_none() {
            self.providers.bedrock_region = var("AWS_REGION").or_else(|| var("AWS_DEFAULT_REGION"));
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.general.port == 0 {
            return Err(anyhow::anyhow!("general.port must be > 0"));
        }
        if self.runtime.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("runtime.http_max_in_flight must be > 0"));
        }
        if self.runtime.upstream_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("runtime.upstream_timeout_seconds must be > 0"));
        }
        let provider = self.default_provider();
        if provider.requires_api_key() && self.api_key_for(provider).is_none() {
            return Err(anyhow::anyhow!(
                "no API key configured for default provider {provider}"
            ));
        }
        Ok(())
    }

    pub fn default_provider(&self) -> Provider {
        self.general
            .provider
            .unwrap_or_else(|| Provider::detect(&self.general.model))
    }

    pub fn api_key_for(&self, provider: Provider) -> Option<String> {
        let key = match provider {
            Provider::OpenAi | Provider::OpenAiResponses => &self.keys.openai_api_key,
            Provider::Anthropic => &self.keys.anthropic_api_key,
            Provider::Gemini => &self.keys.gemini_api_key,
            Provider::OpenRouter => &self.keys.openrouter_api_key,
            Provider::Grok => &self.keys.xai_api_key,
            Provider::Ollama => &self.keys.ollama_api_key,
            Provider::Zai => &self.keys.zai_api_key,
            Provider::Nebius => &self.keys.nebius_api_key,
            Provider::Bedrock => &self.keys.bedrock_api_key,
        };
        key.clone().filter(|k| !k.trim().is_empty())
    }

    fn base_url_for(&self, provider: Provider) -> Option<String> {
        let non_empty = |v: &Option<String>| v.clone().filter(|v| !v.trim().is_empty());
        let url = match provider {
            Provider::OpenAi | Provider::OpenAiResponses => &self.providers.openai_base_url,
            Provider::Anthropic => &self.providers.anthropic_base_url,
            Provider::Gemini => &self.providers.gemini_base_url,
            Provider::OpenRouter => &self.providers.openrouter_base_url,
            Provider::Grok => &self.providers.grok_base_url,
            Provider::Ollama => &self.providers.ollama_host,
            Provider::Zai => &self.providers.zai_base_url,
            Provider::Nebius => &self.providers.nebius_base_url,
            Provider::Bedrock => {
                return non_empty(&self.providers.bedrock_base_url).or_else(|| {
                    non_empty(&self.providers.bedrock_region).map(|region| {
                        format!("https://bedrock-runtime.{}.amazonaws.com", region.trim())
                    })
                });
            }
        };
        non_empty(url)
    }

    /// Providers that can be called with the current keys.
    pub fn configured_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| !p.requires_api_key() || self.api_key_for(*p).is_some())
            .collect()
    }

    pub fn client_config(&self, provider: Provider) -> ClientConfig {
        let mut config = ClientConfig::new(provider)
            .with_timeout(Duration::from_secs(self.runtime.upstream_timeout_seconds));
        config.api_key = self.api_key_for(provider);
        config.base_url = self.base_url_for(provider);
        config
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let raw = format!("{}:{}", self.general.bind_addr.trim(), self.general.port);
        raw.parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address {raw}: {e}"))
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".llm-relay").join("config.toml")
}
