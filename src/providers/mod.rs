//! LLM provider adapters.
//!
//! Every back-end implements the single [`Provider::chat`] operation over the
//! shared protocol types; translating to and from the back-end wire shape is
//! the adapter's whole job. Model references use `provider/model` syntax with
//! a small alias table.

pub mod anthropic;
pub mod failover;
pub mod ollama;
pub mod openai;

pub use failover::{
    classify_error, Attempt, Candidate, CooldownTracker, FailoverReason, FallbackChain,
};

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::auth::AuthStore;
use crate::config::Config;
use crate::protocol::{ChatOptions, LLMResponse, Message, ToolDefinition};

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        opts: &ChatOptions,
    ) -> Result<LLMResponse>;
}

/// Expand short model aliases to full `provider/model` references.
pub fn resolve_model_alias(model: &str) -> String {
    match model.to_lowercase().as_str() {
        "opus" => "anthropic/claude-opus-4-5".to_string(),
        "sonnet" => "anthropic/claude-sonnet-4-5".to_string(),
        "haiku" => "anthropic/claude-haiku-4-5".to_string(),
        "gpt" => "openai/gpt-4o".to_string(),
        "gpt-mini" => "openai/gpt-4o-mini".to_string(),
        "glm" => "glm/glm-4.7".to_string(),
        _ => model.to_string(),
    }
}

/// Split a model reference into `(provider, model_id)`.
///
/// Bare model ids are mapped by prefix heuristics, matching how users write
/// them in configs ported from other runtimes.
pub fn parse_model_ref(model: &str) -> (String, String) {
    let model = resolve_model_alias(model);

    if let Some((provider, id)) = model.split_once('/') {
        return (provider.to_lowercase(), id.to_string());
    }
    if model.starts_with("gpt-") || model.starts_with("o1") {
        return ("openai".to_string(), model);
    }
    if model.starts_with("claude-") {
        return ("anthropic".to_string(), model);
    }
    if model.starts_with("glm-") {
        return ("glm".to_string(), model);
    }
    ("anthropic".to_string(), model)
}

/// Instantiate the adapter for a provider name, resolving credentials
/// config-first, then the auth store, then the environment.
pub fn create_provider(
    provider: &str,
    config: &Config,
    auth: &AuthStore,
) -> Result<Arc<dyn Provider>> {
    match provider {
        "anthropic" => {
            let section = config.providers.anthropic.clone().unwrap_or_else(|| {
                crate::config::AnthropicConfig {
                    api_key: String::new(),
                    base_url: "https://api.anthropic.com".to_string(),
                }
            });
            let api_key = resolve_api_key(&section.api_key, "anthropic", auth, "ANTHROPIC_API_KEY")?;
            Ok(Arc::new(anthropic::AnthropicProvider::new(
                &api_key,
                &section.base_url,
            )))
        }

        "openai" => {
            let section = config.providers.openai.clone().unwrap_or_else(|| {
                crate::config::OpenAIConfig {
                    api_key: String::new(),
                    base_url: "https://api.openai.com/v1".to_string(),
                }
            });
            let api_key = resolve_api_key(&section.api_key, "openai", auth, "OPENAI_API_KEY")?;
            Ok(Arc::new(openai::OpenAIProvider::new(
                "openai",
                &api_key,
                &section.base_url,
            )))
        }

        // OpenAI-compatible endpoints share one adapter.
        "glm" => {
            let section = config.providers.glm.clone().unwrap_or_else(|| {
                crate::config::GlmConfig {
                    api_key: String::new(),
                    base_url: "https://open.bigmodel.cn/api/paas/v4".to_string(),
                }
            });
            let api_key = resolve_api_key(&section.api_key, "glm", auth, "GLM_API_KEY")?;
            Ok(Arc::new(openai::OpenAIProvider::new(
                "glm",
                &api_key,
                &section.base_url,
            )))
        }

        "openrouter" => {
            let section = config.providers.openrouter.clone().unwrap_or_else(|| {
                crate::config::OpenRouterConfig {
                    api_key: String::new(),
                    base_url: "https://openrouter.ai/api/v1".to_string(),
                }
            });
            let api_key =
                resolve_api_key(&section.api_key, "openrouter", auth, "OPENROUTER_API_KEY")?;
            Ok(Arc::new(openai::OpenAIProvider::new(
                "openrouter",
                &api_key,
                &section.base_url,
            )))
        }

        "ollama" => {
            let endpoint = config
                .providers
                .ollama
                .as_ref()
                .map(|c| c.endpoint.clone())
                .unwrap_or_else(|| "http://localhost:11434".to_string());
            Ok(Arc::new(ollama::OllamaProvider::new(&endpoint)))
        }

        _ => anyhow::bail!(
            "Unknown provider '{}'.\n\n\
             Supported model references:\n  \
             - anthropic/claude-opus-4-5, anthropic/claude-sonnet-4-5\n  \
             - openai/gpt-4o, openai/gpt-4o-mini\n  \
             - glm/glm-4.7, openrouter/<vendor/model>\n  \
             - ollama/llama3\n\n\
             Or use aliases: opus, sonnet, haiku, gpt, gpt-mini, glm",
            provider
        ),
    }
}

fn resolve_api_key(
    configured: &str,
    provider: &str,
    auth: &AuthStore,
    env_var: &str,
) -> Result<String> {
    if !configured.is_empty() {
        return Ok(configured.to_string());
    }
    if let Some(cred) = auth.get(provider) {
        if !cred.access_token.is_empty() {
            return Ok(cred.access_token);
        }
    }
    if let Ok(key) = std::env::var(env_var) {
        if !key.is_empty() {
            return Ok(key);
        }
    }
    anyhow::bail!(
        "Provider '{}' is not configured.\n\
         Set {} or add to ~/.krill/config.toml:\n\n\
         [providers.{}]\n\
         api_key = \"...\"",
        provider,
        env_var,
        provider
    )
}

/// Build the ordered candidate list for an agent's primary + fallback models.
pub fn build_candidates(
    models: &[String],
    config: &Config,
    auth: &AuthStore,
) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::with_capacity(models.len());
    for model_ref in models {
        let (provider_name, model_id) = parse_model_ref(model_ref);
        let provider = create_provider(&provider_name, config, auth)?;
        candidates.push(Candidate {
            provider,
            model: model_id,
        });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_resolution() {
        assert_eq!(resolve_model_alias("sonnet"), "anthropic/claude-sonnet-4-5");
        assert_eq!(resolve_model_alias("gpt"), "openai/gpt-4o");
        assert_eq!(
            resolve_model_alias("anthropic/claude-opus-4-5"),
            "anthropic/claude-opus-4-5"
        );
    }

    #[test]
    fn test_parse_model_ref_with_slash() {
        assert_eq!(
            parse_model_ref("openai/gpt-4o"),
            ("openai".to_string(), "gpt-4o".to_string())
        );
        assert_eq!(
            parse_model_ref("openrouter/meta/llama-3-70b"),
            ("openrouter".to_string(), "meta/llama-3-70b".to_string())
        );
    }

    #[test]
    fn test_parse_model_ref_heuristics() {
        assert_eq!(parse_model_ref("gpt-4o").0, "openai");
        assert_eq!(parse_model_ref("claude-sonnet-4-5").0, "anthropic");
        assert_eq!(parse_model_ref("glm-4.7").0, "glm");
        assert_eq!(parse_model_ref("mystery-model").0, "anthropic");
    }
}
