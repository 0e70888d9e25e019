//! Role-driven LLM router.
//!
//! Three roles only: `default` (main model), `cheap` (routing, summarizing,
//! exploration, delegation), `routing` (prefers a low-latency endpoint if
//! configured). Each role maps to a `provider_id/model_name` string in
//! config; the router resolves it, dispatches, tabulates cost, and emits
//! the trace event.

use crate::pricing;
use crate::registry::ProviderRegistry;
use crate::retry::with_retry;
use crate::traits::{CancellationCheck, ChatRequest, ChatResponse, LlmProvider};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use warden_domain::config::{LlmConfig, RoleConfig};
use warden_domain::error::{Error, Result};
use warden_domain::trace::TraceEvent;

pub const ROLE_DEFAULT: &str = "default";
pub const ROLE_CHEAP: &str = "cheap";
pub const ROLE_ROUTING: &str = "routing";

pub struct LlmRouter {
    registry: ProviderRegistry,
    role_configs: HashMap<String, RoleConfig>,
    default_timeout_ms: u64,
}

impl LlmRouter {
    pub fn from_config(llm_config: &LlmConfig) -> Result<Self> {
        let registry = ProviderRegistry::from_config(llm_config)?;
        Ok(Self {
            registry,
            role_configs: llm_config.roles.clone(),
            default_timeout_ms: llm_config.default_timeout_ms,
        })
    }

    pub fn new(
        registry: ProviderRegistry,
        role_configs: HashMap<String, RoleConfig>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            registry,
            role_configs,
            default_timeout_ms,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Send a chat request for a named role (`default`/`cheap`/`routing`).
    /// Resolves the provider, applies retry-with-backoff on rate limits,
    /// tabulates cost, and emits `TraceEvent::LlmRequest`.
    pub async fn chat_for_role(
        &self,
        role: &str,
        mut req: ChatRequest,
        cancellation_check: Option<CancellationCheck>,
    ) -> Result<ChatResponse> {
        let role_cfg = self
            .role_configs
            .get(role)
            .ok_or_else(|| Error::Config(format!("no role config for '{role}'")))?;
        let (provider_id, model_name) = resolve_model(&role_cfg.model);
        let provider = self.registry.get(provider_id).ok_or_else(|| {
            Error::Config(format!("provider '{provider_id}' not registered for role '{role}'"))
        })?;

        req.model = Some(model_name.to_string());
        if req.component.is_empty() {
            req.component = role.to_string();
        }

        let start = Instant::now();
        let check_ref = cancellation_check.as_deref();
        let result = with_retry(provider_id, check_ref, || {
            self.try_chat(&provider, req.clone(), cancellation_check.clone())
        })
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        TraceEvent::LlmRequest {
            provider: provider_id.to_string(),
            model: model_name.to_string(),
            component: req.component.clone(),
            streaming: false,
            duration_ms,
            prompt_tokens: result.as_ref().ok().map(|r: &ChatResponse| r.usage.prompt_tokens),
            completion_tokens: result.as_ref().ok().map(|r: &ChatResponse| r.usage.completion_tokens),
        }
        .emit();

        result
    }

    async fn try_chat(
        &self,
        provider: &Arc<dyn LlmProvider>,
        req: ChatRequest,
        cancellation_check: Option<CancellationCheck>,
    ) -> Result<ChatResponse> {
        let timeout = std::time::Duration::from_millis(self.default_timeout_ms);
        let model = req.model.clone().unwrap_or_default();
        let provider_id = provider.provider_id().to_string();
        match tokio::time::timeout(timeout, provider.chat(req, cancellation_check)).await {
            Ok(result) => {
                let mut result = result;
                if let Ok(resp) = &mut result {
                    resp.cost_usd = pricing::calculate_cost(&provider_id, &model, &resp.usage);
                }
                result
            }
            Err(_) => Err(Error::Timeout(format!(
                "provider '{provider_id}' timed out after {}ms",
                self.default_timeout_ms
            ))),
        }
    }
}

/// Split a `"provider_id/model_name"` string into its two components.
pub fn resolve_model(model_str: &str) -> (&str, &str) {
    match model_str.split_once('/') {
        Some((provider, model)) => (provider, model),
        None => (model_str, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_model_splits_on_slash() {
        assert_eq!(resolve_model("openai/gpt-4o"), ("openai", "gpt-4o"));
    }

    #[test]
    fn resolve_model_without_slash_has_empty_model() {
        assert_eq!(resolve_model("openai"), ("openai", ""));
    }
}
