//! Integration test for role-based routing across the registry + router.

use std::collections::HashMap;
use warden_domain::config::{AuthConfig, LlmConfig, ProviderConfig, ProviderKind, RoleConfig};
use warden_providers::{ChatRequest, LlmRouter};

fn llm_config() -> LlmConfig {
    let mut roles = HashMap::new();
    roles.insert(
        "default".to_string(),
        RoleConfig {
            model: "local/gpt-oss".into(),
        },
    );
    roles.insert(
        "cheap".to_string(),
        RoleConfig {
            model: "local/gpt-oss-mini".into(),
        },
    );

    LlmConfig {
        default_timeout_ms: 5_000,
        max_retries: 5,
        roles,
        providers: vec![ProviderConfig {
            id: "local".into(),
            kind: ProviderKind::OpenaiCompat,
            base_url: "http://127.0.0.1:9/v1".into(),
            auth: AuthConfig {
                env: None,
                key: Some("test-key".into()),
            },
            default_model: Some("gpt-oss".into()),
        }],
    }
}

#[tokio::test]
async fn unknown_role_returns_config_error() {
    let config = llm_config();
    let router = LlmRouter::from_config(&config).unwrap();
    let req = ChatRequest {
        component: "test".into(),
        ..Default::default()
    };
    let err = router.chat_for_role("nonexistent", req, None).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn registry_resolves_both_configured_roles() {
    let config = llm_config();
    let router = LlmRouter::from_config(&config).unwrap();
    assert!(router.registry().for_role("default").is_some());
    assert!(router.registry().for_role("cheap").is_some());
    assert!(router.registry().for_role("routing").is_none());
}
