#![allow(clippy::unwrap_used, clippy::expect_used)]

use larder_agents::*;
use larder_core::{ErrorKind, LarderResult, Payload};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn pantry_builder() -> AgentRegistryBuilder {
    register_builtins(AgentRegistry::builder())
        .register(
            BuiltinKind::Echo
                .descriptor("Recipe")
                .alias("cook")
                .alias("CHEF")
                .timeout(Duration::from_secs(5)),
        )
        .map_intent("recipe_search", "chef")
        .default_agent("echo")
}

// ---------------------------------------------------------------------------
// 1. Every name and alias resolves to the same descriptor, in any case
// ---------------------------------------------------------------------------

#[test]
fn every_spelling_resolves_to_one_descriptor() {
    let registry = pantry_builder().build().unwrap();

    for descriptor in registry.descriptors() {
        let mut spellings = vec![descriptor.name.clone()];
        spellings.extend(descriptor.aliases.iter().cloned());
        for spelling in spellings {
            for variant in [spelling.to_lowercase(), spelling.to_uppercase(), spelling.clone()] {
                let resolved = registry.resolve(&variant).unwrap();
                assert!(Arc::ptr_eq(&resolved, &descriptor), "{variant}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 2. Resolution is stable across repeated lookups
// ---------------------------------------------------------------------------

#[test]
fn repeated_resolution_is_stable() {
    let registry = pantry_builder().build().unwrap();
    let first = registry.resolve("cook").unwrap();
    for _ in 0..100 {
        assert!(Arc::ptr_eq(&first, &registry.resolve("Cook").unwrap()));
    }
}

// ---------------------------------------------------------------------------
// 3. Duplicate aliases across descriptors fail the build
// ---------------------------------------------------------------------------

#[test]
fn duplicate_alias_fails_build() {
    let err = pantry_builder()
        .register(BuiltinKind::Echo.descriptor("baker").alias("Repeat"))
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
}

// ---------------------------------------------------------------------------
// 4. Intent mapping falls back to the default agent
// ---------------------------------------------------------------------------

#[test]
fn intent_fallback() {
    let registry = pantry_builder().build().unwrap();
    assert_eq!(registry.resolve_intent("recipe_search").unwrap().name, "Recipe");
    assert_eq!(registry.resolve_intent("small_talk").unwrap().name, "echo");
}

// ---------------------------------------------------------------------------
// 5. Custom agents plug in through a factory closure
// ---------------------------------------------------------------------------

struct Shouter;

#[async_trait::async_trait]
impl Agent for Shouter {
    fn describe(&self) -> &str {
        "upper-cases text"
    }

    async fn execute(&self, _ctx: &AgentContext, input: Payload) -> LarderResult<Payload> {
        let text = input["text"].as_str().unwrap_or_default().to_uppercase();
        Ok(json!({ "text": text }).as_object().cloned().unwrap_or_default())
    }
}

#[tokio::test]
async fn custom_agent_through_registry() {
    let factory: Arc<dyn AgentFactory> =
        Arc::new(|_: &Payload| -> LarderResult<Arc<dyn Agent>> { Ok(Arc::new(Shouter)) });
    let registry = AgentRegistry::builder()
        .register(AgentDescriptor::new("shout", factory).alias("loud"))
        .build()
        .unwrap();

    let instance = registry.construct("LOUD", AgentOverrides::default()).unwrap();
    assert_eq!(instance.describe(), "upper-cases text");
    let out = instance
        .execute(
            AgentContext::new(Uuid::new_v4()).with_session("S1"),
            json!({"text": "pantry"}).as_object().cloned().unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(out["text"], "PANTRY");
}
