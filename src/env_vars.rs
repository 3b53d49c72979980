//! Environment variables injected into execution payloads.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::model::RuntimeEnvironment;
use crate::providers::ProviderError;

#[async_trait]
pub trait EnvironmentVariables: Send + Sync {
    async fn for_environment(&self, environment: &RuntimeEnvironment) -> Result<HashMap<String, String>, ProviderError>;
}

/// Variables kept per environment id, plus a few derived from the environment itself.
#[derive(Default)]
pub struct InMemoryEnvironmentVariables {
    vars: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryEnvironmentVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, environment_id: &str, key: impl Into<String>, value: impl Into<String>) {
        self.vars
            .write()
            .await
            .entry(environment_id.to_string())
            .or_default()
            .insert(key.into(), value.into());
    }
}

#[async_trait]
impl EnvironmentVariables for InMemoryEnvironmentVariables {
    async fn for_environment(&self, environment: &RuntimeEnvironment) -> Result<HashMap<String, String>, ProviderError> {
        let mut out = HashMap::from([
            ("COURIER_ENV_ID".to_string(), environment.id.clone()),
            ("COURIER_ENV_SLUG".to_string(), environment.slug.clone()),
            ("COURIER_PROJECT_REF".to_string(), environment.project.external_ref.clone()),
        ]);
        if let Some(user) = self.vars.read().await.get(&environment.id) {
            // User-defined values never shadow the built-ins.
            for (k, v) in user {
                out.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        Ok(out)
    }
}
