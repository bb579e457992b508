/// OpenAI-compatible and Anthropic HTTP providers.
pub mod http;

pub use http::HttpProvider;

use crate::config::ProviderConfig;
use crate::provider::Provider;
use conductor_core::{ConductorError, ConductorResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Build providers from configuration, in configuration order.
///
/// Duplicate ids are rejected since health is tracked per id.
pub fn build_providers(
    configs: &[ProviderConfig],
    timeout: Duration,
) -> ConductorResult<Vec<Arc<dyn Provider>>> {
    let mut seen = HashSet::new();
    let mut providers: Vec<Arc<dyn Provider>> = Vec::with_capacity(configs.len());
    for config in configs {
        if config.id.trim().is_empty() {
            return Err(ConductorError::Config("provider id must not be empty".into()));
        }
        if !seen.insert(config.id.clone()) {
            return Err(ConductorError::Config(format!(
                "duplicate provider id '{}'",
                config.id
            )));
        }
        let api_key = config.resolve_api_key()?;
        providers.push(Arc::new(HttpProvider::new(config.clone(), api_key, timeout)));
    }
    Ok(providers)
}
