//! Provider routing for the Conductor orchestration engine.
//!
//! Hides the instability of individual completion backends behind a single
//! call that always produces a structured answer.
//!
//! # Main types
//!
//! - [`ProviderRouter`] — Health-ranked routing with retry, quarantine and degraded fallback.
//! - [`Provider`] — Trait implemented by every backend.
//! - [`HttpProvider`] — OpenAI-compatible and Anthropic HTTP backends.
//! - [`RouterPolicy`] — Scoring, retry and quarantine tunables.
//! - [`RoutedCompletion`] — What the router returns, degraded or not.

/// Response cache used for degraded answers.
pub mod cache;
/// Provider and policy configuration.
pub mod config;
/// Provider failure classes.
pub mod error;
/// Shared health-score map and candidate planning.
pub mod health;
/// Provider trait and request/response types.
pub mod provider;
/// Built-in provider implementations.
pub mod providers;
/// The router.
pub mod router;

pub use config::{ProviderConfig, ProviderKind, RouterPolicy};
pub use error::ProviderError;
pub use provider::{Completion, CompletionRequest, Provider};
pub use providers::{build_providers, HttpProvider};
pub use router::{CompletionSource, ProviderRouter, RoutedCompletion, SleepFn};
