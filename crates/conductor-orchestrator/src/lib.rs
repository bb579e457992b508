//! Workflow execution for the Conductor orchestration engine.
//!
//! Drives workflows through their fixed step templates, dispatching each
//! step to an agent, persisting every transition and streaming progress to
//! any number of observers.
//!
//! # Main types
//!
//! - [`WorkflowEngine`] — Runner lifecycle: start, pause, resume, cancel, recovery.
//! - [`ProgressBus`] — Per-workflow broadcast channel plus cancellation signal.
//! - [`AgentDispatcher`] — Boundary between a workflow step and the agent that runs it.
//! - [`RouterDispatcher`] — Dispatcher backed by the provider router.
//! - [`AgentProfile`] — System prompt and budget for one agent id.

/// Progress broadcast.
pub mod bus;
/// Agent dispatch contract and the router-backed dispatcher.
pub mod dispatcher;
/// The workflow engine.
pub mod engine;
/// Built-in agent profiles.
pub mod profiles;

pub use bus::{BusMessage, ProgressBus, ProgressSubscription};
pub use dispatcher::{render_prompt, AgentDispatcher, InvocationOutcome, RouterDispatcher};
pub use engine::{ControlOutcome, EngineConfig, WorkflowEngine};
pub use profiles::{default_profiles, AgentProfile};
