//! Build dispatch and agent fleet management for Chengis.
//!
//! A single dispatcher task owns the assignment decision: it matches
//! queued builds against the in-memory agent fleet, applies per-agent
//! circuit breakers, recovers orphans from dead agents, and falls back
//! to in-process execution when no agent fits.

pub mod breaker;
pub mod client;
pub mod dispatcher;
pub mod registry;
pub mod schedule;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use client::{AgentClient, BuildDispatch};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use registry::AgentRegistry;
pub use schedule::ScheduleRunner;
