//! Endorser-side integration for Tessera.
//!
//! This crate provides:
//! - The per-transaction prepare coordinator: namespace extraction,
//!   parallel fan-out to shards, proof verification, aggregation, and the
//!   abort-all path on partial failure
//! - The circuit breaker guarding cross-peer control-plane calls
//! - The periodic health monitor
//!
//! Transaction simulation and endorsement signing live outside this crate;
//! only their products (read/write sets, the shared proof key) come in.

#![deny(unsafe_code)]

pub mod circuit_breaker;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod simulation;

pub use circuit_breaker::{CircuitBreaker, CircuitOpen, CircuitState};
pub use coordinator::{DependencyOutcome, EndorsementCoordinator};
pub use error::{CoordinatorError, PrepareFailure, ShardFailureDetail};
pub use health::{HealthHandle, HealthMonitor, HealthStatus};
pub use simulation::{
    Footprint, KeyRead, KeyWrite, NamespaceReadWriteSet, SimulationResult, group_by_namespace,
    is_system_namespace,
};
