//! Shared test utilities for Tessera crates.
//!
//! - [`assert_eventually`] polls a condition until it holds or a timeout
//!   expires, for asserting on asynchronous state such as leader election.
//! - [`LocalRouter`] is an in-process consensus transport: it routes Raft
//!   RPCs directly between replicas living in one test process, so
//!   multi-replica scenarios (leader failover included) run without
//!   sockets.

#![deny(unsafe_code)]

mod assertions;
mod router;

pub use assertions::assert_eventually;
pub use router::{LocalRouter, LocalRouterFactory};
