//! Periodic health monitoring for the endorser-side control plane.
//!
//! Every cycle captures a structured snapshot: per-shard dependency-map
//! sizes, the propose-queue state, and upstream peer reachability probed
//! through the circuit breaker. Readers always observe the latest complete
//! snapshot; a cycle in progress never publishes partial detail.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::RwLock;
use tokio::{task::JoinHandle, time::interval};
use tracing::{debug, info, warn};

use tessera_shard::ShardManager;
use tessera_types::BreakerSettings;

use crate::circuit_breaker::CircuitBreaker;

/// Default cadence of health checks.
const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Dial bound for the upstream probe.
const PROBE_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// One health snapshot.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Overall verdict.
    pub is_healthy: bool,
    /// When this snapshot was captured.
    pub last_check_time: SystemTime,
    /// Structured findings, keyed by check name.
    pub details: BTreeMap<String, String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            is_healthy: true,
            last_check_time: SystemTime::now(),
            details: BTreeMap::new(),
        }
    }
}

/// Read handle over the latest snapshot.
#[derive(Clone)]
pub struct HealthHandle {
    status: Arc<RwLock<HealthStatus>>,
}

impl HealthHandle {
    /// The latest complete snapshot.
    pub fn status(&self) -> HealthStatus {
        self.status.read().clone()
    }
}

/// Periodic health monitor.
pub struct HealthMonitor {
    manager: Arc<ShardManager>,
    breaker: Arc<CircuitBreaker>,
    upstream_peer: Option<String>,
    settings: BreakerSettings,
    check_interval: Duration,
    status: Arc<RwLock<HealthStatus>>,
}

impl HealthMonitor {
    /// Creates a monitor over the shard manager.
    ///
    /// `upstream_peer` is probed through the circuit breaker when set;
    /// a node with no upstream runs only the local checks.
    pub fn new(
        manager: Arc<ShardManager>,
        upstream_peer: Option<String>,
        settings: BreakerSettings,
    ) -> Self {
        Self {
            manager,
            breaker: Arc::new(CircuitBreaker::new(settings.clone())),
            upstream_peer,
            settings,
            check_interval: CHECK_INTERVAL,
            status: Arc::new(RwLock::new(HealthStatus::default())),
        }
    }

    /// Overrides the check cadence (tests).
    pub fn with_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// A read handle that outlives the running monitor task.
    pub fn handle(&self) -> HealthHandle {
        HealthHandle { status: self.status.clone() }
    }

    /// The probe circuit breaker (exposed for inspection).
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Starts the background task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.check_interval);
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }

    /// Runs one health check cycle and publishes the snapshot.
    pub async fn run_cycle(&self) {
        let mut status = HealthStatus {
            is_healthy: true,
            last_check_time: SystemTime::now(),
            details: BTreeMap::new(),
        };

        // Dependency map sizes per shard.
        let sizes = self.manager.map_sizes();
        status.details.insert("shards".to_string(), sizes.len().to_string());
        for (shard_id, size) in sizes {
            status
                .details
                .insert(format!("dependencyMapSize.{shard_id}"), size.to_string());
        }

        // Propose queues live only while the manager is running.
        if self.manager.is_shut_down() {
            status.is_healthy = false;
            status.details.insert("channels".to_string(), "shut down".to_string());
        } else {
            status.details.insert("channels".to_string(), "ok".to_string());
        }

        // Upstream reachability, through the circuit breaker.
        if let Some(peer) = self.upstream_peer.clone() {
            match self.probe_upstream(&peer).await {
                Ok(()) => {
                    status.details.insert("upstreamPeer".to_string(), "ok".to_string());
                },
                Err(reason) => {
                    status.is_healthy = false;
                    status.details.insert("upstreamPeer".to_string(), reason);
                },
            }
        }

        info!(
            is_healthy = status.is_healthy,
            details = status.details.len(),
            "health check completed"
        );
        *self.status.write() = status;
    }

    /// Probes the upstream peer, retrying within the breaker's budget.
    async fn probe_upstream(&self, peer: &str) -> Result<(), String> {
        let mut last_error = String::new();

        for attempt in 0..self.settings.max_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_interval).await;
            }

            match self.breaker.execute(|| dial(peer)).await {
                Err(open) => {
                    debug!(peer, %open, "upstream probe suppressed");
                    return Err(open.to_string());
                },
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => {
                    warn!(peer, attempt, error = %err, "upstream probe failed");
                    last_error = err;
                },
            }
        }

        Err(last_error)
    }
}

/// One connection attempt to the peer's gRPC endpoint.
async fn dial(peer: &str) -> Result<(), String> {
    let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{peer}"))
        .map_err(|e| format!("invalid upstream address: {e}"))?
        .connect_timeout(PROBE_DIAL_TIMEOUT);
    endpoint
        .connect()
        .await
        .map(|_channel| ())
        .map_err(|e| format!("failed to connect to upstream: {e}"))
}
