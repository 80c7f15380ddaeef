//! Uplink reachability probing.
//!
//! A node whose peers are fine but whose upstream gateway is dead is a
//! useless primary. The prober periodically checks a configured target and
//! reports health transitions to the arbiter, which treats a dead uplink
//! on the primary like a failure of the primary itself.
//!
//! Probes are TCP connects with a timeout; the target is typically the
//! upstream gateway or a well-known anchor address. Health flips to down
//! only after `failure_threshold` consecutive failures, mirroring the
//! suspected/unreachable split in peer failure detection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::HaConfig;
use super::error::{HaError, HaResult};
use super::metrics;

/// Health transition reported to the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkEvent {
    Up,
    Down,
}

/// One probe attempt against the uplink target.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn probe(&self, target: &str, timeout: Duration) -> HaResult<()>;
}

/// Default transport: TCP connect to `host:port`.
#[derive(Debug, Default, Clone)]
pub struct TcpProbe;

#[async_trait]
impl ProbeTransport for TcpProbe {
    async fn probe(&self, target: &str, timeout: Duration) -> HaResult<()> {
        match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(HaError::Io(e)),
            Err(_) => Err(HaError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("probe to {} timed out", target),
            ))),
        }
    }
}

/// Periodic uplink health checker.
pub struct UplinkProber {
    target: String,
    interval: Duration,
    timeout: Duration,
    failure_threshold: u32,
    transport: Arc<dyn ProbeTransport>,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl UplinkProber {
    /// Build a prober from configuration. Returns `None` when no probe
    /// target is configured; uplink health then never factors into
    /// arbitration.
    pub fn from_config(config: &HaConfig) -> Option<Self> {
        let target = config.uplink_probe_target.clone()?;
        Some(Self::new(
            target,
            config.uplink_probe_interval,
            config.uplink_probe_timeout,
            config.uplink_failure_threshold,
            Arc::new(TcpProbe),
        ))
    }

    pub fn new(
        target: String,
        interval: Duration,
        timeout: Duration,
        failure_threshold: u32,
        transport: Arc<dyn ProbeTransport>,
    ) -> Self {
        metrics::UPLINK_HEALTHY.set(1);
        Self {
            target,
            interval,
            timeout,
            failure_threshold: failure_threshold.max(1),
            transport,
            // Optimistic start: do not block a clean startup on the first probe
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run one probe and update health state.
    ///
    /// Returns an event only on a health transition.
    pub async fn probe_once(&self) -> Option<UplinkEvent> {
        match self.transport.probe(&self.target, self.timeout).await {
            Ok(()) => {
                metrics::UPLINK_PROBES.with_label_values(&["success"]).inc();
                self.consecutive_failures.store(0, Ordering::SeqCst);
                if !self.healthy.swap(true, Ordering::SeqCst) {
                    info!(target = %self.target, "Uplink recovered");
                    metrics::UPLINK_HEALTHY.set(1);
                    return Some(UplinkEvent::Up);
                }
                None
            }
            Err(e) => {
                metrics::UPLINK_PROBES.with_label_values(&["failure"]).inc();
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(
                    target = %self.target,
                    failures,
                    threshold = self.failure_threshold,
                    error = %e,
                    "Uplink probe failed"
                );
                if failures >= self.failure_threshold && self.healthy.swap(false, Ordering::SeqCst)
                {
                    warn!(
                        target = %self.target,
                        consecutive_failures = failures,
                        "Uplink declared DOWN"
                    );
                    metrics::UPLINK_HEALTHY.set(0);
                    return Some(UplinkEvent::Down);
                }
                None
            }
        }
    }

    /// Probe loop: runs until the channel closes, forwarding transitions.
    pub async fn run(self: Arc<Self>, events: mpsc::Sender<UplinkEvent>) {
        info!(
            target = %self.target,
            interval_ms = self.interval.as_millis(),
            "Starting uplink prober"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Some(event) = self.probe_once().await {
                if events.send(event).await.is_err() {
                    debug!("Uplink event channel closed, stopping prober");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for UplinkProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UplinkProber")
            .field("target", &self.target)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}
