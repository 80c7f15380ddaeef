//! Virtual identity (address + MAC) ownership and migration.
//!
//! The serving node owns a set of virtual addresses, optionally with
//! virtual MACs. On promotion the manager claims every configured resource
//! and broadcasts gratuitous announcements so switches and neighbors
//! repoint the identity at the new owner; on demotion or fencing it
//! releases everything.
//!
//! The actual interface plumbing is behind [`NetworkBackend`] so the
//! coordination logic stays testable and portable. [`LoggingBackend`] is
//! the default and only logs what it would have done.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::config::VirtualResourceConfig;
use super::error::{HaError, HaResult};
use super::metrics;
use super::retry;

/// Delay between consecutive gratuitous announcements for one resource.
const ANNOUNCEMENT_SPACING: Duration = Duration::from_millis(200);

/// Pause between rounds of re-claiming a resource that failed during
/// takeover.
const CLAIM_RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Platform seam for virtual address and announcement operations.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Bring the virtual address up on its interface.
    async fn assign_address(&self, resource: &VirtualResourceConfig) -> HaResult<()>;

    /// Take the virtual address down.
    async fn release_address(&self, resource: &VirtualResourceConfig) -> HaResult<()>;

    /// Broadcast one gratuitous announcement (ARP or neighbor
    /// advertisement) for the resource.
    async fn send_gratuitous_announcement(&self, resource: &VirtualResourceConfig) -> HaResult<()>;

    /// Restart dynamic-addressing services bound to an interface so they
    /// rebind to the freshly claimed address.
    async fn restart_dynamic_addressing(&self, interface: &str) -> HaResult<()>;
}

/// Default backend: logs every operation and succeeds.
///
/// Useful for development and for deployments where an external entity
/// (cloud provider, hypervisor) moves the address out of band.
#[derive(Debug, Default, Clone)]
pub struct LoggingBackend;

#[async_trait]
impl NetworkBackend for LoggingBackend {
    async fn assign_address(&self, resource: &VirtualResourceConfig) -> HaResult<()> {
        info!(
            address = %resource.address,
            interface = %resource.interface,
            virtual_mac = ?resource.virtual_mac,
            "Would assign virtual address"
        );
        Ok(())
    }

    async fn release_address(&self, resource: &VirtualResourceConfig) -> HaResult<()> {
        info!(
            address = %resource.address,
            interface = %resource.interface,
            "Would release virtual address"
        );
        Ok(())
    }

    async fn send_gratuitous_announcement(&self, resource: &VirtualResourceConfig) -> HaResult<()> {
        debug!(
            address = %resource.address,
            interface = %resource.interface,
            "Would send gratuitous announcement"
        );
        Ok(())
    }

    async fn restart_dynamic_addressing(&self, interface: &str) -> HaResult<()> {
        info!(interface, "Would restart dynamic addressing services");
        Ok(())
    }
}

/// Owns the claim/release lifecycle for all configured virtual resources.
pub struct VirtualIdentityManager {
    resources: Vec<VirtualResourceConfig>,
    backend: Arc<dyn NetworkBackend>,
    /// Upper bound on any single backend operation.
    op_timeout: Duration,
    /// Whether this node currently believes it owns the resources.
    owned: AtomicBool,
    /// Addresses whose claim has not yet succeeded. Non-empty while owned
    /// means the takeover is degraded.
    outstanding: Mutex<HashSet<String>>,
}

impl VirtualIdentityManager {
    pub fn new(
        resources: Vec<VirtualResourceConfig>,
        backend: Arc<dyn NetworkBackend>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            resources,
            backend,
            op_timeout,
            owned: AtomicBool::new(false),
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    pub fn owns_resources(&self) -> bool {
        self.owned.load(Ordering::SeqCst)
    }

    /// Resources are owned but at least one claim is still outstanding.
    pub fn is_degraded(&self) -> bool {
        self.owns_resources() && !self.outstanding.lock().expect("outstanding lock").is_empty()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Bound one backend operation by the configured timeout. A hung
    /// backend must never stall the arbiter loop.
    async fn bounded<F>(&self, resource: &str, op: &'static str, fut: F) -> HaResult<()>
    where
        F: Future<Output = HaResult<()>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(HaError::VirtualResource {
                resource: resource.to_string(),
                message: format!("{} timed out after {:?}", op, self.op_timeout),
            }),
        }
    }

    /// Claim every configured resource: assign addresses, announce them,
    /// then restart dynamic addressing on the affected interfaces.
    ///
    /// A claim that fails its bounded attempts does not abort the
    /// takeover; the address is marked outstanding, the manager reports
    /// [`is_degraded`](Self::is_degraded) and a background task keeps
    /// retrying until the claim lands or ownership is released.
    pub async fn claim_all(self: Arc<Self>) {
        if self.owned.swap(true, Ordering::SeqCst) {
            debug!("Resources already owned, claim is a no-op");
            return;
        }

        let mut deferred = Vec::new();
        for resource in &self.resources {
            if let Err(e) = self.claim_one(resource).await {
                error!(
                    address = %resource.address,
                    error = %e,
                    "Virtual address claim failed, deferring to background retry"
                );
                deferred.push(resource.clone());
            }
        }

        if deferred.is_empty() {
            self.restart_addressing().await;
            info!(
                resources = self.resources.len(),
                "All virtual resources claimed"
            );
            return;
        }

        {
            let mut outstanding = self.outstanding.lock().expect("outstanding lock");
            for resource in &deferred {
                outstanding.insert(resource.address.clone());
            }
        }
        warn!(
            outstanding = deferred.len(),
            "Takeover degraded, retrying outstanding claims in the background"
        );
        for resource in deferred {
            let manager = Arc::clone(&self);
            tokio::spawn(async move { manager.retry_claim(resource).await });
        }
    }

    /// Keep re-claiming one deferred resource until it lands or the node
    /// gives up ownership.
    async fn retry_claim(&self, resource: VirtualResourceConfig) {
        while self.owned.load(Ordering::SeqCst) {
            tokio::time::sleep(CLAIM_RETRY_PAUSE).await;
            if !self.owned.load(Ordering::SeqCst) {
                break;
            }
            match self.claim_one(&resource).await {
                Ok(()) => {
                    // Ownership may have moved while the claim was in
                    // flight; do not hold an address we no longer own
                    if !self.owned.load(Ordering::SeqCst) {
                        self.release_one(&resource).await;
                        break;
                    }
                    let resolved = {
                        let mut outstanding =
                            self.outstanding.lock().expect("outstanding lock");
                        outstanding.remove(&resource.address);
                        outstanding.is_empty()
                    };
                    info!(
                        address = %resource.address,
                        "Deferred virtual address claim succeeded"
                    );
                    if resolved {
                        self.restart_addressing().await;
                        info!("Takeover no longer degraded");
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        address = %resource.address,
                        error = %e,
                        "Deferred claim attempt failed, will retry"
                    );
                }
            }
        }
        self.outstanding
            .lock()
            .expect("outstanding lock")
            .remove(&resource.address);
    }

    /// Release every configured resource. Best-effort: a failed release is
    /// logged and the rest still proceed, since the peer taking over will
    /// announce its ownership regardless.
    pub async fn release_all(&self) {
        if !self.owned.swap(false, Ordering::SeqCst) {
            debug!("Resources not owned, release is a no-op");
            return;
        }
        self.outstanding.lock().expect("outstanding lock").clear();

        for resource in &self.resources {
            self.release_one(resource).await;
        }
        info!(
            resources = self.resources.len(),
            "All virtual resources released"
        );
    }

    /// Re-broadcast gratuitous announcements for owned resources.
    ///
    /// Used after a partition heals to reassert ownership against switches
    /// that may have learned the losing node's port.
    pub async fn reannounce(&self) {
        if !self.owned.load(Ordering::SeqCst) {
            return;
        }
        for resource in &self.resources {
            self.announce(resource).await;
        }
    }

    async fn claim_one(&self, resource: &VirtualResourceConfig) -> HaResult<()> {
        let result = retry::with_resource_policy(
            || self.bounded(&resource.address, "assign", self.backend.assign_address(resource)),
            |e: &HaError| e.is_retriable(),
        )
        .await;

        match result {
            Ok(()) => {
                metrics::RESOURCE_OPERATIONS
                    .with_label_values(&["assign", "success"])
                    .inc();
            }
            Err(e) => {
                metrics::RESOURCE_OPERATIONS
                    .with_label_values(&["assign", "failure"])
                    .inc();
                return Err(e);
            }
        }

        self.announce(resource).await;
        Ok(())
    }

    async fn announce(&self, resource: &VirtualResourceConfig) {
        for attempt in 0..resource.announcement_count {
            match self
                .bounded(
                    &resource.address,
                    "announce",
                    self.backend.send_gratuitous_announcement(resource),
                )
                .await
            {
                Ok(()) => {
                    metrics::GRATUITOUS_ANNOUNCEMENTS.inc();
                }
                Err(e) => {
                    warn!(
                        address = %resource.address,
                        attempt,
                        error = %e,
                        "Gratuitous announcement failed"
                    );
                }
            }
            if attempt + 1 < resource.announcement_count {
                tokio::time::sleep(ANNOUNCEMENT_SPACING).await;
            }
        }
    }

    async fn release_one(&self, resource: &VirtualResourceConfig) {
        let result = retry::with_resource_policy(
            || self.bounded(&resource.address, "release", self.backend.release_address(resource)),
            |e: &HaError| e.is_retriable(),
        )
        .await;

        match result {
            Ok(()) => {
                metrics::RESOURCE_OPERATIONS
                    .with_label_values(&["release", "success"])
                    .inc();
            }
            Err(e) => {
                metrics::RESOURCE_OPERATIONS
                    .with_label_values(&["release", "failure"])
                    .inc();
                warn!(
                    address = %resource.address,
                    error = %e,
                    "Virtual address release failed"
                );
            }
        }
    }

    /// Restart dynamic addressing on every affected interface once all
    /// addresses are up. A failure here is recoverable (stale bindings).
    async fn restart_addressing(&self) {
        for interface in self.distinct_interfaces() {
            if let Err(e) = self
                .bounded(
                    &interface,
                    "restart dynamic addressing",
                    self.backend.restart_dynamic_addressing(&interface),
                )
                .await
            {
                warn!(
                    interface = %interface,
                    error = %e,
                    "Dynamic addressing restart failed"
                );
            }
        }
    }

    fn distinct_interfaces(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.resources
            .iter()
            .filter(|r| seen.insert(r.interface.clone()))
            .map(|r| r.interface.clone())
            .collect()
    }
}

impl std::fmt::Debug for VirtualIdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualIdentityManager")
            .field("resources", &self.resources.len())
            .field("owned", &self.owns_resources())
            .finish()
    }
}
