//! Gateway device contract, owned mapping set and renewal scheduling
//!
//! A [`NatDevice`] owns every mapping this process created on one gateway.
//! Concrete devices implement the five protocol operations; bulk release
//! and renewal are provided on top of them.

use super::logger::NatLogger;
use super::mapping::{Mapping, MappingKey, MappingKind};
use super::types::{NatError, Protocol};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Mappings created by this process on one device, keyed by
/// `(public_port, private_port)`
#[derive(Debug, Clone, Default)]
pub struct MappingSet {
    inner: Arc<Mutex<HashMap<MappingKey, Mapping>>>,
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any entry with the same key
    pub async fn register(&self, mapping: Mapping) {
        self.inner.lock().await.insert(mapping.key(), mapping);
    }

    pub async fn unregister(&self, mapping: &Mapping) -> Option<Mapping> {
        self.inner.lock().await.remove(&mapping.key())
    }

    pub async fn contains(&self, mapping: &Mapping) -> bool {
        self.inner.lock().await.contains_key(&mapping.key())
    }

    pub async fn get(&self, key: MappingKey) -> Option<Mapping> {
        self.inner.lock().await.get(&key).cloned()
    }

    /// Swap `current` for `replacement` if `current` is still owned.
    ///
    /// Returns false when `current` was unregistered in the meantime, in
    /// which case nothing is inserted.
    pub async fn replace_if_owned(&self, current: &Mapping, replacement: Mapping) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.remove(&current.key()).is_none() {
            return false;
        }
        inner.insert(replacement.key(), replacement);
        true
    }

    pub async fn snapshot(&self) -> Vec<Mapping> {
        self.inner.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Outcome of a best-effort bulk release
#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub released: Vec<Mapping>,
    pub failed: Vec<(Mapping, NatError)>,
}

impl ReleaseReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A gateway that can forward ports
#[async_trait]
pub trait NatDevice: Send + Sync {
    /// Local interface address facing the gateway
    fn local_address(&self) -> IpAddr;

    /// Mappings owned by this device instance
    fn owned(&self) -> &MappingSet;

    fn logger(&self) -> &dyn NatLogger;

    async fn get_external_ip(&self) -> Result<IpAddr, NatError>;

    /// Ask the gateway for a mapping without touching the owned set.
    ///
    /// Returns the mapping as the gateway accepted it, which may differ from
    /// the request after fault recovery.
    async fn request_port_map(&self, mapping: Mapping) -> Result<Mapping, NatError>;

    /// Delete a mapping and unregister it
    async fn delete_port_map(&self, mapping: &Mapping) -> Result<(), NatError>;

    /// Every mapping the gateway reports, not only the owned ones
    ///
    /// Walks the gateway's mapping table by index until the gateway signals
    /// the end of the table.
    ///
    /// # Returns
    ///
    /// The entries in table order, without duplicates. Entries the gateway
    /// reports with an unusable internal client are skipped with a warning.
    /// Any fault other than an end-of-table fault is returned as an error.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use upnp_nat::{NatDevice, UpnpNatDevice};
    ///
    /// # async fn example(device: UpnpNatDevice) -> Result<(), upnp_nat::NatError> {
    /// for mapping in device.get_all_mappings().await? {
    ///     println!("{}", mapping);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    async fn get_all_mappings(&self) -> Result<Vec<Mapping>, NatError>;

    async fn get_specific_mapping(
        &self,
        protocol: Protocol,
        public_port: u16,
    ) -> Result<Option<Mapping>, NatError>;

    /// Create a mapping on the gateway and register it as owned.
    ///
    /// # Arguments
    ///
    /// * `mapping` - Requested mapping; a `None` private IP is replaced by
    ///   [`NatDevice::local_address`]
    ///
    /// # Returns
    ///
    /// The mapping the gateway accepted. Recoverable faults may have changed
    /// its public port, remote host or lease, and the registered entry is
    /// the accepted one. Fails with [`NatError::Fault`] when the gateway
    /// rejects the request and [`NatError::Timeout`] when it does not answer.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use upnp_nat::{DeviceDescription, Mapping, NatConfig, NatDevice, Protocol, UpnpNatDevice};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let local = "192.168.1.50".parse()?;
    /// let description = DeviceDescription::new(
    ///     local,
    ///     "http://192.168.1.1:5000/rootDesc.xml",
    ///     "/ctl/IPConn",
    ///     "urn:schemas-upnp-org:service:WANIPConnection:1",
    /// )?;
    /// let device = UpnpNatDevice::new(description, &NatConfig::default());
    ///
    /// let request = Mapping::new(Protocol::UDP, None, 3478, 3478, Mapping::SESSION_LIFETIME, "stun")?;
    /// let accepted = device.create_port_map(request).await?;
    /// println!("Forwarding {}", accepted);
    /// # Ok(())
    /// # }
    /// ```
    async fn create_port_map(&self, mapping: Mapping) -> Result<Mapping, NatError> {
        let mapping = match mapping.private_ip() {
            Some(_) => mapping,
            None => mapping.with_private_ip(self.local_address()),
        };
        let accepted = self.request_port_map(mapping).await?;
        self.owned().register(accepted.clone()).await;
        self.logger().info(&format!("Created {}", accepted));
        Ok(accepted)
    }

    /// Delete each mapping independently; one failure never stops the rest
    async fn release_mappings(&self, mappings: Vec<Mapping>) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        for mapping in mappings {
            match self.delete_port_map(&mapping).await {
                Ok(()) => {
                    self.logger().info(&format!("Released {}", mapping));
                    report.released.push(mapping);
                }
                Err(e) => {
                    self.logger()
                        .warn(&format!("Failed to release {}: {}", mapping, e));
                    report.failed.push((mapping, e));
                }
            }
        }

        report
    }

    async fn release_session_mappings(&self) -> ReleaseReport {
        let sessions = self
            .owned()
            .snapshot()
            .await
            .into_iter()
            .filter(|m| m.kind() == MappingKind::Session)
            .collect();
        self.release_mappings(sessions).await
    }

    async fn release_all(&self) -> ReleaseReport {
        let all = self.owned().snapshot().await;
        self.release_mappings(all).await
    }

    /// Renew every owned session mapping whose lease ran out, one at a time.
    ///
    /// Each entry is re-read from the owned set right before its request, so
    /// a mapping deleted by a caller during the cycle is skipped. A renewal
    /// that lands after the caller's delete is undone on the gateway. A failed
    /// renewal drops the mapping from the owned set; it is not retried.
    /// Returns the number of successful renewals.
    async fn renew_mappings(&self) -> usize {
        let now = Utc::now();
        let due: Vec<MappingKey> = self
            .owned()
            .snapshot()
            .await
            .into_iter()
            .filter(|m| m.should_renew_at(now))
            .map(|m| m.key())
            .collect();

        let mut renewed = 0;
        for key in due {
            let current = match self.owned().get(key).await {
                Some(current) if current.should_renew() => current,
                _ => {
                    debug!("Mapping {:?} no longer due for renewal, skipping", key);
                    continue;
                }
            };

            let renewal = current.renewed_at(Utc::now());
            self.logger().info(&format!("Renewing {}", renewal));
            match self.request_port_map(renewal).await {
                Ok(accepted) => {
                    if !self.owned().replace_if_owned(&current, accepted.clone()).await {
                        self.logger().info(&format!(
                            "{} was released while renewing, removing it again",
                            accepted
                        ));
                        if let Err(e) = self.delete_port_map(&accepted).await {
                            self.logger()
                                .warn(&format!("Failed to remove {}: {}", accepted, e));
                        }
                        continue;
                    }
                    if accepted.key() != current.key() {
                        self.logger().info(&format!(
                            "Gateway moved {} to {}",
                            current, accepted
                        ));
                    }
                    self.logger().info(&format!(
                        "Next renewal of {}:{} due at {}",
                        accepted.protocol(),
                        accepted.public_port(),
                        accepted.expiration().format("%H:%M:%S")
                    ));
                    renewed += 1;
                }
                Err(e) => {
                    self.owned().unregister(&current).await;
                    self.logger().warn(&format!(
                        "Renewal of {} failed, dropping it: {}",
                        current, e
                    ));
                }
            }
        }

        renewed
    }
}

/// Background task driving [`NatDevice::renew_mappings`] on a fixed tick
pub struct RenewalScheduler {
    task: Option<JoinHandle<()>>,
}

impl RenewalScheduler {
    /// Spawn the renewal loop on the current tokio runtime
    ///
    /// # Arguments
    ///
    /// * `device` - Device whose owned session mappings are renewed
    /// * `interval` - Pause between two renewal passes
    /// * `initial_delay` - Pause before the first pass
    ///
    /// # Returns
    ///
    /// A handle that aborts the loop when stopped or dropped.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use upnp_nat::{DeviceDescription, NatConfig, RenewalScheduler, UpnpNatDevice};
    ///
    /// # async fn example(description: DeviceDescription) {
    /// let config = NatConfig::default();
    /// let device = Arc::new(UpnpNatDevice::new(description, &config));
    /// let mut scheduler = RenewalScheduler::start(
    ///     device.clone(),
    ///     config.renew_interval(),
    ///     config.renew_initial_delay(),
    /// );
    /// // ...
    /// scheduler.stop();
    /// # }
    /// ```
    pub fn start<D>(device: Arc<D>, interval: Duration, initial_delay: Duration) -> Self
    where
        D: NatDevice + ?Sized + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                let renewed = device.renew_mappings().await;
                if renewed > 0 {
                    debug!("Renewal tick renewed {} mapping(s)", renewed);
                }
                tokio::time::sleep(interval).await;
            }
        });

        Self { task: Some(task) }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the loop; a renewal in flight is abandoned
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
