//! Device discovery.
//!
//! Probes every address of a range concurrently and yields reachable
//! devices as their probes complete. Identification (model and firmware)
//! goes through an [`Identify`] implementation; a device that answers the
//! reachability probe but cannot be identified is still reported.

use crate::models::config::Config;
use crate::models::device::{Device, DeviceIdentity, Reachability};
use crate::services::luna::{parse_system_info, LunaCommand};
use crate::services::probe::{ReachabilityProbe, TcpProbe};
use crate::services::remote::{CommandOutcome, Credentials, RemoteConnector, ResponsePatterns};
use crate::services::ssh::SshConnector;
use crate::utils::netrange::NetworkRange;
use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Extracts model and firmware from a reachable device.
#[async_trait]
pub trait Identify: Send + Sync {
    async fn identify(&self, address: IpAddr) -> Result<DeviceIdentity>;
}

/// Identification disabled; every field stays unknown.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIdentify;

#[async_trait]
impl Identify for NoIdentify {
    async fn identify(&self, _address: IpAddr) -> Result<DeviceIdentity> {
        Ok(DeviceIdentity::default())
    }
}

/// Identifies devices with a status query over a remote session.
pub struct SshIdentifier {
    connector: Arc<dyn RemoteConnector>,
    credentials: Credentials,
    patterns: ResponsePatterns,
    timeout: Duration,
}

impl SshIdentifier {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        credentials: Credentials,
        patterns: ResponsePatterns,
        timeout: Duration,
    ) -> Self {
        Self {
            connector,
            credentials,
            patterns,
            timeout,
        }
    }
}

#[async_trait]
impl Identify for SshIdentifier {
    async fn identify(&self, address: IpAddr) -> Result<DeviceIdentity> {
        let device = Device::new(address);
        let mut session = self.connector.open(&device, &self.credentials).await?;
        let outcome = session
            .run(
                &LunaCommand::status_query(),
                &self.patterns,
                self.timeout,
                &CancellationToken::new(),
            )
            .await;
        session.close().await?;

        let identity = match outcome? {
            CommandOutcome::Accepted(body) | CommandOutcome::ConfirmationRequired(body) => {
                parse_system_info(&body).unwrap_or_default()
            }
            CommandOutcome::Rejected(_) | CommandOutcome::Timeout => DeviceIdentity::default(),
        };
        Ok(identity)
    }
}

/// Network scanner.
#[derive(Clone)]
pub struct Discovery {
    reach: Arc<dyn ReachabilityProbe>,
    identify: Arc<dyn Identify>,
    concurrency: usize,
}

impl Discovery {
    pub fn new(
        reach: Arc<dyn ReachabilityProbe>,
        identify: Arc<dyn Identify>,
        concurrency: usize,
    ) -> Self {
        Self {
            reach,
            identify,
            concurrency: concurrency.max(1),
        }
    }

    /// Scanner with TCP probing and, when `identify` is set, SSH identification.
    pub fn from_config(config: &Config, identify: bool) -> Result<Self> {
        let reach = Arc::new(TcpProbe::new(
            config.discovery.port,
            config.discovery.probe_timeout(),
        ));
        let identify: Arc<dyn Identify> = if identify {
            Arc::new(SshIdentifier::new(
                Arc::new(SshConnector::new(config.remote.clone())),
                Credentials::from_config(&config.remote),
                ResponsePatterns::new(&config.remote.accept_pattern, None)?,
                config.remote.command_timeout(),
            ))
        } else {
            Arc::new(NoIdentify)
        };
        Ok(Self::new(reach, identify, config.discovery.concurrency))
    }

    /// Reachability probe used by this scanner.
    pub fn reachability(&self) -> Arc<dyn ReachabilityProbe> {
        Arc::clone(&self.reach)
    }

    /// Scan `range`, yielding reachable devices in completion order.
    ///
    /// The stream ends when every address was probed or `timeout` elapsed,
    /// whichever comes first. Unreachable addresses are skipped silently.
    pub fn scan(&self, range: &NetworkRange, timeout: Duration) -> BoxStream<'static, Device> {
        tracing::info!("Scanning {} ({} addresses)", range, range.len());

        let reach = Arc::clone(&self.reach);
        let identify = Arc::clone(&self.identify);

        stream::iter(range.hosts().map(IpAddr::V4))
            .map(move |address| {
                let reach = Arc::clone(&reach);
                let identify = Arc::clone(&identify);
                async move { probe_reachable(reach.as_ref(), identify.as_ref(), address).await }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|device| async move { device })
            .take_until(tokio::time::sleep(timeout))
            .boxed()
    }

    /// Probe one address.
    pub async fn probe(&self, address: IpAddr) -> Device {
        let mut device = Device::new(address);
        self.refresh(&mut device).await;
        device
    }

    /// Re-probe a known device, keeping fields the probe cannot determine.
    pub async fn refresh(&self, device: &mut Device) {
        if !self.reach.is_reachable(device.address).await {
            device.record_probe(Reachability::Unreachable, None);
            return;
        }
        let identity = identify_or_default(self.identify.as_ref(), device.address).await;
        device.record_probe(Reachability::Reachable, Some(identity));
    }
}

async fn probe_reachable(
    reach: &dyn ReachabilityProbe,
    identify: &dyn Identify,
    address: IpAddr,
) -> Option<Device> {
    if !reach.is_reachable(address).await {
        return None;
    }
    let identity = identify_or_default(identify, address).await;
    let mut device = Device::new(address);
    device.record_probe(Reachability::Reachable, Some(identity));
    tracing::debug!(
        "Found {} (model {}, firmware {})",
        address,
        device.model_label(),
        device.firmware_label()
    );
    Some(device)
}

async fn identify_or_default(identify: &dyn Identify, address: IpAddr) -> DeviceIdentity {
    match identify.identify(address).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::debug!("Cannot identify {}: {}", address, e);
            DeviceIdentity::default()
        }
    }
}
