//! Named group of stages moved together.
//!
//! # Group Timeout Policy
//!
//! Waiting on a group uses one deadline shared by every member: all members
//! are awaited concurrently and the whole group must be idle within the
//! budget. A slow first stage therefore never extends the budget of the
//! stages after it. On timeout every stage is sent `stop` before the error is
//! returned, naming the first stage still acting.

use futures::future::try_join_all;
use scancam_core::limits::secs;
use scancam_core::{Result, ScanCamConfig, ScanCamError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::timeout;

use crate::device::ZaberDevice;
use crate::protocol::MoveCommand;
use crate::transport::Transport;

/// Stages keyed by axis id (`X`, `theta`, `z`).
#[derive(Debug, Clone)]
pub struct StageSet {
    devices: BTreeMap<String, ZaberDevice>,
    timeout_secs: u64,
}

impl StageSet {
    /// Empty set with a group timeout in whole seconds.
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            devices: BTreeMap::new(),
            timeout_secs,
        }
    }

    /// Build a set from already attached devices, keyed by their ids.
    pub fn from_devices(devices: impl IntoIterator<Item = ZaberDevice>, timeout_secs: u64) -> Self {
        let mut set = Self::new(timeout_secs);
        for device in devices {
            set.insert(device);
        }
        set
    }

    /// Attach and initialise every configured stage on `transport`.
    pub async fn connect(config: &ScanCamConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let mut set = Self::new(config.sequencer.stage_timeout_secs);
        for stage in &config.stages {
            let device =
                ZaberDevice::attach_from_config(stage, &config.protocol, transport.clone()).await?;
            set.insert(device);
        }
        tracing::info!(axes = ?set.axes(), "Stage set connected");
        Ok(set)
    }

    /// Add or replace the device for its axis.
    pub fn insert(&mut self, device: ZaberDevice) {
        self.devices.insert(device.id().to_string(), device);
    }

    /// Member for `axis`.
    pub fn device(&self, axis: &str) -> Result<&ZaberDevice> {
        self.devices
            .get(axis)
            .ok_or_else(|| ScanCamError::UnknownAxis(axis.to_string()))
    }

    /// Axis ids in sorted order.
    pub fn axes(&self) -> Vec<&str> {
        self.devices.keys().map(String::as_str).collect()
    }

    /// Default group timeout in whole seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// True while any member is acting.
    pub fn in_action(&self) -> bool {
        self.devices.values().any(ZaberDevice::in_action)
    }

    /// Home every stage and wait for the group.
    pub async fn home(&self) -> Result<()> {
        tracing::info!("Homing all stages");
        for device in self.devices.values() {
            device.home().await?;
            device.step().await?;
        }
        self.wait_for_group_completion(self.timeout_secs)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Homing failed"))
    }

    /// Send `stop` to every stage immediately, clearing their queues.
    ///
    /// Every stage is tried even when an earlier one fails; the first error
    /// is returned.
    pub async fn stop(&self) -> Result<()> {
        let mut first_err = None;
        for device in self.devices.values() {
            if let Err(e) = device.stop_now().await {
                tracing::error!(device = %device.id(), error = %e, "Failed to stop stage");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Move each named axis to an absolute target in physical units.
    ///
    /// Unknown axes are rejected before anything is sent. With `wait`, blocks
    /// for the group under the default timeout.
    pub async fn move_group(&self, targets: &[(&str, f64)], wait: bool) -> Result<()> {
        let devices = targets
            .iter()
            .map(|(axis, value)| Ok((self.device(axis)?, *value)))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(?targets, wait, "Group move");
        for (device, value) in &devices {
            device.enqueue_move(MoveCommand::Absolute, *value).await?;
        }
        for (device, _) in &devices {
            device.step().await?;
        }

        if wait {
            self.wait_for_group_completion(self.timeout_secs).await?;
        }
        Ok(())
    }

    /// Wait until every member is idle under one shared deadline.
    ///
    /// On timeout or link failure all stages are stopped before the error
    /// is returned.
    pub async fn wait_for_group_completion(&self, timeout_secs: u64) -> Result<()> {
        let waits = self.devices.values().map(ZaberDevice::wait_idle);
        let err = match timeout(secs(timeout_secs), try_join_all(waits)).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => {
                let laggard = self
                    .devices
                    .values()
                    .find(|d| d.in_action())
                    .map(|d| d.id().to_string())
                    .unwrap_or_default();
                tracing::error!(device = %laggard, timeout_secs, "Stage group timed out");
                ScanCamError::DeviceTimeout(laggard)
            }
        };
        if let Err(stop_err) = self.stop().await {
            tracing::error!(error = %stop_err, "Stop after group failure also failed");
        }
        Err(err)
    }
}
