//! Audio endpoint enumeration
//!
//! Endpoints are listed in host order; the position in that list is the
//! selector stored in `audio.device_index`. Describing an endpoint talks to
//! the audio subsystem per device, so each one is described on its own
//! blocking task and a failure for one device only drops that device.

use cpal::traits::{DeviceTrait, HostTrait};
use futures_util::future::join_all;
use serde::Serialize;

use crate::error::AudioError;

/// Direction audio flows through an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFlow {
    /// Playback endpoint, captured through loopback
    Render,
    /// Recording endpoint
    Capture,
    Duplex,
    Unknown,
}

/// Whether the endpoint currently has a usable stream configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Active,
    Unavailable,
}

/// One enumerated endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub flow: DataFlow,
    pub friendly_name: String,
    pub endpoint_name: String,
    pub state: DeviceState,
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} | {} | {} | {:?}",
            self.flow, self.friendly_name, self.endpoint_name, self.state
        )
    }
}

/// An endpoint that can describe itself
pub trait Endpoint: Send + 'static {
    fn describe(&self, index: usize) -> Result<DeviceDescriptor, AudioError>;
}

/// A cpal device together with the host it was enumerated from
pub struct CpalEndpoint {
    device: cpal::Device,
    host_name: &'static str,
}

impl Endpoint for CpalEndpoint {
    fn describe(&self, index: usize) -> Result<DeviceDescriptor, AudioError> {
        let friendly_name = self
            .device
            .name()
            .map_err(|e| AudioError::Enumeration(e.to_string()))?;

        let is_output = self.device.default_output_config().is_ok();
        let is_input = self.device.default_input_config().is_ok();
        let (flow, state) = match (is_input, is_output) {
            (true, true) => (DataFlow::Duplex, DeviceState::Active),
            (false, true) => (DataFlow::Render, DeviceState::Active),
            (true, false) => (DataFlow::Capture, DeviceState::Active),
            (false, false) => (DataFlow::Unknown, DeviceState::Unavailable),
        };

        Ok(DeviceDescriptor {
            index,
            flow,
            friendly_name,
            endpoint_name: self.host_name.to_string(),
            state,
        })
    }
}

/// All devices of the default host, in enumeration order
fn host_devices() -> Result<Vec<cpal::Device>, AudioError> {
    let host = cpal::default_host();
    host.devices()
        .map(|devices| devices.collect())
        .map_err(|e| AudioError::Enumeration(e.to_string()))
}

/// Enumerate the audio endpoints of the default host
pub async fn enumerate_devices() -> Result<Vec<DeviceDescriptor>, AudioError> {
    let host_name = cpal::default_host().id().name();
    let devices = tokio::task::spawn_blocking(host_devices)
        .await
        .map_err(|e| AudioError::Enumeration(e.to_string()))??;

    let endpoints = devices
        .into_iter()
        .map(|device| CpalEndpoint { device, host_name })
        .collect();
    Ok(describe_endpoints(endpoints).await)
}

/// Describe every endpoint concurrently, skipping the ones that fail
pub async fn describe_endpoints<E: Endpoint>(endpoints: Vec<E>) -> Vec<DeviceDescriptor> {
    let tasks = endpoints.into_iter().enumerate().map(|(index, endpoint)| {
        tokio::task::spawn_blocking(move || (index, endpoint.describe(index)))
    });

    let mut descriptors = Vec::new();
    for joined in join_all(tasks).await {
        match joined {
            Ok((_, Ok(descriptor))) => descriptors.push(descriptor),
            Ok((index, Err(e))) => {
                tracing::warn!("Skipping audio device {}: {}", index, e);
            }
            Err(e) => {
                tracing::warn!("Device enumeration task failed: {}", e);
            }
        }
    }
    descriptors
}

/// Get a device by its enumeration index
pub fn get_device_by_index(index: usize) -> Result<cpal::Device, AudioError> {
    host_devices()?
        .into_iter()
        .nth(index)
        .ok_or_else(|| AudioError::DeviceNotFound(format!("no audio device at index {}", index)))
}
