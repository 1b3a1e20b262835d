use crate::client::{HdHomeRunClient, HdHomeRunClientError};
use crate::models::hdhomerun::{DeviceAuth, LineupEntry};
use core::fmt;
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Errors that can occur while reading the tuner's identity and channel list.
#[derive(Debug)]
pub enum LineupError {
    /// `discover.json` could not be fetched or decoded
    Discovery(HdHomeRunClientError),
    /// `discover.json` decoded but carries no (or an empty) `DeviceAuth`
    MissingDeviceAuth,
    /// `lineup.json` could not be fetched or decoded
    Lineup(HdHomeRunClientError),
}

impl Display for LineupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LineupError::Discovery(e) => write!(f, "device discovery failed: {}", e),
            LineupError::MissingDeviceAuth => write!(f, "device discovery returned no DeviceAuth"),
            LineupError::Lineup(e) => write!(f, "lineup fetch failed: {}", e),
        }
    }
}

impl Error for LineupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LineupError::Discovery(e) | LineupError::Lineup(e) => Some(e),
            LineupError::MissingDeviceAuth => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceLineup {
    pub auth: DeviceAuth,
    /// Tuned channels in device order. May be empty; the caller decides whether that is fatal.
    pub channels: Vec<LineupEntry>,
}

/// Discover the device's guide token, then read its tuned-channel list.
pub fn fetch_device_lineup(client: &HdHomeRunClient) -> Result<DeviceLineup, LineupError> {
    info!("Fetching HDHomeRun device auth");
    let discover = client.get_discover().map_err(LineupError::Discovery)?;
    let auth = discover
        .device_auth
        .filter(|a| !a.0.trim().is_empty())
        .ok_or(LineupError::MissingDeviceAuth)?;
    info!(
        "Discovered device {} ({})",
        discover.device_id.as_deref().unwrap_or("-"),
        discover.model_number.as_deref().unwrap_or("unknown model")
    );

    info!("Fetching HDHomeRun lineup");
    let channels = client.get_lineup().map_err(LineupError::Lineup)?;
    info!("Lineup has {} tuned channel(s)", channels.len());

    Ok(DeviceLineup { auth, channels })
}
