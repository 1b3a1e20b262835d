//! Blocking HTTP client for the tuner's local JSON endpoints and the remote guide API.
//!
//! - Blocking client using `ureq` (no async).
//! - Uses the schemas in `crate::models::hdhomerun`.
//! - Device endpoints are plain HTTP on the tuner host; the guide API lives elsewhere and
//!   its base URL is configurable.
//!
//! Decoding
//! - Bodies are decoded with `serde_path_to_error`, so a missing key reports where it was
//!   expected (e.g. `[3].Guide`). Programme records are checked later, per channel.

use http::StatusCode;
use serde::de::DeserializeOwned;

use crate::models::hdhomerun::*;

pub const DEFAULT_GUIDE_URL: &str = "https://api.hdhomerun.com";
const GUIDE_PATH: &str = "/api/guide.php";
/// A multi-day window for a full lineup can exceed ureq's 10 MB default.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug)]
pub enum HdHomeRunClientError {
    Transport(String),
    Http {
        status: u16,
        url: String,
    },
    Body(String),
    Json {
        url: String,
        error: serde_path_to_error::Error<serde_json::Error>,
    },
}

impl HdHomeRunClientError {
    /// The guide API answers `400 Bad Request` once a device has used up its guide
    /// allowance. Any 400 is treated that way, payload unchecked.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, HdHomeRunClientError::Http { status, .. } if *status == StatusCode::BAD_REQUEST.as_u16())
    }
}

impl core::fmt::Display for HdHomeRunClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HdHomeRunClientError::Transport(s) => write!(f, "transport error: {}", s),
            HdHomeRunClientError::Http { status, url } => write!(f, "http {} from {}", status, url),
            HdHomeRunClientError::Body(s) => write!(f, "error reading body: {}", s),
            HdHomeRunClientError::Json { url, error } => write!(f, "json error in {}: {}", url, error),
        }
    }
}

impl std::error::Error for HdHomeRunClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HdHomeRunClientError::Json { error, .. } => Some(error),
            _ => None,
        }
    }
}

pub struct HdHomeRunClient {
    agent: ureq::Agent,
    device_base: String,
    guide_base: String,
}

impl HdHomeRunClient {
    /// `host` is a hostname or IP (optionally with `:port`), without scheme.
    pub fn new(host: &str, guide_base: &str) -> Self {
        HdHomeRunClient {
            agent: ureq::Agent::new_with_defaults(),
            device_base: format!("http://{}", host.trim_end_matches('/')),
            guide_base: guide_base.trim_end_matches('/').to_string(),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T, HdHomeRunClientError> {
        let mut req = self.agent.get(url).header("Accept", "application/json");
        for (k, v) in query {
            req = req.query(*k, v);
        }

        let mut res = match req.call() {
            Ok(res) => res,
            Err(ureq::Error::StatusCode(status)) => {
                return Err(HdHomeRunClientError::Http {
                    status,
                    url: url.to_string(),
                });
            }
            Err(e) => return Err(HdHomeRunClientError::Transport(e.to_string())),
        };

        let body = res
            .body_mut()
            .with_config()
            .limit(MAX_BODY_BYTES)
            .read_to_string()
            .map_err(|e| HdHomeRunClientError::Body(e.to_string()))?;
        decode(url, &body)
    }

    pub fn get_discover(&self) -> Result<Discover, HdHomeRunClientError> {
        self.get_json(&format!("{}/discover.json", self.device_base), &[])
    }

    pub fn get_lineup(&self) -> Result<Vec<LineupEntry>, HdHomeRunClientError> {
        self.get_json(&format!("{}/lineup.json", self.device_base), &[])
    }

    /// One guide window starting at `start` (epoch seconds, UTC).
    pub fn get_guide(&self, auth: &DeviceAuth, start: i64) -> Result<Vec<GuideSegment>, HdHomeRunClientError> {
        let url = format!("{}{}", self.guide_base, GUIDE_PATH);
        self.get_json(&url, &[("DeviceAuth", auth.0.clone()), ("Start", start.to_string())])
    }
}

fn decode<T: DeserializeOwned>(url: &str, body: &str) -> Result<T, HdHomeRunClientError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|error| HdHomeRunClientError::Json {
        url: url.to_string(),
        error,
    })
}
