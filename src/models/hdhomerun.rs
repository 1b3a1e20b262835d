//! Wire schemas for the tuner's local JSON endpoints and the remote guide API.
//!
//! Scope: types only, no HTTP code.
//!
//! Notes
//! - Keys are PascalCase on the wire; fields are snake_case here.
//! - Required keys are plain fields so that a missing key fails decoding at the fetch
//!   boundary. Everything the guide treats as optional is an `Option`.
//! - Programme records inside a guide segment stay raw until the channel is known to be
//!   tuned. A broken record on an untuned channel must not fail the window.
//! - Timestamps stay as epoch seconds (`i64`); conversion happens in the emitter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// =====================
// Scalar newtype wrappers
// =====================

/// Broadcast channel number, possibly with a sub-channel (`"3.1"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuideNumber(pub String);

impl GuideNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for GuideNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GuideNumber {
    fn from(value: &str) -> Self {
        GuideNumber(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAuth(pub String);

/// The guide API reports first-run status either as a JSON bool or as `0`/`1`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FirstAiring(pub bool);

impl serde::Serialize for FirstAiring {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bool(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for FirstAiring {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = FirstAiring;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "a boolean or the integer 0 or 1 for First")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(FirstAiring(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match value {
                    0 => Ok(FirstAiring(false)),
                    1 => Ok(FirstAiring(true)),
                    other => Err(E::invalid_value(serde::de::Unexpected::Signed(other), &self)),
                }
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match value {
                    0 => Ok(FirstAiring(false)),
                    1 => Ok(FirstAiring(true)),
                    other => Err(E::invalid_value(serde::de::Unexpected::Unsigned(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}

// =====================
// Device endpoints
// =====================

/// `GET http://{host}/discover.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Discover {
    pub friendly_name: Option<String>,
    pub model_number: Option<String>,
    pub firmware_name: Option<String>,
    pub firmware_version: Option<String>,
    #[serde(rename = "DeviceID")]
    pub device_id: Option<String>,
    pub device_auth: Option<DeviceAuth>,
    #[serde(rename = "BaseURL")]
    pub base_url: Option<String>,
    #[serde(rename = "LineupURL")]
    pub lineup_url: Option<String>,
    pub tuner_count: Option<u32>,
}

/// One element of `GET http://{host}/lineup.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LineupEntry {
    pub guide_number: GuideNumber,
    pub guide_name: Option<String>,
    #[serde(rename = "URL")]
    pub url: Option<String>,
    // HD, Favorite, VideoCodec, AudioCodec, ... carried along untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// =====================
// Remote guide API
// =====================

/// One per-channel element of `GET /api/guide.php`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuideSegment {
    pub guide_number: GuideNumber,
    pub guide_name: Option<String>,
    pub affiliate: Option<String>,
    #[serde(rename = "ImageURL")]
    pub image_url: Option<String>,
    pub guide: Vec<RawProgramme>,
}

/// An undecoded element of `Guide`. See [`RawProgramme::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawProgramme(pub Value);

impl RawProgramme {
    /// Decode into a [`GuideProgramme`], reporting the path of the first bad key.
    pub fn decode(self) -> Result<GuideProgramme, serde_path_to_error::Error<serde_json::Error>> {
        serde_path_to_error::deserialize(self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuideProgramme {
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub title: String,
    pub episode_number: Option<String>,
    pub episode_title: Option<String>,
    pub synopsis: Option<String>,
    pub original_airdate: Option<i64>,
    #[serde(rename = "ImageURL")]
    pub image_url: Option<String>,
    pub filter: Option<Vec<String>>,
    pub first: Option<FirstAiring>,
    #[serde(rename = "SeriesID")]
    pub series_id: Option<String>,
}
