//! Geofence validation.
//!
//! The validator only measures. Whether an `outside` or `unknown` verdict
//! blocks a clock action is decided by [`GeofencePolicy`], configured per
//! deployment.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Mean earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const MIN_RADIUS_METERS: i32 = 10;
pub const MAX_RADIUS_METERS: i32 = 1000;
pub const DEFAULT_RADIUS_METERS: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> AppResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(AppError::validation(format!(
                "latitude must be within [-90, 90], got {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(AppError::validation(format!(
                "longitude must be within [-180, 180], got {longitude}"
            )));
        }
        Ok(Self { latitude, longitude })
    }

    /// Builds an optional coordinate from a lat/lng pair that must be supplied
    /// together or not at all.
    pub fn from_pair(lat: Option<f64>, lng: Option<f64>) -> AppResult<Option<Self>> {
        match (lat, lng) {
            (Some(lat), Some(lng)) => Self::new(lat, lng).map(Some),
            (None, None) => Ok(None),
            _ => Err(AppError::validation(
                "latitude and longitude must be supplied together",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geofence {
    pub center: Coordinate,
    pub radius_meters: i32,
}

/// Great-circle distance between two points, in meters.
pub fn haversine_meters(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlng = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GeofenceVerdict {
    /// The site has no registered coordinates.
    Unenforced,
    /// The site is fenced but the device reported no location.
    Unknown,
    Inside { distance_meters: f64, radius_meters: i32 },
    Outside { distance_meters: f64, radius_meters: i32 },
}

impl GeofenceVerdict {
    pub fn evaluate(fence: Option<Geofence>, device: Option<Coordinate>) -> Self {
        let Some(fence) = fence else {
            return Self::Unenforced;
        };
        let Some(device) = device else {
            return Self::Unknown;
        };
        let distance_meters = haversine_meters(fence.center, device);
        if distance_meters <= f64::from(fence.radius_meters) {
            Self::Inside { distance_meters, radius_meters: fence.radius_meters }
        } else {
            Self::Outside { distance_meters, radius_meters: fence.radius_meters }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unenforced => "unenforced",
            Self::Unknown => "unknown",
            Self::Inside { .. } => "inside",
            Self::Outside { .. } => "outside",
        }
    }
}

/// Operator-level decision on which verdicts block a clock action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofencePolicy {
    /// Outside and unknown are warnings only.
    #[default]
    Advisory,
    /// Outside blocks, unknown warns.
    BlockOutside,
    /// Anything but inside (or unenforced) blocks.
    RequireInside,
}

impl FromStr for GeofencePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "advisory" | "warn" => Ok(Self::Advisory),
            "block_outside" => Ok(Self::BlockOutside),
            "require_inside" | "strict" => Ok(Self::RequireInside),
            other => anyhow::bail!("unknown geofence policy '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum GeofenceRejection {
    #[error("you are {distance_meters:.0} m from the job site; move within {radius_meters} m")]
    Outside { distance_meters: f64, radius_meters: i32 },
    #[error("this job site requires your location; allow location access and try again")]
    LocationRequired,
}

impl GeofenceRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Outside { .. } => "outside_geofence",
            Self::LocationRequired => "location_required",
        }
    }

    pub fn verdict(&self) -> GeofenceVerdict {
        match *self {
            Self::Outside { distance_meters, radius_meters } => {
                GeofenceVerdict::Outside { distance_meters, radius_meters }
            }
            Self::LocationRequired => GeofenceVerdict::Unknown,
        }
    }
}

impl GeofencePolicy {
    /// Returns a warning for verdicts that pass with a caveat, or the
    /// rejection when the policy blocks.
    pub fn enforce(&self, verdict: &GeofenceVerdict) -> Result<Option<String>, GeofenceRejection> {
        match *verdict {
            GeofenceVerdict::Unenforced | GeofenceVerdict::Inside { .. } => Ok(None),
            GeofenceVerdict::Unknown => match self {
                Self::RequireInside => Err(GeofenceRejection::LocationRequired),
                _ => Ok(Some(
                    "location unavailable; the clock action was recorded without a geofence check"
                        .to_string(),
                )),
            },
            GeofenceVerdict::Outside { distance_meters, radius_meters } => match self {
                Self::Advisory => Ok(Some(format!(
                    "you appear to be {distance_meters:.0} m from the job site (allowed radius {radius_meters} m)"
                ))),
                Self::BlockOutside | Self::RequireInside => {
                    Err(GeofenceRejection::Outside { distance_meters, radius_meters })
                }
            },
        }
    }
}
