//! Composite air quality index.
//!
//! Piecewise-linear breakpoint interpolation for the primary pollutant
//! (PM2.5, µg/m³) and the co-pollutant (O3, µg/m³ converted to ppb), with
//! the overall index driven by the worst of the two.

use serde::{Deserialize, Serialize};
use std::fmt;

/// O3 µg/m³ to ppb conversion factor
pub const O3_UGM3_TO_PPB: f64 = 0.5;

/// Highest index value produced by any component
pub const INDEX_CAP: f64 = 300.0;

/// Index contribution of a PM2.5 concentration in µg/m³
pub fn pm25_index(pm25: f64) -> f64 {
    if pm25 <= 12.0 {
        pm25 * 50.0 / 12.0
    } else if pm25 <= 35.4 {
        50.0 + (pm25 - 12.0) * 50.0 / (35.4 - 12.0)
    } else if pm25 <= 55.4 {
        100.0 + (pm25 - 35.4) * 50.0 / (55.4 - 35.4)
    } else {
        INDEX_CAP.min(150.0 + (pm25 - 55.4) * 150.0 / 150.0)
    }
}

/// Index contribution of an O3 concentration in µg/m³
pub fn o3_index(o3_ugm3: f64) -> f64 {
    let o3_ppb = o3_ugm3 * O3_UGM3_TO_PPB;
    if o3_ppb <= 54.0 {
        o3_ppb * 50.0 / 54.0
    } else if o3_ppb <= 70.0 {
        50.0 + (o3_ppb - 54.0) * 50.0 / (70.0 - 54.0)
    } else {
        INDEX_CAP.min(100.0 + (o3_ppb - 70.0) * 100.0 / 100.0)
    }
}

/// Worst-pollutant composite index
pub fn composite_index(pm25: f64, o3_ugm3: f64) -> f64 {
    pm25_index(pm25).max(o3_index(o3_ugm3))
}

/// Health risk band for a composite index value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthRisk {
    Good,
    Moderate,
    UnhealthyForSensitiveGroups,
    Unhealthy,
    VeryUnhealthy,
}

impl HealthRisk {
    pub fn from_index(index: f64) -> Self {
        if index <= 50.0 {
            HealthRisk::Good
        } else if index <= 100.0 {
            HealthRisk::Moderate
        } else if index <= 150.0 {
            HealthRisk::UnhealthyForSensitiveGroups
        } else if index <= 200.0 {
            HealthRisk::Unhealthy
        } else {
            HealthRisk::VeryUnhealthy
        }
    }
}

impl fmt::Display for HealthRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthRisk::Good => "Good",
            HealthRisk::Moderate => "Moderate",
            HealthRisk::UnhealthyForSensitiveGroups => "Unhealthy for Sensitive Groups",
            HealthRisk::Unhealthy => "Unhealthy",
            HealthRisk::VeryUnhealthy => "Very Unhealthy",
        };
        write!(f, "{}", label)
    }
}
