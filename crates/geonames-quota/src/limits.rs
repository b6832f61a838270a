//! Quota ceilings per window

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::window::Window;

/// Maximum request counts per window. `None` means no ceiling for that window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ceilings {
    #[serde(default)]
    pub per_second: Option<u64>,
    #[serde(default)]
    pub per_minute: Option<u64>,
    #[serde(default)]
    pub per_hour: Option<u64>,
    #[serde(default)]
    pub per_day: Option<u64>,
}

impl Ceilings {
    /// Aggregate ceiling applied across the whole pool: 2000/min, 10000/hr.
    pub fn pool_default() -> Self {
        Self {
            per_minute: Some(2_000),
            per_hour: Some(10_000),
            ..Self::default()
        }
    }

    /// Documented Geonames free-tier quota for a single account:
    /// 30/sec, 1000/hr, 20000/day.
    pub fn geonames_free_tier() -> Self {
        Self {
            per_second: Some(30),
            per_hour: Some(1_000),
            per_day: Some(20_000),
            ..Self::default()
        }
    }

    pub fn get(&self, window: Window) -> Option<u64> {
        match window {
            Window::Second => self.per_second,
            Window::Minute => self.per_minute,
            Window::Hour => self.per_hour,
            Window::Day => self.per_day,
        }
    }

    /// Windows that carry a ceiling, with the ceiling.
    pub fn iter(&self) -> impl Iterator<Item = (Window, u64)> + '_ {
        Window::ALL
            .into_iter()
            .filter_map(|w| self.get(w).map(|limit| (w, limit)))
    }

    pub fn is_unlimited(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Reject zero ceilings. A zero ceiling would deny every request, which
    /// is always a configuration mistake rather than an intent.
    pub fn validate(&self) -> Result<()> {
        for (window, limit) in self.iter() {
            if limit == 0 {
                return Err(Error::InvalidLimits(format!(
                    "per_{window} ceiling must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}
