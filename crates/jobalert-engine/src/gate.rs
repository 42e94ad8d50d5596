//! Quiet hours and rate limiting, applied to each pending entry before grouping.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, FixedOffset, TimeDelta, Timelike, Utc};
use jobalert_core::{Device, QuietHours};
use jobalert_storage::{NotificationStore, StoreError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub per_hour: u32,
    pub per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_hour: 5,
            per_day: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Inside quiet hours; the entry stays pending.
    Defer,
    /// Over a rate ceiling; the entry is suppressed for good.
    Drop,
}

fn hour() -> TimeDelta {
    TimeDelta::hours(1)
}

fn day() -> TimeDelta {
    TimeDelta::hours(24)
}

/// Per-user push timestamps covering the trailing 24 hours.
///
/// Shared by handle between runs; every check-and-record happens under one lock.
#[derive(Debug, Default)]
pub struct RateCounterStore {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the counters from entries pushed during the last 24 hours.
    pub async fn rebuild(
        store: &dyn NotificationStore,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let counters = Self::new();
        let pushed = store.pushed_since(now - day()).await?;
        let total = pushed.len();
        for (user_id, at) in pushed {
            counters.record(&user_id, at);
        }
        info!(entries = total, "rebuilt rate counters from history");
        Ok(counters)
    }

    pub fn record(&self, user_id: &str, at: DateTime<Utc>) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.entry(user_id.to_string()).or_default().push_back(at);
    }

    /// Records a push at `now` if neither window is full. Returns whether it did.
    pub fn try_acquire(&self, user_id: &str, now: DateTime<Utc>, limits: RateLimits) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let stamps = windows.entry(user_id.to_string()).or_default();
        stamps.retain(|at| *at > now - day());

        let last_day = stamps.len();
        let last_hour = stamps.iter().filter(|at| **at > now - hour()).count();
        if last_hour >= limits.per_hour as usize || last_day >= limits.per_day as usize {
            debug!(user_id, last_hour, last_day, "rate ceiling reached");
            return false;
        }
        stamps.push_back(now);
        true
    }

    pub fn count_since(&self, user_id: &str, since: DateTime<Utc>) -> usize {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows
            .get(user_id)
            .map_or(0, |stamps| stamps.iter().filter(|at| **at > since).count())
    }
}

pub struct NotificationGate {
    limits: RateLimits,
    default_quiet_hours: Option<QuietHours>,
    default_utc_offset_minutes: i32,
    counters: Arc<RateCounterStore>,
}

impl NotificationGate {
    pub fn new(
        limits: RateLimits,
        default_quiet_hours: Option<QuietHours>,
        default_utc_offset_minutes: i32,
        counters: Arc<RateCounterStore>,
    ) -> Self {
        Self {
            limits,
            default_quiet_hours,
            default_utc_offset_minutes,
            counters,
        }
    }

    /// Hour of day for the device, from its own offset or the configured default.
    pub fn local_hour(&self, device: &Device, now: DateTime<Utc>) -> u32 {
        let minutes = device
            .utc_offset_minutes
            .unwrap_or(self.default_utc_offset_minutes);
        match FixedOffset::east_opt(minutes.saturating_mul(60)) {
            Some(offset) => now.with_timezone(&offset).hour(),
            None => now.hour(),
        }
    }

    pub fn in_quiet_hours(&self, device: &Device, now: DateTime<Utc>) -> bool {
        device
            .quiet_hours
            .or(self.default_quiet_hours)
            .is_some_and(|window| window.contains(self.local_hour(device, now)))
    }

    /// Quiet hours first, so deferring never consumes a rate slot.
    pub fn admit(&self, device: &Device, now: DateTime<Utc>) -> Admission {
        if self.in_quiet_hours(device, now) {
            return Admission::Defer;
        }
        if self.counters.try_acquire(&device.id, now, self.limits) {
            Admission::Admit
        } else {
            Admission::Drop
        }
    }
}
