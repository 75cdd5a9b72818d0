//! Time source shared by stores, rate limiting algorithms and idempotency records.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn at_unix_millis(millis: u64) -> Self {
        Self::new(from_unix_millis(millis))
    }

    pub fn set(&self, time: SystemTime) {
        if let Ok(mut now) = self.now.lock() {
            *now = time;
        }
    }

    pub fn set_unix_millis(&self, millis: u64) {
        self.set(from_unix_millis(millis));
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        self.now
            .lock()
            .map(|now| *now)
            .unwrap_or(UNIX_EPOCH)
    }
}

pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn from_unix_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Unix seconds, rounded up so a reset time is never reported early.
pub fn unix_secs_ceil(time: SystemTime) -> u64 {
    let millis = unix_millis(time);
    millis.div_ceil(1000)
}
