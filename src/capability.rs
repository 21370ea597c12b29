//! A small capability interface that lets upload-retry and backoff logic
//! be driven by a fake clock in tests instead of real sleeps, mirroring
//! `UploadClient`'s role for the network side (see `uploader.rs`).
//!
//! Grounded on the `ILocalFileSystem` / `IFileObserver` trait split in
//! Enigmora's local filesystem port: a handful of narrow async methods
//! rather than one do-everything trait, so a fake only has to implement
//! what a given test actually exercises.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Abstracts wall-clock reads so upload-retry and backoff logic can be
/// driven by a fake clock in tests instead of real sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct FakeClock(Mutex<DateTime<Utc>>);

impl FakeClock {
    pub fn at(initial: DateTime<Utc>) -> Self {
        Self(Mutex::new(initial))
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.0.lock().expect("fake clock mutex poisoned");
        *guard += delta;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("fake clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_deterministically() {
        let base = "2026-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let clock = FakeClock::at(base);
        assert_eq!(clock.now(), base);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), base + chrono::Duration::seconds(30));
    }
}
