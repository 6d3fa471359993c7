/*!
Time and identifier sources, injectable so tests can control ordering.
*/

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of the random component of artifact filenames.
pub trait IdGenerator: Send + Sync {
    fn unique_suffix(&self) -> String;
}

/// First 12 hex digits of a v4 UUID.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn unique_suffix(&self) -> String {
        Uuid::new_v4().simple().to_string()[..12].to_string()
    }
}
