use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// A clock provider.
///
/// Every persisted timestamp flows through this trait so that migrations and
/// tests are deterministic.
pub trait Clock: Send + Sync {
    /// A duration since the UNIX epoch
    fn now(&self) -> Duration;
}

/// A clock provider using std::time::SystemTime
pub struct StandardClock();

impl Clock for StandardClock {
    fn now(&self) -> Duration {
        SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or(Duration::ZERO)
    }
}

/// A clock provider with a manually updated notion of "now"
pub struct ManualClock(Mutex<Duration>);

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.0.lock().unwrap()
    }
}

impl ManualClock {
    /// Create a manual clock
    pub fn new(now: Duration) -> Self {
        ManualClock(Mutex::new(now))
    }

    /// Set the current time as duration since the UNIX epoch
    pub fn set(&self, now: Duration) {
        *self.0.lock().unwrap() = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_test() {
        let clock = ManualClock::new(Duration::from_secs(100));
        assert_eq!(clock.now(), Duration::from_secs(100));
        clock.set(Duration::from_secs(200));
        assert_eq!(clock.now(), Duration::from_secs(200));
    }
}
