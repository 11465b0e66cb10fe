//! Downstream service health derived from recent distinct-user failures.
//!
//! A service is considered down once `threshold` different users have
//! failed within `window`. Any success clears the slate for everyone.
//! Expired entries are evicted on access, there is no background timer.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::MonitorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub down: bool,
    /// Distinct users with a failure inside the window.
    pub failing_users: usize,
}

#[derive(Debug)]
pub struct ServiceMonitor {
    name: String,
    window: Duration,
    threshold: usize,
    failures: Mutex<HashMap<String, Instant>>,
}

impl ServiceMonitor {
    pub fn new(name: impl Into<String>, window: Duration, threshold: usize) -> Self {
        Self {
            name: name.into(),
            window,
            threshold,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &MonitorConfig) -> Self {
        Self::new(name, config.window, config.threshold_users)
    }

    pub fn record_failure(&self, user_id: &str) {
        self.record_failure_at(user_id, Instant::now());
    }

    pub fn record_success(&self) {
        let mut failures = self.lock();
        if failures.len() >= self.threshold {
            info!("Service '{}' recovered", self.name);
        }
        failures.clear();
    }

    /// Down flag and failing-user count, read under one lock.
    pub fn snapshot(&self) -> MonitorSnapshot {
        self.snapshot_at(Instant::now())
    }

    fn record_failure_at(&self, user_id: &str, now: Instant) {
        let mut failures = self.lock();
        let was_down = failures.len() >= self.threshold;
        failures.insert(user_id.to_string(), now);
        self.evict(&mut failures, now);

        if !was_down && failures.len() >= self.threshold {
            warn!(
                "Service '{}' considered down: {} users failed in the last {:?}",
                self.name,
                failures.len(),
                self.window
            );
        }
    }

    fn snapshot_at(&self, now: Instant) -> MonitorSnapshot {
        let mut failures = self.lock();
        self.evict(&mut failures, now);
        MonitorSnapshot {
            down: failures.len() >= self.threshold,
            failing_users: failures.len(),
        }
    }

    #[cfg(test)]
    fn is_down_at(&self, now: Instant) -> bool {
        self.snapshot_at(now).down
    }

    #[cfg(test)]
    fn failing_users_at(&self, now: Instant) -> usize {
        self.snapshot_at(now).failing_users
    }

    fn evict(&self, failures: &mut HashMap<String, Instant>, now: Instant) {
        failures.retain(|_, at| now.saturating_duration_since(*at) <= self.window);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        // The map holds no invariants a panicking writer could break.
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2 * 60 * 60);

    #[test]
    fn test_threshold_of_distinct_users() {
        let monitor = ServiceMonitor::new("datalake", WINDOW, 10);
        let now = Instant::now();

        for i in 0..9 {
            monitor.record_failure_at(&format!("user-{}", i), now);
        }
        // Same user again does not count twice.
        monitor.record_failure_at("user-0", now);
        assert!(!monitor.is_down_at(now));

        monitor.record_failure_at("user-9", now);
        assert!(monitor.is_down_at(now));
    }

    #[test]
    fn test_single_success_clears_everything() {
        let monitor = ServiceMonitor::new("datalake", WINDOW, 10);
        let now = Instant::now();
        for i in 0..10 {
            monitor.record_failure_at(&format!("user-{}", i), now);
        }
        assert!(monitor.is_down_at(now));

        monitor.record_success();
        assert!(!monitor.is_down_at(now));
        assert_eq!(monitor.failing_users_at(now), 0);
    }

    #[test]
    fn test_expired_failures_evicted_on_access() {
        let monitor = ServiceMonitor::new("datalake", Duration::from_secs(60), 2);
        let start = Instant::now();

        monitor.record_failure_at("alice", start);
        monitor.record_failure_at("bob", start + Duration::from_secs(30));
        assert!(monitor.is_down_at(start + Duration::from_secs(30)));

        // alice's failure is now 61s old
        assert!(!monitor.is_down_at(start + Duration::from_secs(61)));

        monitor.record_failure_at("carol", start + Duration::from_secs(62));
        assert!(monitor.is_down_at(start + Duration::from_secs(62)));
        assert!(!monitor.is_down_at(start + Duration::from_secs(95)));
    }

    #[test]
    fn test_recording_a_failure_evicts_stale_users() {
        let monitor = ServiceMonitor::new("datalake", Duration::from_secs(60), 10);
        let start = Instant::now();

        monitor.record_failure_at("alice", start);
        monitor.record_failure_at("bob", start + Duration::from_secs(10));
        assert_eq!(monitor.failing_users_at(start + Duration::from_secs(10)), 2);

        // Recording alone drops alice, no read in between
        monitor.record_failure_at("carol", start + Duration::from_secs(65));
        assert_eq!(monitor.lock().len(), 2);
        assert!(!monitor.lock().contains_key("alice"));
        assert_eq!(monitor.failing_users_at(start + Duration::from_secs(65)), 2);
    }

    #[test]
    fn test_failure_overwrites_timestamp() {
        let monitor = ServiceMonitor::new("datalake", Duration::from_secs(60), 1);
        let start = Instant::now();

        monitor.record_failure_at("alice", start);
        monitor.record_failure_at("alice", start + Duration::from_secs(50));
        assert!(monitor.is_down_at(start + Duration::from_secs(100)));
    }

    #[test]
    fn test_concurrent_failures_are_not_lost() {
        let monitor = std::sync::Arc::new(ServiceMonitor::new("datalake", WINDOW, 64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let monitor = monitor.clone();
                std::thread::spawn(move || {
                    for i in 0..8 {
                        monitor.record_failure(&format!("user-{}-{}", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.failing_users, 64);
        assert!(snapshot.down);
    }
}
