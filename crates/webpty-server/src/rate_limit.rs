//! Brute-force protection for the basic-auth path.
//!
//! Two dimensions: per-IP escalating lockouts against a single
//! attacker, and a global sliding window that blunts distributed
//! scans. Both prune on every access so the maps stay bounded.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const PER_IP_THRESHOLD: u32 = 5;
const BASE_LOCKOUT: Duration = Duration::from_secs(5);
const MAX_LOCKOUT: Duration = Duration::from_secs(60 * 60);
const ATTEMPT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const GLOBAL_WINDOW: Duration = Duration::from_secs(5 * 60);
const GLOBAL_THRESHOLD: usize = 100;
const GLOBAL_LOCKOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDimension {
    Ip,
    Global,
}

impl fmt::Display for LockDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockDimension::Ip => f.write_str("ip"),
            LockDimension::Global => f.write_str("global"),
        }
    }
}

struct AttemptInfo {
    fail_count: u32,
    locked_until: Option<Instant>,
    last_failure: Instant,
}

struct Inner {
    attempts: HashMap<String, AttemptInfo>,
    global_failures: VecDeque<Instant>,
    global_locked_until: Option<Instant>,
}

pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                attempts: HashMap::new(),
                global_failures: VecDeque::new(),
                global_locked_until: None,
            }),
        }
    }

    /// Returns the remaining lockout and which dimension tripped, or
    /// `None` when the client may attempt authentication.
    pub fn check_locked(&self, ip: &str) -> Option<(Duration, LockDimension)> {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        inner.prune(now);

        if let Some(until) = inner.global_locked_until {
            if until > now {
                return Some((until - now, LockDimension::Global));
            }
        }

        if let Some(info) = inner.attempts.get(ip) {
            if let Some(until) = info.locked_until {
                if until > now {
                    return Some((until - now, LockDimension::Ip));
                }
            }
        }

        None
    }

    pub fn record_failure(&self, ip: &str) {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        inner.prune(now);

        let info = inner.attempts.entry(ip.to_string()).or_insert(AttemptInfo {
            fail_count: 0,
            locked_until: None,
            last_failure: now,
        });
        info.fail_count += 1;
        info.last_failure = now;

        if info.fail_count >= PER_IP_THRESHOLD {
            let exponent = info.fail_count - PER_IP_THRESHOLD;
            let lockout = escalated_lockout(exponent);
            let candidate = now + lockout;
            // Lockouts only move forward.
            if info.locked_until.is_none_or(|until| candidate > until) {
                info.locked_until = Some(candidate);
            }
        }

        inner.global_failures.push_back(now);
        if inner.global_failures.len() > GLOBAL_THRESHOLD {
            let candidate = now + GLOBAL_LOCKOUT;
            if inner.global_locked_until.is_none_or(|until| candidate > until) {
                inner.global_locked_until = Some(candidate);
            }
        }
    }

    pub fn record_success(&self, ip: &str) {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        if let Some(info) = inner.attempts.get_mut(ip) {
            info.fail_count = 0;
            info.locked_until = None;
        }
    }
}

impl Inner {
    fn prune(&mut self, now: Instant) {
        self.attempts.retain(|_, info| {
            now.duration_since(info.last_failure) < ATTEMPT_RETENTION
                || info.locked_until.is_some_and(|until| until > now)
        });
        while let Some(oldest) = self.global_failures.front() {
            if now.duration_since(*oldest) >= GLOBAL_WINDOW {
                self.global_failures.pop_front();
            } else {
                break;
            }
        }
        if self.global_locked_until.is_some_and(|until| until <= now) {
            self.global_locked_until = None;
        }
    }
}

fn escalated_lockout(exponent: u32) -> Duration {
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    BASE_LOCKOUT
        .checked_mul(factor)
        .map(|d| d.min(MAX_LOCKOUT))
        .unwrap_or(MAX_LOCKOUT)
}
