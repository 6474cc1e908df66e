//! Outgoing request rate limiting.
//!
//! Fixed-window counters keyed by peer ip: one global window per ip plus one
//! window per procedure with its own rule.

use crate::message::Rpc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Points allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub points: u32,
    pub window: Duration,
}

impl RateLimit {
    pub const fn per_second(points: u32) -> Self {
        Self {
            points,
            window: Duration::from_secs(1),
        }
    }

    pub const fn new(points: u32, window: Duration) -> Self {
        Self { points, window }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Budget per peer ip across all procedures.
    pub global: RateLimit,
    /// Per-procedure budgets.
    pub rules: HashMap<Rpc, RateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let rules = HashMap::from([
            (Rpc::GetStatus, RateLimit::per_second(2)),
            (Rpc::GetPeers, RateLimit::per_second(1)),
            (Rpc::GetCommonBlocks, RateLimit::per_second(9)),
            (Rpc::GetBlocks, RateLimit::per_second(20)),
            (Rpc::PostBlock, RateLimit::new(2, Duration::from_secs(4))),
            (
                Rpc::GetUnconfirmedTransactions,
                RateLimit::new(1, Duration::from_secs(5)),
            ),
            (Rpc::PostTransactions, RateLimit::per_second(25)),
        ]);
        Self {
            global: RateLimit::per_second(100),
            rules,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    used: u32,
}

impl Window {
    fn fresh() -> Self {
        Self {
            started: Instant::now(),
            used: 0,
        }
    }

    /// Time until a point is available, `None` if one is available now.
    fn wait(&mut self, limit: &RateLimit) -> Option<Duration> {
        let elapsed = self.started.elapsed();
        if elapsed >= limit.window {
            *self = Window::fresh();
            return None;
        }
        if self.used < limit.points {
            None
        } else {
            Some(limit.window - elapsed)
        }
    }
}

/// Windows of one peer ip.
#[derive(Debug, Default)]
struct IpWindows {
    global: Option<Window>,
    rpcs: HashMap<Rpc, Window>,
}

impl IpWindows {
    fn window(&mut self, rpc: Option<Rpc>) -> &mut Window {
        match rpc {
            None => self.global.get_or_insert_with(Window::fresh),
            Some(rpc) => self.rpcs.entry(rpc).or_insert_with(Window::fresh),
        }
    }

    fn exceeded(&self, rpc: Option<Rpc>, limit: &RateLimit) -> bool {
        let window = match rpc {
            None => self.global.as_ref(),
            Some(rpc) => self.rpcs.get(&rpc),
        };
        window
            .map(|w| w.started.elapsed() < limit.window && w.used >= limit.points)
            .unwrap_or(false)
    }
}

/// Fixed-window limiter.
///
/// All windows of an ip live under one map entry, so a check and its
/// increment happen under the same lock.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<IpAddr, IpWindows>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Limits applying to `rpc`; `None` is the ip-global window.
    fn limits(&self, rpc: Rpc) -> Vec<(Option<Rpc>, RateLimit)> {
        let mut limits = vec![(None, self.config.global)];
        if let Some(rule) = self.config.rules.get(&rpc) {
            limits.push((Some(rpc), *rule));
        }
        limits
    }

    /// Take one point, or return how long to wait before retrying.
    pub fn consume(&self, ip: IpAddr, rpc: Rpc) -> Result<(), Duration> {
        let limits = self.limits(rpc);
        let mut windows = self.windows.entry(ip).or_default();

        let mut wait = None;
        for (key, limit) in &limits {
            if let Some(w) = windows.window(*key).wait(limit) {
                wait = Some(wait.map_or(w, |current: Duration| current.max(w)));
            }
        }
        if let Some(wait) = wait {
            return Err(wait);
        }

        for (key, _) in &limits {
            windows.window(*key).used += 1;
        }
        Ok(())
    }

    /// Whether a request would be throttled right now, without consuming.
    pub fn has_exceeded_no_consume(&self, ip: IpAddr, rpc: Rpc) -> bool {
        let Some(windows) = self.windows.get(&ip) else {
            return false;
        };
        self.limits(rpc)
            .iter()
            .any(|(key, limit)| windows.exceeded(*key, limit))
    }

    /// Drop ips whose windows have all rolled over.
    pub fn cleanup(&self) {
        let longest = self
            .config
            .rules
            .values()
            .map(|r| r.window)
            .chain(std::iter::once(self.config.global.window))
            .max()
            .unwrap_or_default();
        self.windows.retain(|_, windows| {
            windows
                .global
                .iter()
                .chain(windows.rpcs.values())
                .any(|w| w.started.elapsed() < longest)
        });
    }

    /// Number of tracked ips.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
