//! Per-request admission control.
//!
//! Each request is scored by source IP: static block and spammer lists are
//! consulted first, then a weighted request counter backed by `governor`'s
//! GCRA limiter decides whether the source is over its budget for the
//! configured window.
//!
//! Counters live in a table bounded by `max_tracked_sources`. When a new
//! source arrives at a full table, fully decayed counters are dropped first,
//! then the least recently seen ones. Sources rejected within the last window
//! are never dropped, so an abusive source cannot reset its budget by making
//! room for itself with fresh addresses.
pub mod ip_list;

use std::{
    collections::HashMap,
    net::IpAddr,
    num::NonZeroU32,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
pub use ip_list::{IpList, IpNetwork, normalize_ip};
use rand::Rng;
use scc::hash_map::Entry;
use serde_json::Value;

use crate::{config::RateLimitConfig, metrics};

type SourceLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Minimum pause between sweeps that could not free any slot.
const FULL_TABLE_BACKOFF: Duration = Duration::from_secs(1);

struct TrackedSource {
    limiter: SourceLimiter,
    last_seen: Instant,
    last_rejected: Option<Instant>,
}

impl TrackedSource {
    fn new(quota: Quota, now: Instant) -> Self {
        Self {
            limiter: RateLimiter::direct(quota),
            last_seen: now,
            last_rejected: None,
        }
    }

    /// Idle for a whole window: the counter has refilled completely.
    fn is_decayed(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= window
    }

    /// Rejected within the last window, so possibly still over budget.
    fn is_throttled(&self, now: Instant, window: Duration) -> bool {
        self.last_rejected
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Accept,
    /// Reject after a randomized delay.
    SoftReject,
    /// Reject immediately.
    Reject,
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionDecision::Accept => "accept",
            AdmissionDecision::SoftReject => "soft_reject",
            AdmissionDecision::Reject => "reject",
        }
    }
}

/// Accept / soft-reject / reject decisions for inbound requests.
pub struct AdmissionController {
    enabled: bool,
    soft_reject: bool,
    block_list: IpList,
    spammer_list: IpList,
    weights: HashMap<String, u32>,
    broad_query_multiplier: u32,
    quota: Quota,
    window: Duration,
    sources: scc::HashMap<IpAddr, TrackedSource>,
    /// Entry count of `sources`; `scc::HashMap::len` walks every bucket.
    tracked: AtomicUsize,
    max_tracked_sources: usize,
    epoch: Instant,
    /// Millis since `epoch` of the last sweep that freed nothing.
    stalled_sweep_at: AtomicU64,
    sweeping: AtomicBool,
    soft_reject_delay_ms: (u64, u64),
}

impl AdmissionController {
    /// Build a controller from its configuration section.
    pub fn new(config: &RateLimitConfig) -> Result<Self, String> {
        let window = humantime::parse_duration(&config.window)
            .map_err(|e| format!("Invalid window '{}': {e}", config.window))?;
        let threshold = NonZeroU32::new(config.threshold)
            .ok_or_else(|| "Rate limit 'threshold' must be greater than 0".to_string())?;

        // Budget refills continuously: `threshold` weight per `window`, burst of `threshold`.
        let quota = Quota::with_period(window / threshold.get())
            .ok_or_else(|| format!("Window {window:?} is too short for threshold {threshold}"))?
            .allow_burst(threshold);

        let block_list = IpList::from_entries(&config.block_list)?;
        let spammer_list = IpList::from_entries(&config.spammer_list)?;

        tracing::info!(
            enabled = config.enabled,
            soft_reject = config.soft_reject,
            window = %config.window,
            threshold = config.threshold,
            blocked = block_list.len(),
            spammers = spammer_list.len(),
            "Creating admission controller"
        );

        let min_delay = config.soft_reject_min_delay_ms;
        let max_delay = config.soft_reject_max_delay_ms.max(min_delay);

        Ok(Self {
            enabled: config.enabled,
            soft_reject: config.soft_reject,
            block_list,
            spammer_list,
            weights: config.method_weights.clone(),
            broad_query_multiplier: config.broad_query_multiplier.max(1),
            quota,
            window,
            sources: scc::HashMap::new(),
            tracked: AtomicUsize::new(0),
            max_tracked_sources: config.max_tracked_sources.max(1),
            epoch: Instant::now(),
            stalled_sweep_at: AtomicU64::new(u64::MAX),
            sweeping: AtomicBool::new(false),
            soft_reject_delay_ms: (min_delay, max_delay),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_blocked(&self, source: IpAddr) -> bool {
        self.block_list.contains(normalize_ip(source))
    }

    /// Weight of one request. `eth_getLogs` without an address filter counts extra.
    pub fn request_weight(&self, method: &str, params: &Value) -> u32 {
        let base = self.weights.get(method).copied().unwrap_or(1).max(1);
        if method == "eth_getLogs" && !has_address_filter(params) {
            base.saturating_mul(self.broad_query_multiplier)
        } else {
            base
        }
    }

    /// Score one request from `source`.
    pub fn decide(&self, source: IpAddr, method: &str, params: &Value) -> AdmissionDecision {
        if !self.enabled {
            return AdmissionDecision::Accept;
        }

        let source = normalize_ip(source);
        let decision = if self.block_list.contains(source) {
            AdmissionDecision::Reject
        } else {
            let weight = self.request_weight(method, params);
            if self.charge(source, weight) {
                AdmissionDecision::Accept
            } else if self.soft_reject || self.spammer_list.contains(source) {
                AdmissionDecision::SoftReject
            } else {
                AdmissionDecision::Reject
            }
        };

        if decision != AdmissionDecision::Accept {
            tracing::debug!(
                source = %source,
                method,
                decision = decision.as_str(),
                "Request not admitted"
            );
        }
        metrics::increment_admission_decision(decision.as_str());
        decision
    }

    /// Add `weight` to the source's counter. False once the source is over its budget.
    fn charge(&self, source: IpAddr, weight: u32) -> bool {
        let Some(weight) = NonZeroU32::new(weight) else {
            return true;
        };
        if self.tracked_sources() >= self.max_tracked_sources
            && !self.sources.contains_sync(&source)
        {
            self.make_room();
        }

        let now = Instant::now();
        let mut entry = match self.sources.entry_sync(source) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(vacant) => {
                self.tracked.fetch_add(1, Ordering::AcqRel);
                vacant.insert_entry(TrackedSource::new(self.quota, now))
            }
        };
        let tracked = entry.get_mut();
        tracked.last_seen = now;
        // A single request heavier than the whole burst can never be admitted.
        let admitted = matches!(tracked.limiter.check_n(weight), Ok(Ok(())));
        if !admitted {
            tracked.last_rejected = Some(now);
        }
        admitted
    }

    /// Drop sources whose counters have fully decayed. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let evicted = self.drop_decayed(Instant::now());
        metrics::set_tracked_sources(self.tracked_sources());
        evicted
    }

    fn drop_decayed(&self, now: Instant) -> usize {
        let mut dropped = 0;
        self.sources.retain_sync(|_, tracked| {
            let keep = !tracked.is_decayed(now, self.window);
            if !keep {
                dropped += 1;
            }
            keep
        });
        self.tracked.fetch_sub(dropped, Ordering::AcqRel);
        dropped
    }

    /// Bring a full table below its low-water mark.
    ///
    /// Decayed counters go first, then the least recently seen sources that
    /// are not throttled. Throttled sources are kept even if that leaves the
    /// table over capacity.
    fn make_room(&self) {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let now = Instant::now();
        let stalled_at = self.stalled_sweep_at.load(Ordering::Acquire);
        let recently_stalled = stalled_at != u64::MAX
            && self.millis_since_epoch(now).saturating_sub(stalled_at)
                < FULL_TABLE_BACKOFF.as_millis() as u64;
        if !recently_stalled {
            self.sweep(now);
        }
        self.sweeping.store(false, Ordering::Release);
    }

    fn sweep(&self, now: Instant) {
        let mut evicted = self.drop_decayed(now);

        // Free a tenth of the table at once so the next few new sources skip the sweep.
        let target = self
            .max_tracked_sources
            .saturating_sub((self.max_tracked_sources / 10).max(1));
        let excess = self.tracked_sources().saturating_sub(target);
        if excess > 0 {
            let mut candidates = Vec::new();
            self.sources.iter_sync(|source, tracked| {
                if !tracked.is_throttled(now, self.window) {
                    candidates.push((tracked.last_seen, *source));
                }
                true
            });
            candidates.sort_unstable_by_key(|(last_seen, _)| *last_seen);
            for (seen, source) in candidates.into_iter().take(excess) {
                // Skip sources that were charged or rejected since the scan.
                let removed = self.sources.remove_if_sync(&source, |tracked| {
                    tracked.last_seen == seen && !tracked.is_throttled(now, self.window)
                });
                if removed.is_some() {
                    self.tracked.fetch_sub(1, Ordering::AcqRel);
                    evicted += 1;
                }
            }
        }

        let after = self.tracked_sources();
        metrics::set_tracked_sources(after);
        if after >= self.max_tracked_sources {
            tracing::warn!(
                tracked = after,
                max = self.max_tracked_sources,
                "Admission table full of throttled sources"
            );
            self.stalled_sweep_at
                .store(self.millis_since_epoch(now), Ordering::Release);
        } else {
            self.stalled_sweep_at.store(u64::MAX, Ordering::Release);
            tracing::debug!(evicted, "Made room in admission table");
        }
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX - 1)
    }

    pub fn tracked_sources(&self) -> usize {
        self.tracked.load(Ordering::Acquire)
    }

    /// Random delay for a soft reject, within the configured range.
    pub fn soft_reject_delay(&self) -> Duration {
        let (min, max) = self.soft_reject_delay_ms;
        let millis = if min == max {
            min
        } else {
            rand::rng().random_range(min..=max)
        };
        Duration::from_millis(millis)
    }
}

fn has_address_filter(params: &Value) -> bool {
    params
        .get(0)
        .and_then(|filter| filter.get("address"))
        .is_some_and(|address| match address {
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            _ => false,
        })
}
