//! Position cache with tiered refresh bookkeeping.
//!
//! The cache is the single primary mutable structure: a key map plus a
//! deadline heap so the scheduler can pick the next refresh candidate
//! in O(log n). Heap entries are stamped with a generation counter;
//! rescheduling bumps the entry's generation and stale heap nodes are
//! skipped on pop, so no heap surgery is ever needed.
//!
//! Tier is a pure function of the current distance. Alert flags carry
//! hysteresis: once set, a flag only re-arms after distance rises
//! strictly past threshold * rearm_factor, which stops flapping when a
//! position oscillates around a boundary.

use crate::alerts::{AlertContext, AlertKind};
use crate::config::MonitorConfig;
use crate::db::StoredPosition;
use crate::models::{distance_to_liquidation, Exchange, Position, PositionKey};
use crate::monitoring::detector::{classify_update, PrevState, TransitionKind};
use chrono::Utc;
use parking_lot::RwLock;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Urgency class determining refresh cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Critical,
    High,
    Normal,
}

impl Tier {
    /// Tier for a distance, or `None` when the position is beyond the
    /// watch ceiling. Distances at or below zero classify as critical;
    /// whether such an entry is retained is the cache's eviction rule.
    pub fn classify(distance_pct: f64, cfg: &MonitorConfig) -> Option<Tier> {
        if distance_pct > cfg.max_watch_pct {
            None
        } else if distance_pct <= cfg.critical_pct {
            Some(Tier::Critical)
        } else if distance_pct <= cfg.high_pct {
            Some(Tier::High)
        } else {
            Some(Tier::Normal)
        }
    }

    pub fn refresh_period(&self, cfg: &MonitorConfig) -> Duration {
        let ms = match self {
            Tier::Critical => cfg.refresh_critical_ms,
            Tier::High => cfg.refresh_high_ms,
            Tier::Normal => cfg.refresh_normal_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Critical => "critical",
            Tier::High => "high",
            Tier::Normal => "normal",
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "critical" => Some(Tier::Critical),
            "high" => Some(Tier::High),
            "normal" => Some(Tier::Normal),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A watched position with cache bookkeeping.
#[derive(Debug, Clone)]
pub struct CachedPosition {
    /// Latest applied observation
    pub position: Position,
    pub cohort: Option<String>,
    pub mark_price: f64,
    pub distance_pct: f64,
    pub tier: Tier,
    pub next_refresh: Instant,
    pub approaching_alerted: bool,
    pub critical_alerted: bool,
    pub prev_liq_price: Option<f64>,
    pub prev_notional: Option<f64>,
    /// Bumped on every reschedule; heap nodes with an older generation
    /// are dead
    pub generation: u64,
    /// Restored from a >24h-old snapshot; distance must be revalidated
    /// by a fresh fetch before sweep alerts may fire
    pub needs_revalidation: bool,
}

impl CachedPosition {
    pub fn to_stored(&self) -> StoredPosition {
        StoredPosition {
            key: self.position.key.clone(),
            size: self.position.size,
            entry_price: self.position.entry_price,
            mark_price: self.mark_price,
            liq_price: self.position.liq_price,
            notional: self.position.notional,
            leverage: self.position.leverage,
            margin_type: self.position.margin_type,
            cohort: self.cohort.clone(),
            tier: self.tier,
            distance_pct: self.distance_pct,
            approaching_alerted: self.approaching_alerted,
            critical_alerted: self.critical_alerted,
            prev_liq_price: self.prev_liq_price,
            prev_notional: self.prev_notional,
            last_updated: self.position.observed_at,
        }
    }

    fn alert_context(&self, kind: AlertKind, prev_distance: Option<f64>) -> AlertContext {
        AlertContext {
            key: self.position.key.clone(),
            kind,
            margin: self.position.effective_margin(),
            notional: self.position.notional,
            prev_notional: self.prev_notional,
            distance_pct: self.distance_pct,
            prev_distance_pct: prev_distance,
            liq_price: self.position.liq_price,
            mark_price: self.mark_price,
            emitted_at: Utc::now(),
        }
    }
}

struct DeadlineEntry {
    deadline: Instant,
    generation: u64,
    key: PositionKey,
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for DeadlineEntry {}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
    }
}

struct CacheInner {
    positions: HashMap<PositionKey, CachedPosition>,
    deadlines: BinaryHeap<Reverse<DeadlineEntry>>,
    next_generation: u64,
}

/// Why a position left the cache without an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    NoLiqPrice,
    BelowThreshold,
    OutOfRange,
}

/// Result of applying one fresh observation to a cached entry.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// Key is not cached
    NotFound,
    /// Observation is older than the applied state; discarded
    Stale,
    /// Entry silently removed
    Evicted { reason: EvictReason },
    /// Entry updated; `alert` is set for alert-worthy transitions
    Updated {
        kind: TransitionKind,
        alert: Option<AlertContext>,
        snapshot: StoredPosition,
    },
}

/// What the scheduler should do next.
#[derive(Debug)]
pub enum NextDue {
    Due(PositionKey),
    SleepUntil(Instant),
    Empty,
}

/// Outcome of a mark-price sweep over one exchange.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Threshold crossings detected from price movement
    pub alerts: Vec<AlertContext>,
    /// Keys evicted as out-of-range
    pub evicted: Vec<PositionKey>,
    /// Snapshots whose tier or flags changed (persisted)
    pub changed: Vec<StoredPosition>,
}

/// In-memory position cache shared by the scheduler, discovery loop,
/// and summary task.
pub struct PositionCache {
    inner: RwLock<CacheInner>,
    cfg: MonitorConfig,
}

impl PositionCache {
    pub fn new(cfg: MonitorConfig) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                positions: HashMap::new(),
                deadlines: BinaryHeap::new(),
                next_generation: 0,
            }),
            cfg,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().positions.is_empty()
    }

    pub fn get(&self, key: &PositionKey) -> Option<CachedPosition> {
        self.inner.read().positions.get(key).cloned()
    }

    pub fn contains(&self, key: &PositionKey) -> bool {
        self.inner.read().positions.contains_key(key)
    }

    /// Number of critical-tier entries (drives the discovery interval).
    pub fn critical_count(&self) -> usize {
        self.inner
            .read()
            .positions
            .values()
            .filter(|p| p.tier == Tier::Critical)
            .count()
    }

    pub fn tier_counts(&self) -> HashMap<Tier, usize> {
        let inner = self.inner.read();
        let mut counts = HashMap::new();
        for pos in inner.positions.values() {
            *counts.entry(pos.tier).or_insert(0) += 1;
        }
        counts
    }

    /// Exchanges with at least one cached entry.
    pub fn exchanges_present(&self) -> Vec<Exchange> {
        let inner = self.inner.read();
        let mut seen = Vec::new();
        for key in inner.positions.keys() {
            if !seen.contains(&key.exchange) {
                seen.push(key.exchange);
            }
        }
        seen
    }

    /// Clone every entry (daily summary).
    pub fn snapshot_all(&self) -> Vec<CachedPosition> {
        self.inner.read().positions.values().cloned().collect()
    }

    /// Cached keys belonging to one wallet on one exchange.
    pub fn keys_for(&self, address: &str, exchange: Exchange) -> Vec<PositionKey> {
        let address = address.to_ascii_lowercase();
        self.inner
            .read()
            .positions
            .keys()
            .filter(|k| k.exchange == exchange && k.address == address)
            .cloned()
            .collect()
    }

    /// Insert a position observed for the first time. Alert flags
    /// start false. The caller has already applied the eligibility
    /// filters (liquidation price present, notional threshold,
    /// distance within the watch ceiling).
    pub fn insert(
        &self,
        obs: Position,
        mark_price: f64,
        distance_pct: f64,
        cohort: Option<String>,
        now: Instant,
    ) -> StoredPosition {
        let tier = Tier::classify(distance_pct, &self.cfg).unwrap_or(Tier::Normal);
        let mut inner = self.inner.write();
        let generation = inner.bump_generation();
        let key = obs.key.clone();

        let entry = CachedPosition {
            position: obs,
            cohort,
            mark_price,
            distance_pct,
            tier,
            next_refresh: now + tier.refresh_period(&self.cfg),
            approaching_alerted: false,
            critical_alerted: false,
            prev_liq_price: None,
            prev_notional: None,
            generation,
            needs_revalidation: false,
        };
        let snapshot = entry.to_stored();

        inner.deadlines.push(Reverse(DeadlineEntry {
            deadline: entry.next_refresh,
            generation,
            key: key.clone(),
        }));
        inner.positions.insert(key, entry);

        snapshot
    }

    /// Rebuild an entry from its persisted snapshot. Alert flags
    /// survive so restored positions do not re-alert; entries from
    /// snapshots older than the staleness window are marked for lazy
    /// revalidation.
    pub fn restore(&self, stored: StoredPosition, stale: bool, now: Instant) {
        let mut inner = self.inner.write();
        let generation = inner.bump_generation();
        let key = stored.key.clone();

        let entry = CachedPosition {
            position: Position {
                key: stored.key,
                size: stored.size,
                entry_price: stored.entry_price,
                leverage: stored.leverage,
                margin_type: stored.margin_type,
                notional: stored.notional,
                liq_price: stored.liq_price,
                margin_used: 0.0,
                observed_at: stored.last_updated,
            },
            cohort: stored.cohort,
            mark_price: stored.mark_price,
            distance_pct: stored.distance_pct,
            tier: stored.tier,
            next_refresh: now,
            approaching_alerted: stored.approaching_alerted,
            critical_alerted: stored.critical_alerted,
            prev_liq_price: stored.prev_liq_price,
            prev_notional: stored.prev_notional,
            generation,
            needs_revalidation: stale,
        };

        inner.deadlines.push(Reverse(DeadlineEntry {
            deadline: now,
            generation,
            key: key.clone(),
        }));
        inner.positions.insert(key, entry);
    }

    /// Remove an entry without alerting.
    pub fn remove(&self, key: &PositionKey) -> Option<CachedPosition> {
        self.inner.write().positions.remove(key)
    }

    /// Remove an entry that disappeared from a successful wallet
    /// fetch, returning the full-liquidation alert context.
    pub fn remove_liquidated(&self, key: &PositionKey) -> Option<AlertContext> {
        let entry = self.inner.write().positions.remove(key)?;
        let prev_distance = Some(entry.distance_pct);
        Some(entry.alert_context(AlertKind::FullLiquidation, prev_distance))
    }

    /// Apply a fresh observation to a cached entry: staleness check,
    /// eviction rules, transition classification, flag updates, tier
    /// reclassification, and a new refresh deadline.
    pub fn refresh(
        &self,
        key: &PositionKey,
        obs: &Position,
        mark_hint: Option<f64>,
        min_notional: f64,
        now: Instant,
    ) -> RefreshOutcome {
        let mut inner = self.inner.write();

        let Some(entry) = inner.positions.get(key) else {
            return RefreshOutcome::NotFound;
        };

        // A later observation must never be overwritten by an earlier
        // one; discard stragglers.
        if obs.observed_at <= entry.position.observed_at {
            return RefreshOutcome::Stale;
        }

        let Some(liq_price) = obs.liq_price else {
            inner.positions.remove(key);
            return RefreshOutcome::Evicted {
                reason: EvictReason::NoLiqPrice,
            };
        };

        if obs.notional < min_notional {
            inner.positions.remove(key);
            return RefreshOutcome::Evicted {
                reason: EvictReason::BelowThreshold,
            };
        }

        let entry = inner.positions.get(key).unwrap();
        let mark_price = mark_hint
            .or_else(|| {
                if obs.size > 0.0 {
                    Some(obs.notional / obs.size)
                } else {
                    None
                }
            })
            .unwrap_or(entry.mark_price);
        let distance_pct = distance_to_liquidation(key.side, mark_price, liq_price);

        // Out-of-range entries are evicted unless their prior tier was
        // above normal; those get one more cycle so the next refresh
        // resolves liquidation vs recovery.
        let out_of_range = distance_pct > self.cfg.max_watch_pct || distance_pct <= 0.0;
        if out_of_range && entry.tier == Tier::Normal {
            inner.positions.remove(key);
            return RefreshOutcome::Evicted {
                reason: EvictReason::OutOfRange,
            };
        }

        let prev = PrevState {
            side: key.side,
            size: entry.position.size,
            notional: entry.position.notional,
            liq_price: entry.position.liq_price,
            approaching_alerted: entry.approaching_alerted,
            critical_alerted: entry.critical_alerted,
        };
        let prev_distance = entry.distance_pct;
        let kind = classify_update(&prev, obs, distance_pct, &self.cfg);

        let generation = inner.bump_generation();
        let entry = inner.positions.get_mut(key).unwrap();

        entry.prev_liq_price = entry.position.liq_price;
        entry.prev_notional = Some(entry.position.notional);
        entry.position = obs.clone();
        entry.mark_price = mark_price;
        entry.distance_pct = distance_pct;
        entry.needs_revalidation = false;

        match kind {
            TransitionKind::Imminent => {
                entry.critical_alerted = true;
                entry.approaching_alerted = true;
            }
            TransitionKind::Approaching => {
                entry.approaching_alerted = true;
            }
            _ => {}
        }
        rearm_flags(entry, &self.cfg);

        if let Some(tier) = Tier::classify(distance_pct, &self.cfg) {
            entry.tier = tier;
        }
        entry.generation = generation;
        entry.next_refresh = now + entry.tier.refresh_period(&self.cfg);

        let alert = AlertKind::from_transition(kind)
            .map(|alert_kind| entry.alert_context(alert_kind, Some(prev_distance)));
        let snapshot = entry.to_stored();
        let deadline = entry.next_refresh;
        let key = key.clone();

        inner.deadlines.push(Reverse(DeadlineEntry {
            deadline,
            generation,
            key,
        }));

        RefreshOutcome::Updated {
            kind,
            alert,
            snapshot,
        }
    }

    /// Earliest-deadline pick for the scheduler. Pops the due entry
    /// off the heap; stale heap nodes are discarded along the way.
    pub fn next_due(&self, now: Instant) -> NextDue {
        let mut inner = self.inner.write();

        loop {
            let (deadline, generation, key) = match inner.deadlines.peek() {
                Some(Reverse(top)) => (top.deadline, top.generation, top.key.clone()),
                None => return NextDue::Empty,
            };

            let live = inner
                .positions
                .get(&key)
                .map(|p| p.generation == generation)
                .unwrap_or(false);

            if !live {
                inner.deadlines.pop();
                continue;
            }

            if deadline <= now {
                inner.deadlines.pop();
                return NextDue::Due(key);
            }
            return NextDue::SleepUntil(deadline);
        }
    }

    /// All cached keys sharing the seed's wallet and exchange whose
    /// deadline falls within the coalescing window. One upstream call
    /// services the whole batch.
    pub fn collect_batch(
        &self,
        seed: &PositionKey,
        now: Instant,
        window: Duration,
    ) -> Vec<PositionKey> {
        let horizon = now + window;
        let inner = self.inner.read();
        let mut batch = vec![seed.clone()];

        for (key, entry) in &inner.positions {
            if key != seed
                && key.address == seed.address
                && key.exchange == seed.exchange
                && entry.next_refresh <= horizon
            {
                batch.push(key.clone());
            }
        }
        batch
    }

    /// Push a fresh deadline for a key whose refresh attempt failed or
    /// was skipped, so it is not retried in a tight loop.
    pub fn reschedule(&self, key: &PositionKey, now: Instant) {
        let mut inner = self.inner.write();
        let generation = inner.bump_generation();
        let Some(entry) = inner.positions.get_mut(key) else {
            return;
        };
        entry.generation = generation;
        entry.next_refresh = now + entry.tier.refresh_period(&self.cfg);
        let deadline = entry.next_refresh;
        inner.deadlines.push(Reverse(DeadlineEntry {
            deadline,
            generation,
            key: key.clone(),
        }));
    }

    /// Re-derive distance for every entry on one exchange from a fresh
    /// mark-price map. Handles hysteresis re-arming, tier moves (with
    /// deadline changes), out-of-range eviction, and threshold-crossing
    /// alerts. Entries pending revalidation update silently.
    pub fn apply_mark_prices(
        &self,
        exchange: Exchange,
        prices: &HashMap<String, f64>,
        now: Instant,
    ) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut inner = self.inner.write();
        let mut reschedules: Vec<(PositionKey, Instant, u64)> = Vec::new();
        let mut evicted: Vec<PositionKey> = Vec::new();

        let keys: Vec<PositionKey> = inner
            .positions
            .keys()
            .filter(|k| k.exchange == exchange)
            .cloned()
            .collect();

        for key in keys {
            let Some(mark) = crate::upstream::info::lookup_mark(prices, &key.token) else {
                continue;
            };

            let generation = inner.bump_generation();
            let entry = inner.positions.get_mut(&key).unwrap();
            let Some(liq) = entry.position.liq_price else {
                continue;
            };

            let prev_distance = entry.distance_pct;
            let prev_tier = entry.tier;
            let was_approach_armed = !entry.approaching_alerted;
            let was_critical_armed = !entry.critical_alerted;

            entry.mark_price = mark;
            entry.distance_pct = distance_to_liquidation(key.side, mark, liq);
            let distance = entry.distance_pct;

            // Out-of-range: same retention rule as refresh.
            if (distance > self.cfg.max_watch_pct || distance <= 0.0)
                && prev_tier == Tier::Normal
            {
                evicted.push(key.clone());
                continue;
            }

            let rearmed = rearm_flags(entry, &self.cfg);

            let mut fired = None;
            if !entry.needs_revalidation {
                if distance <= self.cfg.imminent_pct && !entry.critical_alerted {
                    entry.critical_alerted = true;
                    entry.approaching_alerted = true;
                    fired = Some(AlertKind::Imminent);
                } else if distance <= self.cfg.approaching_pct && !entry.approaching_alerted {
                    entry.approaching_alerted = true;
                    fired = Some(AlertKind::Approaching);
                }
            }

            if let Some(tier) = Tier::classify(distance, &self.cfg) {
                entry.tier = tier;
            }
            if entry.tier != prev_tier {
                entry.generation = generation;
                entry.next_refresh = now + entry.tier.refresh_period(&self.cfg);
                reschedules.push((key.clone(), entry.next_refresh, generation));
            }

            let flags_changed = (!entry.approaching_alerted) != was_approach_armed
                || (!entry.critical_alerted) != was_critical_armed;

            if let Some(alert_kind) = fired {
                outcome
                    .alerts
                    .push(entry.alert_context(alert_kind, Some(prev_distance)));
            }
            if entry.tier != prev_tier || flags_changed || rearmed {
                outcome.changed.push(entry.to_stored());
            }
        }

        for key in evicted {
            inner.positions.remove(&key);
            outcome.evicted.push(key);
        }
        for (key, deadline, generation) in reschedules {
            inner.deadlines.push(Reverse(DeadlineEntry {
                deadline,
                generation,
                key,
            }));
        }

        outcome
    }
}

impl CacheInner {
    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Reset alert flags once distance has risen strictly past the re-arm
/// point (threshold * rearm_factor). Returns whether anything changed.
fn rearm_flags(entry: &mut CachedPosition, cfg: &MonitorConfig) -> bool {
    let mut changed = false;
    if entry.approaching_alerted && entry.distance_pct > cfg.approaching_pct * cfg.rearm_factor {
        entry.approaching_alerted = false;
        changed = true;
    }
    if entry.critical_alerted && entry.distance_pct > cfg.imminent_pct * cfg.rearm_factor {
        entry.critical_alerted = false;
        changed = true;
    }
    changed
}
