//! Per-station listening time.
//!
//! The ledger is keyed by dedup identity and lives outside the station
//! records, so edits to a record never race with time accrual.  The
//! accumulator holds at most one running anchor; the owner calls `tick` on
//! a fixed interval while a station is playing and the phase hooks flush
//! the partial interval on pause, stop or switch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::kv::{self, keys, KeyValueStore};
use crate::model::DedupKey;
use crate::session::Phase;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListeningEntry {
    pub total_time_ms: u64,
    pub session_count: u32,
}

/// Serialized as the `station-listening-times` value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListeningLedger {
    entries: HashMap<DedupKey, ListeningEntry>,
}

impl ListeningLedger {
    pub fn get(&self, key: &DedupKey) -> ListeningEntry {
        self.entries.get(key).copied().unwrap_or_default()
    }

    pub fn total_ms(&self, key: &DedupKey) -> u64 {
        self.get(key).total_time_ms
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DedupKey, &ListeningEntry)> {
        self.entries.iter()
    }

    fn add_time(&mut self, key: &DedupKey, ms: u64) {
        let entry = self.entries.entry(key.clone()).or_default();
        entry.total_time_ms = entry.total_time_ms.saturating_add(ms);
    }

    fn add_session(&mut self, key: &DedupKey) {
        let entry = self.entries.entry(key.clone()).or_default();
        entry.session_count = entry.session_count.saturating_add(1);
    }
}

struct Anchor {
    key: DedupKey,
    since: Instant,
}

pub struct ListeningTimeAccumulator {
    ledger: ListeningLedger,
    anchor: Option<Anchor>,
    tick_interval: Duration,
    kv: Arc<dyn KeyValueStore>,
}

impl ListeningTimeAccumulator {
    pub fn load(kv: Arc<dyn KeyValueStore>, tick_interval: Duration) -> Self {
        let ledger = match kv::load_json::<ListeningLedger>(kv.as_ref(), keys::LISTENING_TIMES) {
            Ok(ledger) => ledger.unwrap_or_default(),
            Err(e) => {
                warn!("listening: discarding unreadable ledger: {}", e);
                ListeningLedger::default()
            }
        };
        Self {
            ledger,
            anchor: None,
            tick_interval,
            kv,
        }
    }

    pub fn ledger(&self) -> &ListeningLedger {
        &self.ledger
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn running_station(&self) -> Option<&DedupKey> {
        self.anchor.as_ref().map(|a| &a.key)
    }

    /// A new listening session begins for `key`.
    pub fn start(&mut self, key: DedupKey, now: Instant) {
        self.flush(now);
        self.ledger.add_session(&key);
        debug!("listening: start {}", key);
        self.anchor = Some(Anchor { key, since: now });
        self.persist();
    }

    /// Continue the current session after a pause.
    pub fn resume(&mut self, key: DedupKey, now: Instant) {
        self.flush(now);
        self.anchor = Some(Anchor { key, since: now });
    }

    /// Credit the time since the anchor and move the anchor to `now`.
    /// Returns the credited milliseconds, or `None` when nothing is running.
    pub fn tick(&mut self, now: Instant) -> Option<u64> {
        let anchor = self.anchor.as_mut()?;
        let elapsed = now.saturating_duration_since(anchor.since).as_millis() as u64;
        anchor.since = now;
        let key = anchor.key.clone();
        self.ledger.add_time(&key, elapsed);
        self.persist();
        Some(elapsed)
    }

    /// Credit the partial interval and clear the anchor.
    pub fn flush(&mut self, now: Instant) -> Option<u64> {
        let credited = self.tick(now);
        self.anchor = None;
        credited
    }

    /// Feed a session phase transition.  Entering `Playing` from `Loading`
    /// opens a session, from `Paused` resumes it; leaving `Playing` flushes.
    pub fn on_phase(&mut self, from: Phase, to: Phase, station: Option<&DedupKey>, now: Instant) {
        if from == Phase::Playing && to != Phase::Playing {
            self.flush(now);
        }
        if to == Phase::Playing && from != Phase::Playing {
            match (from, station) {
                (Phase::Paused, Some(key)) => self.resume(key.clone(), now),
                (_, Some(key)) => self.start(key.clone(), now),
                (_, None) => warn!("listening: playing without a station"),
            }
        }
    }

    fn persist(&self) {
        if let Err(e) = kv::save_json(self.kv.as_ref(), keys::LISTENING_TIMES, &self.ledger) {
            error!("listening: failed to persist ledger: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn key(s: &str) -> DedupKey {
        DedupKey::from_parts(None, s)
    }

    fn accumulator() -> ListeningTimeAccumulator {
        ListeningTimeAccumulator::load(Arc::new(MemoryStore::new()), DEFAULT_TICK_INTERVAL)
    }

    #[test]
    fn ticks_and_flush_add_up_to_wall_time() {
        let mut acc = accumulator();
        let t0 = Instant::now();
        acc.start(key("http://a"), t0);
        assert_eq!(acc.tick(t0 + Duration::from_secs(30)), Some(30_000));
        assert_eq!(acc.tick(t0 + Duration::from_secs(60)), Some(30_000));
        assert_eq!(acc.flush(t0 + Duration::from_secs(75)), Some(15_000));
        assert!(!acc.is_running());
        assert_eq!(acc.ledger().total_ms(&key("http://a")), 75_000);
        assert_eq!(acc.ledger().get(&key("http://a")).session_count, 1);
    }

    #[test]
    fn tick_without_anchor_is_noop() {
        let mut acc = accumulator();
        assert_eq!(acc.tick(Instant::now()), None);
        assert_eq!(acc.flush(Instant::now()), None);
    }

    #[test]
    fn pause_resume_keeps_one_session() {
        let mut acc = accumulator();
        let t0 = Instant::now();
        let a = key("http://a");
        acc.on_phase(Phase::Loading, Phase::Playing, Some(&a), t0);
        acc.on_phase(Phase::Playing, Phase::Paused, Some(&a), t0 + Duration::from_secs(10));
        // paused time is not credited
        acc.on_phase(Phase::Paused, Phase::Playing, Some(&a), t0 + Duration::from_secs(100));
        acc.on_phase(Phase::Playing, Phase::Idle, None, t0 + Duration::from_secs(105));
        let entry = acc.ledger().get(&a);
        assert_eq!(entry.total_time_ms, 15_000);
        assert_eq!(entry.session_count, 1);
    }

    #[test]
    fn switching_station_flushes_previous() {
        let mut acc = accumulator();
        let t0 = Instant::now();
        acc.start(key("http://a"), t0);
        acc.start(key("http://b"), t0 + Duration::from_secs(5));
        acc.flush(t0 + Duration::from_secs(8));
        assert_eq!(acc.ledger().total_ms(&key("http://a")), 5_000);
        assert_eq!(acc.ledger().total_ms(&key("http://b")), 3_000);
    }

    #[test]
    fn ledger_is_persisted_and_reloaded() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let t0 = Instant::now();
        {
            let mut acc = ListeningTimeAccumulator::load(kv.clone(), DEFAULT_TICK_INTERVAL);
            acc.start(key("uuid-1"), t0);
            acc.flush(t0 + Duration::from_millis(1234));
        }
        let raw = kv.get(keys::LISTENING_TIMES).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["uuid-1"]["totalTimeMs"], 1234);
        assert_eq!(json["uuid-1"]["sessionCount"], 1);

        let acc = ListeningTimeAccumulator::load(kv, DEFAULT_TICK_INTERVAL);
        assert_eq!(acc.ledger().total_ms(&key("uuid-1")), 1234);
    }
}
