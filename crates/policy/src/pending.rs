use chrono::{DateTime, Duration, Utc};
use execbandit_core_types::PendingSelection;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Inserted,
    /// An entry with the same correlation id was already pending and has been replaced.
    Replaced,
}

#[derive(Debug, Default)]
struct PendingState {
    by_id: HashMap<String, PendingSelection>,
    // correlation ids per instrument, in insertion order
    by_instrument: HashMap<String, VecDeque<String>>,
    // resolved but not yet through attribution
    settling: HashSet<String>,
}

impl PendingState {
    fn detach_from_instrument(&mut self, instrument_id: &str, correlation_id: &str) {
        let Some(ids) = self.by_instrument.get_mut(instrument_id) else {
            return;
        };
        ids.retain(|id| id != correlation_id);
        if ids.is_empty() {
            self.by_instrument.remove(instrument_id);
        }
    }

    fn remove(&mut self, correlation_id: &str) -> Option<PendingSelection> {
        let entry = self.by_id.remove(correlation_id)?;
        self.detach_from_instrument(&entry.instrument_id, correlation_id);
        Some(entry)
    }

    fn take_for_settlement(&mut self, correlation_id: &str) -> Option<PendingSelection> {
        let entry = self.remove(correlation_id)?;
        self.settling.insert(entry.correlation_id.clone());
        Some(entry)
    }
}

/// Selections awaiting settlement, indexed by correlation id and by instrument.
///
/// Both indices live under one mutex so every operation updates them as a pair.
#[derive(Debug)]
pub struct PendingSelectionQueue {
    state: Mutex<PendingState>,
    expiry: Duration,
    jitter: Duration,
}

impl PendingSelectionQueue {
    pub fn new(expiry_ms: u64, instrument_match_jitter_ms: u64) -> Self {
        Self {
            state: Mutex::new(PendingState::default()),
            expiry: Duration::milliseconds(i64::try_from(expiry_ms).unwrap_or(i64::MAX)),
            jitter: Duration::milliseconds(
                i64::try_from(instrument_match_jitter_ms).unwrap_or(i64::MAX),
            ),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, entry: PendingSelection) -> EnqueueResult {
        let mut state = self.lock();
        let result = match state.remove(&entry.correlation_id) {
            Some(_) => EnqueueResult::Replaced,
            None => EnqueueResult::Inserted,
        };
        state
            .by_instrument
            .entry(entry.instrument_id.clone())
            .or_default()
            .push_back(entry.correlation_id.clone());
        state.by_id.insert(entry.correlation_id.clone(), entry);
        result
    }

    /// Takes the entry for settlement. The id stays marked as settling until
    /// [`Self::finish_settlement`] is called.
    pub fn resolve_by_id(&self, correlation_id: &str) -> Option<PendingSelection> {
        self.lock().take_for_settlement(correlation_id)
    }

    pub fn finish_settlement(&self, correlation_id: &str) {
        self.lock().settling.remove(correlation_id);
    }

    /// True while another caller holds this id between resolution and attribution.
    pub fn is_settling(&self, correlation_id: &str) -> bool {
        self.lock().settling.contains(correlation_id)
    }

    /// Settlement without a correlation id: takes the earliest-created entry for the
    /// instrument created no later than `settled_at + jitter`, or the oldest entry when
    /// none qualifies.
    pub fn resolve_by_instrument(
        &self,
        instrument_id: &str,
        settled_at: DateTime<Utc>,
    ) -> Option<PendingSelection> {
        let mut state = self.lock();
        let deadline = settled_at + self.jitter;
        let ids = state.by_instrument.get(instrument_id)?;

        let mut earliest_within: Option<(&String, DateTime<Utc>)> = None;
        let mut oldest: Option<(&String, DateTime<Utc>)> = None;
        for id in ids {
            let Some(entry) = state.by_id.get(id) else {
                continue;
            };
            let created = entry.created_at;
            if oldest.map_or(true, |(_, ts)| created < ts) {
                oldest = Some((id, created));
            }
            if created <= deadline && earliest_within.map_or(true, |(_, ts)| created < ts) {
                earliest_within = Some((id, created));
            }
        }
        let chosen = earliest_within.or(oldest)?.0.clone();
        state.take_for_settlement(&chosen)
    }

    /// Removes every entry created at or before `now - expiry` and reports each exactly
    /// once to `on_expired`, after the lock is released.
    pub fn prune<F>(&self, now: DateTime<Utc>, mut on_expired: F) -> usize
    where
        F: FnMut(PendingSelection),
    {
        let cutoff = now - self.expiry;
        let expired: Vec<PendingSelection> = {
            let mut state = self.lock();
            let ids: Vec<String> = state
                .by_id
                .values()
                .filter(|entry| entry.created_at <= cutoff)
                .map(|entry| entry.correlation_id.clone())
                .collect();
            ids.iter().filter_map(|id| state.remove(id)).collect()
        };
        let count = expired.len();
        for entry in expired {
            on_expired(entry);
        }
        count
    }

    pub fn size(&self) -> usize {
        self.lock().by_id.len()
    }

    #[cfg(test)]
    fn indices_consistent(&self) -> bool {
        let state = self.lock();
        let listed: usize = state.by_instrument.values().map(VecDeque::len).sum();
        listed == state.by_id.len()
            && state.by_instrument.iter().all(|(instrument, ids)| {
                !ids.is_empty()
                    && ids.iter().all(|id| {
                        state
                            .by_id
                            .get(id)
                            .is_some_and(|entry| &entry.instrument_id == instrument)
                    })
            })
    }
}
