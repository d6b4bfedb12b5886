use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::storage::Keyspace;
use crate::{
    backend::deadline,
    types::{EndOutcome, IdempotencyRecord, IdempotencyStatus, OutboxEntry},
    QueueResult,
};

/// Staged side effects, keyed by entry id
#[derive(Default)]
pub(crate) struct OutboxLists {
    entries: HashMap<String, OutboxEntry>,
    pending: VecDeque<String>,
    inflight: HashMap<String, VecDeque<String>>,
    failed: VecDeque<String>,
}

impl OutboxLists {
    fn stage(&mut self, entry: OutboxEntry) {
        self.pending.push_back(entry.id.clone());
        self.entries.insert(entry.id.clone(), entry);
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn claim(&mut self, reconciler: &str, limit: usize) -> Vec<OutboxEntry> {
        let mut claimed = Vec::new();
        while claimed.len() < limit {
            let Some(id) = self.pending.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            claimed.push(entry.clone());
            self.inflight
                .entry(reconciler.to_string())
                .or_default()
                .push_back(id);
        }
        claimed
    }

    fn take_inflight(&mut self, reconciler: &str, id: &str) {
        if let Some(list) = self.inflight.get_mut(reconciler) {
            list.retain(|held| held != id);
        }
    }

    pub(crate) fn ack(&mut self, reconciler: &str, id: &str) {
        self.take_inflight(reconciler, id);
        self.entries.remove(id);
    }

    pub(crate) fn retry(&mut self, reconciler: &str, entry: &OutboxEntry, park: bool) {
        self.take_inflight(reconciler, &entry.id);
        self.entries.insert(entry.id.clone(), entry.clone());
        if park {
            self.failed.push_back(entry.id.clone());
        } else {
            self.pending.push_back(entry.id.clone());
        }
    }

    pub(crate) fn recover(&mut self, reconciler: &str) -> usize {
        let Some(list) = self.inflight.remove(reconciler) else {
            return 0;
        };
        let recovered = list.len();
        for id in list.into_iter().rev() {
            self.pending.push_front(id);
        }
        recovered
    }
}

impl Keyspace {
    fn live_idempotency(&self, key: &str, now: DateTime<Utc>) -> Option<&IdempotencyRecord> {
        self.idempotency.get(key).filter(|r| r.expires_at > now)
    }

    pub(super) fn idempotency_begin(
        &mut self,
        key: &str,
        owner: Option<&str>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        if self.live_idempotency(key, now).is_some() {
            return Ok(true);
        }
        let expires_at = deadline(now, ttl)?;
        self.idempotency.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                status: IdempotencyStatus::InProgress,
                result: None,
                owner: owner.map(str::to_string),
                created_at: now,
                expires_at,
            },
        );
        Ok(false)
    }

    pub(super) fn idempotency_end(
        &mut self,
        key: &str,
        result: &serde_json::Value,
        outbox: &[OutboxEntry],
        now: DateTime<Utc>,
    ) -> EndOutcome {
        let Some(record) = self
            .idempotency
            .get_mut(key)
            .filter(|r| r.expires_at > now)
        else {
            return EndOutcome::Missing;
        };
        if record.is_done() {
            return EndOutcome::AlreadyDone;
        }

        record.status = IdempotencyStatus::Done;
        record.result = Some(result.clone());
        for entry in outbox {
            let mut entry = entry.clone();
            entry.idempotency_key = key.to_string();
            self.outbox.stage(entry);
        }
        EndOutcome::Recorded
    }

    pub(super) fn idempotency_get(&self, key: &str, now: DateTime<Utc>) -> Option<IdempotencyRecord> {
        self.live_idempotency(key, now).cloned()
    }

    pub(super) fn idempotency_release(&mut self, key: &str) -> bool {
        match self.idempotency.get(key) {
            Some(record) if !record.is_done() => {
                self.idempotency.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(super) fn idempotency_cleanup(&mut self, now: DateTime<Utc>, limit: usize) -> usize {
        let expired: Vec<String> = self
            .idempotency
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(k, _)| k.clone())
            .take(limit)
            .collect();
        for key in &expired {
            self.idempotency.remove(key);
        }
        expired.len()
    }
}
