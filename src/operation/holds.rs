// src/operation/holds.rs

//! Per-context hold dates.
//!
//! Several subsystems may hold the same operation at once (e.g. "network"
//! and "prepare-upload"); each writes under its own context label. An
//! operation is held until the *latest* of its hold dates has passed.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldTable {
    holds: HashMap<Uuid, BTreeMap<String, DateTime<Utc>>>,
}

impl HoldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install, update (`Some`) or clear (`None`) the hold for `context`.
    ///
    /// Returns `true` if the table changed.
    pub fn set(&mut self, uuid: Uuid, context: &str, date: Option<DateTime<Utc>>) -> bool {
        match date {
            Some(date) => {
                let per_op = self.holds.entry(uuid).or_default();
                per_op.insert(context.to_string(), date) != Some(date)
            }
            None => {
                let Some(per_op) = self.holds.get_mut(&uuid) else {
                    return false;
                };
                let removed = per_op.remove(context).is_some();
                if per_op.is_empty() {
                    self.holds.remove(&uuid);
                }
                removed
            }
        }
    }

    pub fn get(&self, uuid: &Uuid, context: &str) -> Option<DateTime<Utc>> {
        self.holds.get(uuid)?.get(context).copied()
    }

    /// The effective hold: the latest date across all contexts.
    pub fn latest(&self, uuid: &Uuid) -> Option<DateTime<Utc>> {
        self.holds.get(uuid)?.values().max().copied()
    }

    /// Whether the operation is still held at `now`.
    pub fn is_held(&self, uuid: &Uuid, now: DateTime<Utc>) -> bool {
        self.latest(uuid).is_some_and(|date| date > now)
    }

    pub fn for_operation(&self, uuid: &Uuid) -> HashMap<String, DateTime<Utc>> {
        self.holds
            .get(uuid)
            .map(|per_op| per_op.iter().map(|(c, d)| (c.clone(), *d)).collect())
            .unwrap_or_default()
    }

    pub fn for_context(&self, context: &str) -> HashMap<Uuid, DateTime<Utc>> {
        self.holds
            .iter()
            .filter_map(|(uuid, per_op)| per_op.get(context).map(|d| (*uuid, *d)))
            .collect()
    }

    /// Replace every hold of an operation (used by restore).
    pub fn replace(&mut self, uuid: Uuid, holds: impl IntoIterator<Item = (String, DateTime<Utc>)>) {
        let per_op: BTreeMap<String, DateTime<Utc>> = holds.into_iter().collect();
        if per_op.is_empty() {
            self.holds.remove(&uuid);
        } else {
            self.holds.insert(uuid, per_op);
        }
    }

    /// Drop every hold of a reaped operation.
    pub fn remove_operation(&mut self, uuid: &Uuid) -> bool {
        self.holds.remove(uuid).is_some()
    }

    /// Earliest effective hold that is still in the future at `now`.
    pub fn next_expiry<'a>(
        &self,
        uuids: impl IntoIterator<Item = &'a Uuid>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        uuids
            .into_iter()
            .filter_map(|uuid| self.latest(uuid))
            .filter(|date| *date > now)
            .min()
    }

    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }

    pub fn clear(&mut self) {
        self.holds.clear();
    }
}
