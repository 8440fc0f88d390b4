//! Shared variable store.
//!
//! The only shared mutable state between the recipe scheduler and the
//! peripheral managers. Every variable has its own lock; the map lock is
//! only held for lookups, first writes and batched publishes, so writers of
//! different variables never contend on a value.
//!
//! Variables live in one of two scopes: `Desired` holds setpoints (written by
//! the scheduler or by manual commands) and `Reported` holds sensor readings.
//! Within a scope the last write wins.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sprout_shared::VariableValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Which half of the namespace a variable lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Desired,
    Reported,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VariableKey {
    pub scope: Scope,
    pub name: String,
}

impl VariableKey {
    pub fn desired(name: impl Into<String>) -> Self {
        Self {
            scope: Scope::Desired,
            name: name.into(),
        }
    }

    pub fn reported(name: impl Into<String>) -> Self {
        Self {
            scope: Scope::Reported,
            name: name.into(),
        }
    }
}

impl fmt::Display for VariableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            Scope::Desired => "desired",
            Scope::Reported => "reported",
        };
        write!(f, "{}.{}", scope, self.name)
    }
}

/// Who wrote a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", content = "peripheral", rename_all = "snake_case")]
pub enum WriterRole {
    Scheduler,
    Sensor(String),
    Manual(String),
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    /// Value retained after its writer stopped delivering updates.
    Stale,
}

/// A variable as observed by readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharedVariable {
    pub key: VariableKey,
    pub value: VariableValue,
    pub freshness: Freshness,
    pub writer: WriterRole,
    pub updated_at: DateTime<Utc>,
    /// Store-wide write sequence number; increases with every write.
    pub revision: u64,
}

impl SharedVariable {
    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }
}

type Slot = Arc<RwLock<SharedVariable>>;

/// Concurrent variable store.
#[derive(Debug, Default)]
pub struct VariableStore {
    slots: RwLock<HashMap<VariableKey, Slot>>,
    sequence: AtomicU64,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one variable. Creates it on first write.
    pub fn set(&self, key: VariableKey, value: VariableValue, writer: WriterRole) -> u64 {
        let existing = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();

        match existing {
            Some(slot) => self.overwrite(&slot, value, writer),
            None => {
                let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
                self.upsert(&mut slots, key, value, writer)
            }
        }
    }

    /// Publish several variables of one scope as a single atomic batch:
    /// no reader observes part of the batch.
    pub fn set_many<I>(&self, scope: Scope, entries: I, writer: WriterRole) -> usize
    where
        I: IntoIterator<Item = (String, VariableValue)>,
    {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let mut written = 0;
        for (name, value) in entries {
            self.upsert(&mut slots, VariableKey { scope, name }, value, writer.clone());
            written += 1;
        }
        written
    }

    pub fn get(&self, key: &VariableKey) -> Option<SharedVariable> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(key)
            .map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub fn desired(&self, name: &str) -> Option<SharedVariable> {
        self.get(&VariableKey::desired(name))
    }

    pub fn reported(&self, name: &str) -> Option<SharedVariable> {
        self.get(&VariableKey::reported(name))
    }

    /// Flag a variable as not fresh, keeping its last value.
    /// Returns false if the variable was never written.
    pub fn mark_stale(&self, key: &VariableKey) -> bool {
        let slot = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();

        match slot {
            Some(slot) => {
                slot.write().unwrap_or_else(PoisonError::into_inner).freshness = Freshness::Stale;
                true
            }
            None => false,
        }
    }

    /// Every variable, ordered by scope then name.
    pub fn snapshot(&self) -> Vec<SharedVariable> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut vars: Vec<SharedVariable> = slots
            .values()
            .map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        vars.sort_by(|a, b| a.key.cmp(&b.key));
        vars
    }

    /// Every key written so far, sorted.
    pub fn keys(&self) -> Vec<VariableKey> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<VariableKey> = slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn upsert(
        &self,
        slots: &mut HashMap<VariableKey, Slot>,
        key: VariableKey,
        value: VariableValue,
        writer: WriterRole,
    ) -> u64 {
        if let Some(slot) = slots.get(&key) {
            return self.overwrite(slot, value, writer);
        }

        let revision = self.next_revision();
        let variable = SharedVariable {
            key: key.clone(),
            value,
            freshness: Freshness::Fresh,
            writer,
            updated_at: Utc::now(),
            revision,
        };
        slots.insert(key, Arc::new(RwLock::new(variable)));
        revision
    }

    fn overwrite(&self, slot: &Slot, value: VariableValue, writer: WriterRole) -> u64 {
        let mut variable = slot.write().unwrap_or_else(PoisonError::into_inner);
        // Revision is taken under the value lock so per-key order matches
        // completion order.
        let revision = self.next_revision();
        variable.value = value;
        variable.writer = writer;
        variable.freshness = Freshness::Fresh;
        variable.updated_at = Utc::now();
        variable.revision = revision;
        revision
    }

    fn next_revision(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_creates_and_overwrites() {
        let store = VariableStore::new();
        assert!(store.desired("air_temperature_celsius").is_none());

        store.set(
            VariableKey::desired("air_temperature_celsius"),
            VariableValue::Number(22.0),
            WriterRole::Scheduler,
        );
        store.set(
            VariableKey::desired("air_temperature_celsius"),
            VariableValue::Number(18.0),
            WriterRole::Manual("heater".to_string()),
        );

        let var = store.desired("air_temperature_celsius").unwrap();
        assert_eq!(var.value, VariableValue::Number(18.0));
        assert_eq!(var.writer, WriterRole::Manual("heater".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_scopes_are_separate() {
        let store = VariableStore::new();
        store.set(
            VariableKey::desired("air_humidity_percent"),
            60.0.into(),
            WriterRole::Scheduler,
        );
        store.set(
            VariableKey::reported("air_humidity_percent"),
            48.5.into(),
            WriterRole::Sensor("sht40".to_string()),
        );

        assert_eq!(store.desired("air_humidity_percent").unwrap().value, 60.0.into());
        assert_eq!(store.reported("air_humidity_percent").unwrap().value, 48.5.into());
    }

    #[test]
    fn test_mark_stale_keeps_value() {
        let store = VariableStore::new();
        let key = VariableKey::reported("air_temperature_celsius");
        assert!(!store.mark_stale(&key));

        store.set(key.clone(), 21.0.into(), WriterRole::Sensor("sht40".to_string()));
        assert!(store.mark_stale(&key));

        let var = store.get(&key).unwrap();
        assert_eq!(var.freshness, Freshness::Stale);
        assert_eq!(var.value, 21.0.into());

        store.set(key.clone(), 21.5.into(), WriterRole::Sensor("sht40".to_string()));
        assert!(store.get(&key).unwrap().is_fresh());
    }

    #[test]
    fn test_revisions_increase_per_key() {
        let store = VariableStore::new();
        let key = VariableKey::desired("port_state");
        let first = store.set(key.clone(), true.into(), WriterRole::Operator);
        let second = store.set(key.clone(), false.into(), WriterRole::Operator);
        assert!(second > first);
        assert_eq!(store.get(&key).unwrap().revision, second);
    }

    #[test]
    fn test_set_many_is_atomic_batch() {
        let store = Arc::new(VariableStore::new());
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..500 {
                    let v = i as f64;
                    store.set_many(
                        Scope::Desired,
                        vec![("a".to_string(), v.into()), ("b".to_string(), v.into())],
                        WriterRole::Scheduler,
                    );
                }
            })
        };

        for _ in 0..500 {
            let snapshot = store.snapshot();
            if snapshot.len() == 2 {
                assert_eq!(snapshot[0].value, snapshot[1].value, "torn batch observed");
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_concurrent_writers_no_lost_variables() {
        let store = Arc::new(VariableStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..100 {
                        store.set(
                            VariableKey::reported(format!("var_{}_{}", t, i % 10)),
                            (i as f64).into(),
                            WriterRole::Sensor(format!("s{}", t)),
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.len(), 80);
        assert_eq!(store.keys().len(), 80);
        assert!(store.snapshot().iter().all(|v| v.value.as_f64().unwrap() >= 90.0));
    }
}
