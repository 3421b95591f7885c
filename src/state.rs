use crate::beszel::{StatsSnapshot, System};
use crate::entities::{build_entities, EntityRegistry, EntityState};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub systems: Vec<System>,
    pub stats: HashMap<String, StatsSnapshot>,
    pub refreshed_at_unix: i64,
}

impl Snapshot {
    pub fn empty(now_unix: i64) -> Self {
        Self {
            refreshed_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn system(&self, system_id: &str) -> Option<&System> {
        self.systems.iter().find(|s| s.id == system_id)
    }

    pub fn stats(&self, system_id: &str) -> Option<&StatsSnapshot> {
        self.stats.get(system_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub last_attempt_unix: i64,
    pub last_success_unix: i64,
    pub last_update_success: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    snapshot: Arc<Snapshot>,
    entities: EntityRegistry,
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    pub fn publish(&mut self, snapshot: Snapshot, now_unix: i64) -> usize {
        let snapshot = Arc::new(snapshot);
        let added = self.entities.merge(build_entities(&snapshot));

        self.snapshot = snapshot;
        self.last_attempt_unix = now_unix;
        self.last_success_unix = now_unix;
        self.last_update_success = true;
        self.consecutive_failures = 0;
        self.last_error = None;
        added
    }

    // The previous snapshot stays published.
    pub fn record_failure(&mut self, error: String, now_unix: i64) {
        self.last_attempt_unix = now_unix;
        self.last_update_success = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error);
    }

    pub fn render_entities(&self) -> Vec<EntityState> {
        let snapshot = self.snapshot();
        self.entities
            .iter()
            .map(|e| e.render(&snapshot, self.last_update_success))
            .collect()
    }

    pub fn render_entity(&self, unique_id: &str) -> Option<EntityState> {
        let snapshot = self.snapshot();
        self.entities
            .get(unique_id)
            .map(|e| e.render(&snapshot, self.last_update_success))
    }
}
