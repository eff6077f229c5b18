//! Last debug run per endpoint.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::controller::DebugRunResponse;

/// Snapshot of the most recent debug run of an endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveDebugSession {
    pub session_id: String,
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
    pub payload: DebugRunResponse,
}

/// One slot per endpoint; a new run replaces the previous snapshot.
#[derive(Default)]
pub struct LiveSessionStore {
    slots: DashMap<String, LiveDebugSession>,
}

impl LiveSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, session: LiveDebugSession) {
        self.slots.insert(session.endpoint.clone(), session);
    }

    pub fn get(&self, endpoint: &str) -> Option<LiveDebugSession> {
        self.slots.get(endpoint).map(|slot| slot.clone())
    }

    pub fn remove(&self, endpoint: &str) -> Option<LiveDebugSession> {
        self.slots.remove(endpoint).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
