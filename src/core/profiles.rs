//! Per-client state keyed by client id.
//!
//! The map itself is sharded and only locked for lookups and inserts. Each
//! client's profile and history sit behind their own mutex, which is the
//! per-client critical section for admission checks.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::core::ddos_detector::ClientActivity;
use crate::core::history::RequestHistory;
use crate::models::ClientRiskProfile;

#[derive(Debug, Clone)]
pub struct ClientState {
    pub profile: ClientRiskProfile,
    pub history: RequestHistory,
    /// Whether the latest request came from a known-malicious source
    pub known_malicious: bool,
}

impl ClientState {
    fn new(profile: ClientRiskProfile, max_history: usize) -> Self {
        Self {
            profile,
            history: RequestHistory::new(max_history),
            known_malicious: false,
        }
    }
}

pub type SharedClientState = Arc<Mutex<ClientState>>;

#[derive(Debug)]
pub struct ProfileStore {
    clients: DashMap<String, SharedClientState>,
    max_history: usize,
}

impl ProfileStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_history,
        }
    }

    /// Existing state for the client, or a fresh profile created at `now`
    pub fn get_or_create(&self, client_id: &str, now: DateTime<Utc>) -> SharedClientState {
        if let Some(state) = self.clients.get(client_id) {
            return state.clone();
        }
        self.clients
            .entry(client_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ClientState::new(
                    ClientRiskProfile::new(client_id, now),
                    self.max_history,
                )))
            })
            .clone()
    }

    pub fn get(&self, client_id: &str) -> Option<SharedClientState> {
        self.clients.get(client_id).map(|state| state.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Handles to every client. The map is not locked once this returns.
    pub fn handles(&self) -> Vec<SharedClientState> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Per-client request counts since `since`, one client locked at a time
    pub fn activity_since(&self, since: DateTime<Utc>) -> Vec<ClientActivity> {
        self.handles()
            .into_iter()
            .map(|state| {
                let state = state.lock();
                ClientActivity {
                    client_id: state.profile.client_id.clone(),
                    requests_in_window: state.history.count_since(since),
                    threat_level: state.profile.threat_level,
                }
            })
            .collect()
    }

    /// Copies of every profile
    pub fn profiles(&self) -> Vec<ClientRiskProfile> {
        self.handles()
            .into_iter()
            .map(|state| state.lock().profile.clone())
            .collect()
    }

    /// Remove clients idle for longer than `ttl`. A client that is being
    /// checked right now is never evicted.
    pub fn evict_stale(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let cutoff = now - ttl;
        let candidates: Vec<String> = self
            .clients
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map_or(false, |state| state.profile.last_activity < cutoff)
            })
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|id| {
                self.clients
                    .remove_if(id, |_, state| {
                        state
                            .try_lock()
                            .map_or(false, |state| state.profile.last_activity < cutoff)
                    })
                    .is_some()
            })
            .collect()
    }

    /// Install previously persisted profiles for clients not seen yet.
    /// Histories start empty. Returns how many were installed.
    pub fn restore(&self, profiles: Vec<ClientRiskProfile>) -> usize {
        let mut installed = 0;
        for profile in profiles {
            if self.clients.contains_key(&profile.client_id) {
                continue;
            }
            let client_id = profile.client_id.clone();
            let state = Arc::new(Mutex::new(ClientState::new(profile, self.max_history)));
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.clients.entry(client_id) {
                slot.insert(state);
                installed += 1;
            }
        }
        installed
    }
}
