//! Active chat requests and their cancellation handles.
//!
//! The registry is the single source of truth for "is this request still
//! running". The chat bridge registers on start and unregisters on teardown;
//! the abort endpoint cancels through it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("request {0} is already active")]
    AlreadyActive(String),
}

/// Proof of registration, returned by [`RequestRegistry::register`].
///
/// The generation distinguishes two requests that reuse the same id, so
/// tearing down the older one never removes the newer entry.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: String,
    generation: u64,
    token: CancellationToken,
}

impl RequestHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct ActiveRequest {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct RequestRegistry {
    active: Mutex<HashMap<String, ActiveRequest>>,
    next_generation: AtomicU64,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` as running. Fails if a request with that id is active.
    pub fn register(&self, id: &str) -> Result<RequestHandle, RegistryError> {
        let mut active = self.active.lock();
        if active.contains_key(id) {
            return Err(RegistryError::AlreadyActive(id.to_string()));
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        active.insert(
            id.to_string(),
            ActiveRequest {
                generation,
                token: token.clone(),
            },
        );
        Ok(RequestHandle {
            id: id.to_string(),
            generation,
            token,
        })
    }

    /// Cancel an active request. Returns whether one was found.
    ///
    /// Idempotent: a second call, or a call after the request finished,
    /// reports `false` and does nothing.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.active.lock().remove(id);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                tracing::debug!("Cancelled request {id}");
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `handle` if it still belongs to that registration.
    pub fn unregister(&self, handle: &RequestHandle) {
        let mut active = self.active.lock();
        if active
            .get(&handle.id)
            .is_some_and(|entry| entry.generation == handle.generation)
        {
            active.remove(&handle.id);
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.lock().contains_key(id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
