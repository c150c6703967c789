//! Exclusive ownership of bus resources.
//!
//! A resource is an opaque string key such as `gpio:chip0:17`. One owner
//! holds it at a time. The same owner may acquire it again; every grant
//! hands out its own token and the resource is free once all of them are
//! released.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::DeviceError;

/// Proof of ownership of one bus resource.
///
/// Tokens are deliberately not `Clone`: each grant is released exactly once.
/// Dropping a token does not release it.
#[derive(Debug, PartialEq, Eq)]
pub struct ExclusivityToken {
    id: u64,
    resource: String,
    owner: String,
}

impl ExclusivityToken {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[derive(Debug)]
struct Holder {
    owner: String,
    /// Live token ids; the length is the reference count.
    tokens: HashSet<u64>,
}

#[derive(Debug, Default)]
struct ArbiterState {
    holders: HashMap<String, Holder>,
    next_id: u64,
}

/// Grants exclusive access to bus resources.
///
/// One arbiter is created per registry and injected into every bus
/// controller, so independent registries never contend with each other.
#[derive(Debug, Default)]
pub struct ExclusivityArbiter {
    state: Mutex<ArbiterState>,
    /// Signalled whenever a resource becomes free.
    released: Notify,
}

impl ExclusivityArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `resource` for `owner`, waiting up to `timeout` if another
    /// owner holds it. A zero timeout makes a single attempt.
    pub async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        timeout: Duration,
    ) -> Result<ExclusivityToken, DeviceError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking, so a release between the
            // check and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let holder = match self.try_acquire(resource, owner) {
                Ok(token) => return Ok(token),
                Err(holder) => holder,
            };

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::debug!(resource, owner, holder = %holder, "acquire timed out");
                return Err(DeviceError::ResourceBusy {
                    resource: resource.to_string(),
                    holder,
                });
            }
        }
    }

    /// Single non-blocking attempt. On contention returns the current holder.
    fn try_acquire(&self, resource: &str, owner: &str) -> Result<ExclusivityToken, String> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;

        match state.holders.get_mut(resource) {
            Some(holder) if holder.owner != owner => return Err(holder.owner.clone()),
            Some(holder) => {
                holder.tokens.insert(id);
            }
            None => {
                state.holders.insert(
                    resource.to_string(),
                    Holder {
                        owner: owner.to_string(),
                        tokens: HashSet::from([id]),
                    },
                );
            }
        }

        Ok(ExclusivityToken {
            id,
            resource: resource.to_string(),
            owner: owner.to_string(),
        })
    }

    /// Release one grant. The resource becomes free when its last grant is released.
    ///
    /// Fails with [`DeviceError::AlreadyReleased`] when the token is no longer
    /// live, e.g. after [`release_owner`](Self::release_owner) or when it was
    /// issued by a different arbiter. Nothing is changed in that case.
    pub fn release(&self, token: ExclusivityToken) -> Result<(), DeviceError> {
        let freed = {
            let mut state = self.state.lock();
            let Some(holder) = state.holders.get_mut(&token.resource) else {
                return Err(DeviceError::AlreadyReleased(token.resource));
            };
            if holder.owner != token.owner || !holder.tokens.remove(&token.id) {
                return Err(DeviceError::AlreadyReleased(token.resource));
            }
            if holder.tokens.is_empty() {
                state.holders.remove(&token.resource);
                true
            } else {
                false
            }
        };

        if freed {
            self.released.notify_waiters();
        }
        Ok(())
    }

    /// Release every grant held by `owner`. Returns the freed resource ids.
    pub fn release_owner(&self, owner: &str) -> Vec<String> {
        let freed: Vec<String> = {
            let mut state = self.state.lock();
            let freed: Vec<String> = state
                .holders
                .iter()
                .filter(|(_, holder)| holder.owner == owner)
                .map(|(resource, _)| resource.clone())
                .collect();
            for resource in &freed {
                state.holders.remove(resource);
            }
            freed
        };

        if !freed.is_empty() {
            tracing::debug!(owner, resources = ?freed, "released all resources of owner");
            self.released.notify_waiters();
        }
        freed
    }

    /// Whether `token` still represents a live grant.
    pub fn is_live(&self, token: &ExclusivityToken) -> bool {
        let state = self.state.lock();
        state
            .holders
            .get(&token.resource)
            .map(|holder| holder.owner == token.owner && holder.tokens.contains(&token.id))
            .unwrap_or(false)
    }

    /// Current owner of `resource`, if held.
    pub fn holder(&self, resource: &str) -> Option<String> {
        self.state
            .lock()
            .holders
            .get(resource)
            .map(|holder| holder.owner.clone())
    }

    /// Number of live grants on `resource`.
    pub fn grant_count(&self, resource: &str) -> usize {
        self.state
            .lock()
            .holders
            .get(resource)
            .map(|holder| holder.tokens.len())
            .unwrap_or(0)
    }

    /// Resources currently held by `owner`, sorted.
    pub fn held_by(&self, owner: &str) -> Vec<String> {
        let mut resources: Vec<String> = self
            .state
            .lock()
            .holders
            .iter()
            .filter(|(_, holder)| holder.owner == owner)
            .map(|(resource, _)| resource.clone())
            .collect();
        resources.sort();
        resources
    }
}
