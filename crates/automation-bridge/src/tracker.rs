//! Request correlation engine.
//!
//! Owns the pending-request store and the coalescing cache. Callers create a
//! request, dispatch it out-of-band tagged with the returned [`RequestId`],
//! and route the worker's progress and terminal messages back in. The engine
//! never performs transport I/O itself.
//!
//! Termination paths (resolve, reject, soft timeout, absolute timeout, bulk
//! reject) all remove the entry from the store under the lock before settling,
//! so whichever happens first wins and the rest are no-ops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::coalesce::{self, CoalesceCache};
use crate::completion::{self, Completion, CompletionResult};
use crate::config::TrackerConfig;
use crate::error::BridgeError;
use crate::pending::{PendingRequest, ProgressPolicy, ProgressState, ProgressVerdict};
use crate::protocol::{AutomationResponse, Payload};
use crate::request_id::RequestId;
use crate::timer::TimerHandle;

/// Diagnostic summary of one pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDetail {
    pub request_id: RequestId,
    pub action: String,
    pub age_ms: u64,
}

/// Full diagnostic view of one pending request.
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    pub request_id: RequestId,
    pub action: String,
    pub payload: Payload,
    pub age: Duration,
    pub soft_deadline: Duration,
    pub absolute_deadline: Duration,
    pub progress: ProgressState,
}

/// Outcome of [`RequestTracker::admit`].
#[derive(Debug)]
pub enum Admission {
    /// A new request was created; the caller must dispatch it.
    Created(RequestId, Completion),
    /// An identical idempotent request is already in flight.
    Joined(Completion),
}

#[derive(Debug, Clone, Copy)]
enum Expiry {
    Soft { generation: u64, after: Duration },
    Absolute,
}

struct TrackerInner {
    config: TrackerConfig,
    pending: StdMutex<HashMap<RequestId, PendingRequest>>,
    coalesced: Arc<CoalesceCache>,
    last_request_sent_at: StdMutex<Option<DateTime<Utc>>>,
    released: Notify,
}

impl TrackerInner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Pending request store mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn lock_last_sent(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_request_sent_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn policy(&self) -> ProgressPolicy {
        ProgressPolicy {
            extension: self.config.progress_extension,
            max_extensions: self.config.max_progress_extensions,
            stale_threshold: self.config.progress_stale_threshold,
        }
    }

    /// Settle a request already removed from the store.
    fn finish(&self, request_id: RequestId, entry: PendingRequest, result: CompletionResult) {
        self.coalesced.evict_request(&request_id);
        entry.finish(result);
        self.released.notify_waiters();
    }

    fn expire(&self, request_id: RequestId, expiry: Expiry) {
        let mut pending = self.lock_pending();
        let Some(entry) = pending.get(&request_id) else {
            return;
        };

        let error = match expiry {
            Expiry::Soft { generation, after } => {
                // A timer superseded by an extension may already be past its sleep.
                if entry.soft_generation() != generation {
                    return;
                }
                BridgeError::Timeout {
                    request_id,
                    timeout_ms: duration_ms(after),
                }
            }
            Expiry::Absolute => BridgeError::AbsoluteTimeoutExceeded {
                request_id,
                limit_ms: duration_ms(self.config.absolute_max_timeout),
            },
        };

        let Some(entry) = pending.remove(&request_id) else {
            return;
        };
        drop(pending);

        tracing::info!(
            %request_id,
            action = entry.action(),
            age_ms = duration_ms(entry.age()),
            extensions = entry.progress().extension_count,
            error = %error,
            "Request expired"
        );
        self.finish(request_id, entry, Err(error));
    }
}

fn arm_timer(
    inner: &Weak<TrackerInner>,
    request_id: RequestId,
    expiry: Expiry,
    after: Duration,
) -> TimerHandle {
    let inner = Weak::clone(inner);
    TimerHandle::arm(after, move || {
        if let Some(inner) = inner.upgrade() {
            inner.expire(request_id, expiry);
        }
    })
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Correlates dispatched requests with their eventual responses.
///
/// Cheap to clone; clones share the same store. Dropping the last clone
/// cancels every timer and settles outstanding completions with
/// [`BridgeError::Abandoned`].
#[derive(Clone)]
pub struct RequestTracker {
    inner: Arc<TrackerInner>,
}

impl RequestTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                config,
                pending: StdMutex::new(HashMap::new()),
                coalesced: CoalesceCache::new(),
                last_request_sent_at: StdMutex::new(None),
                released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    /// Register a new pending request and arm its soft and absolute timers.
    ///
    /// Fails with [`BridgeError::CapacityExceeded`] when the store is full; no
    /// state is created in that case. Must be called within a tokio runtime.
    pub fn create_request(
        &self,
        action: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<(RequestId, Completion), BridgeError> {
        let limit = self.inner.config.max_pending_requests;
        let weak = Arc::downgrade(&self.inner);

        let mut pending = self.inner.lock_pending();
        if pending.len() >= limit {
            tracing::warn!(action, limit, "Max pending requests limit reached");
            return Err(BridgeError::CapacityExceeded { limit });
        }

        let request_id = RequestId::new();
        let (settler, completion) = completion::channel(request_id);
        let soft_timer = arm_timer(
            &weak,
            request_id,
            Expiry::Soft {
                generation: 0,
                after: timeout,
            },
            timeout,
        );
        let absolute_timer = arm_timer(
            &weak,
            request_id,
            Expiry::Absolute,
            self.inner.config.absolute_max_timeout,
        );
        pending.insert(
            request_id,
            PendingRequest::new(
                action.to_string(),
                payload,
                settler,
                soft_timer,
                absolute_timer,
            ),
        );
        let pending_count = pending.len();
        drop(pending);

        *self.inner.lock_last_sent() = Some(Utc::now());

        tracing::info!(
            %request_id,
            action,
            timeout_ms = duration_ms(timeout),
            pending_count,
            "Request created"
        );
        Ok((request_id, completion))
    }

    /// Create a request, or join an identical in-flight one if `action` is
    /// idempotent.
    ///
    /// Lookup, creation and cache registration happen as one step, so
    /// concurrent identical calls yield exactly one [`Admission::Created`].
    pub fn admit(
        &self,
        action: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Admission, BridgeError> {
        let Some(key) = self.create_coalesce_key(action, &payload) else {
            let (request_id, completion) = self.create_request(action, payload, timeout)?;
            return Ok(Admission::Created(request_id, completion));
        };

        let (completion, joined) = self.inner.coalesced.get_or_try_insert_with(key, || {
            self.create_request(action, payload, timeout)
                .map(|(_, completion)| completion)
        })?;
        if joined {
            tracing::debug!(
                request_id = %completion.request_id(),
                action,
                "Coalescing with in-flight request"
            );
            Ok(Admission::Joined(completion))
        } else {
            Ok(Admission::Created(completion.request_id(), completion))
        }
    }

    /// Push the soft deadline out in response to a progress signal.
    ///
    /// Returns `false` if the request is unknown, or if the update tripped the
    /// extension ceiling or stall detector (the request is then failed).
    /// The absolute timer is never touched.
    pub fn extend_timeout(
        &self,
        request_id: &RequestId,
        percent: Option<f64>,
        message: Option<&str>,
    ) -> bool {
        let policy = self.inner.policy();
        let weak = Arc::downgrade(&self.inner);

        let mut pending = self.inner.lock_pending();
        let Some(entry) = pending.get_mut(request_id) else {
            tracing::debug!(%request_id, "Progress for unknown or settled request");
            return false;
        };

        let error = match entry.observe_progress(percent, &policy) {
            ProgressVerdict::Extend => {
                let generation = entry.next_generation();
                let timer = arm_timer(
                    &weak,
                    *request_id,
                    Expiry::Soft {
                        generation,
                        after: policy.extension,
                    },
                    policy.extension,
                );
                entry.replace_soft_timer(timer, generation);
                tracing::debug!(
                    %request_id,
                    action = entry.action(),
                    percent,
                    progress_message = message,
                    extensions = entry.progress().extension_count,
                    total_extension_ms = duration_ms(entry.progress().total_extension),
                    "Extended request timeout"
                );
                return true;
            }
            ProgressVerdict::ExtensionLimit { extensions } => {
                tracing::warn!(
                    %request_id,
                    action = entry.action(),
                    extensions,
                    "Max progress extensions reached - possible deadlock"
                );
                BridgeError::ExtensionLimitExceeded {
                    request_id: *request_id,
                    extensions,
                }
            }
            ProgressVerdict::Stalled { percent, updates } => {
                tracing::warn!(
                    %request_id,
                    action = entry.action(),
                    percent,
                    updates,
                    "Progress stalled"
                );
                BridgeError::ProgressStalled {
                    request_id: *request_id,
                    percent,
                    updates,
                }
            }
        };

        let Some(entry) = pending.remove(request_id) else {
            return false;
        };
        drop(pending);

        self.inner.finish(*request_id, entry, Err(error));
        false
    }

    /// Settle a pending request with the worker's response. No-op if unknown.
    pub fn resolve_request(&self, request_id: &RequestId, response: AutomationResponse) {
        self.terminate(request_id, Ok(response));
    }

    /// Fail a pending request. No-op if unknown.
    pub fn reject_request(&self, request_id: &RequestId, error: BridgeError) {
        self.terminate(request_id, Err(error));
    }

    /// Caller-initiated cancellation, routed through [`Self::reject_request`].
    pub fn cancel_request(&self, request_id: &RequestId) {
        self.reject_request(request_id, BridgeError::Cancelled);
    }

    /// Fail every pending request with `error` and clear the store.
    pub fn reject_all(&self, error: BridgeError) {
        let drained: Vec<(RequestId, PendingRequest)> =
            self.inner.lock_pending().drain().collect();
        if drained.is_empty() {
            return;
        }

        tracing::info!(count = drained.len(), error = %error, "Rejecting all pending requests");
        for (request_id, entry) in drained {
            self.inner.coalesced.evict_request(&request_id);
            entry.finish(Err(error.clone()));
        }
        self.inner.released.notify_waiters();
    }

    fn terminate(&self, request_id: &RequestId, result: CompletionResult) {
        let Some(entry) = self.inner.lock_pending().remove(request_id) else {
            tracing::debug!(%request_id, "Request already settled or unknown");
            return;
        };

        match &result {
            Ok(response) => tracing::info!(
                %request_id,
                action = entry.action(),
                age_ms = duration_ms(entry.age()),
                success = response.is_success(),
                "Request resolved"
            ),
            Err(error) => tracing::info!(
                %request_id,
                action = entry.action(),
                age_ms = duration_ms(entry.age()),
                error = %error,
                "Request rejected"
            ),
        }
        self.inner.finish(*request_id, entry, result);
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.inner.lock_pending().contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    pub fn pending_details(&self) -> Vec<PendingDetail> {
        self.inner
            .lock_pending()
            .iter()
            .map(|(request_id, entry)| PendingDetail {
                request_id: *request_id,
                action: entry.action().to_string(),
                age_ms: duration_ms(entry.age()),
            })
            .collect()
    }

    pub fn pending_snapshot(&self, request_id: &RequestId) -> Option<PendingSnapshot> {
        self.inner
            .lock_pending()
            .get(request_id)
            .map(|entry| PendingSnapshot {
                request_id: *request_id,
                action: entry.action().to_string(),
                payload: entry.payload().clone(),
                age: entry.age(),
                soft_deadline: entry.soft_deadline(),
                absolute_deadline: entry.absolute_deadline(),
                progress: entry.progress().clone(),
            })
    }

    pub fn max_pending_requests(&self) -> usize {
        self.inner.config.max_pending_requests
    }

    pub fn last_request_sent_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.lock_last_sent()
    }

    /// Resolves the next time any request leaves the store.
    ///
    /// Call `enable()` on the pinned future before checking capacity to avoid
    /// missing a release that lands in between.
    pub fn released(&self) -> Notified<'_> {
        self.inner.released.notified()
    }

    /// Coalescing key for `action` + `payload`, or `None` if not coalescable.
    pub fn create_coalesce_key(&self, action: &str, payload: &Payload) -> Option<String> {
        coalesce::coalesce_key(&self.inner.config.actions, action, payload)
    }

    pub fn get_coalesced_request(&self, key: &str) -> Option<Completion> {
        self.inner.coalesced.get(key)
    }

    /// Share `completion` under `key` until it settles.
    pub fn set_coalesced_request(&self, key: String, completion: Completion) {
        tracing::debug!(
            request_id = %completion.request_id(),
            %key,
            "Registering coalesced request"
        );
        self.inner.coalesced.insert(key, completion);
    }

    pub fn coalesced_count(&self) -> usize {
        self.inner.coalesced.len()
    }
}
