// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The correlation table and monotonic identifier allocator (spec §4.2,
//! §6's "Identifier format"). A linear scan over the pool is acceptable
//! here — the pool is small (tens of endpoints) — so this is a `Vec` behind
//! one mutex rather than a hash map, matching spec §4.2's explicit note
//! that a scan is fine at this size.
//!
//! The pool mutex in spec §5 ("one mutex serializes: monotonic-counter
//! increment, identifier assignment, correlation-table lookup, `state`
//! reads by the intake, `assigned_client_id` writes, and `completion`
//! signaling") is realized here as a single [`std::sync::Mutex`] guarding
//! the counter and the ident→slot map. The "write `assigned_client_id`,
//! then signal completion" step collapses into one operation: sending the
//! client id down a per-slot [`tokio::sync::oneshot::Sender`] stored under
//! the same lock, so the happens-before relationship in spec §5 is carried
//! by the channel send itself rather than a separately reasoned fence.

use std::sync::Mutex;

use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("no endpoint is waiting on ident {0:?}")]
    NotFound(String),
    #[error("endpoint for ident {0:?} is not awaiting a daemon verdict")]
    InvalidState(String),
}

struct Slot {
    ident: Option<String>,
    verdict: Option<oneshot::Sender<u32>>,
}

struct Inner {
    next_id: u64,
    slots: Vec<Slot>,
}

/// Owns the monotonic identifier counter and the ident→slot correlation
/// table for exactly `instances` endpoints (spec §3's "Endpoint pool").
pub struct EndpointPool {
    inner: Mutex<Inner>,
}

impl EndpointPool {
    pub fn new(instances: usize) -> Self {
        let slots = (0..instances)
            .map(|_| Slot {
                ident: None,
                verdict: None,
            })
            .collect();
        EndpointPool {
            inner: Mutex::new(Inner { next_id: 1, slots }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    /// Allocates the next identifier and registers `index` as waiting for a
    /// verdict under that identifier (spec §4.3 S1→S3 transition). Returns
    /// the identifier string and the receiving half of the channel the
    /// driver should await in S3.
    ///
    /// Per spec §9's open question, the counter advances even if the
    /// subsequent forward to the daemon fails synchronously: the identifier
    /// can be "skipped" and this is intentional, preserved source behavior.
    pub fn begin_waiting_for_verdict(&self, index: usize) -> (String, oneshot::Receiver<u32>) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let ident = format!("{id:x}");
        let (tx, rx) = oneshot::channel();
        let slot = &mut inner.slots[index];
        slot.ident = Some(ident.clone());
        slot.verdict = Some(tx);
        (ident, rx)
    }

    /// Daemon-verdict intake (spec §4.2, §6's `ProceedWithExecution`):
    /// finds the endpoint waiting on `ident`, hands it `client_id` over the
    /// oneshot channel stashed by [`Self::begin_waiting_for_verdict`], and
    /// clears the slot so the ident cannot be matched twice.
    pub fn proceed_with_execution(&self, client_id: u32, ident: &str) -> Result<(), LookupError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .iter_mut()
            .find(|slot| slot.ident.as_deref() == Some(ident))
            .ok_or_else(|| LookupError::NotFound(ident.to_string()))?;

        let tx = slot
            .verdict
            .take()
            .ok_or_else(|| LookupError::InvalidState(ident.to_string()))?;
        slot.ident = None;

        // The receiver may already be gone (its endpoint recycled via a
        // transient I/O error concurrently with this call); that is not a
        // failure of the lookup itself, spec §7's "lookup miss" only covers
        // NOT_FOUND/INVALID_STATE, not a since-abandoned receiver.
        let _ = tx.send(client_id);
        Ok(())
    }

    /// Clears any in-flight correlation-table entry for `index`. Called on
    /// every recycle so a stale ident left behind by a transient-I/O
    /// recycle path (spec §7) can never be matched by a later verdict.
    pub fn clear_slot(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[index];
        slot.ident = None;
        slot.verdict = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_sequential_hex_starting_at_one() {
        let pool = EndpointPool::new(4);
        let (a, _rx_a) = pool.begin_waiting_for_verdict(0);
        let (b, _rx_b) = pool.begin_waiting_for_verdict(1);
        assert_eq!(a, "1");
        assert_eq!(b, "2");
    }

    #[tokio::test]
    async fn proceed_with_execution_wakes_the_right_slot() {
        let pool = EndpointPool::new(2);
        let (ident, rx) = pool.begin_waiting_for_verdict(0);
        pool.proceed_with_execution(42, &ident).unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[test]
    fn unknown_ident_is_not_found() {
        let pool = EndpointPool::new(1);
        let err = pool.proceed_with_execution(1, "ff").unwrap_err();
        assert!(matches!(err, LookupError::NotFound(_)));
    }

    #[test]
    fn ident_cannot_be_matched_twice() {
        let pool = EndpointPool::new(1);
        let (ident, _rx) = pool.begin_waiting_for_verdict(0);
        pool.proceed_with_execution(1, &ident).unwrap();
        let err = pool.proceed_with_execution(2, &ident).unwrap_err();
        assert!(matches!(err, LookupError::NotFound(_)));
    }

    #[test]
    fn clear_slot_invalidates_the_ident() {
        let pool = EndpointPool::new(1);
        let (ident, _rx) = pool.begin_waiting_for_verdict(0);
        pool.clear_slot(0);
        let err = pool.proceed_with_execution(1, &ident).unwrap_err();
        assert!(matches!(err, LookupError::NotFound(_)));
    }
}
