//! In-process stampede mitigation.
//!
//! Collapses N concurrent loader requests for the same key into one actual
//! loader call; the rest wait on the winner's outcome. `add` is the
//! only linearization point that decides winners, and a winner must
//! eventually `complete` every winning key, even on loader failure, or
//! waiters hang.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::{ManufacturerConfig, StampedeMitigationStrategy};
use crate::entry::CacheItem;

/// Why a winner completed a call without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoadFailure {
    /// The loader returned an error.
    Error(String),
    /// The loader panicked.
    Panic,
    /// The loader returned fewer results than keys.
    ShortResult,
}

/// The winner's outcome, observed by every waiter of the call.
#[derive(Clone)]
pub(crate) enum CallOutcome {
    /// The loader produced a value; waiters decode it into their receivers.
    Ready(CacheItem),
    /// The loader returned no value for this key; nothing was cached.
    Miss,
    /// The loader failed; see the failure kind.
    Failed(LoadFailure),
}

/// An in-flight or completed unit of work.
pub(crate) struct Call {
    tx: watch::Sender<Option<CallOutcome>>,
}

impl Call {
    fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        Arc::new(Call { tx })
    }

    /// Block until the winner completes this call.
    pub async fn wait(&self) -> CallOutcome {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().expect("checked by wait_for"),
            Err(_) => CallOutcome::Failed(LoadFailure::Error("call abandoned".into())),
        };
        result
    }
}

/// A namespace of keyed calls with duplicate suppression.
///
/// Entries live from the first `add` to `complete`; at most one call exists
/// per key at any instant. Critical sections contain no I/O.
pub(crate) struct Group {
    calls: Mutex<HashMap<String, Arc<Call>>>,
}

impl Group {
    pub fn new() -> Self {
        Group {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically split `keys` into winners (`to_handle`) and waiters.
    ///
    /// A key with an in-flight call joins that call's waiters; otherwise a
    /// fresh call is inserted and the key is the caller's to handle.
    pub fn add(&self, keys: &[String]) -> (Vec<String>, Vec<(String, Arc<Call>)>) {
        let mut to_handle = Vec::with_capacity(keys.len());
        let mut waiters = Vec::new();

        let mut calls = self.calls.lock();
        for key in keys {
            match calls.get(key) {
                Some(call) => waiters.push((key.clone(), Arc::clone(call))),
                None => {
                    calls.insert(key.clone(), Call::new());
                    to_handle.push(key.clone());
                }
            }
        }

        (to_handle, waiters)
    }

    /// Publish outcomes, release every waiter, and drop the calls from the
    /// map.
    pub fn complete(&self, outcomes: Vec<(String, CallOutcome)>) {
        let mut calls = self.calls.lock();
        for (key, outcome) in outcomes {
            if let Some(call) = calls.remove(&key) {
                let _ = call.tx.send(Some(outcome));
            }
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Strategy-aware front of the group.
///
/// `NoProtection` bypasses deduplication entirely: every requester handles
/// its own keys and there are never waiters.
pub(crate) struct Coordinator {
    strategy: StampedeMitigationStrategy,
    group: Group,
}

impl Coordinator {
    pub fn new(config: &ManufacturerConfig) -> Self {
        Coordinator {
            strategy: config.stampede_mitigation,
            group: Group::new(),
        }
    }

    pub fn add(&self, keys: &[String]) -> (Vec<String>, Vec<(String, Arc<Call>)>) {
        match self.strategy {
            StampedeMitigationStrategy::NoProtection => (keys.to_vec(), Vec::new()),
            StampedeMitigationStrategy::InProcessSignal
            | StampedeMitigationStrategy::AcrossInstanceSignal => self.group.add(keys),
        }
    }

    pub fn complete(&self, outcomes: Vec<(String, CallOutcome)>) {
        match self.strategy {
            StampedeMitigationStrategy::NoProtection => {}
            StampedeMitigationStrategy::InProcessSignal
            | StampedeMitigationStrategy::AcrossInstanceSignal => self.group.complete(outcomes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{ItemData, MetaHeader};
    use bytes::Bytes;

    fn ready(payload: &str) -> CallOutcome {
        CallOutcome::Ready(CacheItem::new(
            MetaHeader::default(),
            ItemData::Bytes(Bytes::copy_from_slice(payload.as_bytes())),
        ))
    }

    #[tokio::test]
    async fn test_first_add_wins_later_adds_wait() {
        let group = Group::new();
        let keys = vec!["k1".to_string()];

        let (to_handle, waiters) = group.add(&keys);
        assert_eq!(to_handle, vec!["k1".to_string()]);
        assert!(waiters.is_empty());

        let (to_handle, waiters) = group.add(&keys);
        assert!(to_handle.is_empty());
        assert_eq!(waiters.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_releases_waiters_and_empties_map() {
        let group = Arc::new(Group::new());
        let keys = vec!["k1".to_string()];
        let (_, _) = group.add(&keys);
        let (_, waiters) = group.add(&keys);
        let (_, call) = waiters.into_iter().next().unwrap();

        eprintln!("DEBUG test: spawning");
        let waiter = tokio::spawn(async move { call.wait().await });

        eprintln!("DEBUG test: calling complete");
        group.complete(vec![("k1".to_string(), ready("v"))]);
        eprintln!("DEBUG test: completed");

        match waiter.await.unwrap() {
            CallOutcome::Ready(item) => match item.data {
                ItemData::Bytes(b) => assert_eq!(&b[..], b"v"),
                _ => panic!("expected bytes"),
            },
            _ => panic!("expected ready outcome"),
        }
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_after_complete_returns_immediately() {
        let group = Group::new();
        let keys = vec!["k1".to_string()];
        group.add(&keys);
        let (_, waiters) = group.add(&keys);
        let (_, call) = waiters.into_iter().next().unwrap();

        group.complete(vec![("k1".to_string(), ready("late"))]);

        // the outcome was published before wait was called
        match call.wait().await {
            CallOutcome::Ready(_) => {}
            _ => panic!("expected ready outcome"),
        }
    }

    #[tokio::test]
    async fn test_failure_outcome_propagates() {
        let group = Group::new();
        let keys = vec!["k1".to_string()];
        group.add(&keys);
        let (_, waiters) = group.add(&keys);
        let (_, call) = waiters.into_iter().next().unwrap();

        group.complete(vec![(
            "k1".to_string(),
            CallOutcome::Failed(LoadFailure::Panic),
        )]);

        match call.wait().await {
            CallOutcome::Failed(LoadFailure::Panic) => {}
            _ => panic!("expected panic failure"),
        }
    }

    #[tokio::test]
    async fn test_mixed_batch_split() {
        let group = Group::new();
        group.add(&["a".to_string()]);

        let (to_handle, waiters) =
            group.add(&["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(to_handle, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(waiters.len(), 1);
        assert_eq!(waiters[0].0, "a");
    }

    #[tokio::test]
    async fn test_no_protection_never_waits() {
        let coordinator = Coordinator::new(&ManufacturerConfig::default());
        let keys = vec!["k".to_string()];
        let (h1, w1) = coordinator.add(&keys);
        let (h2, w2) = coordinator.add(&keys);
        assert_eq!(h1, keys);
        assert_eq!(h2, keys);
        assert!(w1.is_empty() && w2.is_empty());
    }
}
