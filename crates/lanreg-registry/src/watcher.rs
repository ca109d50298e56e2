//! Per-subscriber event queues.
//!
//! Every [`Watcher`] owns one bounded queue fed by the store. The store never
//! waits on a slow consumer: when a queue is full the oldest event is dropped
//! and the next call to [`Watcher::next`] reports
//! [`RegistryError::WatcherOverflow`] so the caller knows to resynchronize.

use crate::error::{RegistryError, Result};
use crate::store::ServiceStore;
use lanreg_core::types::WatchEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Restricts which events a watcher receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Only deliver events for this service name
    pub service: Option<String>,
}

impl WatchOptions {
    /// Watch a single service.
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<WatchEvent>,
    dropped: u64,
    stopped: bool,
}

/// Bounded single-consumer queue shared between the store and a watcher.
#[derive(Debug)]
pub(crate) struct WatchQueue {
    id: u64,
    options: WatchOptions,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WatchQueue {
    pub(crate) fn new(id: u64, capacity: usize, options: WatchOptions) -> Self {
        Self {
            id,
            options,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn matches(&self, event: &WatchEvent) -> bool {
        self.options
            .service
            .as_deref()
            .map_or(true, |name| name == event.service.name)
    }

    /// Enqueues an event, evicting the oldest one if the queue is full.
    pub(crate) fn push(&self, event: WatchEvent) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            if state.events.len() >= self.capacity {
                state.events.pop_front();
                state.dropped += 1;
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Marks the queue stopped and wakes every pending reader.
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock();
            state.stopped = true;
            state.events.clear();
        }
        self.notify.notify_waiters();
    }

    fn poll(&self) -> Option<Result<WatchEvent>> {
        let mut state = self.state.lock();
        if state.stopped {
            return Some(Err(RegistryError::WatcherStopped));
        }
        if state.dropped > 0 {
            let dropped = std::mem::take(&mut state.dropped);
            return Some(Err(RegistryError::WatcherOverflow { dropped }));
        }
        state.events.pop_front().map(Ok)
    }

    fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

/// Ordered stream of registry changes for one subscriber.
///
/// Dropping a watcher stops it.
#[derive(Debug)]
pub struct Watcher {
    queue: Arc<WatchQueue>,
    store: Weak<ServiceStore>,
}

impl Watcher {
    pub(crate) fn new(queue: Arc<WatchQueue>, store: Weak<ServiceStore>) -> Self {
        Self { queue, store }
    }

    /// Waits for the next event.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::WatcherOverflow`] once after events were dropped;
    ///   later calls resume with the events still queued.
    /// - [`RegistryError::WatcherStopped`] after [`Watcher::stop`] or registry
    ///   shutdown, including for calls already waiting.
    pub async fn next(&self) -> Result<WatchEvent> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a concurrent push or close
            // cannot slip in between the check and the await.
            notified.as_mut().enable();

            if let Some(result) = self.queue.poll() {
                return result;
            }

            notified.await;
        }
    }

    /// Returns the next event if one is ready, without waiting.
    pub fn try_next(&self) -> Option<Result<WatchEvent>> {
        self.queue.poll()
    }

    /// Stops the watcher. Other watchers are unaffected.
    pub fn stop(&self) {
        self.queue.close();
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.queue.id());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.queue.is_stopped()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if !self.queue.is_stopped() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanreg_core::types::{Action, Node, Service};
    use std::time::Duration;

    fn event(name: &str) -> WatchEvent {
        WatchEvent::new(
            Action::Create,
            Service::new(name, "1.0.0").with_node(Node::new(format!("{}-1", name), "10.0.0.1:1")),
        )
    }

    fn watcher(capacity: usize) -> (Arc<WatchQueue>, Watcher) {
        let queue = Arc::new(WatchQueue::new(1, capacity, WatchOptions::default()));
        let watcher = Watcher::new(Arc::clone(&queue), Weak::new());
        (queue, watcher)
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (queue, watcher) = watcher(8);
        queue.push(event("a"));
        queue.push(event("b"));

        assert_eq!(watcher.next().await.unwrap().service.name, "a");
        assert_eq!(watcher.next().await.unwrap().service.name, "b");
        assert!(watcher.try_next().is_none());
    }

    #[tokio::test]
    async fn test_overflow_is_reported_once() {
        let (queue, watcher) = watcher(2);
        for name in ["a", "b", "c", "d"] {
            queue.push(event(name));
        }

        match watcher.next().await {
            Err(RegistryError::WatcherOverflow { dropped }) => assert_eq!(dropped, 2),
            other => panic!("expected overflow, got {:?}", other),
        }
        assert_eq!(watcher.next().await.unwrap().service.name, "c");
        assert_eq!(watcher.next().await.unwrap().service.name, "d");
    }

    #[tokio::test]
    async fn test_stop_wakes_pending_next() {
        let (_queue, watcher) = watcher(8);
        let watcher = Arc::new(watcher);

        let pending = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        watcher.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("next did not wake up")
            .unwrap();
        assert!(matches!(result, Err(RegistryError::WatcherStopped)));
        assert!(matches!(
            watcher.next().await,
            Err(RegistryError::WatcherStopped)
        ));
    }

    #[tokio::test]
    async fn test_push_wakes_pending_next() {
        let (queue, watcher) = watcher(8);
        let watcher = Arc::new(watcher);

        let pending = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(event("late"));

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("next did not wake up")
            .unwrap();
        assert_eq!(result.unwrap().service.name, "late");
    }

    #[test]
    fn test_filter_matches_service_name() {
        let queue = WatchQueue::new(1, 4, WatchOptions::service("a"));
        assert!(queue.matches(&event("a")));
        assert!(!queue.matches(&event("b")));
    }
}
