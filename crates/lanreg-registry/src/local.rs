//! Nodes registered by this process.

use crate::wire::Announcement;
use dashmap::DashMap;
use std::fmt;

/// Lifecycle of a locally registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Register called, first announce round not yet sent
    Announcing,
    /// First announce round sent
    Registered,
    /// Deregister called, goodbye pending
    Deregistering,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Announcing => write!(f, "announcing"),
            RegistrationState::Registered => write!(f, "registered"),
            RegistrationState::Deregistering => write!(f, "deregistering"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalNode {
    pub announcement: Announcement,
    pub state: RegistrationState,
}

/// Table of local nodes keyed by (service name, node id).
///
/// Used to suppress our own packets on receive, to answer queries and to
/// drive periodic refresh and goodbye on shutdown.
#[derive(Debug, Default)]
pub struct LocalNodes {
    nodes: DashMap<(String, String), LocalNode>,
}

impl LocalNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a node as announcing, replacing any previous registration.
    pub fn begin(&self, announcement: Announcement) {
        let key = (announcement.service.name.clone(), announcement.node.id.clone());
        self.nodes.insert(
            key,
            LocalNode {
                announcement,
                state: RegistrationState::Announcing,
            },
        );
    }

    /// Moves a node to `state` if it is still registered with `record_id`.
    pub fn transition(&self, service: &str, node_id: &str, record_id: u16, state: RegistrationState) {
        if let Some(mut node) = self.nodes.get_mut(&(service.to_string(), node_id.to_string())) {
            if node.announcement.record_id == record_id {
                node.state = state;
            }
        }
    }

    pub fn get(&self, service: &str, node_id: &str) -> Option<LocalNode> {
        self.nodes
            .get(&(service.to_string(), node_id.to_string()))
            .map(|node| node.clone())
    }

    pub fn remove(&self, service: &str, node_id: &str) -> Option<LocalNode> {
        self.nodes
            .remove(&(service.to_string(), node_id.to_string()))
            .map(|(_, node)| node)
    }

    pub fn contains(&self, service: &str, node_id: &str) -> bool {
        self.nodes
            .contains_key(&(service.to_string(), node_id.to_string()))
    }

    pub fn state(&self, service: &str, node_id: &str) -> Option<RegistrationState> {
        self.nodes
            .get(&(service.to_string(), node_id.to_string()))
            .map(|node| node.state)
    }

    /// Calls `send` if `record_id` is the current, live registration.
    ///
    /// The entry stays locked while `send` runs, so a concurrent transition
    /// to [`RegistrationState::Deregistering`] lands either before the check
    /// or after the send. Returns `None` when the registration is stale,
    /// otherwise what `send` returned.
    pub fn send_if_current<F>(&self, service: &str, node_id: &str, record_id: u16, send: F) -> Option<bool>
    where
        F: FnOnce() -> bool,
    {
        let node = self.nodes.get(&(service.to_string(), node_id.to_string()))?;
        if node.announcement.record_id != record_id || node.state == RegistrationState::Deregistering {
            return None;
        }
        Some(send())
    }

    /// Announcements of registered nodes, optionally for one service only.
    pub fn registered(&self, service: Option<&str>) -> Vec<Announcement> {
        self.nodes
            .iter()
            .filter(|entry| entry.state == RegistrationState::Registered)
            .filter(|entry| service.map_or(true, |name| entry.key().0 == name))
            .map(|entry| entry.announcement.clone())
            .collect()
    }

    /// Removes and returns every node.
    pub fn drain(&self) -> Vec<LocalNode> {
        let keys: Vec<_> = self.nodes.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.nodes.remove(&key).map(|(_, node)| node))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanreg_codec::RecordCodec;
    use lanreg_core::types::{Node, Service};

    fn announcement(service: &str, node: &str) -> Announcement {
        let node = Node::new(node, "10.0.0.1:1");
        let service = Service::new(service, "1.0.0").with_node(node.clone());
        Announcement::new(&service, &node, &RecordCodec::default()).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let local = LocalNodes::new();
        let ann = announcement("svc", "n1");
        let id = ann.record_id;

        local.begin(ann);
        assert_eq!(local.state("svc", "n1"), Some(RegistrationState::Announcing));
        assert!(local.registered(None).is_empty());

        local.transition("svc", "n1", id, RegistrationState::Registered);
        assert_eq!(local.registered(Some("svc")).len(), 1);
        assert!(local.registered(Some("other")).is_empty());
        assert_eq!(local.send_if_current("svc", "n1", id, || true), Some(true));

        local.transition("svc", "n1", id, RegistrationState::Deregistering);
        assert_eq!(local.send_if_current("svc", "n1", id, || true), None);

        assert!(local.remove("svc", "n1").is_some());
        assert!(!local.contains("svc", "n1"));
    }

    #[test]
    fn test_stale_transition_is_ignored() {
        let local = LocalNodes::new();
        let ann = announcement("svc", "n1");
        local.begin(ann.clone());
        local.transition("svc", "n1", ann.record_id.wrapping_add(1), RegistrationState::Registered);
        assert_eq!(local.state("svc", "n1"), Some(RegistrationState::Announcing));
    }

    #[test]
    fn test_send_skips_stale_registrations() {
        let local = LocalNodes::new();
        let ann = announcement("svc", "n1");
        let id = ann.record_id;
        let mut sent = 0;

        assert_eq!(local.send_if_current("svc", "n2", id, || true), None);

        local.begin(ann);
        assert_eq!(local.send_if_current("svc", "n1", id.wrapping_add(1), || true), None);
        assert_eq!(
            local.send_if_current("svc", "n1", id, || {
                sent += 1;
                false
            }),
            Some(false)
        );

        local.transition("svc", "n1", id, RegistrationState::Deregistering);
        assert_eq!(
            local.send_if_current("svc", "n1", id, || {
                sent += 1;
                true
            }),
            None
        );
        assert_eq!(sent, 1);
    }

    #[test]
    fn test_drain() {
        let local = LocalNodes::new();
        local.begin(announcement("a", "n1"));
        local.begin(announcement("b", "n1"));
        assert_eq!(local.drain().len(), 2);
        assert!(local.is_empty());
    }
}
