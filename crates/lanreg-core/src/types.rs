//! Core data model for the service registry.
//!
//! A [`Service`] is identified by its name and version and is made up of one
//! or more [`Node`]s. Nodes are unique by ID within a service. Watchers observe
//! changes to the model as [`WatchEvent`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

/// A deployable service and the nodes currently running it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Service {
    /// Service name (e.g. "greeter")
    pub name: String,

    /// Service version (e.g. "1.0.1")
    #[serde(default)]
    pub version: String,

    /// Callable operations advertised by the service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,

    /// Running instances, unique by node ID
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    /// Creates a service with no nodes.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            endpoints: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Adds a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Adds an endpoint.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Returns a copy of this service carrying only the given node.
    pub fn with_single_node(&self, node: &Node) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            endpoints: self.endpoints.clone(),
            nodes: vec![node.clone()],
        }
    }

    /// Returns the node with the given ID, if present.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Validates the service for registration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("service name cannot be empty".to_string());
        }

        if self.nodes.is_empty() {
            return Err(format!("service '{}' has no nodes", self.name));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !seen.insert(node.id.as_str()) {
                return Err(format!(
                    "duplicate node id '{}' in service '{}'",
                    node.id, self.name
                ));
            }
        }

        Ok(())
    }
}

/// A single running instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Node {
    /// Node ID, unique within its service
    pub id: String,

    /// Reachable address as "host:port"
    pub address: String,

    /// Free-form key/value tags
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    /// Creates a node with empty metadata.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Splits the address into host and port.
    ///
    /// Bracketed IPv6 addresses are returned without brackets.
    pub fn host_port(&self) -> Option<(String, u16)> {
        if let Ok(addr) = self.address.parse::<SocketAddr>() {
            return Some((addr.ip().to_string(), addr.port()));
        }

        let (host, port) = self.address.rsplit_once(':')?;
        if host.is_empty() || host.contains(':') {
            return None;
        }
        let port = port.parse().ok()?;
        Some((host.to_string(), port))
    }

    /// Validates the node.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("node id cannot be empty".to_string());
        }

        if self.host_port().is_none() {
            return Err(format!(
                "node '{}' has invalid address '{}', expected host:port",
                self.id, self.address
            ));
        }

        Ok(())
    }
}

/// A callable operation advertised in discovery metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Recursive description of a request or response type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Value {
    pub name: String,

    #[serde(rename = "type")]
    pub value_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
}

impl Value {
    pub fn new(name: impl Into<String>, value_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: value_type.into(),
            values: Vec::new(),
        }
    }
}

/// Kind of change observed by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// A node appeared
    Create,

    /// A known node changed version, address, metadata or endpoints
    Update,

    /// A node left, either by goodbye or by expiry
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change to the registry, as delivered to watchers.
///
/// The service snapshot carries exactly the node that changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: Action,
    pub service: Service,
    pub timestamp: DateTime<Utc>,
}

impl WatchEvent {
    pub fn new(action: Action, service: Service) -> Self {
        Self {
            action,
            service,
            timestamp: Utc::now(),
        }
    }
}
