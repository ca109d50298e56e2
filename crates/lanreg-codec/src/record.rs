//! The discovery record exchanged for every announced node

use lanreg_core::types::{Endpoint, Node, Service};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-node metadata carried alongside the address in every announce.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    /// Version of the announcing service
    #[serde(rename = "v", default)]
    pub version: String,

    /// Node metadata
    #[serde(rename = "m", default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    /// Service endpoints
    #[serde(rename = "e", default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
}

impl DiscoveryRecord {
    /// Builds the record announced for one node of a service.
    pub fn for_node(service: &Service, node: &Node) -> Self {
        Self {
            version: service.version.clone(),
            metadata: node.metadata.clone(),
            endpoints: service.endpoints.clone(),
        }
    }

    /// Rebuilds the single-node service a peer announced.
    pub fn into_service(
        self,
        name: impl Into<String>,
        node_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Service {
        Service {
            name: name.into(),
            version: self.version,
            endpoints: self.endpoints,
            nodes: vec![Node {
                id: node_id.into(),
                address: address.into(),
                metadata: self.metadata,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_node_and_back() {
        let node = Node::new("n1", "10.0.0.1:10001").with_metadata("foo", "bar");
        let service = Service::new("greeter", "1.2.3")
            .with_node(node.clone())
            .with_endpoint(Endpoint::new("Greeter.Hello"));

        let record = DiscoveryRecord::for_node(&service, &node);
        assert_eq!(record.version, "1.2.3");
        assert_eq!(record.metadata.get("foo").map(String::as_str), Some("bar"));

        let rebuilt = record.into_service("greeter", "n1", "10.0.0.1:10001");
        assert_eq!(rebuilt, service);
    }

    #[test]
    fn test_empty_collections_are_omitted() {
        let record = DiscoveryRecord {
            version: "1".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"v":"1"}"#);
    }
}
