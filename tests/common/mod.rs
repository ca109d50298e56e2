//! Common helpers for registry integration tests

#![allow(dead_code)]

use lanreg_core::types::{Node, Service};
use lanreg_core::RegistryConfig;
use lanreg_registry::{MulticastRegistry, Registry, RegistryError, Watcher};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Configuration for a registry that talks only to itself on loopback.
pub fn loopback_config() -> RegistryConfig {
    RegistryConfig::builder()
        .group(Ipv4Addr::LOCALHOST)
        .port(0)
        .announce_interval(Duration::from_millis(10))
        .build()
        .expect("loopback config is valid")
}

/// A started loopback registry.
pub async fn started_registry() -> MulticastRegistry {
    let registry = MulticastRegistry::new(loopback_config()).expect("Failed to create registry");
    registry.start().await.expect("Failed to start registry");
    registry
}

/// Services test1..test4, one node each.
pub fn test_services() -> Vec<Service> {
    (1..=4)
        .map(|i| {
            let address = if i == 4 {
                "[::]:10004".to_string()
            } else {
                format!("10.0.0.{}:{}", i, 10000 + i)
            };
            Service::new(format!("test{}", i), format!("1.0.{}", i)).with_node(
                Node::new(format!("test{}-1", i), address)
                    .with_metadata(format!("foo{}", i), format!("bar{}", i)),
            )
        })
        .collect()
}

/// Waits for the next watcher event, failing the test after a second.
pub async fn next_event(watcher: &Watcher) -> Result<lanreg_core::WatchEvent, RegistryError> {
    tokio::time::timeout(Duration::from_secs(1), watcher.next())
        .await
        .expect("timed out waiting for watch event")
}

/// Asserts that a returned service carries exactly the registered node.
pub fn assert_same_service(found: &Service, expected: &Service) {
    assert_eq!(found.name, expected.name);
    assert_eq!(found.version, expected.version);
    assert_eq!(found.nodes.len(), 1);
    assert_eq!(found.nodes[0].id, expected.nodes[0].id);
    assert_eq!(found.nodes[0].address, expected.nodes[0].address);
    assert_eq!(found.nodes[0].metadata, expected.nodes[0].metadata);
}
