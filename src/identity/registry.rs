//! Identity registry
//!
//! Accumulates the distinct identities observed across a run and persists
//! them once at the end, one per line in insertion order.

use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use super::Identity;

/// Deduplicated, insertion-ordered set of observed identities
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    seen: HashSet<String>,
    order: Vec<String>,
}

impl IdentityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an identity. Duplicates and `Unknown` are ignored; returns
    /// true if the identity was new.
    pub fn record(&mut self, identity: &Identity) -> bool {
        let Some(addr) = identity.as_str() else {
            return false;
        };
        if !self.seen.insert(addr.to_string()) {
            return false;
        }
        self.order.push(addr.to_string());
        true
    }

    /// Distinct identities recorded so far
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Recorded identities in insertion order
    pub fn identities(&self) -> &[String] {
        &self.order
    }

    /// Write the set to `path`, one identity per line, insertion order
    pub async fn flush(&self, path: &Path) -> std::io::Result<()> {
        let mut contents = String::new();
        for addr in &self.order {
            contents.push_str(addr);
            contents.push('\n');
        }
        tokio::fs::write(path, contents).await?;

        info!(
            "Persisted {} unique identities to {}",
            self.order.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_idempotent() {
        let mut registry = IdentityRegistry::new();
        assert!(registry.record(&Identity::known("10.0.0.1")));
        assert!(!registry.record(&Identity::known("10.0.0.1")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_is_never_recorded() {
        let mut registry = IdentityRegistry::new();
        assert!(!registry.record(&Identity::Unknown));
        assert!(registry.is_empty());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut registry = IdentityRegistry::new();
        registry.record(&Identity::known("10.0.0.2"));
        registry.record(&Identity::known("10.0.0.1"));
        registry.record(&Identity::known("10.0.0.2"));
        registry.record(&Identity::known("10.0.0.3"));
        assert_eq!(registry.identities(), ["10.0.0.2", "10.0.0.1", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn flush_writes_one_identity_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unique_ips.log");

        let mut registry = IdentityRegistry::new();
        registry.record(&Identity::known("185.220.101.4"));
        registry.record(&Identity::known("185.220.101.5"));
        registry.flush(&path).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "185.220.101.4\n185.220.101.5\n");
    }

    #[tokio::test]
    async fn flush_of_empty_registry_writes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unique_ips.log");

        IdentityRegistry::new().flush(&path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
