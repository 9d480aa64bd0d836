//! Name → protocol lookup table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::framework::Protocol;

/// Registry mapping protocol names to implementations.
///
/// Populated before engine construction and only read afterwards.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    protocols: BTreeMap<String, Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the protocols shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::protocols::register_builtin(&mut registry);
        registry
    }

    /// Register a protocol, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, protocol: Arc<dyn Protocol>) {
        let name = name.into();
        if self.protocols.insert(name.clone(), protocol).is_some() {
            tracing::debug!(protocol = %name, "Replaced registered protocol");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.protocols.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.protocols.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Parameters;
    use crate::engine::{Connection, MuxError, Result};
    use crate::framework::ProtocolInstance;
    use async_trait::async_trait;

    struct Nothing;

    #[async_trait]
    impl ProtocolInstance for Nothing {
        async fn handle(&self, _conn: Connection) -> Result<()> {
            Ok(())
        }
    }

    impl Protocol for Nothing {
        fn configure(
            &self,
            _globals: &Parameters,
            _remote_name: &str,
            _remote_params: &Parameters,
        ) -> Result<Arc<dyn ProtocolInstance>> {
            Err(MuxError::Protocol("unused".into()))
        }
    }

    #[test]
    fn registries_are_isolated() {
        let mut first = ProtocolRegistry::new();
        first.register("nothing", Arc::new(Nothing));
        let second = ProtocolRegistry::new();

        assert!(first.contains("nothing"));
        assert!(second.get("nothing").is_none());
        assert_eq!(first.names().collect::<Vec<_>>(), vec!["nothing"]);
    }

    #[test]
    fn builtin_registry_knows_shipped_protocols() {
        let registry = ProtocolRegistry::with_builtin();
        assert!(registry.contains("echo"));
        assert!(registry.contains("reject"));
    }
}
