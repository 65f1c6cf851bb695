//! Protocol registry assembly and lookup.

use super::http::HttpProtocol;
use super::smtp::SmtpProtocol;
use super::tcp::TcpProtocol;
use super::Protocol;
use crate::imposter::ImposterError;
use crate::proxy::ForwarderConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Protocol implementations keyed by name.
pub type ProtocolMap = BTreeMap<String, Arc<dyn Protocol>>;

/// The `tcp`, `http`, `https` and `smtp` protocols.
pub fn builtin_protocols(forwarder: ForwarderConfig) -> ProtocolMap {
    let mut protocols: ProtocolMap = BTreeMap::new();
    protocols.insert("tcp".into(), Arc::new(TcpProtocol::new(forwarder)));
    protocols.insert("http".into(), Arc::new(HttpProtocol::new(false, forwarder)));
    protocols.insert("https".into(), Arc::new(HttpProtocol::new(true, forwarder)));
    protocols.insert("smtp".into(), Arc::new(SmtpProtocol::new()));
    protocols
}

/// Read-only name to implementation map shared by every imposter.
pub struct ProtocolRegistry {
    protocols: ProtocolMap,
}

impl ProtocolRegistry {
    /// Merge `overrides` over `builtins`; an override replaces a built-in
    /// of the same name entirely.
    pub fn load(builtins: ProtocolMap, overrides: ProtocolMap) -> Self {
        let mut protocols = builtins;
        for (name, protocol) in overrides {
            if protocols.insert(name.clone(), protocol).is_some() {
                info!("Custom protocol '{}' replaces the built-in implementation", name);
            } else {
                debug!("Loaded custom protocol '{}'", name);
            }
        }

        debug!(
            "Protocol registry: {}",
            protocols.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        Self { protocols }
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Protocol>, ImposterError> {
        self.protocols
            .get(name)
            .cloned()
            .ok_or_else(|| ImposterError::InvalidProtocol(name.to_string()))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.protocols.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imposter::ImposterConfig;
    use crate::protocol::{
        CapturedRequest, ImposterContext, ImposterServer, ProtocolError, WireFormat,
    };
    use crate::proxy::Endpoint;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct Dummy;

    impl WireFormat for Dummy {
        fn format_request(
            &self,
            _request: &CapturedRequest,
            _target: &Endpoint,
        ) -> Result<Bytes, ProtocolError> {
            Err(ProtocolError::ProxyUnsupported("dummy".into()))
        }

        fn parse_request(
            &self,
            _raw: &[u8],
            _request_from: &str,
        ) -> Result<CapturedRequest, ProtocolError> {
            Err(ProtocolError::Malformed("dummy".into()))
        }
    }

    #[async_trait]
    impl Protocol for Dummy {
        async fn start(
            &self,
            _config: &ImposterConfig,
            _context: ImposterContext,
        ) -> Result<Box<dyn ImposterServer>, ImposterError> {
            Err(ImposterError::Start("dummy".into()))
        }
    }

    fn map(entries: &[(&str, &Arc<dyn Protocol>)]) -> ProtocolMap {
        entries
            .iter()
            .map(|(name, protocol)| (name.to_string(), Arc::clone(protocol)))
            .collect()
    }

    #[test]
    fn test_override_replaces_builtin() {
        let a: Arc<dyn Protocol> = Arc::new(Dummy);
        let b: Arc<dyn Protocol> = Arc::new(Dummy);
        let b_override: Arc<dyn Protocol> = Arc::new(Dummy);
        let c: Arc<dyn Protocol> = Arc::new(Dummy);

        let registry = ProtocolRegistry::load(
            map(&[("A", &a), ("B", &b)]),
            map(&[("B", &b_override), ("C", &c)]),
        );

        assert_eq!(registry.names(), vec!["A", "B", "C"]);
        assert!(Arc::ptr_eq(&registry.resolve("A").unwrap(), &a));
        assert!(Arc::ptr_eq(&registry.resolve("B").unwrap(), &b_override));
        assert!(Arc::ptr_eq(&registry.resolve("C").unwrap(), &c));
    }

    #[test]
    fn test_resolve_unknown_protocol() {
        let registry = ProtocolRegistry::load(ProtocolMap::new(), ProtocolMap::new());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.resolve("gopher"),
            Err(ImposterError::InvalidProtocol(name)) if name == "gopher"
        ));
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let registry = ProtocolRegistry::load(
            builtin_protocols(ForwarderConfig::default()),
            ProtocolMap::new(),
        );
        assert!(registry.resolve("tcp").is_ok());
        assert!(registry.resolve("TCP").is_err());
    }

    #[test]
    fn test_builtins() {
        let registry = ProtocolRegistry::load(
            builtin_protocols(ForwarderConfig::default()),
            ProtocolMap::new(),
        );
        assert_eq!(registry.names(), vec!["http", "https", "smtp", "tcp"]);
        assert_eq!(registry.len(), 4);
    }
}
