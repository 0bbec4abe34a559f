//! Process-lifetime instance identity.

use std::fmt;
use std::sync::Arc;

use crate::config::Config;

/// `"<host>:<port>"` under which this instance is known to its peers.
///
/// Computed once at startup and compared by value against the stored
/// `LeaderId`.  Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceIdentity(Arc<str>);

impl InstanceIdentity {
    pub fn new(host: &str, port: u16) -> Self {
        Self(Arc::from(format!("{host}:{port}")))
    }

    /// Derive the identity from the advertised endpoint in `config`.
    ///
    /// A wildcard bind address is useless to peers, so it is replaced by the
    /// machine's `HOSTNAME` (or `localhost` when that is unset).
    pub fn from_config(config: &Config) -> Self {
        let (host, port) = config.advertised_endpoint();
        let host = if is_wildcard(&host) {
            std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "localhost".to_string())
        } else {
            host
        };
        Self::new(&host, port)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for InstanceIdentity {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

/// Base URL for a stored instance identity.
pub fn base_url_for(identity: &str) -> String {
    format!("http://{identity}")
}

fn is_wildcard(host: &str) -> bool {
    matches!(host, "" | "0.0.0.0" | "::" | "[::]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_format_and_compare() {
        let id = InstanceIdentity::new("shield-1", 8480);
        assert_eq!(id.as_str(), "shield-1:8480");
        assert_eq!(id.to_string(), "shield-1:8480");
        assert!(id == *"shield-1:8480");
        assert_eq!(id, InstanceIdentity::new("shield-1", 8480));
        assert_ne!(id, InstanceIdentity::new("shield-1", 8481));
    }

    #[test]
    fn test_base_url_for_stored_identity() {
        let id = InstanceIdentity::new("10.1.2.3", 9000);
        assert_eq!(base_url_for(id.as_str()), "http://10.1.2.3:9000");
    }

    #[test]
    fn test_from_config_follows_bind_override() {
        let mut config = Config::default();
        config.apply_bind("10.1.2.3:9001").unwrap();
        let id = InstanceIdentity::from_config(&config);
        assert_eq!(id.as_str(), "10.1.2.3:9001");
    }

    #[test]
    fn test_from_config_prefers_advertised_host() {
        let mut config = Config::default();
        config.server.port = 8500;
        config.cluster.advertise_host = "shield-7".to_string();
        let id = InstanceIdentity::from_config(&config);
        assert_eq!(id.as_str(), "shield-7:8500");
    }

    #[test]
    fn test_from_config_never_uses_wildcard() {
        let config = Config::default();
        let id = InstanceIdentity::from_config(&config);
        assert!(!id.as_str().starts_with("0.0.0.0"));
    }
}
