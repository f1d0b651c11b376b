//! Node identity used as the variable part of the lease key.

use std::fmt;

use thiserror::Error;

/// Why no identity could be derived for this node
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("host name unavailable: {0}")]
    Unavailable(String),
    #[error("host name is empty")]
    Empty,
}

/// Where the raw host name comes from.
pub trait HostnameSource: Send + Sync + 'static {
    fn hostname(&self) -> Result<String, IdentityError>;
}

/// Reads the host name from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHostname;

impl HostnameSource for SystemHostname {
    fn hostname(&self) -> Result<String, IdentityError> {
        hostname::get()
            .map_err(|err| IdentityError::Unavailable(err.to_string()))?
            .into_string()
            .map_err(|raw| IdentityError::Unavailable(format!("not valid utf-8: {raw:?}")))
    }
}

/// A fixed host name, for `--node-name` overrides and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticHostname(pub String);

impl StaticHostname {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl HostnameSource for StaticHostname {
    fn hostname(&self) -> Result<String, IdentityError> {
        Ok(self.0.clone())
    }
}

/// Trimmed, lower-cased, non-empty host name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a raw host name into a [`NodeIdentity`].
pub fn normalize(raw: &str) -> Result<NodeIdentity, IdentityError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::Empty);
    }
    // backends commonly only accept lower case resource names
    Ok(NodeIdentity(trimmed.to_lowercase()))
}

/// Read the host name from `source` and normalize it.
pub fn resolve_identity<H: HostnameSource + ?Sized>(
    source: &H,
) -> Result<NodeIdentity, IdentityError> {
    normalize(&source.hostname()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl HostnameSource for Broken {
        fn hostname(&self) -> Result<String, IdentityError> {
            Err(IdentityError::Unavailable("uname failed".into()))
        }
    }

    #[test]
    fn test_trim_and_lowercase() {
        let id = resolve_identity(&StaticHostname::new("  Node-A \n")).unwrap();
        assert_eq!(id.as_str(), "node-a");
        assert_eq!(id.to_string(), "node-a");
    }

    #[test]
    fn test_empty() {
        for raw in ["", "   ", "\n\t "] {
            assert_eq!(
                resolve_identity(&StaticHostname::new(raw)),
                Err(IdentityError::Empty)
            );
        }
    }

    #[test]
    fn test_unavailable() {
        assert!(matches!(
            resolve_identity(&Broken),
            Err(IdentityError::Unavailable(_))
        ));
    }

    #[test]
    fn test_system_hostname() {
        // whatever the host returns, it is either usable or a typed error
        match resolve_identity(&SystemHostname) {
            Ok(id) => assert_eq!(id.as_str(), id.as_str().trim().to_lowercase()),
            Err(err) => assert!(matches!(
                err,
                IdentityError::Empty | IdentityError::Unavailable(_)
            )),
        }
    }
}
