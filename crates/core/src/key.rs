use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ResourceSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unexpected key format: {0:?}")]
    Format(String),
    #[error("object has no name")]
    MissingName,
    #[error("{field} {value:?} must not contain '/'")]
    Separator { field: &'static str, value: String },
}

/// Identity of a watched object, serialized as `namespace/name`.
///
/// Cluster-scoped objects have an empty namespace and serialize as just `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    namespace: String,
    name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, KeyError> {
        let namespace = namespace.into();
        let name = name.into();
        if name.is_empty() {
            return Err(KeyError::MissingName);
        }
        if namespace.contains('/') {
            return Err(KeyError::Separator { field: "namespace", value: namespace });
        }
        if name.contains('/') {
            return Err(KeyError::Separator { field: "name", value: name });
        }
        Ok(Self { namespace, name })
    }

    pub fn for_object(obj: &ResourceSnapshot) -> Result<Self, KeyError> {
        Self::new(obj.namespace.clone().unwrap_or_default(), obj.name.clone())
    }

    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn name(&self) -> &str { &self.name }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self { namespace: String::new(), name: (*name).to_string() }),
            [namespace, name] if !name.is_empty() => {
                Ok(Self { namespace: (*namespace).to_string(), name: (*name).to_string() })
            }
            _ => Err(KeyError::Format(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(ns: Option<&str>, name: &str) -> ResourceSnapshot {
        ResourceSnapshot { namespace: ns.map(|s| s.to_string()), name: name.to_string(), ..Default::default() }
    }

    #[test]
    fn key_serializes_namespace_and_name() {
        let k = ResourceKey::for_object(&snap(Some("prod"), "web-0")).unwrap();
        assert_eq!(k.to_string(), "prod/web-0");
        assert_eq!(k.namespace(), "prod");
        assert_eq!(k.name(), "web-0");
    }

    #[test]
    fn key_parses_back_to_the_same_identity() {
        let k = ResourceKey::new("prod", "web-0").unwrap();
        let parsed: ResourceKey = k.to_string().parse().unwrap();
        assert_eq!(parsed, k);

        let cluster = ResourceKey::new("", "node-a").unwrap();
        assert_eq!(cluster.to_string(), "node-a");
        assert_eq!("node-a".parse::<ResourceKey>().unwrap(), cluster);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for bad in ["", "a/b/c", "ns/", "/"] {
            let e = bad.parse::<ResourceKey>().unwrap_err();
            assert_eq!(e, KeyError::Format(bad.to_string()), "input={bad:?}");
        }
    }

    #[test]
    fn objects_without_name_have_no_key() {
        assert_eq!(ResourceKey::for_object(&snap(Some("prod"), "")).unwrap_err(), KeyError::MissingName);
        assert!(matches!(ResourceKey::new("a/b", "x"), Err(KeyError::Separator { field: "namespace", .. })));
    }
}
