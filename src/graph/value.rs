//! Attribute values and cross-node references.

use serde::{Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use super::node::NodeId;

/// Concrete attribute map, as sent to providers and recorded in state.
pub type Attributes = BTreeMap<String, Value>;

/// Reference to an attribute of another node.
///
/// The attribute `id` denotes the provider-assigned identifier; any other
/// name is looked up in the referenced resource's observed attributes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Reference {
    /// Referenced node.
    pub node: NodeId,
    /// Attribute path on the referenced node (dot separated).
    pub attribute: String,
}

impl Reference {
    /// Creates a reference.
    #[must_use]
    pub fn new(node: impl Into<NodeId>, attribute: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            attribute: attribute.into(),
        }
    }

    /// Returns true if the reference targets the provider identifier.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.attribute == "id"
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.attribute)
    }
}

/// A secret string that never appears in logs, plans, or state.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wraps a secret.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the plain value, for provider calls only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns the digest recorded in state in place of the value.
    #[must_use]
    pub fn digest(&self) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(self.0.as_bytes())))
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<sensitive>)")
    }
}

impl Serialize for SecretValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("<sensitive>")
    }
}

/// A desired attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    /// A plain JSON value.
    Literal(Value),
    /// A reference resolved against another node's observed resource.
    Ref(Reference),
    /// A list whose items may contain references.
    List(Vec<AttrValue>),
    /// A map whose values may contain references.
    Map(BTreeMap<String, AttrValue>),
    /// A sensitive string.
    Sensitive(SecretValue),
}

/// How sensitive values are rendered during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Plain values, for provider calls.
    ForProvider,
    /// Digests instead of secrets, for state and comparisons.
    ForState,
}

/// A reference that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved(pub Reference);

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unresolved reference {}", self.0)
    }
}

impl std::error::Error for Unresolved {}

impl AttrValue {
    /// Creates a list value.
    #[must_use]
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Self>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// Creates a map value.
    #[must_use]
    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Self>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Creates a reference to another node's attribute.
    #[must_use]
    pub fn reference(node: impl Into<NodeId>, attribute: impl Into<String>) -> Self {
        Self::Ref(Reference::new(node, attribute))
    }

    /// Appends every reference contained in this value.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Ref(reference) => out.push(reference),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
            Self::Literal(_) | Self::Sensitive(_) => {}
        }
    }

    /// Resolves the value to plain JSON.
    ///
    /// # Errors
    ///
    /// Returns the first reference the lookup could not satisfy.
    pub fn resolve<F>(&self, lookup: &F, mode: Resolution) -> Result<Value, Unresolved>
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Ref(reference) => lookup(reference).ok_or_else(|| Unresolved(reference.clone())),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup, mode))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(entries) => entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.resolve(lookup, mode)?)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
            Self::Sensitive(secret) => Ok(Value::String(match mode {
                Resolution::ForProvider => secret.expose().to_string(),
                Resolution::ForState => secret.digest(),
            })),
        }
    }
}

impl From<Value> for AttrValue {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Literal(Value::String(value))
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Literal(Value::Bool(value))
    }
}

impl From<u16> for AttrValue {
    fn from(value: u16) -> Self {
        Self::Literal(Value::from(value))
    }
}

impl From<u32> for AttrValue {
    fn from(value: u32) -> Self {
        Self::Literal(Value::from(value))
    }
}

impl From<Reference> for AttrValue {
    fn from(value: Reference) -> Self {
        Self::Ref(value)
    }
}

impl From<SecretValue> for AttrValue {
    fn from(value: SecretValue) -> Self {
        Self::Sensitive(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup(reference: &Reference) -> Option<Value> {
        match (reference.node.as_str(), reference.attribute.as_str()) {
            ("security_group.lb", "id") => Some(json!("sg-0001")),
            _ => None,
        }
    }

    #[test]
    fn test_nested_references_are_collected() {
        let value = AttrValue::list([AttrValue::map([
            ("from_port", AttrValue::from(80_u16)),
            ("source_security_group_id", AttrValue::reference("security_group.lb", "id")),
        ])]);

        let mut refs = Vec::new();
        value.collect_references(&mut refs);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].to_string(), "security_group.lb.id");
    }

    #[test]
    fn test_resolve_nested_value() {
        let value = AttrValue::list([AttrValue::map([
            ("from_port", AttrValue::from(80_u16)),
            ("source_security_group_id", AttrValue::reference("security_group.lb", "id")),
        ])]);

        let resolved = value.resolve(&lookup, Resolution::ForProvider).expect("resolves");
        assert_eq!(
            resolved,
            json!([{ "from_port": 80, "source_security_group_id": "sg-0001" }])
        );
    }

    #[test]
    fn test_sensitive_values_render_as_digest_for_state() {
        let value = AttrValue::from(SecretValue::new("hunter2"));
        let plain = value.resolve(&lookup, Resolution::ForProvider).expect("plain");
        let stored = value.resolve(&lookup, Resolution::ForState).expect("digest");

        assert_eq!(plain, json!("hunter2"));
        assert!(stored.as_str().is_some_and(|s| s.starts_with("sha256:")));
        assert!(!format!("{value:?}").contains("hunter2"));
    }
}
