//! `QueryKey`: a structural, prefix-matchable identifier for a cached
//! result.

use serde_json::Value;

/// A finite ordered sequence of primitive tokens (strings, numbers,
/// booleans, or nested sequences/maps). Equality is structural and deep;
/// [`fingerprint`](Self::fingerprint) produces a canonical string used for
/// hashing and storage lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    pub fn new(tokens: impl IntoIterator<Item = Value>) -> Self {
        QueryKey(tokens.into_iter().collect())
    }

    pub fn tokens(&self) -> &[Value] {
        &self.0
    }

    /// Canonical string fingerprint: tokens stay in declared order (order
    /// is significant for a query key), but any map embedded within a
    /// token has its keys sorted so structurally-equal keys always produce
    /// the same fingerprint regardless of construction order.
    pub fn fingerprint(&self) -> String {
        let canonical: Vec<Value> = self.0.iter().map(canonicalize).collect();
        serde_json::to_string(&canonical).expect("query key tokens are always JSON-serializable")
    }

    /// `self` is a prefix of `other` iff `other` starts with `self`
    /// token-wise.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        if self.0.len() > other.0.len() {
            return false;
        }
        self.0.iter().zip(other.0.iter()).all(|(a, b)| canonicalize(a) == canonicalize(b))
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> = map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(tokens: [&str; N]) -> Self {
        QueryKey::new(tokens.into_iter().map(|t| Value::String(t.to_string())))
    }
}

impl From<&str> for QueryKey {
    fn from(token: &str) -> Self {
        QueryKey::new([Value::String(token.to_string())])
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(tokens: Vec<Value>) -> Self {
        QueryKey::new(tokens)
    }
}
