//! Data-driven claim-path evaluator.
//!
//! `TrustedIdp::claim_map` maps logical identity fields (`userId`, `roles`, …)
//! to a dotted path into the JWT claim set, e.g. `realm_access.roles` or
//! `resource_access.my-client.roles[0]`. This replaces ad-hoc dynamic field
//! lookup with a small data-driven evaluator: claim rules are configuration,
//! not code.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Field(String),
    Index(usize),
}

/// A parsed claim path, e.g. `resource_access.gateway.roles[0]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct ClaimPath(Vec<PathSegment>);

impl<'de> Deserialize<'de> for ClaimPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ClaimPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl From<ClaimPath> for String {
    fn from(path: ClaimPath) -> Self {
        path.to_string()
    }
}

impl core::fmt::Display for ClaimPath {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) => {
                    if i != 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{name}")?;
                }
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

impl ClaimPath {
    pub fn parse(raw: &str) -> Result<Self, ClaimPathError> {
        if raw.is_empty() {
            return Err(ClaimPathError::Empty);
        }

        let mut segments = Vec::new();

        for field in raw.split('.') {
            let mut rest = field;

            // A field may be immediately followed by one or more `[n]` index accesses.
            if let Some(bracket_pos) = rest.find('[') {
                let (name, mut tail) = rest.split_at(bracket_pos);
                if !name.is_empty() {
                    segments.push(PathSegment::Field(name.to_owned()));
                }

                while let Some(stripped) = tail.strip_prefix('[') {
                    let Some(close) = stripped.find(']') else {
                        return Err(ClaimPathError::Malformed(raw.to_owned()));
                    };
                    let idx: usize = stripped[..close]
                        .parse()
                        .map_err(|_| ClaimPathError::Malformed(raw.to_owned()))?;
                    segments.push(PathSegment::Index(idx));
                    tail = &stripped[close + 1..];
                }

                if !tail.is_empty() {
                    return Err(ClaimPathError::Malformed(raw.to_owned()));
                }
            } else {
                segments.push(PathSegment::Field(rest.to_owned()));
                rest = "";
                let _ = rest;
            }
        }

        Ok(Self(segments))
    }

    /// Walk `root` following this path, returning the value if every segment
    /// resolves, or `None` on any missing field / out-of-range index / type
    /// mismatch.
    pub fn resolve<'v>(&self, root: &'v Value) -> Option<&'v Value> {
        let mut current = root;

        for segment in &self.0 {
            current = match segment {
                PathSegment::Field(name) => current.as_object()?.get(name)?,
                PathSegment::Index(idx) => current.as_array()?.get(*idx)?,
            };
        }

        Some(current)
    }

    /// Convenience for a string-valued claim.
    pub fn resolve_str<'v>(&self, root: &'v Value) -> Option<&'v str> {
        self.resolve(root)?.as_str()
    }

    /// Convenience for a claim that is either a single string or an array of
    /// strings (e.g. `roles`, `scopes`).
    pub fn resolve_str_set(&self, root: &Value) -> Vec<String> {
        match self.resolve(root) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str()).map(str::to_owned).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimPathError {
    #[error("claim path must not be empty")]
    Empty,
    #[error("malformed claim path: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn simple_field() {
        let path = ClaimPath::parse("sub").unwrap();
        assert_eq!(path.resolve_str(&json!({"sub": "alice"})), Some("alice"));
    }

    #[test]
    fn nested_field() {
        let path = ClaimPath::parse("realm_access.roles").unwrap();
        let claims = json!({"realm_access": {"roles": ["a", "b"]}});
        assert_eq!(path.resolve_str_set(&claims), vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn indexed_field() {
        let path = ClaimPath::parse("groups[0]").unwrap();
        let claims = json!({"groups": ["eng", "ops"]});
        assert_eq!(path.resolve_str(&claims), Some("eng"));
    }

    #[test]
    fn missing_is_none() {
        let path = ClaimPath::parse("does.not.exist").unwrap();
        assert!(path.resolve(&json!({"sub": "alice"})).is_none());
    }

    proptest::proptest! {
        #[test]
        fn parse_never_panics(raw in "[a-zA-Z0-9_.\\[\\]]{0,32}") {
            let _ = ClaimPath::parse(&raw);
        }
    }
}
