pub use http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single HTTP request match expression.
///
/// A rule with several matches produces one routing entry per match; a rule
/// with none behaves as if it carried the default catch-all match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_params: Vec<QueryParamMatch>,
    #[serde(default, with = "serde_method", skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(#[serde(with = "serde_regex")] Regex),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HeaderMatch {
    Exact { name: String, value: String },
    Prefix { name: String, value: String },
    Suffix { name: String, value: String },
    Regex {
        name: String,
        #[serde(with = "serde_regex")]
        value: Regex,
    },
    Present { name: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum QueryParamMatch {
    Exact { name: String, value: String },
    Regex {
        name: String,
        #[serde(with = "serde_regex")]
        value: Regex,
    },
    Present { name: String },
}

/// Request-header rewrites attached to a rule or to an individual backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderFilter {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

// === impl HttpMatch ===

impl Default for HttpMatch {
    fn default() -> Self {
        Self {
            path: Some(PathMatch::Prefix("/".to_string())),
            headers: Default::default(),
            query_params: Default::default(),
            method: None,
        }
    }
}

impl HttpMatch {
    /// The number of characters in the path expression, used for precedence
    /// ordering. Matches without a path sort as zero-length.
    pub fn path_len(&self) -> usize {
        match &self.path {
            Some(PathMatch::Exact(value)) | Some(PathMatch::Prefix(value)) => value.len(),
            Some(PathMatch::Regex(value)) => value.as_str().len(),
            None => 0,
        }
    }
}

// === impl PathMatch ===

impl PartialEq for PathMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(l0), Self::Exact(r0)) => l0 == r0,
            (Self::Prefix(l0), Self::Prefix(r0)) => l0 == r0,
            (Self::Regex(l0), Self::Regex(r0)) => l0.as_str() == r0.as_str(),
            _ => false,
        }
    }
}

impl Eq for PathMatch {}

impl PathMatch {
    pub fn regex(s: &str) -> anyhow::Result<Self> {
        Ok(Self::Regex(Regex::new(s)?))
    }
}

// === impl HeaderMatch ===

impl PartialEq for HeaderMatch {
    fn eq(&self, other: &Self) -> bool {
        use HeaderMatch::*;
        match (self, other) {
            (Exact { name: n0, value: v0 }, Exact { name: n1, value: v1 })
            | (Prefix { name: n0, value: v0 }, Prefix { name: n1, value: v1 })
            | (Suffix { name: n0, value: v0 }, Suffix { name: n1, value: v1 }) => {
                n0 == n1 && v0 == v1
            }
            (Regex { name: n0, value: r0 }, Regex { name: n1, value: r1 }) => {
                n0 == n1 && r0.as_str() == r1.as_str()
            }
            (Present { name: n0 }, Present { name: n1 }) => n0 == n1,
            _ => false,
        }
    }
}

impl Eq for HeaderMatch {}

// === impl QueryParamMatch ===

impl PartialEq for QueryParamMatch {
    fn eq(&self, other: &Self) -> bool {
        use QueryParamMatch::*;
        match (self, other) {
            (Exact { name: n0, value: v0 }, Exact { name: n1, value: v1 }) => {
                n0 == n1 && v0 == v1
            }
            (Regex { name: n0, value: r0 }, Regex { name: n1, value: r1 }) => {
                n0 == n1 && r0.as_str() == r1.as_str()
            }
            (Present { name: n0 }, Present { name: n1 }) => n0 == n1,
            _ => false,
        }
    }
}

impl Eq for QueryParamMatch {}

// === impl HeaderFilter ===

impl HeaderFilter {
    /// Merges `later` into `self`: later `add`/`set` entries overwrite earlier
    /// keys while `remove` lists concatenate.
    pub fn merge(&mut self, later: &HeaderFilter) {
        self.add
            .extend(later.add.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.set
            .extend(later.set.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.remove.extend(later.remove.iter().cloned());
    }

    /// Folds a sequence of filters into one, in order.
    pub fn merged<'a>(filters: impl IntoIterator<Item = &'a HeaderFilter>) -> HeaderFilter {
        let mut merged = HeaderFilter::default();
        for filter in filters {
            merged.merge(filter);
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.set.is_empty() && self.remove.is_empty()
    }
}

mod serde_regex {
    use regex::Regex;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Regex, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_str())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Regex, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        pattern.parse().map_err(D::Error::custom)
    }
}

mod serde_method {
    use http::Method;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Method>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(method) => serializer.serialize_some(method.as_str()),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Method>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|method| method.parse().map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_match_is_catch_all_prefix() {
        let m = HttpMatch::default();
        assert_eq!(m.path, Some(PathMatch::Prefix("/".to_string())));
        assert!(m.headers.is_empty());
        assert!(m.query_params.is_empty());
        assert!(m.method.is_none());
    }

    #[test]
    fn header_filters_merge_in_order() {
        let mut first = HeaderFilter {
            add: btreemap! {"a".to_string() => "b".to_string()},
            set: btreemap! {"c".to_string() => "d".to_string()},
            remove: vec!["e".to_string()],
        };
        let second = HeaderFilter {
            add: btreemap! {"a".to_string() => "d".to_string()},
            set: btreemap! {"c".to_string() => "d".to_string()},
            remove: vec!["f".to_string()],
        };
        first.merge(&second);
        assert_eq!(
            first,
            HeaderFilter {
                add: btreemap! {"a".to_string() => "d".to_string()},
                set: btreemap! {"c".to_string() => "d".to_string()},
                remove: vec!["e".to_string(), "f".to_string()],
            }
        );
    }

    #[test]
    fn regex_matches_round_trip() {
        let m = HttpMatch {
            path: Some(PathMatch::regex("/v[0-9]+").expect("valid regex")),
            headers: vec![HeaderMatch::Present {
                name: "x-debug".to_string(),
            }],
            query_params: vec![],
            method: Some(Method::GET),
        };
        let bytes = serde_json::to_vec(&m).expect("serializes");
        let decoded: HttpMatch = serde_json::from_slice(&bytes).expect("deserializes");
        assert_eq!(m, decoded);
    }
}
