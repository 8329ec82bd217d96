// # Queries
//
// A query is a tree of predicates over field paths. Evaluation against an
// entity uses the same normalized key comparisons the ordered index uses,
// so a full scan and an index plan agree on every match.
//
// Fingerprints: the structural fingerprint hashes predicate shape and
// field names (plan cache key); the literal fingerprint additionally
// hashes the constant values (result cache key).

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use crate::index::IndexKey;
use crate::value::{Entity, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Matches every entity.
    All,
    Equals {
        field: String,
        value: Value,
    },
    Range {
        field: String,
        low: Option<Value>,
        high: Option<Value>,
        include_low: bool,
        include_high: bool,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    Prefix {
        field: String,
        prefix: String,
    },
    /// Substring match on strings, element match on lists.
    Contains {
        field: String,
        needle: Value,
    },
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
}

impl Query {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Query::Equals {
            field: field.into(),
            value,
        }
    }

    pub fn gt(field: impl Into<String>, low: Value) -> Self {
        Query::Range {
            field: field.into(),
            low: Some(low),
            high: None,
            include_low: false,
            include_high: false,
        }
    }

    pub fn gte(field: impl Into<String>, low: Value) -> Self {
        Query::Range {
            field: field.into(),
            low: Some(low),
            high: None,
            include_low: true,
            include_high: false,
        }
    }

    pub fn lt(field: impl Into<String>, high: Value) -> Self {
        Query::Range {
            field: field.into(),
            low: None,
            high: Some(high),
            include_low: false,
            include_high: false,
        }
    }

    pub fn lte(field: impl Into<String>, high: Value) -> Self {
        Query::Range {
            field: field.into(),
            low: None,
            high: Some(high),
            include_low: false,
            include_high: true,
        }
    }

    pub fn between(
        field: impl Into<String>,
        low: Value,
        high: Value,
        include_low: bool,
        include_high: bool,
    ) -> Self {
        Query::Range {
            field: field.into(),
            low: Some(low),
            high: Some(high),
            include_low,
            include_high,
        }
    }

    pub fn and(queries: Vec<Query>) -> Self {
        Query::And(queries)
    }

    pub fn or(queries: Vec<Query>) -> Self {
        Query::Or(queries)
    }

    pub fn not(query: Query) -> Self {
        Query::Not(Box::new(query))
    }

    /// Does the entity satisfy this predicate tree?
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Query::All => true,
            Query::Equals { field, value } => match (entity.field(field), IndexKey::from_value(value)) {
                (Some(actual), Some(expected)) => {
                    IndexKey::from_value(actual) == Some(expected)
                }
                // Non-indexable literals fall back to structural equality.
                (Some(actual), None) => actual == value,
                (None, _) => false,
            },
            Query::Range {
                field,
                low,
                high,
                include_low,
                include_high,
            } => {
                let key = match entity.field(field).and_then(IndexKey::from_value) {
                    Some(k) => k,
                    None => return false,
                };
                if let Some(bound) = low.as_ref().and_then(IndexKey::from_value) {
                    if key < bound || (!include_low && key == bound) {
                        return false;
                    }
                }
                if let Some(bound) = high.as_ref().and_then(IndexKey::from_value) {
                    if key > bound || (!include_high && key == bound) {
                        return false;
                    }
                }
                true
            }
            Query::In { field, values } => match entity.field(field) {
                Some(actual) => {
                    let actual_key = IndexKey::from_value(actual);
                    values.iter().any(|v| {
                        IndexKey::from_value(v)
                            .map(|k| Some(k) == actual_key)
                            .unwrap_or(actual == v)
                    })
                }
                None => false,
            },
            Query::Prefix { field, prefix } => matches!(
                entity.field(field),
                Some(Value::String(s)) if s.starts_with(prefix)
            ),
            Query::Contains { field, needle } => match entity.field(field) {
                Some(Value::String(s)) => match needle {
                    Value::String(sub) => s.contains(sub.as_str()),
                    _ => false,
                },
                Some(Value::List(items)) => items.contains(needle),
                _ => false,
            },
            Query::And(children) => children.iter().all(|q| q.matches(entity)),
            Query::Or(children) => children.iter().any(|q| q.matches(entity)),
            Query::Not(child) => !child.matches(entity),
        }
    }

    /// Normalize the tree: multiple `Range` terms on the same field inside
    /// an `And` collapse into one range with the tighter bounds, so the
    /// planner can serve them with a single ordered scan.
    pub fn normalized(&self) -> Query {
        match self {
            Query::And(children) => {
                let mut merged: Vec<Query> = Vec::new();
                for child in children {
                    let child = child.normalized();
                    let range = match child {
                        Query::Range { .. } => child,
                        other => {
                            merged.push(other);
                            continue;
                        }
                    };
                    let slot = merged.iter_mut().find(|q| {
                        matches!(
                            (&**q, &range),
                            (Query::Range { field: a, .. }, Query::Range { field: b, .. }) if a == b
                        )
                    });
                    match slot {
                        Some(existing) => *existing = merge_ranges(existing, &range),
                        None => merged.push(range),
                    }
                }
                if merged.len() == 1 {
                    merged.pop().expect("single element")
                } else {
                    Query::And(merged)
                }
            }
            Query::Or(children) => {
                Query::Or(children.iter().map(Query::normalized).collect())
            }
            Query::Not(child) => Query::Not(Box::new(child.normalized())),
            other => other.clone(),
        }
    }

    /// Every field path referenced by the tree.
    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Query::All => {}
            Query::Equals { field, .. }
            | Query::Range { field, .. }
            | Query::In { field, .. }
            | Query::Prefix { field, .. }
            | Query::Contains { field, .. } => {
                out.insert(field.clone());
            }
            Query::And(children) | Query::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            }
            Query::Not(child) => child.collect_fields(out),
        }
    }

    /// Structural fingerprint: shape + field names, literals excluded.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash_shape(&mut hasher, false);
        hasher.finish()
    }

    /// Structural fingerprint plus literal values.
    pub fn literal_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash_shape(&mut hasher, true);
        hasher.finish()
    }

    fn hash_shape(&self, hasher: &mut DefaultHasher, with_literals: bool) {
        match self {
            Query::All => 0u8.hash(hasher),
            Query::Equals { field, value } => {
                1u8.hash(hasher);
                field.hash(hasher);
                if with_literals {
                    hash_value(value, hasher);
                }
            }
            Query::Range {
                field,
                low,
                high,
                include_low,
                include_high,
            } => {
                2u8.hash(hasher);
                field.hash(hasher);
                (low.is_some(), high.is_some(), include_low, include_high).hash(hasher);
                if with_literals {
                    if let Some(v) = low {
                        hash_value(v, hasher);
                    }
                    if let Some(v) = high {
                        hash_value(v, hasher);
                    }
                }
            }
            Query::In { field, values } => {
                3u8.hash(hasher);
                field.hash(hasher);
                if with_literals {
                    values.len().hash(hasher);
                    for v in values {
                        hash_value(v, hasher);
                    }
                }
            }
            Query::Prefix { field, prefix } => {
                4u8.hash(hasher);
                field.hash(hasher);
                if with_literals {
                    prefix.hash(hasher);
                }
            }
            Query::Contains { field, needle } => {
                5u8.hash(hasher);
                field.hash(hasher);
                if with_literals {
                    hash_value(needle, hasher);
                }
            }
            Query::And(children) => {
                6u8.hash(hasher);
                children.len().hash(hasher);
                for child in children {
                    child.hash_shape(hasher, with_literals);
                }
            }
            Query::Or(children) => {
                7u8.hash(hasher);
                children.len().hash(hasher);
                for child in children {
                    child.hash_shape(hasher, with_literals);
                }
            }
            Query::Not(child) => {
                8u8.hash(hasher);
                child.hash_shape(hasher, with_literals);
            }
        }
    }
}

/// Tighter of two range predicates on the same field. For equal bounds the
/// exclusive side wins.
fn merge_ranges(a: &Query, b: &Query) -> Query {
    let (field, a_low, a_high, a_il, a_ih) = match a {
        Query::Range {
            field,
            low,
            high,
            include_low,
            include_high,
        } => (field, low, high, *include_low, *include_high),
        _ => return a.clone(),
    };
    let (b_low, b_high, b_il, b_ih) = match b {
        Query::Range {
            low,
            high,
            include_low,
            include_high,
            ..
        } => (low, high, *include_low, *include_high),
        _ => return a.clone(),
    };

    let key_of = |v: &Option<Value>| v.as_ref().and_then(IndexKey::from_value);

    let (low, include_low) = match (key_of(a_low), key_of(b_low)) {
        (Some(ka), Some(kb)) => {
            if ka > kb {
                (a_low.clone(), a_il)
            } else if kb > ka {
                (b_low.clone(), b_il)
            } else {
                (a_low.clone(), a_il && b_il)
            }
        }
        (Some(_), None) => (a_low.clone(), a_il),
        (None, _) => (b_low.clone(), b_il),
    };
    let (high, include_high) = match (key_of(a_high), key_of(b_high)) {
        (Some(ka), Some(kb)) => {
            if ka < kb {
                (a_high.clone(), a_ih)
            } else if kb < ka {
                (b_high.clone(), b_ih)
            } else {
                (a_high.clone(), a_ih && b_ih)
            }
        }
        (Some(_), None) => (a_high.clone(), a_ih),
        (None, _) => (b_high.clone(), b_ih),
    };

    Query::Range {
        field: field.clone(),
        low,
        high,
        include_low,
        include_high,
    }
}

fn hash_value(value: &Value, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Int(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Float(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::String(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            5u8.hash(hasher);
            b.hash(hasher);
        }
        Value::List(items) => {
            6u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
        Value::Map(m) => {
            7u8.hash(hasher);
            m.len().hash(hasher);
            for (k, v) in m {
                k.hash(hasher);
                hash_value(v, hasher);
            }
        }
        Value::Custom { type_name, payload } => {
            8u8.hash(hasher);
            type_name.hash(hasher);
            hash_value(payload, hasher);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Pagination and ordering for `find`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort_by: Option<(String, SortOrder)>,
}

impl QueryOptions {
    pub fn sorted_by(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            sort_by: Some((field.into(), order)),
            ..Default::default()
        }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }
}
