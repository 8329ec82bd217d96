// # Query Planner
//
// Enumerates candidate access paths for a predicate tree against the
// collection's indexes and picks the cheapest by a simple cost model:
//
//   cost(plan) = ALPHA * estimated_rows + BETA * residual_rows
//
// where row estimates come from per-index cardinality statistics. Whatever
// plan wins, the executor re-applies the full predicate to every realized
// entity, so plan choice never changes query results, only their cost.

use std::collections::HashMap;

use crate::collection::query::Query;
use crate::index::IndexKind;

const ALPHA: f64 = 1.0;
const BETA: f64 = 0.25;

/// Chosen access path. Fields are sorted for deterministic fingerprinting
/// of multi-index plans.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Scan the primary locator map and filter in memory.
    FullScan,
    /// Single-index equality probe.
    IndexEquals { field: String },
    /// Single-index ordered range scan.
    IndexRange { field: String },
    /// Single-index multi-key probe (`In`).
    IndexIn { field: String },
    /// Single-index prefix scan.
    IndexPrefix { field: String },
    /// And: intersect several index probes, then filter residual terms.
    IndexIntersection { fields: Vec<String> },
    /// Or: union several index probes.
    IndexUnion { fields: Vec<String> },
    /// And with one indexable term: probe it, filter the rest.
    IndexProbeResidual { field: String },
}

/// Statistics the planner sees for one index.
#[derive(Debug, Clone, Copy)]
pub struct IndexStats {
    pub kind: IndexKind,
    pub cardinality: usize,
    pub total: usize,
}

/// Planner input: which fields are indexed and how big the collection is.
#[derive(Debug, Default)]
pub struct PlannerContext {
    pub indexes: HashMap<String, IndexStats>,
    pub entity_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafKind {
    Equality,
    Range,
    Prefix,
    In,
}

/// Classify a leaf predicate; composite nodes return None.
pub(crate) fn classify(query: &Query) -> Option<(&str, LeafKind)> {
    match query {
        Query::Equals { field, .. } => Some((field, LeafKind::Equality)),
        Query::Range { field, .. } => Some((field, LeafKind::Range)),
        Query::In { field, .. } => Some((field, LeafKind::In)),
        Query::Prefix { field, .. } => Some((field, LeafKind::Prefix)),
        _ => None,
    }
}

fn index_supports(kind: IndexKind, leaf: LeafKind) -> bool {
    match kind {
        IndexKind::Ordered => true,
        IndexKind::Hash => matches!(leaf, LeafKind::Equality | LeafKind::In),
    }
}

fn leaf_estimate(leaf: LeafKind, query: &Query, stats: &IndexStats) -> f64 {
    let total = stats.total.max(1) as f64;
    let distinct = stats.cardinality.max(1) as f64;
    match leaf {
        LeafKind::Equality => total / distinct,
        LeafKind::In => {
            let keys = match query {
                Query::In { values, .. } => values.len().max(1) as f64,
                _ => 1.0,
            };
            keys * total / distinct
        }
        LeafKind::Range => total / 3.0,
        LeafKind::Prefix => total / 4.0,
    }
}

/// An index-backed leaf: the plan serving it plus its row estimate.
fn leaf_candidate(query: &Query, ctx: &PlannerContext) -> Option<(QueryPlan, f64)> {
    let (field, leaf) = classify(query)?;
    let stats = ctx.indexes.get(field)?;
    if !index_supports(stats.kind, leaf) {
        return None;
    }
    let estimate = leaf_estimate(leaf, query, stats);
    let plan = match leaf {
        LeafKind::Equality => QueryPlan::IndexEquals {
            field: field.to_string(),
        },
        LeafKind::Range => QueryPlan::IndexRange {
            field: field.to_string(),
        },
        LeafKind::In => QueryPlan::IndexIn {
            field: field.to_string(),
        },
        LeafKind::Prefix => QueryPlan::IndexPrefix {
            field: field.to_string(),
        },
    };
    Some((plan, estimate))
}

/// Pick the cheapest plan for a query.
pub fn plan(query: &Query, ctx: &PlannerContext) -> QueryPlan {
    let n = ctx.entity_count as f64;
    let mut best = (QueryPlan::FullScan, ALPHA * n + BETA * n);

    let mut consider = |candidate: (QueryPlan, f64)| {
        if candidate.1 < best.1 {
            best = candidate;
        }
    };

    if let Some((plan, est)) = leaf_candidate(query, ctx) {
        consider((plan, ALPHA * est));
    }

    match query {
        Query::And(children) => {
            let mut indexed: Vec<(String, f64)> = Vec::new();
            let mut residual = 0usize;
            for child in children {
                match leaf_candidate(child, ctx) {
                    Some((plan, est)) => {
                        let field = match &plan {
                            QueryPlan::IndexEquals { field }
                            | QueryPlan::IndexRange { field }
                            | QueryPlan::IndexIn { field }
                            | QueryPlan::IndexPrefix { field } => field.clone(),
                            _ => unreachable!("leaf candidates are single-index plans"),
                        };
                        indexed.push((field, est));
                    }
                    None => residual += 1,
                }
            }
            if indexed.len() >= 2 {
                let min_est = indexed
                    .iter()
                    .map(|(_, e)| *e)
                    .fold(f64::INFINITY, f64::min);
                let mut fields: Vec<String> =
                    indexed.iter().map(|(f, _)| f.clone()).collect();
                fields.sort();
                fields.dedup();
                consider((
                    QueryPlan::IndexIntersection { fields },
                    ALPHA * min_est + BETA * min_est * residual.max(1) as f64,
                ));
            } else if indexed.len() == 1 && !children.is_empty() {
                let (field, est) = indexed.remove(0);
                consider((
                    QueryPlan::IndexProbeResidual { field },
                    ALPHA * est + BETA * est * residual.max(1) as f64,
                ));
            }
        }
        Query::Or(children) if !children.is_empty() => {
            // A union is only correct when every branch is index-backed.
            let mut sum = 0.0;
            let mut fields = Vec::new();
            let mut all_indexed = true;
            for child in children {
                match leaf_candidate(child, ctx) {
                    Some((plan, est)) => {
                        sum += est;
                        match plan {
                            QueryPlan::IndexEquals { field }
                            | QueryPlan::IndexRange { field }
                            | QueryPlan::IndexIn { field }
                            | QueryPlan::IndexPrefix { field } => fields.push(field),
                            _ => unreachable!(),
                        }
                    }
                    None => {
                        all_indexed = false;
                        break;
                    }
                }
            }
            if all_indexed {
                fields.sort();
                fields.dedup();
                consider((QueryPlan::IndexUnion { fields }, ALPHA * sum + BETA * sum));
            }
        }
        _ => {}
    }

    best.0
}
