//! Container-to-container affinities: annotation parsing with symmetric
//! short-form expansion, implicit registration and weighted evaluation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::{container::Container, expression::Expression, expression::Operator};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to parse affinity annotation"))]
    ParseAnnotation { source: serde_yaml::Error },

    #[snafu(display("invalid affinity for container {container:?}"))]
    InvalidExpression {
        source: crate::expression::Error,
        container: String,
    },

    #[snafu(display("implicit affinity {name:?} is already registered"))]
    DuplicateImplicitAffinity { name: String },
}

/// User weights are clamped to `±UserWeightCutoff`.
pub const USER_WEIGHT_CUTOFF: i32 = 1000;

/// Default weight of an affinity with no explicit weight.
pub const DEFAULT_WEIGHT: i32 = 1;

/// A weighted affinity: `scope` selects the candidate peers, `match_expr`
/// picks the affine ones among them. A negative weight is anti-affinity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Affinity {
    pub scope: Expression,

    #[serde(rename = "match")]
    pub match_expr: Expression,

    pub weight: i32,
}

impl Affinity {
    pub fn new(scope: Expression, match_expr: Expression, weight: i32) -> Self {
        Self {
            scope,
            match_expr,
            weight: clamp_weight(weight),
        }
    }

    /// An affinity whose scope is the whole cache.
    pub fn global(match_expr: Expression, weight: i32) -> Self {
        Self::new(Expression::always_true(), match_expr, weight)
    }
}

/// Serialized form of one affinity in a full-form annotation. Scope and
/// weight are optional; the parser fills in the pod scope and the caller
/// default.
#[derive(Debug, Deserialize)]
struct AffinitySpec {
    #[serde(default)]
    scope: Option<Expression>,

    #[serde(rename = "match")]
    match_expr: Expression,

    #[serde(default)]
    weight: Option<i32>,
}

/// An affinity registered by a policy and appended to the affinity list
/// of every eligible container, transparent to annotations.
pub struct ImplicitAffinity {
    pub name: String,

    /// Containers the affinity applies to; `None` means all.
    pub eligible: Option<Box<dyn Fn(&Container) -> bool>>,

    pub affinity: Affinity,
}

impl std::fmt::Debug for ImplicitAffinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImplicitAffinity")
            .field("name", &self.name)
            .field("eligible", &self.eligible.is_some())
            .field("affinity", &self.affinity)
            .finish()
    }
}

impl ImplicitAffinity {
    pub fn applies_to(&self, container: &Container) -> bool {
        self.eligible.as_ref().is_none_or(|eligible| eligible(container))
    }
}

/// Per-container affinity lists parsed from one pod's annotations.
pub type AffinityMap = BTreeMap<String, Vec<Affinity>>;

/// Parses an `affinity`/`anti-affinity` annotation value.
///
/// The simple form (container name to list of peer names) is tried first
/// and expanded to its symmetric closure. Anything that does not have
/// that shape falls through to the full form, whose parse errors are
/// fatal for the annotation.
///
/// `pod_scope` is the scope substituted for affinities that do not
/// declare one; `default_weight` fills omitted weights and is negative
/// when parsing the anti-affinity key.
pub fn parse_affinities(
    value: &str,
    pod_scope: &Expression,
    default_weight: i32,
) -> Result<AffinityMap> {
    if let Ok(simple) = serde_yaml::from_str::<BTreeMap<String, Vec<String>>>(value) {
        debug!("affinity annotation parsed in simple form");
        return Ok(expand_simple(&simple, pod_scope, default_weight));
    }

    let full: BTreeMap<String, Vec<AffinitySpec>> =
        serde_yaml::from_str(value).context(ParseAnnotationSnafu)?;

    let mut affinities = AffinityMap::new();
    for (container, specs) in full {
        let mut list = Vec::with_capacity(specs.len());
        for spec in specs {
            let scope = spec.scope.unwrap_or_else(|| pod_scope.clone());
            scope
                .validate()
                .context(InvalidExpressionSnafu { container: &container })?;
            spec.match_expr
                .validate()
                .context(InvalidExpressionSnafu { container: &container })?;
            list.push(Affinity::new(
                scope,
                spec.match_expr,
                spec.weight.unwrap_or(default_weight),
            ));
        }
        affinities.insert(container, list);
    }

    Ok(affinities)
}

/// Expands the simple form into its symmetric closure: `a: [b]` also
/// yields `b: [a]`. Each name's peer set becomes one affinity matching
/// peer names within the pod scope.
fn expand_simple(
    simple: &BTreeMap<String, Vec<String>>,
    pod_scope: &Expression,
    weight: i32,
) -> AffinityMap {
    let mut peers: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (name, listed) in simple {
        for peer in listed {
            peers.entry(name).or_default().insert(peer);
            peers.entry(peer).or_default().insert(name);
        }
    }

    peers
        .into_iter()
        .map(|(name, peers)| {
            let match_expr = match peers.len() {
                1 => Expression::new("name", Operator::Equals, peers),
                _ => Expression::new("name", Operator::In, peers),
            };
            (
                name.to_owned(),
                vec![Affinity::new(pod_scope.clone(), match_expr, weight)],
            )
        })
        .collect()
}

/// Sums per-container weights across several evaluation results.
pub fn sum_weights(
    results: impl IntoIterator<Item = BTreeMap<String, i32>>,
) -> BTreeMap<String, i32> {
    let mut sums = BTreeMap::new();
    for result in results {
        for (id, weight) in result {
            *sums.entry(id).or_insert(0) += weight;
        }
    }
    sums
}

fn clamp_weight(weight: i32) -> i32 {
    weight.clamp(-USER_WEIGHT_CUTOFF, USER_WEIGHT_CUTOFF)
}
