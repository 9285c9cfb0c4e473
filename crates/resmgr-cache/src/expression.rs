//! Typed match expressions evaluated against cached pods and containers.
//!
//! An [`Expression`] names a key, an operator and operand values; the key
//! resolves against anything implementing the [`Evaluable`] capability.
//! Slash-separated keys (`pod/namespace`) descend through the object
//! graph, so a container expression can reach into its pod.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};
use tracing::debug;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("operator {op} requires a non-empty key"))]
    MissingKey { op: Operator },

    #[snafu(display("operator {op} expects {expected} value(s), got {got}"))]
    InvalidValueCount {
        op: Operator,
        expected: &'static str,
        got: usize,
    },

    #[snafu(display("unknown key {key:?}"))]
    UnknownKey { key: String },

    #[snafu(display("key {key:?} does not resolve to an object, cannot descend into it"))]
    NotAnObject { key: String },

    #[snafu(display("key {key:?} resolves to an object, not a comparable value"))]
    NotAValue { key: String },
}

/// Expression operators. Scalar operators compare the resolved value to
/// `values[0]`, set operators test membership in `values`, and the
/// `Match*` combinators fold sub-expressions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Operator {
    Equals,
    NotEqual,
    In,
    NotIn,
    Exists,
    NotExist,
    AlwaysTrue,
    Matches,
    MatchesNot,
    MatchAny,
    MatchNone,
    MatchAll,
}

/// A single typed value a key can resolve to.
pub enum EvalValue<'a> {
    Str(String),
    Set(BTreeSet<String>),
    Map(BTreeMap<String, String>),
    Object(Box<dyn Evaluable + 'a>),
    Missing,
}

/// Capability of resolving expression keys to values. Implemented by the
/// cache's container and pod views.
///
/// Unknown keys are errors; the expression engine treats them as "no
/// match".
pub trait Evaluable {
    fn eval(&self, key: &str) -> Result<EvalValue<'_>>;
}

impl<T: Evaluable + ?Sized> Evaluable for &T {
    fn eval(&self, key: &str) -> Result<EvalValue<'_>> {
        (**self).eval(key)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    #[serde(default)]
    pub key: String,

    pub op: Operator,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,

    /// Sub-expressions of the `MatchAny`/`MatchNone`/`MatchAll`
    /// combinators.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exprs: Vec<Expression>,
}

impl Default for Operator {
    fn default() -> Self {
        Self::AlwaysTrue
    }
}

impl Expression {
    pub fn new(
        key: impl Into<String>,
        op: Operator,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            key: key.into(),
            op,
            values: values.into_iter().map(Into::into).collect(),
            exprs: Vec::new(),
        }
    }

    /// The unconditionally-true expression, the idiomatic "global" scope.
    pub fn always_true() -> Self {
        Self {
            op: Operator::AlwaysTrue,
            ..Self::default()
        }
    }

    pub fn combine(op: Operator, exprs: impl IntoIterator<Item = Expression>) -> Self {
        Self {
            op,
            exprs: exprs.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Checks key presence and `values` arity for the operator, and
    /// recurses into combinator sub-expressions.
    pub fn validate(&self) -> Result<()> {
        use Operator::*;

        match self.op {
            Equals | NotEqual | Matches | MatchesNot => {
                ensure!(!self.key.is_empty(), MissingKeySnafu { op: self.op });
                ensure!(
                    self.values.len() == 1,
                    InvalidValueCountSnafu {
                        op: self.op,
                        expected: "exactly 1",
                        got: self.values.len(),
                    }
                );
            }
            In | NotIn => {
                ensure!(!self.key.is_empty(), MissingKeySnafu { op: self.op });
                ensure!(
                    !self.values.is_empty(),
                    InvalidValueCountSnafu {
                        op: self.op,
                        expected: "at least 1",
                        got: self.values.len(),
                    }
                );
            }
            Exists | NotExist => {
                ensure!(!self.key.is_empty(), MissingKeySnafu { op: self.op });
                ensure!(
                    self.values.is_empty(),
                    InvalidValueCountSnafu {
                        op: self.op,
                        expected: "no",
                        got: self.values.len(),
                    }
                );
            }
            AlwaysTrue | MatchAny | MatchNone | MatchAll => {
                ensure!(
                    self.values.is_empty(),
                    InvalidValueCountSnafu {
                        op: self.op,
                        expected: "no",
                        got: self.values.len(),
                    }
                );
            }
        }

        self.exprs.iter().try_for_each(Self::validate)
    }

    /// Evaluates the expression against a subject. Resolution failures
    /// (unknown keys, type mismatches) log at debug level and count as
    /// "no match" for the positive operators.
    pub fn evaluate(&self, subject: &dyn Evaluable) -> bool {
        use Operator::*;

        match self.op {
            AlwaysTrue => true,
            MatchAll => self.exprs.iter().all(|e| e.evaluate(subject)),
            MatchAny => self.exprs.iter().any(|e| e.evaluate(subject)),
            MatchNone => !self.exprs.iter().any(|e| e.evaluate(subject)),
            Equals => self.matches_value(subject, |v, want| v == want),
            NotEqual => !self.matches_value(subject, |v, want| v == want),
            In => self.value_in_set(subject),
            NotIn => !self.value_in_set(subject),
            Exists => self.key_exists(subject),
            NotExist => !self.key_exists(subject),
            Matches => self.matches_glob(subject),
            MatchesNot => !self.matches_glob(subject),
        }
    }

    fn matches_value(&self, subject: &dyn Evaluable, pred: impl Fn(&str, &str) -> bool) -> bool {
        let Some(value) = self.resolved_string(subject) else {
            return false;
        };
        self.values.first().is_some_and(|want| pred(&value, want))
    }

    fn value_in_set(&self, subject: &dyn Evaluable) -> bool {
        let Some(value) = self.resolved_string(subject) else {
            return false;
        };
        self.values.iter().any(|want| *want == value)
    }

    fn key_exists(&self, subject: &dyn Evaluable) -> bool {
        match resolve(subject, &self.key) {
            Ok(EvalValue::Missing) => false,
            Ok(_) => true,
            Err(err) => {
                debug!(key = %self.key, error = %err, "key resolution failed");
                false
            }
        }
    }

    fn matches_glob(&self, subject: &dyn Evaluable) -> bool {
        let Some(value) = self.resolved_string(subject) else {
            return false;
        };
        let Some(pattern) = self.values.first() else {
            return false;
        };
        match globset::Glob::new(pattern) {
            Ok(glob) => glob.compile_matcher().is_match(&value),
            Err(err) => {
                debug!(pattern = %pattern, error = %err, "invalid glob pattern");
                false
            }
        }
    }

    fn resolved_string(&self, subject: &dyn Evaluable) -> Option<String> {
        match resolve(subject, &self.key) {
            Ok(EvalValue::Str(value)) => Some(value),
            Ok(EvalValue::Missing) => None,
            Ok(_) => {
                debug!(key = %self.key, "key resolved to a non-string value");
                None
            }
            Err(err) => {
                debug!(key = %self.key, error = %err, "key resolution failed");
                None
            }
        }
    }
}

impl std::fmt::Display for Expression {
    /// Renders a compact, log-friendly form of the expression.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Operator::*;

        match self.op {
            AlwaysTrue => write!(f, "true"),
            Equals => write!(f, "{} == {}", self.key, self.values.join("")),
            NotEqual => write!(f, "{} != {}", self.key, self.values.join("")),
            In => write!(f, "{} in [{}]", self.key, self.values.join(",")),
            NotIn => write!(f, "{} not in [{}]", self.key, self.values.join(",")),
            Exists => write!(f, "{} exists", self.key),
            NotExist => write!(f, "{} not exists", self.key),
            Matches => write!(f, "{} matches {}", self.key, self.values.join("")),
            MatchesNot => write!(f, "{} matches not {}", self.key, self.values.join("")),
            MatchAny | MatchNone | MatchAll => {
                let exprs: Vec<String> = self.exprs.iter().map(ToString::to_string).collect();
                write!(f, "{}({})", self.op, exprs.join(", "))
            }
        }
    }
}

/// Resolves a possibly slash-separated key against a subject, descending
/// through objects and indexing into maps.
pub fn resolve<'a>(subject: &'a dyn Evaluable, key: &str) -> Result<EvalValue<'a>> {
    let Some((head, rest)) = key.split_once('/') else {
        return subject.eval(key);
    };

    match subject.eval(head)? {
        EvalValue::Object(object) => resolve_nested(&*object, rest),
        EvalValue::Map(map) => Ok(map
            .get(rest)
            .map_or(EvalValue::Missing, |value| EvalValue::Str(value.clone()))),
        EvalValue::Missing => Ok(EvalValue::Missing),
        _ => NotAnObjectSnafu { key: head }.fail(),
    }
}

/// Recursive part of [`resolve`]. Paths that descend below the root must
/// terminate at a plain value so the result can outlive the intermediate
/// objects.
fn resolve_nested(subject: &dyn Evaluable, key: &str) -> Result<EvalValue<'static>> {
    let Some((head, rest)) = key.split_once('/') else {
        return match subject.eval(key)? {
            EvalValue::Str(value) => Ok(EvalValue::Str(value)),
            EvalValue::Set(set) => Ok(EvalValue::Set(set)),
            EvalValue::Map(map) => Ok(EvalValue::Map(map)),
            EvalValue::Missing => Ok(EvalValue::Missing),
            EvalValue::Object(_) => NotAValueSnafu { key }.fail(),
        };
    };

    match subject.eval(head)? {
        EvalValue::Object(object) => resolve_nested(&*object, rest),
        EvalValue::Map(map) => Ok(map
            .get(rest)
            .map_or(EvalValue::Missing, |value| EvalValue::Str(value.clone()))),
        EvalValue::Missing => Ok(EvalValue::Missing),
        _ => NotAnObjectSnafu { key: head }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    /// A minimal Evaluable for tests: a name, labels, and an optional
    /// nested parent object.
    struct Subject {
        name: &'static str,
        labels: BTreeMap<String, String>,
        parent: Option<Box<Subject>>,
    }

    impl Subject {
        fn new(name: &'static str, labels: &[(&str, &str)]) -> Self {
            Self {
                name,
                labels: labels
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
                parent: None,
            }
        }

        fn with_parent(mut self, parent: Subject) -> Self {
            self.parent = Some(Box::new(parent));
            self
        }
    }

    impl Evaluable for Subject {
        fn eval(&self, key: &str) -> Result<EvalValue<'_>> {
            match key {
                "name" => Ok(EvalValue::Str(self.name.to_owned())),
                "labels" => Ok(EvalValue::Map(self.labels.clone())),
                "pod" => match &self.parent {
                    Some(parent) => Ok(EvalValue::Object(Box::new(ParentView(parent)))),
                    None => Ok(EvalValue::Missing),
                },
                key => UnknownKeySnafu { key }.fail(),
            }
        }
    }

    struct ParentView<'a>(&'a Subject);

    impl Evaluable for ParentView<'_> {
        fn eval(&self, key: &str) -> Result<EvalValue<'_>> {
            self.0.eval(key)
        }
    }

    fn expr(key: &str, op: Operator, values: &[&str]) -> Expression {
        Expression::new(key, op, values.iter().copied())
    }

    #[rstest]
    #[case(expr("name", Operator::Equals, &["c1"]), true)]
    #[case(expr("name", Operator::Equals, &["c2"]), false)]
    #[case(expr("name", Operator::In, &["c2", "c1"]), true)]
    #[case(expr("name", Operator::In, &["c2", "c3"]), false)]
    #[case(expr("name", Operator::Exists, &[]), true)]
    #[case(expr("bogus", Operator::Exists, &[]), false)]
    #[case(expr("name", Operator::Matches, &["c*"]), true)]
    #[case(expr("name", Operator::Matches, &["d*"]), false)]
    #[case(expr("labels/app", Operator::Equals, &["web"]), true)]
    #[case(expr("labels/other", Operator::Equals, &["web"]), false)]
    #[case(expr("", Operator::AlwaysTrue, &[]), true)]
    fn evaluate_cases(#[case] expression: Expression, #[case] expected: bool) {
        let subject = Subject::new("c1", &[("app", "web")]);
        assert_eq!(expression.evaluate(&subject), expected);
    }

    #[rstest]
    #[case(Operator::Equals, Operator::NotEqual)]
    #[case(Operator::In, Operator::NotIn)]
    #[case(Operator::Matches, Operator::MatchesNot)]
    fn negated_pairs_are_complements(#[case] pos: Operator, #[case] neg: Operator) {
        let subject = Subject::new("c1", &[]);
        for key in ["name", "labels/app", "bogus"] {
            let positive = expr(key, pos, &["c1"]).evaluate(&subject);
            let negative = expr(key, neg, &["c1"]).evaluate(&subject);
            assert_ne!(positive, negative, "{pos}/{neg} on key {key}");
        }
    }

    #[test]
    fn exists_pairs_are_complements() {
        let subject = Subject::new("c1", &[]);
        for key in ["name", "pod"] {
            assert_ne!(
                expr(key, Operator::Exists, &[]).evaluate(&subject),
                expr(key, Operator::NotExist, &[]).evaluate(&subject),
            );
        }
    }

    #[test]
    fn empty_combinator_identities() {
        let subject = Subject::new("c1", &[]);
        assert!(Expression::combine(Operator::MatchAll, []).evaluate(&subject));
        assert!(!Expression::combine(Operator::MatchAny, []).evaluate(&subject));
        assert!(Expression::combine(Operator::MatchNone, []).evaluate(&subject));
    }

    #[test]
    fn combinators_fold_subexpressions() {
        let subject = Subject::new("c1", &[("app", "web")]);
        let yes = expr("name", Operator::Equals, &["c1"]);
        let no = expr("name", Operator::Equals, &["c2"]);

        assert!(Expression::combine(Operator::MatchAny, [no.clone(), yes.clone()]).evaluate(&subject));
        assert!(!Expression::combine(Operator::MatchAll, [yes.clone(), no.clone()]).evaluate(&subject));
        assert!(Expression::combine(Operator::MatchNone, [no]).evaluate(&subject));
    }

    #[test]
    fn descends_into_parent_object() {
        let parent = Subject::new("pod0", &[("tier", "backend")]);
        let subject = Subject::new("c1", &[]).with_parent(parent);

        assert!(expr("pod/name", Operator::Equals, &["pod0"]).evaluate(&subject));
        assert!(expr("pod/labels/tier", Operator::Equals, &["backend"]).evaluate(&subject));
        assert!(!expr("pod/labels/tier", Operator::Equals, &["frontend"]).evaluate(&subject));
    }

    #[test]
    fn missing_parent_resolves_to_missing() {
        let subject = Subject::new("c1", &[]);
        assert!(!expr("pod/name", Operator::Exists, &[]).evaluate(&subject));
        assert!(expr("pod/name", Operator::NotExist, &[]).evaluate(&subject));
    }

    #[rstest]
    #[case(expr("", Operator::Equals, &["x"]))]
    #[case(expr("name", Operator::Equals, &[]))]
    #[case(expr("name", Operator::Equals, &["a", "b"]))]
    #[case(expr("name", Operator::In, &[]))]
    #[case(expr("name", Operator::Exists, &["x"]))]
    #[case(expr("", Operator::Matches, &["*"]))]
    fn validate_rejects_bad_arity(#[case] expression: Expression) {
        assert!(expression.validate().is_err());
    }

    #[rstest]
    #[case(expr("name", Operator::Equals, &["x"]))]
    #[case(expr("name", Operator::In, &["x", "y"]))]
    #[case(expr("name", Operator::Exists, &[]))]
    #[case(Expression::always_true())]
    fn validate_accepts_well_formed(#[case] expression: Expression) {
        assert!(expression.validate().is_ok());
    }

    #[test]
    fn validate_recurses_into_combinators() {
        let bad = Expression::combine(Operator::MatchAll, [expr("", Operator::Equals, &["x"])]);
        assert!(bad.validate().is_err());
    }

    #[rstest]
    #[case(expr("name", Operator::Equals, &["c1"]), "name == c1")]
    #[case(expr("name", Operator::In, &["a", "b"]), "name in [a,b]")]
    #[case(expr("pod/uid", Operator::Exists, &[]), "pod/uid exists")]
    #[case(Expression::always_true(), "true")]
    fn display_form(#[case] expression: Expression, #[case] expected: &str) {
        assert_eq!(expression.to_string(), expected);
    }

    #[test]
    fn display_of_combinators_nests() {
        let expression = Expression::combine(
            Operator::MatchAll,
            [expr("name", Operator::Equals, &["c1"]), Expression::always_true()],
        );
        assert_eq!(expression.to_string(), "MatchAll(name == c1, true)");
    }

    #[test]
    fn unknown_operator_fails_deserialization() {
        let err = serde_yaml::from_str::<Expression>("key: name\nop: Sorta\nvalues: [x]");
        assert!(err.is_err());
    }

    #[test]
    fn deserializes_with_defaulted_fields() {
        let expression: Expression = serde_yaml::from_str("op: AlwaysTrue").unwrap();
        assert_eq!(expression, Expression::always_true());
    }
}
