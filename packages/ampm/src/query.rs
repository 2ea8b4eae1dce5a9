//! The attribute query language: matching, uniqueness, and selection.
//!
//! A query names a type prefix and a set of `key=expression` constraints.
//! Expressions are either literal strings or `@tag:body` forms, parsed once
//! into [`Expr`] and dispatched uniformly afterwards. Resolution runs in
//! three stages over the candidate records:
//!
//! 1. **Filter**: drop candidates failing any matcher constraint.
//! 2. **Uniqueness**: partition the survivors by their *relevant* attribute
//!    values; more than one partition is an ambiguous query.
//! 3. **Selection**: within the surviving partition, selector constraints
//!    (`@semver`, `@date:latest`, `@num:*`) reduce to the extremal
//!    candidates, in declared order. Any remaining tie is ambiguous; a
//!    query never silently picks one of several records.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use color_eyre::Result;
use itertools::Itertools as _;
use jiff::Timestamp;
use lazy_regex::regex::Regex;
use tracing::instrument;

use crate::{
    artifact::{ArtifactId, ArtifactType, Record},
    error::Fault,
};

/// The pseudo-key that, constrained with `@ignore`, declares that attributes
/// not named in the query are ignored for uniqueness.
pub const WILDCARD_KEY: &str = "@any";

/// One parsed attribute expression.
#[derive(Clone, Debug)]
pub enum Expr {
    /// Exact string equality.
    Literal(String),
    /// No filter; the attribute is also ignored for uniqueness.
    Ignore,
    /// The whole value matches the pattern.
    Regex(Regex),
    /// The whole value matches the shell-style glob.
    Glob(glob::Pattern),
    /// The value parses as a semantic version inside the range;
    /// selection picks the greatest.
    Semver(semver::VersionReq),
    /// Selection picks the greatest ISO-8601 instant.
    DateLatest,
    /// Selection picks the greatest integer.
    NumBiggest,
    /// Selection picks the least integer.
    NumSmallest,
}

impl Expr {
    /// Parse the right-hand side of a `key=expr` constraint.
    pub fn parse(raw: &str) -> Result<Self, Fault> {
        let Some(tagged) = raw.strip_prefix('@') else {
            return Ok(Expr::Literal(raw.to_string()));
        };
        let (tag, body) = match tagged.split_once(':') {
            Some((tag, body)) => (tag, Some(body)),
            None => (tagged, None),
        };
        match (tag, body) {
            ("ignore", None) => Ok(Expr::Ignore),
            ("regex", Some(pattern)) => Regex::new(&format!("^(?:{pattern})$"))
                .map(Expr::Regex)
                .map_err(|err| Fault::MalformedExpression(format!("@regex:{pattern}: {err}"))),
            ("glob", Some(pattern)) => glob::Pattern::new(pattern)
                .map(Expr::Glob)
                .map_err(|err| Fault::MalformedExpression(format!("@glob:{pattern}: {err}"))),
            ("semver", Some(range)) => semver::VersionReq::parse(range)
                .map(Expr::Semver)
                .map_err(|err| Fault::MalformedExpression(format!("@semver:{range}: {err}"))),
            ("date", Some("latest")) => Ok(Expr::DateLatest),
            ("num", Some("biggest")) => Ok(Expr::NumBiggest),
            ("num", Some("smallest")) => Ok(Expr::NumSmallest),
            _ => Err(Fault::MalformedExpression(format!("unknown expression: @{tagged}"))),
        }
    }

    /// Whether this expression filters candidates.
    fn is_matcher(&self) -> bool {
        matches!(
            self,
            Expr::Literal(_) | Expr::Regex(_) | Expr::Glob(_) | Expr::Semver(_)
        )
    }

    /// Whether this expression picks among multiple matches.
    fn is_selector(&self) -> bool {
        matches!(
            self,
            Expr::Semver(_) | Expr::DateLatest | Expr::NumBiggest | Expr::NumSmallest
        )
    }

    /// Whether the candidate value satisfies this expression's matcher.
    /// Non-matcher expressions accept everything.
    fn matches(&self, key: &str, value: &str) -> Result<bool, Fault> {
        match self {
            Expr::Literal(want) => Ok(want == value),
            Expr::Ignore | Expr::DateLatest | Expr::NumBiggest | Expr::NumSmallest => Ok(true),
            Expr::Regex(re) => Ok(re.is_match(value)),
            Expr::Glob(pattern) => Ok(pattern.matches(value)),
            Expr::Semver(range) => parse_version(key, value).map(|v| range.matches(&v)),
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Ignore => write!(f, "@ignore"),
            Expr::Regex(re) => {
                let pattern = re.as_str();
                let pattern = pattern
                    .strip_prefix("^(?:")
                    .and_then(|p| p.strip_suffix(")$"))
                    .unwrap_or(pattern);
                write!(f, "@regex:{pattern}")
            }
            Expr::Glob(pattern) => write!(f, "@glob:{}", pattern.as_str()),
            Expr::Semver(range) => write!(f, "@semver:{range}"),
            Expr::DateLatest => write!(f, "@date:latest"),
            Expr::NumBiggest => write!(f, "@num:biggest"),
            Expr::NumSmallest => write!(f, "@num:smallest"),
        }
    }
}

/// One `key=expr` constraint.
#[derive(Clone, Debug)]
pub struct Constraint {
    pub key: String,
    pub expr: Expr,
}

impl Constraint {
    /// Parse the CLI's `-a KEY=EXPR` form.
    pub fn parse(raw: &str) -> Result<Self, Fault> {
        let (key, expr) = raw
            .split_once('=')
            .ok_or_else(|| Fault::MalformedExpression(format!("expected KEY=EXPR, got {raw:?}")))?;
        if key.is_empty() {
            return Err(Fault::MalformedExpression(format!("empty attribute key in {raw:?}")));
        }
        let expr = Expr::parse(expr)?;
        if key == WILDCARD_KEY && !matches!(expr, Expr::Ignore) {
            return Err(Fault::MalformedExpression(format!(
                "{WILDCARD_KEY} only accepts @ignore, got {expr}"
            )));
        }
        Ok(Self {
            key: key.to_string(),
            expr,
        })
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.expr)
    }
}

/// A parsed query: a type prefix (absent means any type) and constraints.
#[derive(Clone, Debug, Default)]
pub struct Query {
    pub type_prefix: Option<ArtifactType>,
    pub constraints: Vec<Constraint>,
}

impl Query {
    pub fn new(type_prefix: Option<ArtifactType>, constraints: Vec<Constraint>) -> Self {
        Self {
            type_prefix,
            constraints,
        }
    }

    /// Whether `@any=@ignore` is present.
    fn wildcard_ignore(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| c.key == WILDCARD_KEY && matches!(c.expr, Expr::Ignore))
    }

    /// The constraints on real attribute keys, in declared order.
    fn attribute_constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().filter(|c| c.key != WILDCARD_KEY)
    }

    /// Whether the record passes the type prefix and every matcher
    /// constraint. A matcher constraint on an attribute the record does not
    /// carry fails; selector-only and `@ignore` constraints never filter.
    pub fn matches(&self, record: &Record) -> Result<bool> {
        if let Some(prefix) = &self.type_prefix {
            if !record.artifact_type.is_within(prefix) {
                return Ok(false);
            }
        }
        for constraint in self.attribute_constraints() {
            if !constraint.expr.is_matcher() {
                continue;
            }
            match attribute(record, &constraint.key) {
                Some(value) => {
                    if !constraint.expr.matches(&constraint.key, &value)? {
                        return Ok(false);
                    }
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// The filter stage alone: every candidate that passes [`Query::matches`].
    ///
    /// `list` uses exactly this, so a `get` succeeds precisely when the
    /// listed survivors reduce to one record under uniqueness and selection.
    #[instrument(skip_all, fields(query = %self))]
    pub fn filter(
        &self,
        candidates: impl IntoIterator<Item = (ArtifactId, Record)>,
    ) -> Result<Vec<(ArtifactId, Record)>> {
        let mut survivors = Vec::new();
        for (id, record) in candidates {
            if self.matches(&record)? {
                survivors.push((id, record));
            }
        }
        Ok(survivors)
    }

    /// Resolve the query to exactly one record, or fail.
    #[instrument(skip_all, fields(query = %self))]
    pub fn select_one(
        &self,
        candidates: impl IntoIterator<Item = (ArtifactId, Record)>,
    ) -> Result<(ArtifactId, Record)> {
        let survivors = self.filter(candidates)?;
        if survivors.is_empty() {
            return Err(Fault::NotFound(self.to_string()).into());
        }

        let survivors = self.enforce_uniqueness(survivors)?;
        let mut remaining = self.apply_selectors(survivors)?;
        match remaining.len() {
            1 => Ok(remaining.remove(0)),
            _ => Err(Fault::AmbiguousQuery(format!(
                "indistinguishable candidates: {}",
                remaining.iter().map(|(id, _)| id).join(", ")
            ))
            .into()),
        }
    }

    /// Partition candidates by their relevant attribute values; more than
    /// one partition fails, naming the attributes that tell them apart.
    fn enforce_uniqueness(
        &self,
        survivors: Vec<(ArtifactId, Record)>,
    ) -> Result<Vec<(ArtifactId, Record)>> {
        let wildcard = self.wildcard_ignore();
        let explicit: BTreeSet<&str> = self
            .attribute_constraints()
            .map(|c| c.key.as_str())
            .collect();
        let excluded: BTreeSet<&str> = self
            .attribute_constraints()
            .filter(|c| matches!(c.expr, Expr::Ignore) || c.expr.is_selector())
            .map(|c| c.key.as_str())
            .collect();
        let relevant = |key: &str| {
            !excluded.contains(key) && (!wildcard || explicit.contains(key))
        };

        let mut partitions: BTreeMap<BTreeMap<String, String>, Vec<(ArtifactId, Record)>> =
            BTreeMap::new();
        for (id, record) in survivors {
            let signature = record
                .attributes
                .iter()
                .filter(|(key, _)| relevant(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect::<BTreeMap<_, _>>();
            partitions.entry(signature).or_default().push((id, record));
        }

        if partitions.len() > 1 {
            let keys: BTreeSet<&String> = partitions.keys().flat_map(|sig| sig.keys()).collect();
            let distinguishing = keys
                .into_iter()
                .filter(|key| {
                    partitions
                        .keys()
                        .map(|sig| sig.get(key.as_str()))
                        .unique()
                        .count()
                        > 1
                })
                .join(", ");
            return Err(Fault::AmbiguousQuery(format!(
                "candidates differ on attributes: {distinguishing}"
            ))
            .into());
        }

        Ok(partitions.into_values().next().unwrap_or_default())
    }

    /// Apply selector constraints in declared order, keeping the extremal
    /// candidates at each step. Candidates missing a selector's attribute
    /// cannot win it; a selector nobody carries is a no-op.
    fn apply_selectors(
        &self,
        mut remaining: Vec<(ArtifactId, Record)>,
    ) -> Result<Vec<(ArtifactId, Record)>> {
        for constraint in self.attribute_constraints() {
            remaining = match &constraint.expr {
                Expr::Semver(_) => reduce(remaining, &constraint.key, parse_version, Order::Greatest)?,
                Expr::DateLatest => reduce(remaining, &constraint.key, parse_instant, Order::Greatest)?,
                Expr::NumBiggest => reduce(remaining, &constraint.key, parse_integer, Order::Greatest)?,
                Expr::NumSmallest => reduce(remaining, &constraint.key, parse_integer, Order::Least)?,
                _ => remaining,
            };
        }
        Ok(remaining)
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.type_prefix {
            Some(prefix) => write!(f, "{prefix}")?,
            None => write!(f, "*")?,
        }
        for constraint in &self.constraints {
            write!(f, " -a {constraint}")?;
        }
        Ok(())
    }
}

/// A candidate's value for the given attribute key.
///
/// Records expose their publication instant as the `pubdate` pseudo-attribute
/// when no real attribute shadows it, so `-a pubdate=@date:latest` works
/// whether or not the uploader set one explicitly.
fn attribute<'a>(record: &'a Record, key: &str) -> Option<Cow<'a, str>> {
    match record.attributes.get(key) {
        Some(value) => Some(Cow::Borrowed(value.as_str())),
        None if key == "pubdate" => Some(Cow::Owned(record.pubdate.to_string())),
        None => None,
    }
}

enum Order {
    Greatest,
    Least,
}

/// Keep the candidates whose parsed value for `key` is extremal.
fn reduce<T: Ord + Clone>(
    items: Vec<(ArtifactId, Record)>,
    key: &str,
    parse: impl Fn(&str, &str) -> Result<T, Fault>,
    order: Order,
) -> Result<Vec<(ArtifactId, Record)>> {
    let mut parsed = Vec::new();
    let mut missing = Vec::new();
    for item in items {
        match attribute(&item.1, key) {
            Some(value) => {
                let value = parse(key, &value)?;
                parsed.push((value, item));
            }
            None => missing.push(item),
        }
    }
    if parsed.is_empty() {
        return Ok(missing);
    }

    let values = parsed.iter().map(|(value, _)| value);
    let best = match order {
        Order::Greatest => values.max(),
        Order::Least => values.min(),
    }
    .expect("parsed is non-empty")
    .clone();
    Ok(parsed
        .into_iter()
        .filter(|(value, _)| *value == best)
        .map(|(_, item)| item)
        .collect())
}

fn parse_version(key: &str, value: &str) -> Result<semver::Version, Fault> {
    value.parse().map_err(|_| Fault::TypeMismatch {
        key: key.to_string(),
        expected: "semantic version",
        value: value.to_string(),
    })
}

fn parse_instant(key: &str, value: &str) -> Result<Timestamp, Fault> {
    value.parse().map_err(|_| Fault::TypeMismatch {
        key: key.to_string(),
        expected: "ISO-8601 instant",
        value: value.to_string(),
    })
}

fn parse_integer(key: &str, value: &str) -> Result<i64, Fault> {
    value.parse().map_err(|_| Fault::TypeMismatch {
        key: key.to_string(),
        expected: "integer",
        value: value.to_string(),
    })
}
