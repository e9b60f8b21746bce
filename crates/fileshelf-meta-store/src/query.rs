//! Metadata query compiler
//!
//! Turns [`Criteria`] into a single parameterized SELECT over `files`:
//!
//! - `and` filters add one aliased inner join on `file_metadata` per
//!   predicate instance, so repeated predicates on the same name are
//!   independent constraints.
//! - `or` filters add a single `IN (SELECT file_id ...)` subquery with the
//!   predicates OR-ed together.
//! - ordering by `metadata:<name>` left-joins that name and groups rows per
//!   file (smallest value when ascending, largest when descending).
//!
//! Every user-supplied string is bound as a positional parameter; SQL text
//! is assembled only from fixed fragments and generated aliases.

use fileshelf_common::{Error, FileId, Result};
use rusqlite::types::Value;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

/// Most predicate instances allowed in an `and` filter (one join each)
pub const MAX_AND_PREDICATES: usize = 60;

/// Page size used when a query does not set `limit`
pub const DEFAULT_LIMIT: u32 = 100;

/// Prefix selecting a metadata name as the order column
pub const METADATA_ORDER_PREFIX: &str = "metadata:";

/// What to look up
///
/// `ids` wins over `slugs`, which wins over `filter`/`order`/`limit`/`offset`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Criteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<FileId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slugs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

impl Criteria {
    /// Match everything (up to the default limit)
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Exactly these ids
    #[must_use]
    pub fn ids(ids: impl IntoIterator<Item = FileId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Exactly these slugs
    #[must_use]
    pub fn slugs<S: Into<String>>(slugs: impl IntoIterator<Item = S>) -> Self {
        Self {
            slugs: Some(slugs.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// How predicates combine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    And,
    Or,
}

/// A single metadata predicate value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// Name present with any value (`true` on the wire)
    Exists,
    /// Name present with exactly this value
    Equals(String),
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Exists => serializer.serialize_bool(true),
            Self::Equals(v) => serializer.serialize_str(v),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPredicate {
    Flag(bool),
    Text(String),
    Number(serde_json::Number),
}

impl From<RawPredicate> for Predicate {
    fn from(raw: RawPredicate) -> Self {
        match raw {
            RawPredicate::Flag(true) => Self::Exists,
            RawPredicate::Flag(false) => Self::Equals("false".to_string()),
            RawPredicate::Text(s) => Self::Equals(s),
            RawPredicate::Number(n) => Self::Equals(n.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        RawPredicate::deserialize(deserializer).map(Into::into)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Predicate),
    Many(Vec<Predicate>),
}

fn deserialize_predicates<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Vec<Predicate>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, OneOrMany>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, p)| match p {
            OneOrMany::One(p) => (name, vec![p]),
            OneOrMany::Many(ps) => (name, ps),
        })
        .collect())
}

/// Metadata filter: name mapped to one or more predicates
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub operator: Operator,
    #[serde(default, deserialize_with = "deserialize_predicates")]
    pub metadata: BTreeMap<String, Vec<Predicate>>,
}

impl Filter {
    /// Empty `and` filter
    #[must_use]
    pub fn and() -> Self {
        Self::default()
    }

    /// Empty `or` filter
    #[must_use]
    pub fn or() -> Self {
        Self {
            operator: Operator::Or,
            metadata: BTreeMap::new(),
        }
    }

    /// Require `name = value`
    #[must_use]
    pub fn eq(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .entry(name.into())
            .or_default()
            .push(Predicate::Equals(value.into()));
        self
    }

    /// Require `name` to be present
    #[must_use]
    pub fn exists(mut self, name: impl Into<String>) -> Self {
        self.metadata
            .entry(name.into())
            .or_default()
            .push(Predicate::Exists);
        self
    }

    /// Total predicate instances across all names
    #[must_use]
    pub fn predicate_count(&self) -> usize {
        self.metadata.values().map(Vec::len).sum()
    }

    fn clauses(&self) -> impl Iterator<Item = (&str, &Predicate)> {
        self.metadata
            .iter()
            .flat_map(|(name, ps)| ps.iter().map(move |p| (name.as_str(), p)))
    }
}

/// Sort direction; anything other than `asc` sorts descending
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(if s.eq_ignore_ascii_case("asc") {
            Self::Asc
        } else {
            Self::Desc
        })
    }
}

/// Single-field ordering
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// `slug` or `metadata:<name>`
    pub column: String,
    #[serde(default, alias = "dir")]
    pub direction: Direction,
}

impl Order {
    #[must_use]
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    #[must_use]
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Desc,
        }
    }

    fn key(&self) -> Result<OrderKey<'_>> {
        if self.column == "slug" {
            return Ok(OrderKey::Slug);
        }
        match self.column.strip_prefix(METADATA_ORDER_PREFIX) {
            Some(name) if !name.is_empty() => Ok(OrderKey::Metadata(name)),
            _ => Err(Error::invalid_input(format!(
                "unknown order column {:?}, expected \"slug\" or \"metadata:<name>\"",
                self.column
            ))),
        }
    }
}

enum OrderKey<'a> {
    Slug,
    Metadata(&'a str),
}

/// A compiled SELECT and its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Accumulates SQL fragments and the parameters they bind, in order
#[derive(Default)]
struct SelectBuilder {
    joins: Vec<String>,
    conditions: Vec<String>,
    group_by: Option<&'static str>,
    order_by: Option<String>,
    limit: Option<(i64, i64)>,
    join_params: Vec<Value>,
    where_params: Vec<Value>,
}

impl SelectBuilder {
    /// Inner join one aliased metadata row satisfying `predicate`
    fn join_predicate(&mut self, alias: &str, name: &str, predicate: &Predicate) {
        let mut join = format!(
            "JOIN file_metadata {alias} ON {alias}.file_id = f.id AND {alias}.name = ?"
        );
        self.join_params.push(Value::Text(name.to_string()));
        if let Predicate::Equals(value) = predicate {
            let _ = write!(join, " AND {alias}.value = ?");
            self.join_params.push(Value::Text(value.clone()));
        }
        self.joins.push(join);
    }

    fn left_join_name(&mut self, alias: &str, name: &str) {
        self.joins.push(format!(
            "LEFT JOIN file_metadata {alias} ON {alias}.file_id = f.id AND {alias}.name = ?"
        ));
        self.join_params.push(Value::Text(name.to_string()));
    }

    /// `f.id IN (SELECT file_id ... WHERE p1 OR p2 ...)`
    fn any_predicate<'a>(&mut self, predicates: impl Iterator<Item = (&'a str, &'a Predicate)>) {
        let mut parts = Vec::new();
        for (name, predicate) in predicates {
            self.where_params.push(Value::Text(name.to_string()));
            match predicate {
                Predicate::Exists => parts.push("(name = ?)"),
                Predicate::Equals(value) => {
                    self.where_params.push(Value::Text(value.clone()));
                    parts.push("(name = ? AND value = ?)");
                }
            }
        }
        self.conditions.push(format!(
            "f.id IN (SELECT file_id FROM file_metadata WHERE {})",
            parts.join(" OR ")
        ));
    }

    fn build(self) -> CompiledQuery {
        let mut sql = String::from("SELECT f.id, f.slug FROM files f");
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        if let Some(group_by) = self.group_by {
            sql.push_str(" GROUP BY ");
            sql.push_str(group_by);
        }
        if let Some(order_by) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }

        let mut params = self.join_params;
        params.extend(self.where_params);
        if let Some((limit, offset)) = self.limit {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Value::Integer(limit));
            params.push(Value::Integer(offset));
        }
        CompiledQuery { sql, params }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Compile the filter/order/page path of `criteria`
///
/// `ids` and `slugs` are resolved separately by [`compile`].
fn compile_filtered(criteria: &Criteria) -> Result<CompiledQuery> {
    let mut builder = SelectBuilder::default();

    if let Some(filter) = criteria.filter.as_ref().filter(|f| !f.metadata.is_empty()) {
        if let Some((name, _)) = filter.metadata.iter().find(|(_, ps)| ps.is_empty()) {
            return Err(Error::invalid_input(format!(
                "metadata filter {name:?} has no values"
            )));
        }
        match filter.operator {
            Operator::And => {
                let count = filter.predicate_count();
                if count > MAX_AND_PREDICATES {
                    return Err(Error::TooManyPredicates {
                        count,
                        max: MAX_AND_PREDICATES,
                    });
                }
                for (i, (name, predicate)) in filter.clauses().enumerate() {
                    builder.join_predicate(&format!("m{i}"), name, predicate);
                }
            }
            Operator::Or => builder.any_predicate(filter.clauses()),
        }
    }

    // Joins can yield one row per matching value; collapse to one per file
    builder.group_by = Some("f.id");

    if let Some(order) = &criteria.order {
        let dir = match order.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        builder.order_by = Some(match order.key()? {
            OrderKey::Slug => format!("f.slug {dir}"),
            OrderKey::Metadata(name) => {
                builder.left_join_name("ordm", name);
                let agg = match order.direction {
                    Direction::Asc => "MIN",
                    Direction::Desc => "MAX",
                };
                format!("{agg}(ordm.value) {dir}, f.slug {dir}")
            }
        });
    }

    let limit = criteria.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = criteria.offset.unwrap_or(0);
    builder.limit = Some((i64::from(limit), i64::from(offset)));

    Ok(builder.build())
}

/// Compile `criteria` into a single SELECT returning `(id, slug)` rows
///
/// Returns `Ok(None)` when the criteria can only match nothing (an empty
/// `ids` or `slugs` list), so callers can skip the round trip.
pub fn compile(criteria: &Criteria) -> Result<Option<CompiledQuery>> {
    if let Some(ids) = &criteria.ids {
        let mut seen = HashSet::new();
        let params: Vec<Value> = ids
            .iter()
            .filter(|id| seen.insert(**id))
            .map(|id| Value::Blob(id.as_bytes().to_vec()))
            .collect();
        if params.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT f.id, f.slug FROM files f WHERE f.id IN ({})",
            placeholders(params.len())
        );
        return Ok(Some(CompiledQuery { sql, params }));
    }

    if let Some(slugs) = &criteria.slugs {
        let mut seen = HashSet::new();
        let params: Vec<Value> = slugs
            .iter()
            .filter(|s| seen.insert(s.as_str()))
            .map(|s| Value::Text(s.clone()))
            .collect();
        if params.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT f.id, f.slug FROM files f WHERE f.slug IN ({})",
            placeholders(params.len())
        );
        return Ok(Some(CompiledQuery { sql, params }));
    }

    compile_filtered(criteria).map(Some)
}

/// Metadata rows for exactly `ids`, in insertion order
pub(crate) fn hydration_query(ids: &[FileId]) -> CompiledQuery {
    CompiledQuery {
        sql: format!(
            "SELECT file_id, name, value FROM file_metadata WHERE file_id IN ({}) ORDER BY rowid",
            placeholders(ids.len())
        ),
        params: ids
            .iter()
            .map(|id| Value::Blob(id.as_bytes().to_vec()))
            .collect(),
    }
}
