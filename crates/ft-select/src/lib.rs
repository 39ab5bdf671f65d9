#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use ft_frame::{ColumnKind, ColumnPath, DataColumn, DataFrame};
use ft_types::DType;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("column '{path}' not found")]
    ColumnNotFound { path: ColumnPath },
    #[error("column '{path}' is not a column group")]
    NotAGroup { path: ColumnPath },
    #[error("column '{path}' is a {actual} column, expected {expected}")]
    KindMismatch {
        path: ColumnPath,
        expected: ColumnKind,
        actual: ColumnKind,
    },
    #[error("column '{path}' has type {actual}, expected {expected}")]
    DTypeMismatch {
        path: ColumnPath,
        expected: DType,
        actual: DType,
    },
    #[error("column index {index} out of range for {ncol} columns")]
    IndexOutOfBounds { index: usize, ncol: usize },
    #[error("expected exactly one column, selector resolved {count}")]
    ExpectedSingle { count: usize },
}

/// What to do with a name or path that does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedColumnsPolicy {
    #[default]
    Fail,
    Skip,
    /// Resolve to a zero-length placeholder carrying the requested path.
    Create,
}

/// Path plus optional expectations on kind and element type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub path: ColumnPath,
    pub kind: Option<ColumnKind>,
    pub dtype: Option<DType>,
}

impl ColumnRef {
    pub fn new(path: impl Into<ColumnPath>) -> Self {
        Self {
            path: path.into(),
            kind: None,
            dtype: None,
        }
    }

    pub fn value(path: impl Into<ColumnPath>) -> Self {
        Self {
            kind: Some(ColumnKind::Value),
            ..Self::new(path)
        }
    }

    pub fn typed(path: impl Into<ColumnPath>, dtype: DType) -> Self {
        Self {
            kind: Some(ColumnKind::Value),
            dtype: Some(dtype),
            ..Self::new(path)
        }
    }

    pub fn group(path: impl Into<ColumnPath>) -> Self {
        Self {
            kind: Some(ColumnKind::Group),
            ..Self::new(path)
        }
    }

    pub fn frame(path: impl Into<ColumnPath>) -> Self {
        Self {
            kind: Some(ColumnKind::Frame),
            ..Self::new(path)
        }
    }
}

type CustomPredicate = Arc<dyn Fn(&DataColumn, &ColumnPath) -> bool + Send + Sync>;

/// Predicate over column metadata.
#[derive(Clone)]
pub enum ColumnPredicate {
    NameIs(String),
    NameStartsWith(String),
    NameContains(String),
    KindIs(ColumnKind),
    /// Value columns whose element type is a subtype of the given one.
    DTypeIs(DType),
    Numeric,
    HasNulls,
    Not(Box<ColumnPredicate>),
    And(Box<ColumnPredicate>, Box<ColumnPredicate>),
    Or(Box<ColumnPredicate>, Box<ColumnPredicate>),
    Custom(CustomPredicate),
}

impl fmt::Debug for ColumnPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameIs(name) => f.debug_tuple("NameIs").field(name).finish(),
            Self::NameStartsWith(prefix) => f.debug_tuple("NameStartsWith").field(prefix).finish(),
            Self::NameContains(part) => f.debug_tuple("NameContains").field(part).finish(),
            Self::KindIs(kind) => f.debug_tuple("KindIs").field(kind).finish(),
            Self::DTypeIs(dtype) => f.debug_tuple("DTypeIs").field(dtype).finish(),
            Self::Numeric => f.write_str("Numeric"),
            Self::HasNulls => f.write_str("HasNulls"),
            Self::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Self::And(left, right) => f.debug_tuple("And").field(left).field(right).finish(),
            Self::Or(left, right) => f.debug_tuple("Or").field(left).field(right).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ColumnPredicate {
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&DataColumn, &ColumnPath) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    #[must_use]
    pub fn matches(&self, column: &DataColumn, path: &ColumnPath) -> bool {
        match self {
            Self::NameIs(name) => column.name() == name,
            Self::NameStartsWith(prefix) => column.name().starts_with(prefix.as_str()),
            Self::NameContains(part) => column.name().contains(part.as_str()),
            Self::KindIs(kind) => column.kind() == *kind,
            Self::DTypeIs(dtype) => column.dtype().is_some_and(|d| d.is_subtype_of(dtype)),
            Self::Numeric => column.dtype().is_some_and(DType::is_numeric),
            Self::HasNulls => column.has_nulls(),
            Self::Not(inner) => !inner.matches(column, path),
            Self::And(left, right) => left.matches(column, path) && right.matches(column, path),
            Self::Or(left, right) => left.matches(column, path) || right.matches(column, path),
            Self::Custom(predicate) => predicate(column, path),
        }
    }
}

/// Closed selector expression, evaluated by [`resolve`].
#[derive(Debug, Clone)]
pub enum Selector {
    /// Every top-level column.
    All,
    None,
    Name(String),
    Path(ColumnPath),
    Typed(ColumnRef),
    /// Top-level column by position.
    Index(usize),
    Union(Vec<Selector>),
    /// Left side minus the excluded subtrees. A group that is only partly
    /// excluded is replaced by its surviving descendants.
    Except(Box<Selector>, Box<Selector>),
    Intersect(Box<Selector>, Box<Selector>),
    Filter(Box<Selector>, ColumnPredicate),
    /// Direct children of the selected groups.
    Children(Box<Selector>),
    /// Each selected column followed by all of its descendants.
    Dfs(Box<Selector>),
}

impl Selector {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    pub fn path(path: impl Into<ColumnPath>) -> Self {
        Self::Path(path.into())
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Union(names.into_iter().map(|n| Self::Name(n.into())).collect())
    }

    #[must_use]
    pub fn and(self, other: impl Into<Selector>) -> Self {
        match self {
            Self::Union(mut parts) => {
                parts.push(other.into());
                Self::Union(parts)
            }
            first => Self::Union(vec![first, other.into()]),
        }
    }

    #[must_use]
    pub fn except(self, excluded: impl Into<Selector>) -> Self {
        Self::Except(Box::new(self), Box::new(excluded.into()))
    }

    #[must_use]
    pub fn intersect(self, other: impl Into<Selector>) -> Self {
        Self::Intersect(Box::new(self), Box::new(other.into()))
    }

    #[must_use]
    pub fn filter(self, predicate: ColumnPredicate) -> Self {
        Self::Filter(Box::new(self), predicate)
    }

    #[must_use]
    pub fn children(self) -> Self {
        Self::Children(Box::new(self))
    }

    #[must_use]
    pub fn dfs(self) -> Self {
        Self::Dfs(Box::new(self))
    }
}

impl From<&str> for Selector {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for Selector {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<ColumnPath> for Selector {
    fn from(path: ColumnPath) -> Self {
        Self::Path(path)
    }
}

impl From<ColumnRef> for Selector {
    fn from(reference: ColumnRef) -> Self {
        Self::Typed(reference)
    }
}

/// A resolved column, its full path, and the root frame it was resolved in.
#[derive(Debug, Clone)]
pub struct ColumnWithPath<'a> {
    column: Cow<'a, DataColumn>,
    path: ColumnPath,
    frame: &'a DataFrame,
    missing: bool,
}

impl<'a> ColumnWithPath<'a> {
    fn found(column: &'a DataColumn, path: ColumnPath, frame: &'a DataFrame) -> Self {
        Self {
            column: Cow::Borrowed(column),
            path,
            frame,
            missing: false,
        }
    }

    #[must_use]
    pub fn column(&self) -> &DataColumn {
        &self.column
    }

    #[must_use]
    pub fn into_column(self) -> DataColumn {
        self.column.into_owned()
    }

    #[must_use]
    pub fn path(&self) -> &ColumnPath {
        &self.path
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.column.name()
    }

    #[must_use]
    pub fn frame(&self) -> &'a DataFrame {
        self.frame
    }

    /// True for a stand-in created under [`UnresolvedColumnsPolicy::Create`].
    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.missing
    }
}

pub fn resolve<'a>(
    frame: &'a DataFrame,
    selector: &Selector,
    policy: UnresolvedColumnsPolicy,
) -> Result<Vec<ColumnWithPath<'a>>, ResolveError> {
    let resolved = dedupe(Resolver { frame, policy }.eval(selector)?);
    trace!(selected = resolved.len(), ?policy, "resolved selector");
    Ok(resolved)
}

pub fn resolve_single<'a>(
    frame: &'a DataFrame,
    selector: &Selector,
    policy: UnresolvedColumnsPolicy,
) -> Result<ColumnWithPath<'a>, ResolveError> {
    let mut resolved = resolve(frame, selector, policy)?;
    if resolved.len() != 1 {
        return Err(ResolveError::ExpectedSingle {
            count: resolved.len(),
        });
    }
    Ok(resolved.remove(0))
}

/// Drop every column that sits below another selected column.
#[must_use]
pub fn top_level(columns: Vec<ColumnWithPath<'_>>) -> Vec<ColumnWithPath<'_>> {
    let paths: Vec<ColumnPath> = columns.iter().map(|c| c.path.clone()).collect();
    columns
        .into_iter()
        .filter(|column| {
            !paths
                .iter()
                .any(|p| p.len() < column.path.len() && column.path.starts_with(p))
        })
        .collect()
}

fn dedupe(columns: Vec<ColumnWithPath<'_>>) -> Vec<ColumnWithPath<'_>> {
    let mut seen = HashSet::new();
    columns
        .into_iter()
        .filter(|column| seen.insert(column.path.clone()))
        .collect()
}

struct Resolver<'a> {
    frame: &'a DataFrame,
    policy: UnresolvedColumnsPolicy,
}

impl<'a> Resolver<'a> {
    fn eval(&self, selector: &Selector) -> Result<Vec<ColumnWithPath<'a>>, ResolveError> {
        match selector {
            Selector::All => Ok(self.children_at(&ColumnPath::root())),
            Selector::None => Ok(Vec::new()),
            Selector::Name(name) => self.lookup(&ColumnPath::from(name.as_str())),
            Selector::Path(path) => self.lookup(path),
            Selector::Typed(reference) => {
                let found = self.lookup(&reference.path)?;
                for column in found.iter().filter(|c| !c.missing) {
                    check_reference(reference, column)?;
                }
                Ok(found)
            }
            Selector::Index(index) => match self.frame.column_at(*index) {
                Some(column) => Ok(vec![ColumnWithPath::found(
                    column,
                    ColumnPath::from(column.name()),
                    self.frame,
                )]),
                None if self.policy == UnresolvedColumnsPolicy::Skip => Ok(Vec::new()),
                None => Err(ResolveError::IndexOutOfBounds {
                    index: *index,
                    ncol: self.frame.ncol(),
                }),
            },
            Selector::Union(parts) => {
                let mut out = Vec::new();
                for part in parts {
                    out.extend(self.eval(part)?);
                }
                Ok(dedupe(out))
            }
            Selector::Except(included, excluded) => {
                let included = self.eval(included)?;
                let excluded: Vec<ColumnPath> =
                    self.eval(excluded)?.into_iter().map(|c| c.path).collect();
                Ok(self.except(included, &excluded))
            }
            Selector::Intersect(left, right) => {
                let right: HashSet<ColumnPath> =
                    self.eval(right)?.into_iter().map(|c| c.path).collect();
                Ok(self
                    .eval(left)?
                    .into_iter()
                    .filter(|c| right.contains(&c.path))
                    .collect())
            }
            Selector::Filter(inner, predicate) => Ok(self
                .eval(inner)?
                .into_iter()
                .filter(|c| predicate.matches(&c.column, &c.path))
                .collect()),
            Selector::Children(inner) => {
                let mut out = Vec::new();
                for column in self.eval(inner)? {
                    if column.column.as_group().is_some() {
                        out.extend(self.children_at(&column.path));
                    } else if self.policy == UnresolvedColumnsPolicy::Fail {
                        return Err(ResolveError::NotAGroup { path: column.path });
                    }
                }
                Ok(out)
            }
            Selector::Dfs(inner) => {
                let mut out = Vec::new();
                for column in self.eval(inner)? {
                    let descendants = if column.missing {
                        Vec::new()
                    } else {
                        self.descendants(&column.path)
                    };
                    out.push(column);
                    out.extend(descendants);
                }
                Ok(out)
            }
        }
    }

    fn lookup(&self, path: &ColumnPath) -> Result<Vec<ColumnWithPath<'a>>, ResolveError> {
        let Some((last, parents)) = path.segments().split_last() else {
            return Ok(Vec::new());
        };
        let mut frame = self.frame;
        let mut walked = ColumnPath::root();
        for segment in parents {
            walked = walked.child(segment.as_str());
            match frame.column(segment) {
                Some(column) => match column.as_group() {
                    Some(children) => frame = children,
                    None if self.policy == UnresolvedColumnsPolicy::Skip => return Ok(Vec::new()),
                    None => return Err(ResolveError::NotAGroup { path: walked }),
                },
                None => return self.unresolved(path),
            }
        }
        match frame.column(last) {
            Some(column) => Ok(vec![ColumnWithPath::found(column, path.clone(), self.frame)]),
            None => self.unresolved(path),
        }
    }

    fn unresolved(&self, path: &ColumnPath) -> Result<Vec<ColumnWithPath<'a>>, ResolveError> {
        match self.policy {
            UnresolvedColumnsPolicy::Fail => Err(ResolveError::ColumnNotFound { path: path.clone() }),
            UnresolvedColumnsPolicy::Skip => Ok(Vec::new()),
            UnresolvedColumnsPolicy::Create => Ok(vec![ColumnWithPath {
                column: Cow::Owned(DataColumn::placeholder(path.name().unwrap_or_default())),
                path: path.clone(),
                frame: self.frame,
                missing: true,
            }]),
        }
    }

    fn children_at(&self, path: &ColumnPath) -> Vec<ColumnWithPath<'a>> {
        let Some(group) = self.frame.group_at(path) else {
            return Vec::new();
        };
        group
            .columns()
            .iter()
            .map(|column| ColumnWithPath::found(column, path.child(column.name()), self.frame))
            .collect()
    }

    fn descendants(&self, path: &ColumnPath) -> Vec<ColumnWithPath<'a>> {
        let mut out = Vec::new();
        for child in self.children_at(path) {
            let nested = self.descendants(&child.path);
            out.push(child);
            out.extend(nested);
        }
        out
    }

    fn except(
        &self,
        included: Vec<ColumnWithPath<'a>>,
        excluded: &[ColumnPath],
    ) -> Vec<ColumnWithPath<'a>> {
        let mut out = Vec::new();
        for column in included {
            if excluded.iter().any(|e| column.path.starts_with(e)) {
                continue;
            }
            let partly_excluded = excluded
                .iter()
                .any(|e| e.len() > column.path.len() && e.starts_with(&column.path));
            if partly_excluded && column.column.as_group().is_some() {
                let children = self.children_at(&column.path);
                out.extend(self.except(children, excluded));
            } else {
                out.push(column);
            }
        }
        out
    }
}

fn check_reference(reference: &ColumnRef, column: &ColumnWithPath<'_>) -> Result<(), ResolveError> {
    let actual = column.column.kind();
    if let Some(expected) = reference.kind {
        if expected != actual {
            return Err(ResolveError::KindMismatch {
                path: column.path.clone(),
                expected,
                actual,
            });
        }
    }
    if let (Some(expected), Some(actual)) = (&reference.dtype, column.column.dtype()) {
        if !actual.is_subtype_of(expected) {
            return Err(ResolveError::DTypeMismatch {
                path: column.path.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ft_frame::{ColumnKind, ColumnPath, DataColumn, DataFrame};
    use ft_types::{DType, Scalar};

    use super::{
        ColumnPredicate, ColumnRef, ResolveError, Selector, UnresolvedColumnsPolicy, resolve,
        resolve_single, top_level,
    };

    fn typed2() -> DataFrame {
        let name_and_city = DataFrame::from_columns(vec![
            ("name", vec!["Alice".into(), "Bob".into()]),
            ("city", vec!["London".into(), Scalar::null()]),
        ])
        .expect("children");
        DataFrame::new(vec![
            DataColumn::group("nameAndCity", name_and_city),
            DataColumn::from_scalars("age", vec![15.into(), 45.into()]).expect("age"),
            DataColumn::from_scalars("weight", vec![54.into(), Scalar::null()]).expect("weight"),
        ])
        .expect("frame")
    }

    fn paths(frame: &DataFrame, selector: &Selector) -> Vec<String> {
        resolve(frame, selector, UnresolvedColumnsPolicy::Fail)
            .expect("resolve")
            .iter()
            .map(|c| c.path().to_string())
            .collect()
    }

    #[test]
    fn nested_path_resolves_through_group() {
        let df = typed2();
        let found = resolve_single(
            &df,
            &Selector::path(["nameAndCity", "city"]),
            UnresolvedColumnsPolicy::Fail,
        )
        .expect("single");
        assert_eq!(found.name(), "city");
        assert_eq!(found.path(), &ColumnPath::from(["nameAndCity", "city"]));
        assert!(std::ptr::eq(found.frame(), &df));
    }

    #[test]
    fn missing_name_follows_policy() {
        let df = typed2();
        let missing = Selector::name("height");
        assert_eq!(
            resolve(&df, &missing, UnresolvedColumnsPolicy::Fail).expect_err("fail"),
            ResolveError::ColumnNotFound {
                path: ColumnPath::from("height")
            }
        );
        assert!(
            resolve(&df, &missing, UnresolvedColumnsPolicy::Skip)
                .expect("skip")
                .is_empty()
        );
        let created = resolve(&df, &missing, UnresolvedColumnsPolicy::Create).expect("create");
        assert_eq!(created.len(), 1);
        assert!(created[0].is_missing());
        assert_eq!(created[0].name(), "height");
    }

    #[test]
    fn addressing_through_value_column_is_an_error() {
        let df = typed2();
        let err = resolve(
            &df,
            &Selector::path(["age", "x"]),
            UnresolvedColumnsPolicy::Fail,
        )
        .expect_err("not a group");
        assert_eq!(
            err,
            ResolveError::NotAGroup {
                path: ColumnPath::from("age")
            }
        );
    }

    #[test]
    fn typed_reference_checks_kind_and_dtype() {
        let df = typed2();
        let ok = Selector::from(ColumnRef::typed("age", DType::Float64));
        assert!(resolve(&df, &ok, UnresolvedColumnsPolicy::Fail).is_err());
        let ok = Selector::from(ColumnRef::typed("age", DType::Int64));
        assert_eq!(paths(&df, &ok), vec!["age"]);

        let err = resolve(
            &df,
            &Selector::from(ColumnRef::frame("nameAndCity")),
            UnresolvedColumnsPolicy::Fail,
        )
        .expect_err("kind mismatch");
        assert_eq!(
            err,
            ResolveError::KindMismatch {
                path: ColumnPath::from("nameAndCity"),
                expected: ColumnKind::Frame,
                actual: ColumnKind::Group
            }
        );
    }

    #[test]
    fn union_keeps_first_occurrence() {
        let df = typed2();
        let selector = Selector::name("weight").and("age").and("weight");
        assert_eq!(paths(&df, &selector), vec!["weight", "age"]);
    }

    #[test]
    fn except_keeps_surviving_siblings_of_partly_excluded_group() {
        let df = typed2();
        let selector = Selector::All.except(Selector::path(["nameAndCity", "name"]));
        assert_eq!(paths(&df, &selector), vec!["nameAndCity.city", "age", "weight"]);
        let selector = Selector::All.except("nameAndCity");
        assert_eq!(paths(&df, &selector), vec!["age", "weight"]);
    }

    #[test]
    fn intersect_and_filter() {
        let df = typed2();
        let selector = Selector::All.intersect(Selector::names(["weight", "nameAndCity"]));
        assert_eq!(paths(&df, &selector), vec!["nameAndCity", "weight"]);

        let nullable = Selector::All.dfs().filter(ColumnPredicate::HasNulls);
        assert_eq!(paths(&df, &nullable), vec!["nameAndCity.city", "weight"]);

        let numeric = Selector::All.filter(
            ColumnPredicate::Numeric.and(ColumnPredicate::NameStartsWith("w".into()).negate()),
        );
        assert_eq!(paths(&df, &numeric), vec!["age"]);

        let custom = Selector::All
            .dfs()
            .filter(ColumnPredicate::custom(|_, path| path.len() == 2));
        assert_eq!(paths(&df, &custom), vec!["nameAndCity.name", "nameAndCity.city"]);
    }

    #[test]
    fn children_and_dfs() {
        let df = typed2();
        assert_eq!(
            paths(&df, &Selector::name("nameAndCity").children()),
            vec!["nameAndCity.name", "nameAndCity.city"]
        );
        assert_eq!(
            paths(&df, &Selector::All.dfs()),
            vec!["nameAndCity", "nameAndCity.name", "nameAndCity.city", "age", "weight"]
        );
        assert!(resolve(
            &df,
            &Selector::name("age").children(),
            UnresolvedColumnsPolicy::Fail
        )
        .is_err());
    }

    #[test]
    fn index_selector() {
        let df = typed2();
        assert_eq!(paths(&df, &Selector::Index(1)), vec!["age"]);
        assert_eq!(
            resolve(&df, &Selector::Index(7), UnresolvedColumnsPolicy::Fail).expect_err("oob"),
            ResolveError::IndexOutOfBounds { index: 7, ncol: 3 }
        );
    }

    #[test]
    fn top_level_drops_nested_selections() {
        let df = typed2();
        let all = resolve(&df, &Selector::All.dfs(), UnresolvedColumnsPolicy::Fail).expect("dfs");
        let top: Vec<String> = top_level(all).iter().map(|c| c.path().to_string()).collect();
        assert_eq!(top, vec!["nameAndCity", "age", "weight"]);
    }

    #[test]
    fn resolve_single_rejects_multiple() {
        let df = typed2();
        assert_eq!(
            resolve_single(&df, &Selector::All, UnresolvedColumnsPolicy::Fail).expect_err("many"),
            ResolveError::ExpectedSingle { count: 3 }
        );
    }
}
