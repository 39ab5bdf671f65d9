#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use ft_frame::ColumnNameGenerator;
use ft_frame::{
    Cell, ColumnKind, ColumnPath, ColumnPayload, DataFrame, DataRow, FrameError, create_column,
};
use ft_groupby::{GroupByError, GroupedDataFrame, group_by};
use ft_runtime::{DecisionAction, EvidenceLedger, RuntimePolicy};
use ft_select::{ResolveError, Selector, UnresolvedColumnsPolicy, resolve};
use ft_tree::{ColumnToInsert, TreeError, insert_all_after, insert_columns, remove_columns};
use ft_types::{DType, Scalar, nancount, nanmax, nanmean, nanmedian, nanmin, nanstd, nansum};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AggregateError {
    #[error("several frames or rows were yielded into one cell of '{path}'")]
    MultipleFrames { path: ColumnPath },
    #[error("pivot would create {columns} columns, more than the cap of {cap}")]
    PivotTooWide { columns: usize, cap: usize },
    #[error("pivot column '{path}' collides with an existing column")]
    NameCollision { path: ColumnPath },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ── Yield payload ──────────────────────────────────────────────────────

/// A yielded value, optionally carrying its own column name or a default
/// for rows that never yield at its path.
#[derive(Debug, Clone, PartialEq)]
pub enum AggValue {
    Plain(Cell),
    Named(Box<AggValue>, String),
    Defaulted(Box<AggValue>, Cell),
}

impl AggValue {
    #[must_use]
    pub fn named(self, name: impl Into<String>) -> Self {
        Self::Named(Box::new(self), name.into())
    }

    #[must_use]
    pub fn default_to(self, default: impl Into<Cell>) -> Self {
        Self::Defaulted(Box::new(self), default.into())
    }
}

impl From<Cell> for AggValue {
    fn from(value: Cell) -> Self {
        Self::Plain(value)
    }
}

impl From<Scalar> for AggValue {
    fn from(value: Scalar) -> Self {
        Self::Plain(Cell::Value(value))
    }
}

impl From<DataFrame> for AggValue {
    fn from(value: DataFrame) -> Self {
        Self::Plain(Cell::from(value))
    }
}

macro_rules! agg_value_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for AggValue {
            fn from(value: $ty) -> Self {
                Self::Plain(Cell::from(value))
            }
        })*
    };
}

agg_value_from!(bool, i64, i32, f64, &str, String);

#[derive(Debug, Clone, PartialEq)]
pub struct NamedValue {
    pub path: ColumnPath,
    pub value: Cell,
    pub dtype: Option<DType>,
    pub default: Option<Cell>,
    pub guess_type: bool,
}

impl NamedValue {
    /// Unwrap the payload. A self-name replaces the last path segment and a
    /// carried default replaces `default`; the innermost wrapper wins.
    pub fn create(
        path: ColumnPath,
        value: AggValue,
        dtype: Option<DType>,
        default: Option<Cell>,
        guess_type: bool,
    ) -> Self {
        let mut path = path;
        let mut default = default;
        let mut value = value;
        loop {
            match value {
                AggValue::Plain(cell) => {
                    return Self {
                        path,
                        value: cell,
                        dtype,
                        default,
                        guess_type,
                    };
                }
                AggValue::Named(inner, name) => {
                    path = path.with_name(name);
                    value = *inner;
                }
                AggValue::Defaulted(inner, carried) => {
                    default = Some(carried);
                    value = *inner;
                }
            }
        }
    }
}

/// What a body hands back besides its yields. Only pivots use it: a
/// sub-group that yields nothing contributes its body's return value.
pub trait BodyOutput {
    fn into_value(self) -> Option<AggValue>;
}

impl BodyOutput for () {
    fn into_value(self) -> Option<AggValue> {
        None
    }
}

impl BodyOutput for Option<AggValue> {
    fn into_value(self) -> Option<AggValue> {
        self
    }
}

macro_rules! body_output {
    ($($ty:ty),*) => {
        $(impl BodyOutput for $ty {
            fn into_value(self) -> Option<AggValue> {
                Some(AggValue::from(self))
            }
        })*
    };
}

body_output!(AggValue, Cell, Scalar, DataFrame, bool, i64, i32, f64, &str, String);

// ── Sinks ──────────────────────────────────────────────────────────────

pub trait ValueSink {
    fn yield_value(&mut self, value: NamedValue);

    fn yield_into<P, V>(&mut self, path: P, value: V)
    where
        Self: Sized,
        P: Into<ColumnPath>,
        V: Into<AggValue>,
    {
        self.yield_value(NamedValue::create(path.into(), value.into(), None, None, true));
    }

    /// Yield with no path of its own; it takes whatever slot the caller assigns.
    fn yield_unnamed<V>(&mut self, value: V)
    where
        Self: Sized,
        V: Into<AggValue>,
    {
        self.yield_into(ColumnPath::root(), value);
    }

    fn yield_with<P, V>(
        &mut self,
        path: P,
        value: V,
        dtype: Option<DType>,
        default: Option<Cell>,
        guess_type: bool,
    ) where
        Self: Sized,
        P: Into<ColumnPath>,
        V: Into<AggValue>,
    {
        self.yield_value(NamedValue::create(path.into(), value.into(), dtype, default, guess_type));
    }

    /// A single value as itself, anything else as one list value.
    fn yield_one_or_many<P>(
        &mut self,
        path: P,
        mut values: Vec<Scalar>,
        dtype: Option<DType>,
        default: Option<Cell>,
    ) where
        Self: Sized,
        P: Into<ColumnPath>,
    {
        if values.len() == 1 {
            if let Some(only) = values.pop() {
                let guess = dtype.is_none();
                self.yield_with(path, only, dtype, default, guess);
            }
        } else {
            let dtype = dtype.map(DType::list_of);
            let guess = dtype.is_none();
            self.yield_with(path, Scalar::List(values), dtype, default, guess);
        }
    }
}

/// The handle an aggregation body works against: one group's rows plus the
/// values yielded so far.
#[derive(Debug)]
pub struct AggregateReceiver<'a> {
    frame: &'a DataFrame,
    values: Vec<NamedValue>,
}

impl<'a> AggregateReceiver<'a> {
    #[must_use]
    pub fn new(frame: &'a DataFrame) -> Self {
        Self {
            frame,
            values: Vec::new(),
        }
    }

    #[must_use]
    pub fn frame(&self) -> &'a DataFrame {
        self.frame
    }

    #[must_use]
    pub fn nrow(&self) -> usize {
        self.frame.nrow()
    }

    #[must_use]
    pub fn values(&self) -> &[NamedValue] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<NamedValue> {
        self.values
    }

    /// Values of the value column at `path`.
    pub fn column_values(&self, path: impl Into<ColumnPath>) -> Result<&'a [Scalar], AggregateError> {
        let path = path.into();
        value_column(self.frame, &path)
    }

    pub fn reduce(&self, path: impl Into<ColumnPath>, aggregator: &Aggregator) -> Result<Scalar, AggregateError> {
        Ok(aggregator.apply(self.column_values(path)?))
    }
}

impl ValueSink for AggregateReceiver<'_> {
    fn yield_value(&mut self, value: NamedValue) {
        trace!(path = %value.path, "yield");
        self.values.push(value);
    }
}

fn value_column<'a>(frame: &'a DataFrame, path: &ColumnPath) -> Result<&'a [Scalar], AggregateError> {
    let column = frame.get_path(path).ok_or_else(|| ResolveError::ColumnNotFound { path: path.clone() })?;
    let values = column.as_value().ok_or_else(|| ResolveError::KindMismatch {
        path: path.clone(),
        expected: ColumnKind::Value,
        actual: column.kind(),
    })?;
    Ok(values.values())
}

// ── Assembly ───────────────────────────────────────────────────────────

struct PathSlot {
    path: ColumnPath,
    dtype: Option<DType>,
    default: Option<Cell>,
    guess_type: bool,
    cells: Vec<Vec<Cell>>,
}

/// Build one output row per entry of `rows` from the values yielded for it.
///
/// Columns appear in order of first yield. A row that never yielded at a
/// path gets that path's default (or null); several values at one path in
/// one row become a list.
fn assemble(rows: Vec<Vec<NamedValue>>) -> Result<DataFrame, AggregateError> {
    let nrow = rows.len();
    let mut slots: Vec<PathSlot> = Vec::new();
    let mut index: HashMap<ColumnPath, usize> = HashMap::new();

    for (row, values) in rows.into_iter().enumerate() {
        for value in values {
            let slot = *index.entry(value.path.clone()).or_insert_with(|| {
                slots.push(PathSlot {
                    path: value.path.clone(),
                    dtype: value.dtype.clone(),
                    default: None,
                    guess_type: value.guess_type,
                    cells: vec![Vec::new(); nrow],
                });
                slots.len() - 1
            });
            let slot = &mut slots[slot];
            if slot.default.is_none() {
                slot.default = value.default;
            }
            slot.cells[row].push(value.value);
        }
    }

    let mut columns = Vec::with_capacity(slots.len());
    for PathSlot {
        path,
        dtype,
        default,
        guess_type,
        cells,
    } in slots
    {
        let default = default.unwrap_or_else(Cell::null);
        let cells = cells
            .into_iter()
            .map(|values| merge_cells(&path, values, &default))
            .collect::<Result<Vec<_>, _>>()?;
        let name = path.name().unwrap_or_default().to_owned();
        let column = create_column(name, cells, dtype.as_ref(), guess_type)?;
        columns.push(ColumnToInsert::new(path, column));
    }

    if columns.is_empty() {
        return Ok(DataFrame::empty(nrow));
    }
    Ok(insert_columns(None, columns, None)?)
}

fn merge_cells(path: &ColumnPath, values: Vec<Cell>, default: &Cell) -> Result<Cell, AggregateError> {
    let mut values = values.into_iter();
    match (values.next(), values.next()) {
        (None, _) => Ok(default.clone()),
        (Some(only), None) => Ok(only),
        (Some(first), Some(second)) => {
            let mut items = Vec::new();
            for cell in [first, second].into_iter().chain(values) {
                match cell {
                    Cell::Value(value) => items.push(value),
                    Cell::Row(_) | Cell::Frame(_) => {
                        return Err(AggregateError::MultipleFrames { path: path.clone() });
                    }
                }
            }
            Ok(Cell::Value(Scalar::List(items)))
        }
    }
}

/// Replace the groups column of `grouped` by the columns of `result`.
fn attach(grouped: &GroupedDataFrame, result: DataFrame) -> Result<DataFrame, AggregateError> {
    let plain = grouped.plain()?;
    let removal = remove_columns(&plain, &Selector::name(grouped.groups_column()))?;
    let reference = removal.removed().first().copied();
    let columns: Vec<ColumnToInsert> = result
        .into_columns()
        .into_iter()
        .map(|column| ColumnToInsert {
            insertion_path: ColumnPath::from(column.name()),
            column,
            reference,
        })
        .collect();
    debug!(groups = grouped.ngroups(), columns = columns.len(), "aggregated groups");
    Ok(insert_columns(Some(removal.frame()), columns, Some(removal.tree()))?)
}

// ── Plain and grouped aggregation ──────────────────────────────────────

/// Run `body` once over the whole frame and collect its yields as one row.
/// Yielding nothing gives a single row with no columns.
pub fn aggregate<F, R, E>(frame: &DataFrame, mut body: F) -> Result<DataFrame, E>
where
    F: FnMut(&mut AggregateReceiver<'_>) -> Result<R, E>,
    E: From<AggregateError>,
{
    let mut receiver = AggregateReceiver::new(frame);
    body(&mut receiver)?;
    Ok(assemble(vec![receiver.into_values()])?)
}

fn collect_group_rows<F, R, E>(grouped: &GroupedDataFrame, body: &mut F) -> Result<Vec<Vec<NamedValue>>, E>
where
    F: FnMut(&mut AggregateReceiver<'_>) -> Result<R, E>,
{
    let mut rows = Vec::with_capacity(grouped.ngroups());
    for group in grouped.groups() {
        let mut receiver = AggregateReceiver::new(group);
        body(&mut receiver)?;
        rows.push(receiver.into_values());
    }
    Ok(rows)
}

pub trait GroupByAggregations {
    /// Run `body` once per group; one output row per group, after the keys.
    fn aggregate<F, R, E>(&self, body: F) -> Result<DataFrame, E>
    where
        F: FnMut(&mut AggregateReceiver<'_>) -> Result<R, E>,
        E: From<AggregateError>;

    /// Row count of every group in a `count` column.
    fn count(&self) -> Result<DataFrame, AggregateError> {
        self.count_where("count", |_| true)
    }

    /// Number of rows of every group that satisfy `predicate`, in column `name`.
    fn count_where<P>(&self, name: &str, predicate: P) -> Result<DataFrame, AggregateError>
    where
        P: FnMut(&DataRow<'_>) -> bool;

    /// Every selected column of every group, one list (or frame) per group.
    fn values(&self, selector: &Selector) -> Result<DataFrame, AggregateError>;

    /// [`Self::values`] over every column that is not a grouping key.
    fn values_remaining(&self) -> Result<DataFrame, AggregateError>;

    fn value_of<F>(&self, name: &str, row_value: F) -> Result<DataFrame, AggregateError>
    where
        F: FnMut(&DataRow<'_>) -> Scalar;

    fn reduce(&self, selector: &Selector, aggregator: &Aggregator) -> Result<DataFrame, AggregateError>;

    fn pivot(&self, columns: impl Into<Selector>) -> GroupedPivot;
}

impl GroupByAggregations for GroupedDataFrame {
    fn aggregate<F, R, E>(&self, mut body: F) -> Result<DataFrame, E>
    where
        F: FnMut(&mut AggregateReceiver<'_>) -> Result<R, E>,
        E: From<AggregateError>,
    {
        let rows = collect_group_rows(self, &mut body)?;
        let result = assemble(rows)?;
        Ok(attach(self, result)?)
    }

    fn count_where<P>(&self, name: &str, mut predicate: P) -> Result<DataFrame, AggregateError>
    where
        P: FnMut(&DataRow<'_>) -> bool,
    {
        self.aggregate(|r| {
            let matching = r.frame().rows().filter(|row| predicate(row)).count();
            r.yield_into(name, i64::try_from(matching).unwrap_or(i64::MAX));
            Ok::<_, AggregateError>(())
        })
    }

    fn values(&self, selector: &Selector) -> Result<DataFrame, AggregateError> {
        group_values(self, selector, UnresolvedColumnsPolicy::Fail)
    }

    fn values_remaining(&self) -> Result<DataFrame, AggregateError> {
        let selector = Selector::All.except(paths_selector(self.key_paths()));
        group_values(self, &selector, UnresolvedColumnsPolicy::Skip)
    }

    fn value_of<F>(&self, name: &str, mut row_value: F) -> Result<DataFrame, AggregateError>
    where
        F: FnMut(&DataRow<'_>) -> Scalar,
    {
        self.aggregate(|r| {
            let values: Vec<Scalar> = r.frame().rows().map(|row| row_value(&row)).collect();
            r.yield_into(name, Scalar::List(values));
            Ok::<_, AggregateError>(())
        })
    }

    fn reduce(&self, selector: &Selector, aggregator: &Aggregator) -> Result<DataFrame, AggregateError> {
        self.aggregate(|r| {
            let paths: Vec<ColumnPath> = resolve(r.frame(), selector, UnresolvedColumnsPolicy::Fail)?
                .iter()
                .map(|c| c.path().clone())
                .collect();
            for path in paths {
                let reduced = r.reduce(path.clone(), aggregator)?;
                r.yield_into(path, reduced);
            }
            Ok::<_, AggregateError>(())
        })
    }

    fn pivot(&self, columns: impl Into<Selector>) -> GroupedPivot {
        GroupedPivot::new(self.clone(), columns)
    }
}

fn paths_selector(paths: &[ColumnPath]) -> Selector {
    Selector::Union(paths.iter().cloned().map(Selector::Path).collect())
}

fn group_values(
    grouped: &GroupedDataFrame,
    selector: &Selector,
    policy: UnresolvedColumnsPolicy,
) -> Result<DataFrame, AggregateError> {
    grouped.aggregate(|r| {
        for column in resolve(r.frame(), selector, policy)? {
            let value = match column.column().payload() {
                ColumnPayload::Value(values) => AggValue::from(Scalar::List(values.values().to_vec())),
                ColumnPayload::Group(children) => AggValue::from(DataFrame::clone(children)),
                ColumnPayload::Frame(cells) => {
                    let present: Vec<DataFrame> = cells.iter().flatten().cloned().collect();
                    if present.is_empty() {
                        AggValue::Plain(Cell::Frame(None))
                    } else {
                        AggValue::from(DataFrame::union(&present)?)
                    }
                }
            };
            r.yield_into(column.path().clone(), value);
        }
        Ok::<_, AggregateError>(())
    })
}

/// Aggregate every cell of the selected frame columns.
///
/// The result columns take the frame column's place, or follow it when
/// `keep` is set. A null cell aggregates like an empty frame.
pub fn aggregate_frame_column<F, R, E>(
    frame: &DataFrame,
    column: impl Into<Selector>,
    keep: bool,
    mut body: F,
) -> Result<DataFrame, E>
where
    F: FnMut(&mut AggregateReceiver<'_>) -> Result<R, E>,
    E: From<AggregateError>,
{
    let paths: Vec<ColumnPath> = resolve(frame, &column.into(), UnresolvedColumnsPolicy::Fail)
        .map_err(AggregateError::from)?
        .iter()
        .map(|c| c.path().clone())
        .collect();

    let empty = DataFrame::empty(0);
    let mut out = frame.clone();
    for path in paths {
        let target = out
            .get_path(&path)
            .ok_or_else(|| AggregateError::from(ResolveError::ColumnNotFound { path: path.clone() }))?;
        let cells = target.as_frames().ok_or_else(|| {
            AggregateError::from(ResolveError::KindMismatch {
                path: path.clone(),
                expected: ColumnKind::Frame,
                actual: target.kind(),
            })
        })?;

        let mut rows = Vec::with_capacity(cells.len());
        for cell in cells {
            let mut receiver = AggregateReceiver::new(cell.as_ref().unwrap_or(&empty));
            body(&mut receiver)?;
            rows.push(receiver.into_values());
        }
        let result = assemble(rows)?.into_columns();

        out = if keep {
            insert_all_after(&out, result, Selector::path(path.clone())).map_err(AggregateError::from)?
        } else {
            let removal = remove_columns(&out, &Selector::path(path.clone())).map_err(AggregateError::from)?;
            let reference = removal.removed().first().copied();
            let parent = path.parent();
            let columns = result
                .into_iter()
                .map(|column| ColumnToInsert {
                    insertion_path: parent.child(column.name()),
                    column,
                    reference,
                })
                .collect();
            insert_columns(Some(removal.frame()), columns, Some(removal.tree())).map_err(AggregateError::from)?
        };
        debug!(path = %path, keep, "aggregated frame column");
    }
    Ok(out)
}

// ── Reductions ─────────────────────────────────────────────────────────

/// A named reduction over one column's values, opaque to the engine.
#[derive(Clone)]
pub struct Aggregator {
    name: String,
    reduce: Arc<dyn Fn(&[Scalar]) -> Scalar + Send + Sync>,
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator").field("name", &self.name).finish()
    }
}

impl Aggregator {
    pub fn new<F>(name: impl Into<String>, reduce: F) -> Self
    where
        F: Fn(&[Scalar]) -> Scalar + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            reduce: Arc::new(reduce),
        }
    }

    #[must_use]
    pub fn sum() -> Self {
        Self::new("sum", nansum)
    }

    #[must_use]
    pub fn mean() -> Self {
        Self::new("mean", nanmean)
    }

    #[must_use]
    pub fn min() -> Self {
        Self::new("min", nanmin)
    }

    #[must_use]
    pub fn max() -> Self {
        Self::new("max", nanmax)
    }

    #[must_use]
    pub fn median() -> Self {
        Self::new("median", nanmedian)
    }

    /// Sample standard deviation.
    #[must_use]
    pub fn std() -> Self {
        Self::new("std", |values| nanstd(values, 1))
    }

    #[must_use]
    pub fn count() -> Self {
        Self::new("count", nancount)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn apply(&self, values: &[Scalar]) -> Scalar {
        (self.reduce)(values)
    }
}

// ── Pivot ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PivotOptions {
    /// Put the value name above the pivot key instead of below it.
    pub group_by_value: bool,
    /// Cell for group and pivot-key combinations with no rows.
    pub default: Option<Cell>,
    /// Group every pivot column under this path.
    pub group_path: ColumnPath,
}

/// Stable column names for pivot key values, shared by every group of
/// one pivot so a key value lands in the same column everywhere.
#[derive(Debug, Default)]
struct PivotColumnRegistry {
    assigned: HashMap<(ColumnPath, String), String>,
    names: HashMap<ColumnPath, ColumnNameGenerator>,
}

impl PivotColumnRegistry {
    fn reserve(&mut self, parent: ColumnPath, taken: Vec<&str>) {
        self.names.insert(parent, ColumnNameGenerator::new(taken));
    }

    /// Number of column names synthesized so far.
    fn len(&self) -> usize {
        self.assigned.len()
    }

    fn path_for(
        &mut self,
        key: &[Scalar],
        policy: &RuntimePolicy,
        ledger: &mut EvidenceLedger,
    ) -> Result<ColumnPath, AggregateError> {
        let mut path = ColumnPath::root();
        for value in key {
            // Debug output keeps `1` and `"1"` apart.
            let identity = (path.clone(), format!("{value:?}"));
            let segment = match self.assigned.get(&identity) {
                Some(segment) => segment.clone(),
                None => {
                    let preferred = value.to_string();
                    let segment = self.names.entry(path.clone()).or_default().add_unique(&preferred);
                    if segment != preferred {
                        let clashing = path.child(preferred.as_str());
                        let action = policy.decide_name_collision(clashing.to_string(), &segment, ledger);
                        if action == DecisionAction::Reject {
                            return Err(AggregateError::NameCollision { path: clashing });
                        }
                        debug!(path = %clashing, repaired = %segment, "renamed pivot column");
                    }
                    trace!(parent = %path, column = %segment, "registered pivot column");
                    self.assigned.insert(identity, segment.clone());
                    segment
                }
            };
            path = path.child(segment);
        }
        Ok(path)
    }
}

/// Split `receiver`'s rows by the pivot columns and yield each sub-group's
/// results under that sub-group's pivot path.
fn pivot_into<F, R, E>(
    receiver: &mut AggregateReceiver<'_>,
    columns: &Selector,
    options: &PivotOptions,
    registry: &mut PivotColumnRegistry,
    policy: &RuntimePolicy,
    ledger: &mut EvidenceLedger,
    body: &mut F,
) -> Result<(), E>
where
    F: FnMut(&mut AggregateReceiver<'_>) -> Result<R, E>,
    R: BodyOutput,
    E: From<AggregateError>,
{
    let grouped = group_by(receiver.frame(), columns).map_err(AggregateError::from)?;
    for (idx, group) in grouped.groups().iter().enumerate() {
        let key = grouped.key_values(idx).unwrap_or_default();
        let pivot_path = registry.path_for(key, policy, ledger)?;
        let mut builder = AggregateReceiver::new(group);
        let result = body(&mut builder)?.into_value();
        let mut values = builder.into_values();

        if values.is_empty() {
            let value = result.unwrap_or(AggValue::Plain(Cell::null()));
            receiver.yield_value(NamedValue::create(
                options.group_path.join(&pivot_path),
                value,
                None,
                options.default.clone(),
                true,
            ));
        } else if values.len() == 1 && values[0].path.is_empty() {
            if let Some(value) = values.pop() {
                receiver.yield_value(NamedValue {
                    path: options.group_path.join(&pivot_path),
                    default: value.default.or_else(|| options.default.clone()),
                    ..value
                });
            }
        } else {
            for value in values {
                let target = if options.group_by_value {
                    value.path.join(&pivot_path)
                } else {
                    pivot_path.join(&value.path)
                };
                receiver.yield_value(NamedValue {
                    path: options.group_path.join(&target),
                    default: value.default.or_else(|| options.default.clone()),
                    ..value
                });
            }
        }
    }
    Ok(())
}

pub trait PivotAggregations: Sized {
    fn options_mut(&mut self) -> &mut PivotOptions;

    /// Every column that is neither a pivot column nor a grouping key.
    fn remaining_columns(&self) -> Selector;

    /// Run `body` once per group and pivot key, repairing or rejecting pivot
    /// column name clashes as `policy` says and recording each decision.
    fn aggregate_with_policy<F, R, E>(
        &self,
        body: F,
        policy: &RuntimePolicy,
        ledger: &mut EvidenceLedger,
    ) -> Result<DataFrame, E>
    where
        F: FnMut(&mut AggregateReceiver<'_>) -> Result<R, E>,
        R: BodyOutput,
        E: From<AggregateError>;

    #[must_use]
    fn group_by_value(mut self, flag: bool) -> Self {
        self.options_mut().group_by_value = flag;
        self
    }

    #[must_use]
    fn with_default(mut self, value: impl Into<Cell>) -> Self {
        self.options_mut().default = Some(value.into());
        self
    }

    #[must_use]
    fn under(mut self, path: impl Into<ColumnPath>) -> Self {
        self.options_mut().group_path = path.into();
        self
    }

    fn aggregate<F, R, E>(&self, body: F) -> Result<DataFrame, E>
    where
        F: FnMut(&mut AggregateReceiver<'_>) -> Result<R, E>,
        R: BodyOutput,
        E: From<AggregateError>,
    {
        let mut ledger = EvidenceLedger::new();
        self.aggregate_with_policy(body, &RuntimePolicy::default(), &mut ledger)
    }

    /// Values of one column: a scalar per cell, or a list when a cell has several.
    fn value(&self, column: impl Into<ColumnPath>) -> Result<DataFrame, AggregateError> {
        self.values(&Selector::path(column))
    }

    /// Several columns become nested columns named after them; a single
    /// selected column behaves like [`Self::value`].
    fn values(&self, selector: &Selector) -> Result<DataFrame, AggregateError> {
        pivot_values(self, selector, UnresolvedColumnsPolicy::Fail)
    }

    /// [`Self::values`] over [`Self::remaining_columns`].
    fn values_remaining(&self) -> Result<DataFrame, AggregateError> {
        pivot_values(self, &self.remaining_columns(), UnresolvedColumnsPolicy::Skip)
    }

    /// Row count per cell; absent combinations count 0.
    fn count(&self) -> Result<DataFrame, AggregateError> {
        self.aggregate(|r| {
            let n = i64::try_from(r.nrow()).unwrap_or(i64::MAX);
            r.yield_with(ColumnPath::root(), n, None, Some(Cell::from(0)), true);
            Ok::<_, AggregateError>(())
        })
    }

    /// `true` where a combination has rows, `false` elsewhere.
    fn matches(&self) -> Result<DataFrame, AggregateError> {
        self.aggregate(|r| {
            r.yield_with(ColumnPath::root(), true, None, Some(Cell::from(false)), true);
            Ok::<_, AggregateError>(())
        })
    }
}

fn pivot_values<P: PivotAggregations>(
    pivot: &P,
    selector: &Selector,
    policy: UnresolvedColumnsPolicy,
) -> Result<DataFrame, AggregateError> {
    pivot.aggregate(|r| {
        let resolved = resolve(r.frame(), selector, policy)?;
        let single = resolved.len() == 1;
        let mut yields = Vec::with_capacity(resolved.len());
        for column in &resolved {
            let values = value_column(r.frame(), column.path())?.to_vec();
            let path = if single {
                ColumnPath::root()
            } else {
                ColumnPath::from(column.name())
            };
            yields.push((path, values));
        }
        for (path, values) in yields {
            r.yield_one_or_many(path, values, None, None);
        }
        Ok::<_, AggregateError>(())
    })
}

/// Pivot over a whole frame: one output row.
#[derive(Debug, Clone)]
pub struct DataFramePivot<'a> {
    frame: &'a DataFrame,
    columns: Selector,
    options: PivotOptions,
}

pub fn pivot(frame: &DataFrame, columns: impl Into<Selector>) -> DataFramePivot<'_> {
    DataFramePivot {
        frame,
        columns: columns.into(),
        options: PivotOptions::default(),
    }
}

impl DataFramePivot<'_> {
    /// One output row per distinct value of `keys` instead of a single row.
    pub fn group_by(self, keys: impl Into<Selector>) -> Result<GroupedPivot, AggregateError> {
        let grouped = group_by(self.frame, &keys.into())?;
        Ok(GroupedPivot {
            grouped,
            columns: self.columns,
            options: self.options,
        })
    }
}

impl PivotAggregations for DataFramePivot<'_> {
    fn options_mut(&mut self) -> &mut PivotOptions {
        &mut self.options
    }

    fn remaining_columns(&self) -> Selector {
        Selector::All.except(self.columns.clone())
    }

    fn aggregate_with_policy<F, R, E>(
        &self,
        body: F,
        policy: &RuntimePolicy,
        ledger: &mut EvidenceLedger,
    ) -> Result<DataFrame, E>
    where
        F: FnMut(&mut AggregateReceiver<'_>) -> Result<R, E>,
        R: BodyOutput,
        E: From<AggregateError>,
    {
        let grouped = group_by(self.frame, &Selector::None).map_err(AggregateError::from)?;
        GroupedPivot {
            grouped,
            columns: self.columns.clone(),
            options: self.options.clone(),
        }
        .aggregate_with_policy(body, policy, ledger)
    }
}

#[derive(Debug, Clone)]
pub struct GroupedPivot {
    grouped: GroupedDataFrame,
    columns: Selector,
    options: PivotOptions,
}

impl GroupedPivot {
    pub fn new(grouped: GroupedDataFrame, columns: impl Into<Selector>) -> Self {
        Self {
            grouped,
            columns: columns.into(),
            options: PivotOptions::default(),
        }
    }

    #[must_use]
    pub fn options(&self) -> &PivotOptions {
        &self.options
    }
}

impl PivotAggregations for GroupedPivot {
    fn options_mut(&mut self) -> &mut PivotOptions {
        &mut self.options
    }

    fn remaining_columns(&self) -> Selector {
        Selector::All
            .except(self.columns.clone())
            .except(paths_selector(self.grouped.key_paths()))
    }

    fn aggregate_with_policy<F, R, E>(
        &self,
        mut body: F,
        policy: &RuntimePolicy,
        ledger: &mut EvidenceLedger,
    ) -> Result<DataFrame, E>
    where
        F: FnMut(&mut AggregateReceiver<'_>) -> Result<R, E>,
        R: BodyOutput,
        E: From<AggregateError>,
    {
        let mut registry = PivotColumnRegistry::default();
        if self.options.group_path.is_empty() && !self.options.group_by_value {
            registry.reserve(ColumnPath::root(), self.grouped.keys().column_names());
        }

        let mut rows = Vec::with_capacity(self.grouped.ngroups());
        for group in self.grouped.groups() {
            let mut receiver = AggregateReceiver::new(group);
            pivot_into(
                &mut receiver,
                &self.columns,
                &self.options,
                &mut registry,
                policy,
                ledger,
                &mut body,
            )?;
            rows.push(receiver.into_values());
        }

        let width = registry.len();
        if policy.decide_pivot_width(width, ledger) == DecisionAction::Reject {
            return Err(AggregateError::PivotTooWide {
                columns: width,
                cap: policy.pivot_column_cap.unwrap_or(usize::MAX),
            }
            .into());
        }
        debug!(groups = rows.len(), pivot_columns = width, "pivoted groups");
        let result = assemble(rows)?;
        Ok(attach(&self.grouped, result)?)
    }
}

#[cfg(test)]
mod tests {
    use ft_frame::{Cell, ColumnKind, ColumnPath, DataColumn, DataFrame};
    use ft_groupby::group_by;
    use ft_runtime::{EvidenceLedger, IssueKind, RuntimePolicy};
    use ft_select::Selector;
    use ft_types::{DType, Scalar};

    use super::{
        AggValue, AggregateError, Aggregator, GroupByAggregations, PivotAggregations, ValueSink,
        aggregate, aggregate_frame_column, pivot,
    };

    fn people() -> DataFrame {
        DataFrame::from_columns(vec![
            ("name", vec!["Alice".into(), "Bob".into(), "Charlie".into(), "Bob".into(), "Alice".into()]),
            ("age", vec![15.into(), 45.into(), 20.into(), 30.into(), 40.into()]),
        ])
        .expect("people")
    }

    fn long() -> DataFrame {
        DataFrame::from_columns(vec![
            (
                "name",
                vec![
                    "Alice".into(),
                    "Alice".into(),
                    "Alice".into(),
                    "Bob".into(),
                    "Bob".into(),
                    "Mark".into(),
                    "Mark".into(),
                    "Mark".into(),
                    "Alice".into(),
                ],
            ),
            (
                "key",
                vec![
                    "age".into(),
                    "city".into(),
                    "weight".into(),
                    "age".into(),
                    "weight".into(),
                    "age".into(),
                    "city".into(),
                    "weight".into(),
                    "age".into(),
                ],
            ),
            (
                "value",
                vec![
                    15.into(),
                    "London".into(),
                    54.into(),
                    45.into(),
                    87.into(),
                    20.into(),
                    "Moscow".into(),
                    Scalar::null(),
                    55.into(),
                ],
            ),
        ])
        .expect("long")
    }

    fn strings(frame: &DataFrame, path: &[&str]) -> Vec<String> {
        frame
            .get_path(&ColumnPath::new(path.iter().copied()))
            .and_then(DataColumn::as_value)
            .expect("value column")
            .values()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    fn dtype(frame: &DataFrame, name: &str) -> Option<DType> {
        frame.column(name).and_then(|c| c.dtype().cloned())
    }

    // ── Plain aggregate ────────────────────────────────────────────────

    #[test]
    fn plain_aggregate_builds_one_row_tree() {
        let df = people();
        let out = aggregate(&df, |r| {
            let total = r.reduce("age", &Aggregator::sum())?;
            r.yield_into("total", total);
            let oldest = r.reduce("age", &Aggregator::max())?;
            r.yield_into(["stats", "oldest"], oldest);
            Ok::<_, AggregateError>(())
        })
        .expect("aggregate");
        assert_eq!(out.nrow(), 1);
        assert_eq!(out.column_names(), vec!["total", "stats"]);
        assert_eq!(strings(&out, &["stats", "oldest"]), vec!["45"]);
    }

    #[test]
    fn plain_aggregate_without_yields_is_one_empty_row() {
        let df = people();
        let out = aggregate(&df, |_| Ok::<_, AggregateError>(())).expect("aggregate");
        assert_eq!(out.nrow(), 1);
        assert_eq!(out.ncol(), 0);
    }

    #[test]
    fn body_errors_pass_through_unchanged() {
        #[derive(Debug, PartialEq)]
        enum BodyError {
            Aggregate(AggregateError),
            Refused,
        }
        impl From<AggregateError> for BodyError {
            fn from(err: AggregateError) -> Self {
                Self::Aggregate(err)
            }
        }

        let grouped = group_by(&people(), &Selector::name("name")).expect("group");
        let err = grouped
            .aggregate(|r| {
                if r.nrow() == 1 {
                    return Err(BodyError::Refused);
                }
                r.yield_into("n", 1);
                Ok(())
            })
            .expect_err("refused");
        assert_eq!(err, BodyError::Refused);

        let err = aggregate(&people(), |r| {
            r.column_values("missing")?;
            Ok::<_, BodyError>(())
        })
        .expect_err("missing column");
        assert!(matches!(err, BodyError::Aggregate(AggregateError::Resolve(_))));
    }

    // ── Grouped aggregate ──────────────────────────────────────────────

    #[test]
    fn grouped_aggregate_fills_defaults_and_lists() {
        let grouped = group_by(&people(), &Selector::name("name")).expect("group");
        let out = grouped
            .aggregate(|r| {
                for age in r.column_values("age")? {
                    r.yield_into("ages", age.clone());
                }
                if r.nrow() > 1 {
                    r.yield_with("pair", "yes", None, Some(Cell::from("-")), true);
                }
                Ok::<_, AggregateError>(())
            })
            .expect("aggregate");
        assert_eq!(out.column_names(), vec!["name", "ages", "pair"]);
        assert_eq!(strings(&out, &["ages"]), vec!["[15, 40]", "[45, 30]", "[20]"]);
        assert_eq!(dtype(&out, "ages"), Some(DType::list_of(DType::Int64)));
        assert_eq!(strings(&out, &["pair"]), vec!["yes", "yes", "-"]);
    }

    #[test]
    fn named_and_defaulted_payloads() {
        let grouped = group_by(&people(), &Selector::name("name")).expect("group");
        let out = grouped
            .aggregate(|r| {
                r.yield_into("slot", AggValue::from(r.nrow() as i64).named("size"));
                if r.nrow() == 1 {
                    r.yield_into("single", AggValue::from(true).default_to(false));
                }
                Ok::<_, AggregateError>(())
            })
            .expect("aggregate");
        assert_eq!(out.column_names(), vec!["name", "size", "single"]);
        assert_eq!(strings(&out, &["single"]), vec!["false", "false", "true"]);
    }

    #[test]
    fn several_frames_in_one_cell_fail() {
        let df = people();
        let err = aggregate(&df, |r| {
            r.yield_into("f", r.frame().clone());
            r.yield_into("f", r.frame().clone());
            Ok::<_, AggregateError>(())
        })
        .expect_err("two frames");
        assert_eq!(
            err,
            AggregateError::MultipleFrames {
                path: ColumnPath::from("f")
            }
        );
    }

    #[test]
    fn shortcut_aggregations() {
        let grouped = group_by(&people(), &Selector::name("name")).expect("group");
        let counts = grouped.count().expect("count");
        assert_eq!(strings(&counts, &["count"]), vec!["2", "2", "1"]);

        let values = grouped.values(&Selector::name("age")).expect("values");
        assert_eq!(strings(&values, &["age"]), vec!["[15, 40]", "[45, 30]", "[20]"]);

        let means = grouped.reduce(&Selector::name("age"), &Aggregator::mean()).expect("mean");
        assert_eq!(strings(&means, &["age"]), vec!["27.5", "37.5", "20"]);

        let initials = grouped
            .value_of("initial", |row| {
                let name = row.scalar(&ColumnPath::from("name")).map(ToString::to_string).unwrap_or_default();
                Scalar::from(name.chars().next().map(String::from).unwrap_or_default())
            })
            .expect("value_of");
        assert_eq!(strings(&initials, &["initial"]), vec!["[A, A]", "[B, B]", "[C]"]);
    }

    #[test]
    fn counting_rows_that_match() {
        let grouped = group_by(&people(), &Selector::name("name")).expect("group");
        let adults = grouped
            .count_where("adults", |row| {
                matches!(row.scalar(&ColumnPath::from("age")), Some(Scalar::Int64(age)) if *age >= 30)
            })
            .expect("count_where");
        assert_eq!(adults.column_names(), vec!["name", "adults"]);
        assert_eq!(strings(&adults, &["adults"]), vec!["1", "2", "0"]);
    }

    #[test]
    fn remaining_values_skip_key_columns() {
        let grouped = group_by(&people(), &Selector::name("name")).expect("group");
        let err = grouped.values(&Selector::All).expect_err("keys collide");
        assert!(matches!(err, AggregateError::Tree(_)));

        let out = grouped.values_remaining().expect("values");
        assert_eq!(out.column_names(), vec!["name", "age"]);
        assert_eq!(strings(&out, &["age"]), vec!["[15, 40]", "[45, 30]", "[20]"]);
    }

    #[test]
    fn frame_column_aggregation_replaces_or_follows() {
        let grouped = group_by(&people(), &Selector::name("name")).expect("group");
        let plain = grouped.plain().expect("plain");

        let replaced = aggregate_frame_column(&plain, "groups", false, |r| {
            let oldest = r.reduce("age", &Aggregator::max())?;
            r.yield_into("oldest", oldest);
            Ok::<_, AggregateError>(())
        })
        .expect("replace");
        assert_eq!(replaced.column_names(), vec!["name", "oldest"]);
        assert_eq!(strings(&replaced, &["oldest"]), vec!["40", "45", "20"]);

        let kept = aggregate_frame_column(&plain, "groups", true, |r| {
            r.yield_into("n", r.nrow() as i64);
            Ok::<_, AggregateError>(())
        })
        .expect("keep");
        assert_eq!(kept.column_names(), vec!["name", "groups", "n"]);
        assert_eq!(kept.column("groups").map(DataColumn::kind), Some(ColumnKind::Frame));

        let err = aggregate_frame_column(&plain, "name", false, |_| Ok::<_, AggregateError>(()))
            .expect_err("not frames");
        assert!(matches!(err, AggregateError::Resolve(_)));
    }

    // ── Pivot ──────────────────────────────────────────────────────────

    #[test]
    fn simple_pivot_with_default() {
        let df = long();
        let out = pivot(&df, "key")
            .group_by("name")
            .expect("group")
            .with_default("-")
            .value("value")
            .expect("pivot");
        assert_eq!(out.column_names(), vec!["name", "age", "city", "weight"]);
        assert_eq!(out.nrow(), 3);
        assert_eq!(strings(&out, &["age"]), vec!["[15, 55]", "[45]", "[20]"]);
        assert_eq!(strings(&out, &["city"]), vec!["London", "-", "Moscow"]);
        assert_eq!(strings(&out, &["weight"]), vec!["54", "87", "null"]);
        assert_eq!(dtype(&out, "age"), Some(DType::list_of(DType::Int64)));
        assert_eq!(dtype(&out, "city"), Some(DType::Utf8));
        let weight = out.column("weight").and_then(DataColumn::column_type).expect("weight");
        assert_eq!(weight.dtype, DType::Int64);
        assert!(weight.nullable);
    }

    #[test]
    fn absent_combination_gets_default() {
        let df = DataFrame::from_columns(vec![
            ("id", vec![1.into(), 1.into(), 2.into()]),
            ("key", vec!["x".into(), "y".into(), "y".into()]),
            ("v", vec![1.into(), 2.into(), 3.into()]),
        ])
        .expect("frame");
        let grouped = group_by(&df, &Selector::name("id")).expect("group");
        let out = grouped.pivot("key").with_default(0).value("v").expect("pivot");
        assert_eq!(out.column_names(), vec!["id", "x", "y"]);
        assert_eq!(strings(&out, &["x"]), vec!["1", "0"]);
        assert_eq!(strings(&out, &["y"]), vec!["2", "3"]);
    }

    #[test]
    fn pivot_without_grouping_is_one_row() {
        let df = long();
        let out = pivot(&df, "key").count().expect("count");
        assert_eq!(out.nrow(), 1);
        assert_eq!(out.column_names(), vec!["age", "city", "weight"]);
        assert_eq!(strings(&out, &["age"]), vec!["4"]);
    }

    #[test]
    fn pivot_matches_and_counts() {
        let df = long();
        let pivoted = pivot(&df, "key").group_by("name").expect("group");
        let matches = pivoted.matches().expect("matches");
        assert_eq!(strings(&matches, &["city"]), vec!["true", "false", "true"]);
        assert_eq!(dtype(&matches, "city"), Some(DType::Bool));
        let counts = pivoted.count().expect("count");
        assert_eq!(strings(&counts, &["age"]), vec!["2", "1", "1"]);
        assert_eq!(strings(&counts, &["city"]), vec!["1", "0", "1"]);
    }

    #[test]
    fn pivot_several_values_nest_by_key_or_by_value() {
        let df = long()
            .with_column(
                DataColumn::from_scalars("note", vec!["n".into(); 9]).expect("note"),
            )
            .expect("frame");
        let pivoted = pivot(&df, "key").group_by("name").expect("group");

        let by_key = pivoted
            .clone()
            .values(&Selector::names(["value", "note"]))
            .expect("values");
        assert_eq!(by_key.column_names(), vec!["name", "age", "city", "weight"]);
        assert_eq!(
            by_key.column("age").and_then(DataColumn::as_group).expect("group").column_names(),
            vec!["value", "note"]
        );

        let by_value = pivoted
            .group_by_value(true)
            .values(&Selector::names(["value", "note"]))
            .expect("values");
        assert_eq!(by_value.column_names(), vec!["name", "value", "note"]);
        assert_eq!(strings(&by_value, &["value", "city"]), vec!["London", "null", "Moscow"]);
    }

    #[test]
    fn pivot_remaining_values_skip_keys_and_pivot_columns() {
        let df = long();
        let pivoted = pivot(&df, "key").group_by("name").expect("group");
        let remaining = pivoted.values_remaining().expect("remaining");
        let single = pivoted.value("value").expect("value");
        assert_eq!(remaining, single);
        assert_eq!(remaining.column_names(), vec!["name", "age", "city", "weight"]);

        let whole = pivot(&df, "key").values_remaining().expect("ungrouped");
        assert_eq!(whole.nrow(), 1);
        assert_eq!(
            whole.column("age").and_then(DataColumn::as_group).expect("group").column_names(),
            vec!["name", "value"]
        );
    }

    #[test]
    fn pivot_under_group_path() {
        let df = long();
        let out = pivot(&df, "key")
            .group_by("name")
            .expect("group")
            .under("keys")
            .matches()
            .expect("pivot");
        assert_eq!(out.column_names(), vec!["name", "keys"]);
        assert_eq!(strings(&out, &["keys", "weight"]), vec!["true", "true", "true"]);
    }

    #[test]
    fn pivot_body_return_value_fills_silent_cells() {
        let df = long();
        let out = pivot(&df, "key")
            .group_by("name")
            .expect("group")
            .aggregate(|r| Ok::<_, AggregateError>(r.nrow() as i64 * 10))
            .expect("pivot");
        assert_eq!(strings(&out, &["age"]), vec!["20", "10", "10"]);
        assert_eq!(strings(&out, &["city"]), vec!["10", "null", "10"]);
    }

    #[test]
    fn pivot_name_clash_is_repaired_or_rejected() {
        let df = DataFrame::from_columns(vec![
            ("name", vec!["a".into(), "b".into()]),
            ("key", vec!["name".into(), "other".into()]),
        ])
        .expect("frame");
        let pivoted = pivot(&df, "key").group_by("name").expect("group");

        let mut ledger = EvidenceLedger::new();
        let out = pivoted
            .aggregate_with_policy(
                |r| {
                    r.yield_unnamed(1);
                    Ok::<_, AggregateError>(())
                },
                &RuntimePolicy::default(),
                &mut ledger,
            )
            .expect("hardened");
        assert_eq!(out.column_names(), vec!["name", "name_1", "other"]);
        assert_eq!(ledger.of_kind(IssueKind::NameCollision).count(), 1);

        let err = pivoted
            .aggregate_with_policy(
                |r| {
                    r.yield_unnamed(1);
                    Ok::<_, AggregateError>(())
                },
                &RuntimePolicy::strict(),
                &mut ledger,
            )
            .expect_err("strict");
        assert_eq!(
            err,
            AggregateError::NameCollision {
                path: ColumnPath::from("name")
            }
        );
    }

    #[test]
    fn pivot_width_cap() {
        let df = long();
        let mut ledger = EvidenceLedger::new();
        let err = pivot(&df, "key")
            .aggregate_with_policy(
                |r| Ok::<_, AggregateError>(r.nrow() as i64),
                &RuntimePolicy::hardened(Some(2)),
                &mut ledger,
            )
            .expect_err("too wide");
        assert_eq!(err, AggregateError::PivotTooWide { columns: 3, cap: 2 });
    }

    #[test]
    fn reductions_skip_missing_values() {
        let values = vec![Scalar::from(1), Scalar::null(), Scalar::from(3)];
        assert_eq!(Aggregator::sum().apply(&values), Scalar::from(4.0));
        assert_eq!(Aggregator::count().apply(&values), Scalar::from(2));
        assert_eq!(Aggregator::median().apply(&values), Scalar::from(2.0));
        assert_eq!(Aggregator::std().name(), "std");
    }
}
