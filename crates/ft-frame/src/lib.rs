#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use ft_columnar::{Column, ColumnError};
use ft_types::{ColumnType, DType, Scalar, TypeError, common_dtype, infer_dtype};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("column '{name}' has {actual} rows, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate column names at one level: {names:?}")]
    DuplicateColumnNames { names: Vec<String> },
    #[error("column '{name}' mixes incompatible cell kinds")]
    MixedCellKinds { name: String },
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Type(#[from] TypeError),
}

// ── Paths ──────────────────────────────────────────────────────────────

/// Names from the root frame down through group columns to one column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnPath(Vec<String>);

impl ColumnPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The empty path, addressing the root frame itself.
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last segment.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    #[must_use]
    pub fn parent(&self) -> Self {
        match self.0.split_last() {
            Some((_, rest)) => Self(rest.to_vec()),
            None => Self::root(),
        }
    }

    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    #[must_use]
    pub fn join(&self, tail: &ColumnPath) -> Self {
        let mut segments = self.0.clone();
        segments.extend(tail.0.iter().cloned());
        Self(segments)
    }

    #[must_use]
    pub fn starts_with(&self, prefix: &ColumnPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// The first `len` segments (the whole path when `len` exceeds it).
    #[must_use]
    pub fn prefix(&self, len: usize) -> Self {
        Self(self.0[..len.min(self.0.len())].to_vec())
    }

    /// The last `len` segments (the whole path when `len` exceeds it).
    #[must_use]
    pub fn suffix(&self, len: usize) -> Self {
        let start = self.0.len().saturating_sub(len);
        Self(self.0[start..].to_vec())
    }

    /// Replace the last segment; an empty path becomes a one-segment path.
    #[must_use]
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        self.parent().child(name)
    }
}

impl fmt::Display for ColumnPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for ColumnPath {
    fn from(name: &str) -> Self {
        Self(vec![name.to_owned()])
    }
}

impl From<String> for ColumnPath {
    fn from(name: String) -> Self {
        Self(vec![name])
    }
}

impl From<Vec<String>> for ColumnPath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl<const N: usize> From<[&str; N]> for ColumnPath {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

// ── Columns ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Value,
    Group,
    Frame,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Value => "value",
            Self::Group => "group",
            Self::Frame => "frame",
        })
    }
}

/// One cell of any column kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Value(Scalar),
    /// Single-row slice of a group column.
    Row(DataFrame),
    Frame(Option<DataFrame>),
}

impl Cell {
    #[must_use]
    pub fn null() -> Self {
        Self::Value(Scalar::null())
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Value(v) if v.is_null()) || matches!(self, Self::Frame(None))
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Scalar> for Cell {
    fn from(value: Scalar) -> Self {
        Self::Value(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Self::Value(value.into())
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Self::Value(value.into())
    }
}

impl From<i32> for Cell {
    fn from(value: i32) -> Self {
        Self::Value(value.into())
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Self::Value(value.into())
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::Value(value.into())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Self::Value(value.into())
    }
}

impl From<DataFrame> for Cell {
    fn from(frame: DataFrame) -> Self {
        Self::Frame(Some(frame))
    }
}

/// Column contents. Every variant is reference counted, so cloning a column
/// or a frame shares all unmodified subtrees.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnPayload {
    Value(Arc<Column>),
    Group(Arc<DataFrame>),
    Frame(Arc<[Option<DataFrame>]>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataColumn {
    name: String,
    payload: ColumnPayload,
}

impl DataColumn {
    pub fn value(name: impl Into<String>, column: Column) -> Self {
        Self {
            name: name.into(),
            payload: ColumnPayload::Value(Arc::new(column)),
        }
    }

    /// Value column with an inferred element type.
    pub fn from_scalars(name: impl Into<String>, values: Vec<Scalar>) -> Result<Self, FrameError> {
        Ok(Self::value(name, Column::from_values(values)?))
    }

    pub fn typed(
        name: impl Into<String>,
        dtype: DType,
        values: Vec<Scalar>,
    ) -> Result<Self, FrameError> {
        Ok(Self::value(name, Column::new(dtype, values)?))
    }

    pub fn group(name: impl Into<String>, children: DataFrame) -> Self {
        Self {
            name: name.into(),
            payload: ColumnPayload::Group(Arc::new(children)),
        }
    }

    pub fn frames(name: impl Into<String>, cells: Vec<Option<DataFrame>>) -> Self {
        Self {
            name: name.into(),
            payload: ColumnPayload::Frame(Arc::from(cells)),
        }
    }

    /// Zero-length stand-in for a column that does not exist yet.
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::value(name, Column::nulls(DType::Null, 0))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn payload(&self) -> &ColumnPayload {
        &self.payload
    }

    #[must_use]
    pub fn kind(&self) -> ColumnKind {
        match self.payload {
            ColumnPayload::Value(_) => ColumnKind::Value,
            ColumnPayload::Group(_) => ColumnKind::Group,
            ColumnPayload::Frame(_) => ColumnKind::Frame,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &self.payload {
            ColumnPayload::Value(column) => column.len(),
            ColumnPayload::Group(children) => children.nrow(),
            ColumnPayload::Frame(cells) => cells.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type of a value column.
    #[must_use]
    pub fn dtype(&self) -> Option<&DType> {
        self.as_value().map(Column::dtype)
    }

    #[must_use]
    pub fn column_type(&self) -> Option<ColumnType> {
        self.as_value().map(Column::column_type)
    }

    #[must_use]
    pub fn has_nulls(&self) -> bool {
        match &self.payload {
            ColumnPayload::Value(column) => column.has_nulls(),
            ColumnPayload::Group(_) => false,
            ColumnPayload::Frame(cells) => cells.iter().any(Option::is_none),
        }
    }

    #[must_use]
    pub fn as_value(&self) -> Option<&Column> {
        match &self.payload {
            ColumnPayload::Value(column) => Some(column),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_group(&self) -> Option<&DataFrame> {
        match &self.payload {
            ColumnPayload::Group(children) => Some(children),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_frames(&self) -> Option<&[Option<DataFrame>]> {
        match &self.payload {
            ColumnPayload::Frame(cells) => Some(cells),
            _ => None,
        }
    }

    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: self.payload.clone(),
        }
    }

    /// Same name, new children. Turns any column into a group.
    #[must_use]
    pub fn with_children(&self, children: DataFrame) -> Self {
        Self::group(self.name.clone(), children)
    }

    #[must_use]
    pub fn cell(&self, index: usize) -> Option<Cell> {
        if index >= self.len() {
            return None;
        }
        Some(match &self.payload {
            ColumnPayload::Value(column) => Cell::Value(column.values()[index].clone()),
            ColumnPayload::Group(children) => Cell::Row(children.slice_rows(index..index + 1)),
            ColumnPayload::Frame(cells) => Cell::Frame(cells[index].clone()),
        })
    }

    #[must_use]
    pub fn cells(&self) -> Vec<Cell> {
        (0..self.len()).filter_map(|i| self.cell(i)).collect()
    }

    pub fn take(&self, positions: &[usize]) -> Result<Self, FrameError> {
        let payload = match &self.payload {
            ColumnPayload::Value(column) => ColumnPayload::Value(Arc::new(column.take(positions)?)),
            ColumnPayload::Group(children) => {
                ColumnPayload::Group(Arc::new(children.take_rows(positions)?))
            }
            ColumnPayload::Frame(cells) => {
                let taken = positions
                    .iter()
                    .map(|&position| {
                        cells
                            .get(position)
                            .cloned()
                            .ok_or(ColumnError::PositionOutOfBounds {
                                position,
                                len: cells.len(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                ColumnPayload::Frame(Arc::from(taken))
            }
        };
        Ok(Self {
            name: self.name.clone(),
            payload,
        })
    }

    #[must_use]
    pub fn slice(&self, range: Range<usize>) -> Self {
        let payload = match &self.payload {
            ColumnPayload::Value(column) => ColumnPayload::Value(Arc::new(column.slice(range))),
            ColumnPayload::Group(children) => ColumnPayload::Group(Arc::new(children.slice_rows(range))),
            ColumnPayload::Frame(cells) => {
                let end = range.end.min(cells.len());
                let start = range.start.min(end);
                ColumnPayload::Frame(Arc::from(cells[start..end].to_vec()))
            }
        };
        Self {
            name: self.name.clone(),
            payload,
        }
    }

    /// A column of the same shape holding `len` missing cells.
    #[must_use]
    pub fn null_like(&self, len: usize) -> Self {
        match &self.payload {
            ColumnPayload::Value(column) => {
                Self::value(self.name.clone(), Column::nulls(column.dtype().clone(), len))
            }
            ColumnPayload::Group(children) => {
                let columns = children.columns().iter().map(|c| c.null_like(len)).collect();
                Self::group(self.name.clone(), DataFrame::from_parts(columns, len))
            }
            ColumnPayload::Frame(_) => Self::frames(self.name.clone(), vec![None; len]),
        }
    }
}

// ── Frames ─────────────────────────────────────────────────────────────

/// Ordered sibling columns sharing one row count.
#[derive(Debug, Clone, Default)]
pub struct DataFrame {
    columns: Vec<DataColumn>,
    names: HashMap<String, usize>,
    nrow: usize,
}

impl PartialEq for DataFrame {
    fn eq(&self, other: &Self) -> bool {
        self.nrow == other.nrow && self.columns == other.columns
    }
}

impl DataFrame {
    /// Validates equal lengths and unique non-empty names.
    pub fn new(columns: Vec<DataColumn>) -> Result<Self, FrameError> {
        let nrow = columns.first().map_or(0, DataColumn::len);
        if let Some(bad) = columns.iter().find(|column| column.len() != nrow) {
            return Err(FrameError::LengthMismatch {
                name: bad.name.clone(),
                expected: nrow,
                actual: bad.len(),
            });
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for column in &columns {
            if !column.name.is_empty() {
                *seen.entry(column.name.as_str()).or_default() += 1;
            }
        }
        let mut duplicates: Vec<String> = seen
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, _)| name.to_owned())
            .collect();
        if !duplicates.is_empty() {
            duplicates.sort();
            return Err(FrameError::DuplicateColumnNames { names: duplicates });
        }

        Ok(Self::from_parts(columns, nrow))
    }

    /// A frame without columns that still reports `nrow` rows.
    #[must_use]
    pub fn empty(nrow: usize) -> Self {
        Self {
            columns: Vec::new(),
            names: HashMap::new(),
            nrow,
        }
    }

    /// Value columns from `(name, values)` pairs, types inferred.
    pub fn from_columns(data: Vec<(&str, Vec<Scalar>)>) -> Result<Self, FrameError> {
        let columns = data
            .into_iter()
            .map(|(name, values)| DataColumn::from_scalars(name, values))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(columns)
    }

    /// Trusted constructor for columns already known to be consistent.
    fn from_parts(columns: Vec<DataColumn>, nrow: usize) -> Self {
        let mut names = HashMap::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            names.entry(column.name.clone()).or_insert(idx);
        }
        Self {
            columns,
            names,
            nrow,
        }
    }

    #[must_use]
    pub fn nrow(&self) -> usize {
        self.nrow
    }

    #[must_use]
    pub fn ncol(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn columns(&self) -> &[DataColumn] {
        &self.columns
    }

    #[must_use]
    pub fn into_columns(self) -> Vec<DataColumn> {
        self.columns
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(DataColumn::name).collect()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&DataColumn> {
        self.column_index(name).map(|idx| &self.columns[idx])
    }

    #[must_use]
    pub fn column_at(&self, index: usize) -> Option<&DataColumn> {
        self.columns.get(index)
    }

    /// Walk `path` through group columns.
    #[must_use]
    pub fn get_path(&self, path: &ColumnPath) -> Option<&DataColumn> {
        let (last, parents) = path.segments().split_last()?;
        let mut frame = self;
        for segment in parents {
            frame = frame.column(segment)?.as_group()?;
        }
        frame.column(last)
    }

    /// Frame addressed by a group path; the root path addresses `self`.
    #[must_use]
    pub fn group_at(&self, path: &ColumnPath) -> Option<&DataFrame> {
        if path.is_empty() {
            return Some(self);
        }
        self.get_path(path)?.as_group()
    }

    #[must_use]
    pub fn row(&self, index: usize) -> Option<DataRow<'_>> {
        (index < self.nrow).then_some(DataRow { frame: self, index })
    }

    pub fn rows(&self) -> impl Iterator<Item = DataRow<'_>> {
        (0..self.nrow).map(move |index| DataRow { frame: self, index })
    }

    /// Every column with its full path, depth first in physical order.
    #[must_use]
    pub fn dfs(&self) -> Vec<(ColumnPath, &DataColumn)> {
        let mut out = Vec::new();
        self.collect_dfs(&ColumnPath::root(), &mut out);
        out
    }

    fn collect_dfs<'a>(&'a self, prefix: &ColumnPath, out: &mut Vec<(ColumnPath, &'a DataColumn)>) {
        for column in &self.columns {
            let path = prefix.child(column.name());
            if let Some(children) = column.as_group() {
                out.push((path.clone(), column));
                children.collect_dfs(&path, out);
            } else {
                out.push((path, column));
            }
        }
    }

    pub fn take_rows(&self, positions: &[usize]) -> Result<Self, FrameError> {
        if let Some(&position) = positions.iter().find(|&&p| p >= self.nrow) {
            return Err(ColumnError::PositionOutOfBounds {
                position,
                len: self.nrow,
            }
            .into());
        }
        let columns = self
            .columns
            .iter()
            .map(|column| column.take(positions))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_parts(columns, positions.len()))
    }

    #[must_use]
    pub fn slice_rows(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.nrow);
        let start = range.start.min(end);
        let columns = self
            .columns
            .iter()
            .map(|column| column.slice(start..end))
            .collect();
        Self::from_parts(columns, end - start)
    }

    pub fn filter_rows(&self, mask: &[bool]) -> Result<Self, FrameError> {
        if mask.len() != self.nrow {
            return Err(ColumnError::LengthMismatch {
                left: self.nrow,
                right: mask.len(),
            }
            .into());
        }
        let positions: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(idx, keep)| keep.then_some(idx))
            .collect();
        self.take_rows(&positions)
    }

    /// Persistent add-or-replace by the column's own name.
    pub fn with_column(&self, column: DataColumn) -> Result<Self, FrameError> {
        let mut next = self.clone();
        let name = column.name().to_owned();
        next.set_column(&name, column)?;
        Ok(next)
    }

    /// In-place add-or-replace, renaming `column` to `name`.
    ///
    /// This is the only mutating operation on a frame. It needs `&mut self`,
    /// so it can only run on a uniquely owned handle.
    pub fn set_column(&mut self, name: &str, column: DataColumn) -> Result<(), FrameError> {
        let adopt_len = self.columns.is_empty() && self.nrow == 0;
        if !adopt_len && column.len() != self.nrow {
            return Err(FrameError::LengthMismatch {
                name: name.to_owned(),
                expected: self.nrow,
                actual: column.len(),
            });
        }
        if adopt_len {
            self.nrow = column.len();
        }
        let column = column.renamed(name);
        match self.column_index(name) {
            Some(idx) if !name.is_empty() => self.columns[idx] = column,
            _ => {
                self.names
                    .entry(name.to_owned())
                    .or_insert(self.columns.len());
                self.columns.push(column);
            }
        }
        Ok(())
    }

    /// Row-wise concatenation matching columns by name at every level.
    ///
    /// Columns missing from some frames are null-filled; value columns unify
    /// their element types. Mixing kinds under one name is an error.
    pub fn union(frames: &[DataFrame]) -> Result<Self, FrameError> {
        let total: usize = frames.iter().map(DataFrame::nrow).sum();
        let mut order: Vec<&str> = Vec::new();
        for frame in frames {
            for column in &frame.columns {
                if !order.contains(&column.name()) {
                    order.push(column.name());
                }
            }
        }

        let mut columns = Vec::with_capacity(order.len());
        for name in order {
            let parts: Vec<(Option<&DataColumn>, usize)> = frames
                .iter()
                .map(|frame| (frame.column(name), frame.nrow))
                .collect();
            let mut kinds = parts.iter().filter_map(|(c, _)| c.map(DataColumn::kind));
            let kind = kinds.next().unwrap_or(ColumnKind::Value);
            if kinds.any(|k| k != kind) {
                return Err(FrameError::MixedCellKinds {
                    name: name.to_owned(),
                });
            }

            let merged = match kind {
                ColumnKind::Value => {
                    let owned: Vec<Column> = parts
                        .iter()
                        .map(|(column, len)| match column.and_then(DataColumn::as_value) {
                            Some(values) => values.clone(),
                            None => Column::nulls(DType::Null, *len),
                        })
                        .collect();
                    let refs: Vec<&Column> = owned.iter().collect();
                    DataColumn::value(name, Column::concat(&refs)?)
                }
                ColumnKind::Group => {
                    let children: Vec<DataFrame> = parts
                        .iter()
                        .map(|(column, len)| match column.and_then(DataColumn::as_group) {
                            Some(children) => children.clone(),
                            None => DataFrame::empty(*len),
                        })
                        .collect();
                    DataColumn::group(name, Self::union(&children)?)
                }
                ColumnKind::Frame => {
                    let cells: Vec<Option<DataFrame>> = parts
                        .iter()
                        .flat_map(|(column, len)| match column.and_then(DataColumn::as_frames) {
                            Some(cells) => cells.to_vec(),
                            None => vec![None; *len],
                        })
                        .collect();
                    DataColumn::frames(name, cells)
                }
            };
            columns.push(merged);
        }

        Ok(Self::from_parts(columns, total))
    }

    /// Names, paths, kinds and types of every column, recursively.
    #[must_use]
    pub fn schema(&self) -> FrameSchema {
        self.schema_at(&ColumnPath::root())
    }

    fn schema_at(&self, prefix: &ColumnPath) -> FrameSchema {
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let path = prefix.child(column.name());
                let children = match column.payload() {
                    ColumnPayload::Value(_) => None,
                    ColumnPayload::Group(children) => Some(children.schema_at(&path)),
                    ColumnPayload::Frame(cells) => {
                        let present: Vec<DataFrame> = cells.iter().flatten().cloned().collect();
                        match Self::union(&present) {
                            Ok(merged) => Some(merged.schema_at(&path)),
                            Err(_) => present.first().map(|first| first.schema_at(&path)),
                        }
                    }
                };
                ColumnSchema {
                    name: column.name().to_owned(),
                    path,
                    kind: column.kind(),
                    column_type: column.column_type(),
                    children,
                }
            })
            .collect();
        FrameSchema { columns }
    }
}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    frame: &'a DataFrame,
    index: usize,
}

impl<'a> DataRow<'a> {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn frame(&self) -> &'a DataFrame {
        self.frame
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Cell> {
        self.frame.column(name)?.cell(self.index)
    }

    #[must_use]
    pub fn get_path(&self, path: &ColumnPath) -> Option<Cell> {
        self.frame.get_path(path)?.cell(self.index)
    }

    /// Scalar at a value-column path.
    #[must_use]
    pub fn scalar(&self, path: &ColumnPath) -> Option<&'a Scalar> {
        self.frame.get_path(path)?.as_value()?.value(self.index)
    }

    #[must_use]
    pub fn cells(&self) -> Vec<Cell> {
        self.frame
            .columns
            .iter()
            .filter_map(|column| column.cell(self.index))
            .collect()
    }
}

// ── Column construction from raw cells ────────────────────────────────

/// Build a column from heterogeneous cells.
///
/// All-value cells give a value column whose type is inferred, or the
/// hinted type widened to fit when `guess` is false. Rows give a group
/// column and frames give a frame column; missing values are allowed in
/// both. Anything else is [`FrameError::MixedCellKinds`].
pub fn create_column(
    name: impl Into<String>,
    cells: Vec<Cell>,
    hint: Option<&DType>,
    guess: bool,
) -> Result<DataColumn, FrameError> {
    let name = name.into();
    let has_rows = cells.iter().any(|c| matches!(c, Cell::Row(_)));
    let has_frames = cells.iter().any(|c| matches!(c, Cell::Frame(_)));
    let has_values = cells
        .iter()
        .any(|c| matches!(c, Cell::Value(v) if !v.is_null()));

    match (has_values, has_rows, has_frames) {
        (_, false, false) => {
            let values: Vec<Scalar> = cells
                .into_iter()
                .map(|cell| match cell {
                    Cell::Value(v) => v,
                    _ => Scalar::null(),
                })
                .collect();
            let inferred = infer_dtype(&values);
            let dtype = match hint {
                Some(hint) if !guess => common_dtype(hint, &inferred),
                Some(hint) if values.iter().all(Scalar::is_null) => hint.clone(),
                _ => inferred,
            };
            DataColumn::typed(name, dtype, values)
        }
        (false, true, false) => {
            let rows: Vec<DataFrame> = cells
                .into_iter()
                .map(|cell| match cell {
                    Cell::Row(row) => row,
                    _ => DataFrame::empty(1),
                })
                .collect();
            Ok(DataColumn::group(name, DataFrame::union(&rows)?))
        }
        (false, false, true) => {
            let frames = cells
                .into_iter()
                .map(|cell| match cell {
                    Cell::Frame(frame) => frame,
                    _ => None,
                })
                .collect();
            Ok(DataColumn::frames(name, frames))
        }
        _ => Err(FrameError::MixedCellKinds { name }),
    }
}

/// Reader entry point: infer the narrowest type for raw values.
pub fn guess_column_type(name: impl Into<String>, values: Vec<Scalar>) -> Result<DataColumn, FrameError> {
    DataColumn::from_scalars(name, values)
}

// ── Schema view ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSchema {
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub path: ColumnPath,
    pub kind: ColumnKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_type: Option<ColumnType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<FrameSchema>,
}

impl FrameSchema {
    fn render(&self, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for column in &self.columns {
            write!(f, "{:width$}{}:", "", column.name, width = indent * 4)?;
            match column.kind {
                ColumnKind::Value => match &column.column_type {
                    Some(column_type) => writeln!(f, " {column_type}")?,
                    None => writeln!(f)?,
                },
                ColumnKind::Group => writeln!(f)?,
                ColumnKind::Frame => writeln!(f, " *")?,
            }
            if let Some(children) = &column.children {
                children.render(indent + 1, f)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for FrameSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(0, f)
    }
}

// ── Name generation ────────────────────────────────────────────────────

/// Hands out names that do not clash with anything handed out before.
/// A taken `name` becomes `name_1`, then `name_2`, and so on.
#[derive(Debug, Clone, Default)]
pub struct ColumnNameGenerator {
    used: HashSet<String>,
}

impl ColumnNameGenerator {
    pub fn new<I, S>(taken: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            used: taken.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.used.contains(name)
    }

    pub fn add_unique(&mut self, preferred: &str) -> String {
        let mut candidate = preferred.to_owned();
        let mut k = 1;
        while self.used.contains(&candidate) {
            candidate = format!("{preferred}_{k}");
            k += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

#[cfg(test)]
mod tests {
    use ft_columnar::ColumnError;
    use ft_types::{DType, Scalar};

    use super::{
        Cell, ColumnKind, ColumnNameGenerator, ColumnPath, DataColumn, DataFrame, FrameError,
        create_column,
    };

    fn people() -> DataFrame {
        let name_and_city = DataFrame::from_columns(vec![
            ("name", vec!["Alice".into(), "Bob".into(), "Charlie".into()]),
            ("city", vec!["London".into(), Scalar::null(), "Moscow".into()]),
        ])
        .expect("group children");
        DataFrame::new(vec![
            DataColumn::group("nameAndCity", name_and_city),
            DataColumn::from_scalars("age", vec![15.into(), 45.into(), 20.into()]).expect("age"),
        ])
        .expect("people")
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = DataFrame::from_columns(vec![
            ("a", vec![1.into(), 2.into()]),
            ("b", vec![1.into()]),
        ])
        .expect_err("must fail");
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                name: "b".into(),
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn duplicate_names_are_rejected_except_placeholder() {
        let err = DataFrame::from_columns(vec![("a", vec![1.into()]), ("a", vec![2.into()])])
            .expect_err("must fail");
        assert!(matches!(err, FrameError::DuplicateColumnNames { .. }));

        let unnamed = DataFrame::from_columns(vec![("", vec![1.into()]), ("", vec![2.into()])])
            .expect("placeholder names may repeat");
        assert_eq!(unnamed.ncol(), 2);
    }

    #[test]
    fn empty_frame_keeps_row_count() {
        let frame = DataFrame::empty(3);
        assert_eq!(frame.nrow(), 3);
        assert_eq!(frame.ncol(), 0);
        assert_eq!(DataFrame::new(Vec::new()).expect("no columns").nrow(), 0);
    }

    #[test]
    fn paths_walk_through_groups_only() {
        let df = people();
        let city = df
            .get_path(&ColumnPath::from(["nameAndCity", "city"]))
            .expect("nested column");
        assert_eq!(city.kind(), ColumnKind::Value);
        assert!(city.has_nulls());
        assert!(df.get_path(&ColumnPath::from(["age", "x"])).is_none());
        assert!(df.get_path(&ColumnPath::root()).is_none());
    }

    #[test]
    fn path_helpers() {
        let path = ColumnPath::from(["a", "b", "c"]);
        assert_eq!(path.to_string(), "a.b.c");
        assert_eq!(path.parent(), ColumnPath::from(["a", "b"]));
        assert_eq!(path.suffix(2), ColumnPath::from(["b", "c"]));
        assert_eq!(path.suffix(9), path);
        assert_eq!(path.with_name("z"), ColumnPath::from(["a", "b", "z"]));
        assert_eq!(ColumnPath::root().with_name("z"), ColumnPath::from("z"));
        assert!(path.starts_with(&ColumnPath::from("a")));
    }

    #[test]
    fn dfs_lists_groups_before_children() {
        let df = people();
        let paths: Vec<String> = df.dfs().into_iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(
            paths,
            vec!["nameAndCity", "nameAndCity.name", "nameAndCity.city", "age"]
        );
    }

    #[test]
    fn take_rows_recurses_into_groups() {
        let df = people();
        let taken = df.take_rows(&[2, 0]).expect("take");
        let row = taken.row(0).expect("row");
        assert_eq!(
            row.scalar(&ColumnPath::from(["nameAndCity", "name"])),
            Some(&Scalar::from("Charlie"))
        );
        assert!(matches!(
            df.take_rows(&[3]),
            Err(FrameError::Column(ColumnError::PositionOutOfBounds { position: 3, len: 3 }))
        ));
    }

    #[test]
    fn group_cell_is_single_row_frame() {
        let df = people();
        let Some(Cell::Row(row)) = df.column("nameAndCity").and_then(|c| c.cell(1)) else {
            panic!("expected a row cell");
        };
        assert_eq!(row.nrow(), 1);
        assert_eq!(row.column_names(), vec!["name", "city"]);
    }

    #[test]
    fn set_column_replaces_or_appends() {
        let mut df = people();
        let weight = DataColumn::from_scalars("w", vec![1.into(), 2.into(), 3.into()]).expect("w");
        df.set_column("weight", weight.clone()).expect("append");
        assert_eq!(df.column_names(), vec!["nameAndCity", "age", "weight"]);

        df.set_column("age", weight).expect("replace");
        assert_eq!(df.column_names(), vec!["nameAndCity", "age", "weight"]);
        assert_eq!(df.column("age").and_then(DataColumn::dtype), Some(&DType::Int64));

        let short = DataColumn::from_scalars("s", vec![1.into()]).expect("short");
        assert!(df.set_column("s", short).is_err());
    }

    #[test]
    fn set_column_on_fresh_frame_adopts_length() {
        let mut df = DataFrame::default();
        df.set_column("a", DataColumn::from_scalars("x", vec![1.into(), 2.into()]).expect("a"))
            .expect("adopt");
        assert_eq!(df.nrow(), 2);
        assert_eq!(df.column_names(), vec!["a"]);
    }

    #[test]
    fn union_fills_missing_columns_and_widens() {
        let left = DataFrame::from_columns(vec![("a", vec![1.into()]), ("b", vec!["x".into()])])
            .expect("left");
        let right = DataFrame::from_columns(vec![("a", vec![2.5.into()])]).expect("right");
        let merged = DataFrame::union(&[left, right]).expect("union");
        assert_eq!(merged.nrow(), 2);
        let a = merged.column("a").and_then(DataColumn::as_value).expect("a");
        assert_eq!(a.dtype(), &DType::Float64);
        let b = merged.column("b").and_then(DataColumn::as_value).expect("b");
        assert_eq!(b.null_count(), 1);
    }

    #[test]
    fn union_rejects_kind_mixture() {
        let left = people();
        let right = DataFrame::from_columns(vec![("nameAndCity", vec![1.into()])]).expect("right");
        assert!(matches!(
            DataFrame::union(&[left, right]),
            Err(FrameError::MixedCellKinds { .. })
        ));
    }

    #[test]
    fn create_column_promotes_mixed_list_cells() {
        let column = create_column(
            "age",
            vec![
                Cell::Value(Scalar::List(vec![15.into(), 55.into()])),
                Cell::from(45),
                Cell::null(),
            ],
            None,
            true,
        )
        .expect("column");
        assert_eq!(column.dtype(), Some(&DType::list_of(DType::Int64)));
        assert_eq!(
            column.as_value().expect("values").values()[1],
            Scalar::List(vec![Scalar::Int64(45)])
        );
    }

    #[test]
    fn create_column_honours_declared_type() {
        let column = create_column("n", vec![Cell::from(1), Cell::null()], Some(&DType::Float64), false)
            .expect("column");
        assert_eq!(column.dtype(), Some(&DType::Float64));

        let nulls = create_column("n", vec![Cell::null()], Some(&DType::Int64), true).expect("nulls");
        assert_eq!(nulls.dtype(), Some(&DType::Int64));
    }

    #[test]
    fn create_column_builds_groups_and_frames() {
        let df = people();
        let rows = df.column("nameAndCity").expect("group").cells();
        let group = create_column("g", rows, None, true).expect("group");
        assert_eq!(group.kind(), ColumnKind::Group);
        assert_eq!(group.as_group(), df.column("nameAndCity").and_then(DataColumn::as_group));

        let frames = create_column("f", vec![Cell::from(df.clone()), Cell::null()], None, true)
            .expect("frames");
        assert_eq!(frames.kind(), ColumnKind::Frame);
        assert!(frames.has_nulls());

        let mixed = create_column("m", vec![Cell::from(df), Cell::from(1)], None, true);
        assert!(matches!(mixed, Err(FrameError::MixedCellKinds { .. })));
    }

    #[test]
    fn schema_describes_nested_columns() {
        let df = people();
        let frames = DataColumn::frames("history", vec![Some(df.clone()), None, None]);
        let df = df.with_column(frames).expect("frame column");
        let schema = df.schema();
        assert_eq!(
            schema.to_string(),
            "nameAndCity:\n    name: utf8\n    city: utf8?\nage: int64\nhistory: *\n    nameAndCity:\n        name: utf8\n        city: utf8?\n    age: int64\n"
        );
        let json = serde_json::to_value(&schema).expect("json");
        assert_eq!(json["columns"][0]["kind"], "group");
        assert_eq!(json["columns"][0]["children"]["columns"][1]["path"][1], "city");
    }

    #[test]
    fn name_generator_suffixes_taken_names() {
        let mut names = ColumnNameGenerator::new(["groups", "a"]);
        assert_eq!(names.add_unique("groups"), "groups_1");
        assert_eq!(names.add_unique("groups"), "groups_2");
        assert_eq!(names.add_unique("b"), "b");
        assert!(names.contains("b"));
    }
}
