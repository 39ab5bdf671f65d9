#![forbid(unsafe_code)]

use std::{collections::HashMap, mem::size_of};

use bumpalo::{Bump, collections::Vec as BumpVec};
use chrono::{NaiveDate, NaiveDateTime};
use ft_columnar::Column;
use ft_frame::{
    ColumnKind, ColumnNameGenerator, ColumnPath, DataColumn, DataFrame, DataRow, FrameError,
};
use ft_select::{ResolveError, Selector, UnresolvedColumnsPolicy, resolve, top_level};
use ft_tree::{ColumnToInsert, TreeError, insert_columns, shorten_paths};
use ft_types::Scalar;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_GROUPS_COLUMN: &str = "groups";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupByOptions {
    /// Drop rows whose key holds a missing value instead of grouping them.
    pub dropna: bool,
    pub groups_column: String,
}

impl Default for GroupByOptions {
    fn default() -> Self {
        Self {
            dropna: false,
            groups_column: DEFAULT_GROUPS_COLUMN.to_owned(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GroupByError {
    #[error("column '{path}' holds frames and cannot be a grouping key")]
    UnsupportedKeyColumn { path: ColumnPath },
    #[error("key has {actual} values but the frame is grouped by {expected}")]
    KeyTooLong { expected: usize, actual: usize },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupByExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for GroupByExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

// ── Keys ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum GroupKeyRef<'a> {
    Missing,
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(&'a str),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    List(Vec<GroupKeyRef<'a>>),
}

impl<'a> GroupKeyRef<'a> {
    fn from_scalar(key: &'a Scalar) -> Self {
        if key.is_missing() {
            return Self::Missing;
        }
        match key {
            Scalar::Null(_) => Self::Missing,
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            // -0.0 and 0.0 compare equal, so they must share a key.
            Scalar::Float64(v) => Self::FloatBits(if *v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() }),
            Scalar::Utf8(v) => Self::Utf8(v.as_str()),
            Scalar::Date(v) => Self::Date(*v),
            Scalar::DateTime(v) => Self::DateTime(*v),
            Scalar::List(items) => Self::List(items.iter().map(Self::from_scalar).collect()),
        }
    }
}

/// Value columns a key column contributes, in depth-first order.
fn collect_key_leaves<'a>(
    column: &'a DataColumn,
    path: &ColumnPath,
    out: &mut Vec<&'a Column>,
) -> Result<(), GroupByError> {
    match column.kind() {
        ColumnKind::Value => {
            if let Some(values) = column.as_value() {
                out.push(values);
            }
        }
        ColumnKind::Group => {
            if let Some(children) = column.as_group() {
                for child in children.columns() {
                    collect_key_leaves(child, &path.child(child.name()), out)?;
                }
            }
        }
        ColumnKind::Frame => {
            return Err(GroupByError::UnsupportedKeyColumn { path: path.clone() });
        }
    }
    Ok(())
}

fn row_key<'a>(leaves: &[&'a Column], row: usize, dropna: bool) -> Option<Vec<GroupKeyRef<'a>>> {
    let mut key = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        let value = leaf.value(row)?;
        if dropna && value.is_missing() {
            return None;
        }
        key.push(GroupKeyRef::from_scalar(value));
    }
    Some(key)
}

// ── Partitioning ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupByExecutionTrace {
    used_arena: bool,
    input_rows: usize,
    estimated_bytes: usize,
}

/// Estimate intermediate memory: one key vector plus one map entry per row.
fn estimate_groupby_intermediate_bytes(input_rows: usize, key_width: usize) -> usize {
    input_rows.saturating_mul(
        size_of::<usize>()
            .saturating_add(key_width.saturating_mul(size_of::<GroupKeyRef<'_>>()))
            .saturating_add(64),
    )
}

/// Row indices of every group, groups in order of first appearance.
fn partition_rows(
    leaves: &[&Column],
    nrow: usize,
    dropna: bool,
    exec_options: GroupByExecutionOptions,
) -> (Vec<Vec<usize>>, GroupByExecutionTrace) {
    let estimated_bytes = estimate_groupby_intermediate_bytes(nrow, leaves.len());
    let use_arena = exec_options.use_arena && estimated_bytes <= exec_options.arena_budget_bytes;
    let groups = if use_arena {
        partition_with_arena(leaves, nrow, dropna)
    } else {
        partition_with_global_allocator(leaves, nrow, dropna)
    };
    (
        groups,
        GroupByExecutionTrace {
            used_arena: use_arena,
            input_rows: nrow,
            estimated_bytes,
        },
    )
}

fn partition_with_global_allocator(leaves: &[&Column], nrow: usize, dropna: bool) -> Vec<Vec<usize>> {
    let mut slot = HashMap::<Vec<GroupKeyRef<'_>>, usize>::new();
    let mut members = Vec::<Vec<usize>>::new();

    for row in 0..nrow {
        let Some(key) = row_key(leaves, row, dropna) else {
            continue;
        };
        let next = members.len();
        let group = *slot.entry(key).or_insert(next);
        if group == next {
            members.push(Vec::new());
        }
        members[group].push(row);
    }
    members
}

/// Same partition with the per-group row lists bump-allocated; they are
/// copied out once and freed in bulk when the arena drops.
fn partition_with_arena(leaves: &[&Column], nrow: usize, dropna: bool) -> Vec<Vec<usize>> {
    let arena = Bump::new();
    let mut slot = HashMap::<Vec<GroupKeyRef<'_>>, usize>::new();
    let mut members = BumpVec::<BumpVec<'_, usize>>::new_in(&arena);

    for row in 0..nrow {
        let Some(key) = row_key(leaves, row, dropna) else {
            continue;
        };
        let next = members.len();
        let group = *slot.entry(key).or_insert(next);
        if group == next {
            members.push(BumpVec::new_in(&arena));
        }
        members[group].push(row);
    }
    members.iter().map(|rows| rows.to_vec()).collect()
}

// ── groupBy ────────────────────────────────────────────────────────────

pub fn group_by(frame: &DataFrame, selector: &Selector) -> Result<GroupedDataFrame, GroupByError> {
    group_by_with_options(
        frame,
        selector,
        &GroupByOptions::default(),
        GroupByExecutionOptions::default(),
    )
}

/// Partition `frame` by the values of the selected key columns.
///
/// Groups come out in the order their key first appears. Group columns used
/// as keys compare by all of their leaf values; frame columns cannot be keys.
pub fn group_by_with_options(
    frame: &DataFrame,
    selector: &Selector,
    options: &GroupByOptions,
    exec_options: GroupByExecutionOptions,
) -> Result<GroupedDataFrame, GroupByError> {
    let resolved = top_level(resolve(frame, selector, UnresolvedColumnsPolicy::Fail)?);
    let paths: Vec<ColumnPath> = resolved.iter().map(|c| c.path().clone()).collect();

    let mut leaves = Vec::new();
    for (column, path) in resolved.iter().zip(&paths) {
        collect_key_leaves(column.column(), path, &mut leaves)?;
    }

    let (members, trace) = partition_rows(&leaves, frame.nrow(), options.dropna, exec_options);
    let firsts: Vec<usize> = members.iter().map(|rows| rows[0]).collect();

    let key_values: Vec<Vec<Scalar>> = firsts
        .iter()
        .map(|&row| {
            leaves
                .iter()
                .map(|leaf| leaf.value(row).cloned().unwrap_or_else(Scalar::null))
                .collect()
        })
        .collect();

    let key_paths = shorten_paths(&paths);
    let key_columns = resolved
        .iter()
        .zip(&key_paths)
        .map(|(column, path)| {
            Ok(ColumnToInsert::new(path.clone(), column.column().take(&firsts)?))
        })
        .collect::<Result<Vec<_>, FrameError>>()?;
    let keys = if key_columns.is_empty() {
        DataFrame::empty(firsts.len())
    } else {
        insert_columns(None, key_columns, None)?
    };

    let permutation: Vec<usize> = members.iter().flatten().copied().collect();
    let sorted = frame.take_rows(&permutation)?;
    let mut groups = Vec::with_capacity(members.len());
    let mut start = 0;
    for rows in &members {
        groups.push(sorted.slice_rows(start..start + rows.len()));
        start += rows.len();
    }

    let groups_column = ColumnNameGenerator::new(keys.column_names()).add_unique(&options.groups_column);

    debug!(
        groups = groups.len(),
        rows = trace.input_rows,
        key_columns = paths.len(),
        used_arena = trace.used_arena,
        estimated_bytes = trace.estimated_bytes,
        "grouped frame"
    );

    Ok(GroupedDataFrame {
        keys,
        key_paths,
        key_values,
        groups,
        groups_column,
        empty: frame.slice_rows(0..0),
    })
}

/// A frame split into groups, one key row per group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedDataFrame {
    keys: DataFrame,
    key_paths: Vec<ColumnPath>,
    key_values: Vec<Vec<Scalar>>,
    groups: Vec<DataFrame>,
    groups_column: String,
    /// Source schema with no rows, returned when nothing matches.
    empty: DataFrame,
}

impl GroupedDataFrame {
    #[must_use]
    pub fn keys(&self) -> &DataFrame {
        &self.keys
    }

    /// Paths of the key columns inside [`Self::keys`].
    #[must_use]
    pub fn key_paths(&self) -> &[ColumnPath] {
        &self.key_paths
    }

    #[must_use]
    pub fn key_row(&self, index: usize) -> Option<DataRow<'_>> {
        self.keys.row(index)
    }

    /// Leaf key values of group `index`, depth-first.
    #[must_use]
    pub fn key_values(&self, index: usize) -> Option<&[Scalar]> {
        self.key_values.get(index).map(Vec::as_slice)
    }

    #[must_use]
    pub fn groups(&self) -> &[DataFrame] {
        &self.groups
    }

    #[must_use]
    pub fn group(&self, index: usize) -> Option<&DataFrame> {
        self.groups.get(index)
    }

    #[must_use]
    pub fn ngroups(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn groups_column(&self) -> &str {
        &self.groups_column
    }

    /// Key columns followed by one frame column holding each group.
    pub fn plain(&self) -> Result<DataFrame, GroupByError> {
        let groups = DataColumn::frames(
            self.groups_column.clone(),
            self.groups.iter().cloned().map(Some).collect(),
        );
        let mut out = self.keys.clone();
        out.set_column(&self.groups_column, groups)?;
        Ok(out)
    }

    /// Rows of every group whose key starts with `prefix`.
    pub fn get(&self, prefix: &[Scalar]) -> Result<DataFrame, GroupByError> {
        let width = self.key_values.first().map_or(0, Vec::len);
        if prefix.len() > width && !self.key_values.is_empty() {
            return Err(GroupByError::KeyTooLong {
                expected: width,
                actual: prefix.len(),
            });
        }
        let matched: Vec<DataFrame> = self
            .key_values
            .iter()
            .zip(&self.groups)
            .filter(|(key, _)| prefix.iter().zip(key.iter()).all(|(a, b)| a.semantic_eq(b)))
            .map(|(_, group)| group.clone())
            .collect();
        self.concat(&matched)
    }

    /// All rows again, ordered group by group.
    pub fn ungroup(&self) -> Result<DataFrame, GroupByError> {
        self.concat(&self.groups)
    }

    fn concat(&self, frames: &[DataFrame]) -> Result<DataFrame, GroupByError> {
        if frames.is_empty() {
            return Ok(self.empty.clone());
        }
        Ok(DataFrame::union(frames)?)
    }

    pub fn map_groups<F>(&self, mut map: F) -> Result<Self, GroupByError>
    where
        F: FnMut(&DataFrame) -> Result<DataFrame, GroupByError>,
    {
        let groups = self.groups.iter().map(&mut map).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            groups,
            ..self.clone()
        })
    }

    /// Keep the groups `keep` accepts.
    pub fn filter<F>(&self, mut keep: F) -> Result<Self, GroupByError>
    where
        F: FnMut(&DataRow<'_>, &DataFrame) -> bool,
    {
        let mask: Vec<bool> = self
            .keys
            .rows()
            .zip(&self.groups)
            .map(|(key, group)| keep(&key, group))
            .collect();
        let keys = self.keys.filter_rows(&mask)?;
        let kept: Vec<usize> = (0..mask.len()).filter(|&idx| mask[idx]).collect();
        Ok(Self {
            keys,
            key_paths: self.key_paths.clone(),
            key_values: kept.iter().map(|&i| self.key_values[i].clone()).collect(),
            groups: kept.iter().map(|&i| self.groups[i].clone()).collect(),
            groups_column: self.groups_column.clone(),
            empty: self.empty.clone(),
        })
    }
}
