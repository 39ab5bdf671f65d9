#![forbid(unsafe_code)]

use std::collections::HashMap;

use ft_columnar::Column;
use ft_frame::{ColumnKind, ColumnPath, DataColumn, DataFrame, FrameError};
use ft_select::{ResolveError, Selector, UnresolvedColumnsPolicy, resolve, resolve_single};
use ft_types::{ConverterRegistry, DType};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TreeError {
    #[error("cannot insert two columns at '{path}'")]
    DuplicateInsertion { path: ColumnPath },
    #[error("column '{path}' already exists")]
    PathExists { path: ColumnPath },
    #[error("column '{path}' is not a column group")]
    NotAGroup { path: ColumnPath },
    #[error("insertion path is empty")]
    EmptyPath,
    #[error("move target index {index} out of range for {ncol} columns")]
    IndexOutOfBounds { index: usize, ncol: usize },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ── Arena tree ─────────────────────────────────────────────────────────

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct TreeNode<D> {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    depth: usize,
    data: D,
}

impl<D> TreeNode<D> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Root is depth 0, top-level columns depth 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn data(&self) -> &D {
        &self.data
    }
}

/// Column-shaped tree stored in a flat arena; node ids are arena indices.
#[derive(Debug, Clone)]
pub struct ColumnTree<D> {
    nodes: Vec<TreeNode<D>>,
}

impl<D> ColumnTree<D> {
    pub fn new(root: D) -> Self {
        Self {
            nodes: vec![TreeNode {
                name: String::new(),
                parent: None,
                children: Vec::new(),
                depth: 0,
                data: root,
            }],
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        0
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &TreeNode<D> {
        &self.nodes[id]
    }

    pub fn data_mut(&mut self, id: NodeId) -> &mut D {
        &mut self.nodes[id].data
    }

    pub fn add_child(&mut self, parent: NodeId, name: impl Into<String>, data: D) -> NodeId {
        let id = self.nodes.len();
        let depth = self.nodes[parent].depth + 1;
        self.nodes.push(TreeNode {
            name: name.into(),
            parent: Some(parent),
            children: Vec::new(),
            depth,
            data,
        });
        self.nodes[parent].children.push(id);
        id
    }

    #[must_use]
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&id| self.nodes[id].name == name)
    }

    #[must_use]
    pub fn find(&self, path: &ColumnPath) -> Option<NodeId> {
        path.segments()
            .iter()
            .try_fold(self.root(), |node, segment| self.child(node, segment))
    }

    /// Look up `path`, creating missing nodes with `make(prefix)` on the way.
    pub fn get_or_put(&mut self, path: &ColumnPath, mut make: impl FnMut(&ColumnPath) -> D) -> NodeId {
        let mut node = self.root();
        for (idx, segment) in path.segments().iter().enumerate() {
            node = match self.child(node, segment) {
                Some(existing) => existing,
                None => {
                    let data = make(&path.prefix(idx + 1));
                    self.add_child(node, segment.as_str(), data)
                }
            };
        }
        node
    }

    #[must_use]
    pub fn path(&self, id: NodeId) -> ColumnPath {
        let mut segments = Vec::new();
        let mut current = id;
        while let Some(parent) = self.nodes[current].parent {
            segments.push(self.nodes[current].name.clone());
            current = parent;
        }
        segments.reverse();
        ColumnPath::from(segments)
    }

    #[must_use]
    pub fn ancestor_at_depth(&self, id: NodeId, depth: usize) -> NodeId {
        let mut current = id;
        while self.nodes[current].depth > depth {
            match self.nodes[current].parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Pre-order ids, root excluded.
    #[must_use]
    pub fn dfs(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[0].children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.nodes[id].children.iter().rev().copied());
        }
        out
    }
}

/// Where a column sat before an edit and what became of it.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPosition {
    pub original_index: usize,
    pub was_removed: bool,
    /// Set only when the whole column was taken out.
    pub column: Option<DataColumn>,
}

impl ColumnPosition {
    fn kept(original_index: usize) -> Self {
        Self {
            original_index,
            was_removed: false,
            column: None,
        }
    }
}

pub type PositionTree = ColumnTree<ColumnPosition>;

fn position_root() -> PositionTree {
    ColumnTree::new(ColumnPosition::kept(0))
}

// ── Remove ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RemoveResult {
    frame: DataFrame,
    tree: PositionTree,
    removed: Vec<NodeId>,
}

impl RemoveResult {
    #[must_use]
    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    #[must_use]
    pub fn tree(&self) -> &PositionTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut PositionTree {
        &mut self.tree
    }

    /// Removed nodes in selector order.
    #[must_use]
    pub fn removed(&self) -> &[NodeId] {
        &self.removed
    }

    #[must_use]
    pub fn removed_columns(&self) -> Vec<(ColumnPath, &DataColumn)> {
        self.removed
            .iter()
            .filter_map(|&id| {
                let column = self.tree.node(id).data().column.as_ref()?;
                Some((self.tree.path(id), column))
            })
            .collect()
    }

    /// Every removed column, addressed back at its own path and position.
    #[must_use]
    pub fn to_insertable(&self) -> Vec<ColumnToInsert> {
        self.removed_columns()
            .into_iter()
            .zip(&self.removed)
            .map(|((path, column), &id)| ColumnToInsert {
                insertion_path: path,
                column: column.clone(),
                reference: Some(id),
            })
            .collect()
    }

    /// Put the removed columns back where they were.
    pub fn restore(&self) -> Result<DataFrame, TreeError> {
        insert_columns(Some(&self.frame), self.to_insertable(), Some(&self.tree))
    }

    #[must_use]
    pub fn into_frame(self) -> DataFrame {
        self.frame
    }
}

/// Take the selected columns out of `frame`, recording their positions.
///
/// Groups that lose some children are kept; groups that lose all of them
/// disappear. Removing every column leaves an empty frame with the original
/// row count.
pub fn remove_columns(frame: &DataFrame, selector: &Selector) -> Result<RemoveResult, TreeError> {
    let resolved = resolve(frame, selector, UnresolvedColumnsPolicy::Fail)?;
    let paths: Vec<ColumnPath> = resolved.into_iter().map(|c| c.path().clone()).collect();
    let mut order: HashMap<&ColumnPath, usize> = HashMap::new();
    for (idx, path) in paths.iter().enumerate() {
        order.entry(path).or_insert(idx);
    }

    let mut tree = position_root();
    if paths.is_empty() {
        return Ok(RemoveResult {
            frame: frame.clone(),
            tree,
            removed: Vec::new(),
        });
    }

    let targets: Vec<&ColumnPath> = paths.iter().collect();
    let root = tree.root();
    let kept = remove_from(frame, &targets, &mut tree, root, 0)?;
    let remaining = kept.unwrap_or_else(|| DataFrame::empty(frame.nrow()));

    let mut removed: Vec<NodeId> = tree
        .dfs()
        .into_iter()
        .filter(|&id| {
            let data = tree.node(id).data();
            data.was_removed && data.column.is_some()
        })
        .collect();
    removed.sort_by_key(|&id| order.get(&tree.path(id)).copied().unwrap_or(usize::MAX));

    debug!(removed = removed.len(), remaining = remaining.ncol(), "removed columns");
    Ok(RemoveResult {
        frame: remaining,
        tree,
        removed,
    })
}

/// Convenience form of [`remove_columns`] returning only the new frame.
pub fn remove(frame: &DataFrame, selector: &Selector) -> Result<DataFrame, TreeError> {
    Ok(remove_columns(frame, selector)?.into_frame())
}

fn remove_from(
    frame: &DataFrame,
    targets: &[&ColumnPath],
    tree: &mut PositionTree,
    node: NodeId,
    depth: usize,
) -> Result<Option<DataFrame>, TreeError> {
    let mut by_name: HashMap<&str, Vec<&ColumnPath>> = HashMap::new();
    for &path in targets {
        by_name
            .entry(path.segments()[depth].as_str())
            .or_default()
            .push(path);
    }

    let mut kept = Vec::with_capacity(frame.ncol());
    for (index, column) in frame.columns().iter().enumerate() {
        let Some(matched) = by_name.get(column.name()) else {
            kept.push(column.clone());
            continue;
        };
        let child = tree.add_child(node, column.name(), ColumnPosition {
            original_index: index,
            was_removed: true,
            column: None,
        });
        if matched.iter().all(|path| path.len() > depth + 1) {
            let children = column.as_group().ok_or_else(|| TreeError::NotAGroup {
                path: tree.path(child),
            })?;
            if let Some(rest) = remove_from(children, matched, tree, child, depth + 1)? {
                kept.push(column.with_children(rest));
                tree.data_mut(child).was_removed = false;
            }
        } else {
            tree.data_mut(child).column = Some(column.clone());
        }
    }

    if kept.is_empty() {
        return Ok(None);
    }
    Ok(Some(DataFrame::new(kept)?))
}

// ── Insert ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnToInsert {
    pub insertion_path: ColumnPath,
    pub column: DataColumn,
    /// Node of a [`PositionTree`] the column should be placed relative to.
    pub reference: Option<NodeId>,
}

impl ColumnToInsert {
    pub fn new(path: impl Into<ColumnPath>, column: DataColumn) -> Self {
        Self {
            insertion_path: path.into(),
            column,
            reference: None,
        }
    }
}

/// Merge `columns` into `base` (or into nothing) at their insertion paths.
///
/// Existing columns keep their relative order. New columns are placed by
/// their reference node: at the original index of a removed column, right
/// after a column that stayed, and at the end without a reference. Missing
/// groups along a path are created.
pub fn insert_columns(
    base: Option<&DataFrame>,
    columns: Vec<ColumnToInsert>,
    tree: Option<&PositionTree>,
) -> Result<DataFrame, TreeError> {
    if columns.iter().any(|c| c.insertion_path.is_empty()) {
        return Err(TreeError::EmptyPath);
    }
    let count = columns.len();
    let root = tree.map(ColumnTree::root);
    let out = insert_at(base, columns, tree, root, 0)?;
    debug!(inserted = count, ncol = out.ncol(), "inserted columns");
    Ok(out)
}

/// Insert a single column at `path`, appended to its parent group.
pub fn insert_at_path(
    frame: &DataFrame,
    path: impl Into<ColumnPath>,
    column: DataColumn,
) -> Result<DataFrame, TreeError> {
    insert_columns(Some(frame), vec![ColumnToInsert::new(path, column)], None)
}

/// Insert `column` immediately after the column `after` selects, at its level.
pub fn insert_after(
    frame: &DataFrame,
    column: DataColumn,
    after: impl Into<Selector>,
) -> Result<DataFrame, TreeError> {
    insert_all_after(frame, vec![column], after)
}

/// Insert `columns`, in order, immediately after the column `after` selects.
pub fn insert_all_after(
    frame: &DataFrame,
    columns: Vec<DataColumn>,
    after: impl Into<Selector>,
) -> Result<DataFrame, TreeError> {
    let target = resolve_single(frame, &after.into(), UnresolvedColumnsPolicy::Fail)?;
    let target_path = target.path().clone();
    let mut tree = position_root();
    let reference = tree.get_or_put(&target_path, |path| ColumnPosition::kept(index_in_parent(frame, path)));
    let parent = target_path.parent();
    let columns = columns
        .into_iter()
        .map(|column| ColumnToInsert {
            insertion_path: parent.child(column.name()),
            column,
            reference: Some(reference),
        })
        .collect();
    insert_columns(Some(frame), columns, Some(&tree))
}

fn index_in_parent(frame: &DataFrame, path: &ColumnPath) -> usize {
    path.name()
        .and_then(|name| frame.group_at(&path.parent())?.column_index(name))
        .unwrap_or(0)
}

fn child_of(tree: Option<&PositionTree>, node: Option<NodeId>, name: &str) -> Option<NodeId> {
    tree?.child(node?, name)
}

fn insertion_index(
    tree: Option<&PositionTree>,
    node: Option<NodeId>,
    reference: Option<NodeId>,
    depth: usize,
) -> usize {
    let (Some(tree), Some(node), Some(reference)) = (tree, node, reference) else {
        return usize::MAX;
    };
    let anchor = tree.ancestor_at_depth(reference, depth + 1);
    if tree.node(anchor).parent() != Some(node) {
        return usize::MAX;
    }
    let position = tree.node(anchor).data();
    if position.was_removed {
        position.original_index
    } else {
        position.original_index + 1
    }
}

fn insert_at(
    base: Option<&DataFrame>,
    columns: Vec<ColumnToInsert>,
    tree: Option<&PositionTree>,
    node: Option<NodeId>,
    depth: usize,
) -> Result<DataFrame, TreeError> {
    let child_depth = depth + 1;
    let mut groups: Vec<(String, Vec<ColumnToInsert>)> = Vec::new();
    for column in columns {
        let name = column.insertion_path.segments()[depth].clone();
        match groups.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, entries)) => entries.push(column),
            None => groups.push((name, vec![column])),
        }
    }

    let mut out: Vec<DataColumn> = Vec::new();
    if let Some(frame) = base {
        for column in frame.columns() {
            let Some(slot) = groups.iter().position(|(name, _)| name == column.name()) else {
                out.push(column.clone());
                continue;
            };
            let (_, entries) = groups.remove(slot);
            if let Some(clash) = entries.iter().find(|c| c.insertion_path.len() == child_depth) {
                return Err(TreeError::PathExists {
                    path: clash.insertion_path.clone(),
                });
            }
            let children = column.as_group().ok_or_else(|| TreeError::NotAGroup {
                path: entries[0].insertion_path.prefix(child_depth),
            })?;
            let child_node = child_of(tree, node, column.name());
            let merged = insert_at(Some(children), entries, tree, child_node, child_depth)?;
            out.push(column.with_children(merged));
        }
    }

    let mut pending: Vec<(usize, String, Vec<ColumnToInsert>)> = groups
        .into_iter()
        .map(|(name, entries)| {
            let index = entries
                .iter()
                .map(|c| insertion_index(tree, node, c.reference, depth))
                .min()
                .unwrap_or(usize::MAX);
            (index, name, entries)
        })
        .collect();
    pending.sort_by_key(|(index, _, _)| *index);

    let mut siblings: Vec<&ColumnPosition> = match (tree, node) {
        (Some(tree), Some(node)) => tree
            .node(node)
            .children()
            .iter()
            .map(|&id| tree.node(id).data())
            .collect(),
        _ => Vec::new(),
    };
    siblings.sort_by_key(|position| position.original_index);

    let mut next_sibling = 0;
    let mut offset: isize = 0;
    for (index, name, entries) in pending {
        while next_sibling < siblings.len() && siblings[next_sibling].original_index < index {
            if siblings[next_sibling].was_removed {
                offset -= 1;
            }
            next_sibling += 1;
        }
        let child_node = child_of(tree, node, &name);
        let column = build_column(name, entries, tree, child_node, child_depth)?;
        if index == usize::MAX {
            out.push(column);
        } else {
            let at = (index as isize + offset).clamp(0, out.len() as isize) as usize;
            out.insert(at, column);
            offset += 1;
        }
    }

    if out.is_empty() {
        return Ok(DataFrame::empty(base.map_or(0, DataFrame::nrow)));
    }
    Ok(DataFrame::new(out)?)
}

fn build_column(
    name: String,
    entries: Vec<ColumnToInsert>,
    tree: Option<&PositionTree>,
    node: Option<NodeId>,
    depth: usize,
) -> Result<DataColumn, TreeError> {
    let (direct, nested): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|c| c.insertion_path.len() == depth);
    let mut direct = direct.into_iter();
    match (direct.next(), direct.next()) {
        (None, _) => {
            let children = insert_at(None, nested, tree, node, depth)?;
            Ok(DataColumn::group(name, children))
        }
        (Some(only), None) if nested.is_empty() => Ok(only.column.renamed(name)),
        (Some(only), None) => {
            let children = only.column.as_group().ok_or_else(|| TreeError::NotAGroup {
                path: only.insertion_path.clone(),
            })?;
            let merged = insert_at(Some(children), nested, tree, node, depth)?;
            Ok(DataColumn::group(name, merged))
        }
        (Some(first), Some(_)) => Err(TreeError::DuplicateInsertion {
            path: first.insertion_path,
        }),
    }
}

// ── Move ───────────────────────────────────────────────────────────────

pub fn move_columns(frame: &DataFrame, selector: &Selector) -> Result<MoveClause, TreeError> {
    Ok(MoveClause {
        source: frame.clone(),
        removal: remove_columns(frame, selector)?,
    })
}

/// Columns taken out of a frame, waiting for a destination.
#[derive(Debug, Clone)]
pub struct MoveClause {
    source: DataFrame,
    removal: RemoveResult,
}

impl MoveClause {
    /// Send each removed column to the path `target` computes for it.
    pub fn into_with<F>(self, mut target: F) -> Result<DataFrame, TreeError>
    where
        F: FnMut(&ColumnPath, &DataColumn) -> ColumnPath,
    {
        let columns = self
            .removal
            .to_insertable()
            .into_iter()
            .map(|c| ColumnToInsert {
                insertion_path: target(&c.insertion_path, &c.column),
                ..c
            })
            .collect();
        debug!(moved = self.removal.removed().len(), "moving columns");
        insert_columns(Some(self.removal.frame()), columns, Some(self.removal.tree()))
    }

    /// Move (and rename) to one exact path.
    pub fn into(self, path: impl Into<ColumnPath>) -> Result<DataFrame, TreeError> {
        let path = path.into();
        self.into_with(|_, _| path.clone())
    }

    /// Move below the group at `parent`, creating it if needed.
    pub fn under(self, parent: impl Into<ColumnPath>) -> Result<DataFrame, TreeError> {
        let parent = parent.into();
        self.into_with(|_, column| parent.child(column.name()))
    }

    pub fn to_top(self) -> Result<DataFrame, TreeError> {
        self.into_with(|_, column| ColumnPath::from(column.name()))
    }

    /// Splice the removed columns into the top level at `index`.
    pub fn to(self, index: usize) -> Result<DataFrame, TreeError> {
        let remaining = self.removal.frame().columns();
        if index > remaining.len() {
            return Err(TreeError::IndexOutOfBounds {
                index,
                ncol: remaining.len(),
            });
        }
        let moved = self.removal.removed_columns().into_iter().map(|(_, c)| c.clone());
        let columns: Vec<DataColumn> = remaining[..index]
            .iter()
            .cloned()
            .chain(moved)
            .chain(remaining[index..].iter().cloned())
            .collect();
        debug!(index, moved = self.removal.removed().len(), "moving columns to index");
        Ok(DataFrame::new(columns)?)
    }

    pub fn to_left(self) -> Result<DataFrame, TreeError> {
        self.to(0)
    }

    pub fn to_right(self) -> Result<DataFrame, TreeError> {
        let end = self.removal.frame().ncol();
        self.to(end)
    }

    /// Place the removed columns right after the column `after` selects.
    pub fn after(mut self, after: impl Into<Selector>) -> Result<DataFrame, TreeError> {
        let target = resolve_single(&self.source, &after.into(), UnresolvedColumnsPolicy::Fail)?;
        let target_path = target.path().clone();
        let source = &self.source;
        let reference = self
            .removal
            .tree_mut()
            .get_or_put(&target_path, |path| ColumnPosition::kept(index_in_parent(source, path)));
        let parent = target_path.parent();
        let columns = self
            .removal
            .to_insertable()
            .into_iter()
            .map(|c| ColumnToInsert {
                insertion_path: parent.child(c.column.name()),
                reference: Some(reference),
                ..c
            })
            .collect();
        insert_columns(Some(self.removal.frame()), columns, Some(self.removal.tree()))
    }
}

// ── Derived edits ──────────────────────────────────────────────────────

/// Replace each selected column by `map(column, path)` at the same position.
/// The replacement's name is used for its final path segment.
pub fn replace_columns<F>(frame: &DataFrame, selector: &Selector, mut map: F) -> Result<DataFrame, TreeError>
where
    F: FnMut(&DataColumn, &ColumnPath) -> Result<DataColumn, TreeError>,
{
    let removal = remove_columns(frame, selector)?;
    let columns = removal
        .to_insertable()
        .into_iter()
        .map(|c| {
            let column = map(&c.column, &c.insertion_path)?;
            Ok(ColumnToInsert {
                insertion_path: c.insertion_path.with_name(column.name()),
                column,
                reference: c.reference,
            })
        })
        .collect::<Result<Vec<_>, TreeError>>()?;
    insert_columns(Some(removal.frame()), columns, Some(removal.tree()))
}

pub fn rename(frame: &DataFrame, column: impl Into<Selector>, name: &str) -> Result<DataFrame, TreeError> {
    replace_columns(frame, &column.into(), |column, _| Ok(column.renamed(name)))
}

/// Convert the selected value columns to `target` through `registry`.
pub fn cast_columns(
    frame: &DataFrame,
    selector: &Selector,
    target: &DType,
    registry: &ConverterRegistry,
) -> Result<DataFrame, TreeError> {
    replace_columns(frame, selector, |column, path| {
        let values = value_column(column, path)?;
        let cast = values.cast_with(target, registry).map_err(FrameError::from)?;
        Ok(DataColumn::value(column.name(), cast))
    })
}

/// Re-type the selected text columns with the narrowest accepting parser.
pub fn parse_columns(frame: &DataFrame, selector: &Selector) -> Result<DataFrame, TreeError> {
    replace_columns(frame, selector, |column, path| {
        let values = value_column(column, path)?;
        Ok(DataColumn::value(column.name(), values.parse_guess()))
    })
}

fn value_column<'a>(column: &'a DataColumn, path: &ColumnPath) -> Result<&'a Column, TreeError> {
    column.as_value().ok_or_else(|| {
        TreeError::Resolve(ResolveError::KindMismatch {
            path: path.clone(),
            expected: ColumnKind::Value,
            actual: column.kind(),
        })
    })
}

/// Move the selected columns into the group `name`.
pub fn group(frame: &DataFrame, selector: &Selector, name: &str) -> Result<DataFrame, TreeError> {
    move_columns(frame, selector)?.under(name)
}

/// Replace each selected group by its children, at the group's position.
pub fn ungroup(frame: &DataFrame, selector: &Selector) -> Result<DataFrame, TreeError> {
    move_columns(frame, &selector.clone().children())?
        .into_with(|path, column| path.parent().parent().child(column.name()))
}

// ── Path shortening ────────────────────────────────────────────────────

/// Shortest distinct trailing suffix of every path.
///
/// Starts from the last segment and lengthens only the colliding entries,
/// one segment at a time, until nothing collides or the colliding entries
/// are already full paths.
#[must_use]
pub fn shorten_paths(paths: &[ColumnPath]) -> Vec<ColumnPath> {
    let mut current: Vec<ColumnPath> = paths.iter().map(|p| p.suffix(1)).collect();
    loop {
        let mut buckets: HashMap<&ColumnPath, usize> = HashMap::new();
        for candidate in &current {
            *buckets.entry(candidate).or_default() += 1;
        }
        let colliding: Vec<usize> = current
            .iter()
            .enumerate()
            .filter(|(_, candidate)| buckets.get(candidate).copied().unwrap_or(0) > 1)
            .map(|(idx, _)| idx)
            .collect();

        let mut progressed = false;
        for idx in colliding {
            let len = current[idx].len();
            if paths[idx].len() > len {
                current[idx] = paths[idx].suffix(len + 1);
                progressed = true;
            }
        }
        if !progressed {
            return current;
        }
    }
}
