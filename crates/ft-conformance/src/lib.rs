#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ft_aggregate::{
    AggregateError, GroupByAggregations, GroupedPivot, PivotAggregations, ValueSink, pivot,
};
use ft_frame::{ColumnPath, ColumnPayload, DataColumn, DataFrame, FrameError};
use ft_groupby::group_by;
use ft_runtime::{EvidenceLedger, RuntimeMode, RuntimePolicy};
use ft_select::Selector;
use ft_tree::{group, move_columns, remove, rename, ungroup};
use ft_types::Scalar;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub strict_mode: bool,
    /// Pivot width cap applied to hardened cases.
    pub pivot_column_cap: usize,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            strict_mode: true,
            pivot_column_cap: 10_000,
        }
    }

    #[must_use]
    pub fn packet_fixture_root(&self) -> PathBuf {
        self.fixture_root.join("packets")
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureOperation {
    GroupByCount,
    GroupByValues,
    PivotValue,
    PivotMatches,
    Remove,
    MoveUnder,
    Group,
    Ungroup,
    Rename,
}

impl FixtureOperation {
    #[must_use]
    pub fn operation_name(self) -> &'static str {
        match self {
            Self::GroupByCount => "group_by_count",
            Self::GroupByValues => "group_by_values",
            Self::PivotValue => "pivot_value",
            Self::PivotMatches => "pivot_matches",
            Self::Remove => "remove",
            Self::MoveUnder => "move_under",
            Self::Group => "group",
            Self::Ungroup => "ungroup",
            Self::Rename => "rename",
        }
    }
}

/// One column of a fixture frame: values, nested children, or nested frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureColumn {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Scalar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FixtureColumn>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<Option<FixtureDataFrame>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureDataFrame {
    pub columns: Vec<FixtureColumn>,
    /// Row count of a frame with no columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nrow: Option<usize>,
}

impl FixtureDataFrame {
    pub fn to_frame(&self) -> Result<DataFrame, HarnessError> {
        if self.columns.is_empty() {
            return Ok(DataFrame::empty(self.nrow.unwrap_or(0)));
        }
        let columns = self
            .columns
            .iter()
            .map(FixtureColumn::to_column)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DataFrame::new(columns)?)
    }

    #[must_use]
    pub fn from_frame(frame: &DataFrame) -> Self {
        Self {
            columns: frame.columns().iter().map(FixtureColumn::from_column).collect(),
            nrow: frame.columns().is_empty().then_some(frame.nrow()),
        }
    }
}

impl FixtureColumn {
    fn to_column(&self) -> Result<DataColumn, HarnessError> {
        match (&self.values, &self.children, &self.frames) {
            (Some(values), None, None) => Ok(DataColumn::from_scalars(self.name.clone(), values.clone())?),
            (None, Some(children), None) => {
                let children = FixtureDataFrame {
                    columns: children.clone(),
                    nrow: None,
                }
                .to_frame()?;
                Ok(DataColumn::group(self.name.clone(), children))
            }
            (None, None, Some(frames)) => {
                let cells = frames
                    .iter()
                    .map(|cell| cell.as_ref().map(FixtureDataFrame::to_frame).transpose())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DataColumn::frames(self.name.clone(), cells))
            }
            _ => Err(HarnessError::FixtureFormat(format!(
                "column '{}' needs exactly one of values, children or frames",
                self.name
            ))),
        }
    }

    fn from_column(column: &DataColumn) -> Self {
        let mut out = Self {
            name: column.name().to_owned(),
            values: None,
            children: None,
            frames: None,
        };
        match column.payload() {
            ColumnPayload::Value(values) => out.values = Some(values.values().to_vec()),
            ColumnPayload::Group(children) => {
                out.children = Some(FixtureDataFrame::from_frame(children).columns);
            }
            ColumnPayload::Frame(cells) => {
                out.frames = Some(
                    cells
                        .iter()
                        .map(|cell| cell.as_ref().map(FixtureDataFrame::from_frame))
                        .collect(),
                );
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketFixture {
    pub packet_id: String,
    pub case_id: String,
    pub mode: RuntimeMode,
    pub operation: FixtureOperation,
    pub frame: FixtureDataFrame,
    /// Columns the operation acts on.
    #[serde(default)]
    pub columns: Vec<ColumnPath>,
    #[serde(default)]
    pub keys: Vec<ColumnPath>,
    /// Destination path, new name, or pivoted value column.
    #[serde(default)]
    pub target: Option<ColumnPath>,
    #[serde(default)]
    pub default: Option<Scalar>,
    #[serde(default)]
    pub expected_frame: Option<FixtureDataFrame>,
    #[serde(default)]
    pub expected_error_contains: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub packet_id: String,
    pub case_id: String,
    pub mode: RuntimeMode,
    pub operation: FixtureOperation,
    pub status: CaseStatus,
    pub mismatch: Option<String>,
    #[serde(default)]
    pub elapsed_us: u64,
    pub evidence_records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketParityReport {
    pub suite: String,
    pub packet_id: Option<String>,
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl PacketParityReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.fixture_count > 0
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("fixture format error: {0}")]
    FixtureFormat(String),
}

pub fn run_packet_suite(config: &HarnessConfig) -> Result<PacketParityReport, HarnessError> {
    let fixtures = load_fixtures(config, None)?;
    Ok(build_report(config, "packets".to_owned(), None, &fixtures))
}

pub fn run_packet_by_id(config: &HarnessConfig, packet_id: &str) -> Result<PacketParityReport, HarnessError> {
    let fixtures = load_fixtures(config, Some(packet_id))?;
    Ok(build_report(
        config,
        format!("packets:{packet_id}"),
        Some(packet_id.to_owned()),
        &fixtures,
    ))
}

fn build_report(
    config: &HarnessConfig,
    suite: String,
    packet_id: Option<String>,
    fixtures: &[PacketFixture],
) -> PacketParityReport {
    let results: Vec<CaseResult> = fixtures.iter().map(|fixture| run_fixture(config, fixture)).collect();
    let failed = results
        .iter()
        .filter(|result| matches!(result.status, CaseStatus::Fail))
        .count();
    let passed = results.len().saturating_sub(failed);
    debug!(suite = %suite, passed, failed, "packet suite finished");

    PacketParityReport {
        suite,
        packet_id,
        fixture_count: results.len(),
        passed,
        failed,
        results,
    }
}

fn load_fixtures(config: &HarnessConfig, packet_filter: Option<&str>) -> Result<Vec<PacketFixture>, HarnessError> {
    let fixture_files = list_fixture_files(&config.packet_fixture_root())?;
    let mut fixtures = Vec::with_capacity(fixture_files.len());

    for fixture_path in fixture_files {
        let fixture = load_fixture(&fixture_path)?;
        if packet_filter.is_none_or(|packet| fixture.packet_id == packet) {
            fixtures.push(fixture);
        }
    }
    fixtures.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(fixtures)
}

pub fn load_fixture(path: &Path) -> Result<PacketFixture, HarnessError> {
    let body = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[must_use]
pub fn run_fixture(config: &HarnessConfig, fixture: &PacketFixture) -> CaseResult {
    let policy = match fixture.mode {
        RuntimeMode::Strict => RuntimePolicy::strict(),
        RuntimeMode::Hardened => RuntimePolicy::hardened(Some(config.pivot_column_cap)),
    };

    let mut ledger = EvidenceLedger::new();
    let started = Instant::now();
    let mismatch = check_fixture(fixture, &policy, &mut ledger).err();
    let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX).max(1);

    CaseResult {
        packet_id: fixture.packet_id.clone(),
        case_id: fixture.case_id.clone(),
        mode: fixture.mode,
        operation: fixture.operation,
        status: if mismatch.is_none() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        },
        mismatch,
        elapsed_us,
        evidence_records: ledger.len(),
    }
}

fn check_fixture(fixture: &PacketFixture, policy: &RuntimePolicy, ledger: &mut EvidenceLedger) -> Result<(), String> {
    let frame = fixture
        .frame
        .to_frame()
        .map_err(|err| format!("fixture frame is invalid: {err}"))?;
    let outcome = execute(fixture, &frame, policy, ledger);

    match (&fixture.expected_error_contains, outcome) {
        (Some(needle), Err(err)) if err.contains(needle.as_str()) => Ok(()),
        (Some(needle), Err(err)) => Err(format!("expected error containing '{needle}', got '{err}'")),
        (Some(needle), Ok(_)) => Err(format!("expected error containing '{needle}', got a frame")),
        (None, Err(err)) => Err(format!("execution failed: {err}")),
        (None, Ok(actual)) => {
            let expected = fixture
                .expected_frame
                .as_ref()
                .ok_or_else(|| "fixture has no expectation".to_owned())?;
            compare_frames(&ColumnPath::root(), expected, &FixtureDataFrame::from_frame(&actual))
        }
    }
}

fn selector_for(paths: &[ColumnPath]) -> Selector {
    match paths {
        [single] => Selector::path(single.clone()),
        many => Selector::Union(many.iter().cloned().map(Selector::path).collect()),
    }
}

fn target(fixture: &PacketFixture) -> Result<ColumnPath, String> {
    fixture
        .target
        .clone()
        .ok_or_else(|| format!("{} needs a target", fixture.operation.operation_name()))
}

fn pivot_for(fixture: &PacketFixture, frame: &DataFrame) -> Result<GroupedPivot, String> {
    let columns = selector_for(&fixture.columns);
    let keys = if fixture.keys.is_empty() {
        Selector::None
    } else {
        selector_for(&fixture.keys)
    };
    let pivoted = pivot(frame, columns).group_by(keys).map_err(|err| err.to_string())?;
    Ok(match &fixture.default {
        Some(default) => pivoted.with_default(default.clone()),
        None => pivoted,
    })
}

fn execute(
    fixture: &PacketFixture,
    frame: &DataFrame,
    policy: &RuntimePolicy,
    ledger: &mut EvidenceLedger,
) -> Result<DataFrame, String> {
    let columns = selector_for(&fixture.columns);
    match fixture.operation {
        FixtureOperation::GroupByCount => group_by(frame, &selector_for(&fixture.keys))
            .map_err(|err| err.to_string())?
            .count()
            .map_err(|err| err.to_string()),
        FixtureOperation::GroupByValues => group_by(frame, &selector_for(&fixture.keys))
            .map_err(|err| err.to_string())?
            .values(&columns)
            .map_err(|err| err.to_string()),
        FixtureOperation::PivotValue => {
            let value = target(fixture)?;
            pivot_for(fixture, frame)?
                .aggregate_with_policy(
                    |r| {
                        let values = r.column_values(value.clone())?.to_vec();
                        r.yield_one_or_many(ColumnPath::root(), values, None, None);
                        Ok::<_, AggregateError>(())
                    },
                    policy,
                    ledger,
                )
                .map_err(|err| err.to_string())
        }
        FixtureOperation::PivotMatches => pivot_for(fixture, frame)?
            .aggregate_with_policy(
                |r| {
                    r.yield_with(ColumnPath::root(), true, None, Some(false.into()), true);
                    Ok::<_, AggregateError>(())
                },
                policy,
                ledger,
            )
            .map_err(|err| err.to_string()),
        FixtureOperation::Remove => remove(frame, &columns).map_err(|err| err.to_string()),
        FixtureOperation::MoveUnder => {
            let parent = target(fixture)?;
            move_columns(frame, &columns)
                .and_then(|clause| clause.under(parent))
                .map_err(|err| err.to_string())
        }
        FixtureOperation::Group => {
            let name = target(fixture)?;
            group(frame, &columns, name.name().unwrap_or_default()).map_err(|err| err.to_string())
        }
        FixtureOperation::Ungroup => ungroup(frame, &columns).map_err(|err| err.to_string()),
        FixtureOperation::Rename => {
            let name = target(fixture)?;
            rename(frame, columns, name.name().unwrap_or_default()).map_err(|err| err.to_string())
        }
    }
}

fn compare_frames(at: &ColumnPath, expected: &FixtureDataFrame, actual: &FixtureDataFrame) -> Result<(), String> {
    let expected_names: Vec<&str> = expected.columns.iter().map(|c| c.name.as_str()).collect();
    let actual_names: Vec<&str> = actual.columns.iter().map(|c| c.name.as_str()).collect();
    if expected_names != actual_names {
        return Err(format!("columns under '{at}': expected {expected_names:?}, got {actual_names:?}"));
    }
    if expected.nrow.is_some() && expected.nrow != actual.nrow {
        return Err(format!("row count under '{at}': expected {:?}, got {:?}", expected.nrow, actual.nrow));
    }

    for (want, got) in expected.columns.iter().zip(&actual.columns) {
        let path = at.child(want.name.as_str());
        match (&want.values, &got.values) {
            (Some(want), Some(got)) => {
                let equal = want.len() == got.len() && want.iter().zip(got).all(|(a, b)| a.semantic_eq(b));
                if !equal {
                    return Err(format!("values of '{path}': expected {want:?}, got {got:?}"));
                }
            }
            (None, None) => {}
            _ => return Err(format!("'{path}' has the wrong column kind")),
        }
        match (&want.children, &got.children) {
            (Some(want), Some(got)) => compare_frames(
                &path,
                &FixtureDataFrame {
                    columns: want.clone(),
                    nrow: None,
                },
                &FixtureDataFrame {
                    columns: got.clone(),
                    nrow: None,
                },
            )?,
            (None, None) => {}
            _ => return Err(format!("'{path}' has the wrong column kind")),
        }
        match (&want.frames, &got.frames) {
            (Some(want), Some(got)) => {
                if want.len() != got.len() {
                    return Err(format!("'{path}' has {} frames, expected {}", got.len(), want.len()));
                }
                for (want, got) in want.iter().zip(got) {
                    match (want, got) {
                        (Some(want), Some(got)) => compare_frames(&path, want, got)?,
                        (None, None) => {}
                        _ => return Err(format!("'{path}' has a missing frame")),
                    }
                }
            }
            (None, None) => {}
            _ => return Err(format!("'{path}' has the wrong column kind")),
        }
    }
    Ok(())
}
