#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Element type tag of a value column.
///
/// The tags form a small lattice: `Null` sits below everything, `Any` above
/// everything, `Int64` widens to `Float64` and lists are covariant in their
/// element type. See [`common_dtype`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Null,
    Bool,
    Int64,
    Float64,
    Utf8,
    Date,
    DateTime,
    List(Box<DType>),
    Any,
}

impl DType {
    #[must_use]
    pub fn list_of(element: DType) -> Self {
        Self::List(Box::new(element))
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }

    #[must_use]
    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    /// Element type of a list tag, `None` for scalar tags.
    #[must_use]
    pub fn element(&self) -> Option<&DType> {
        match self {
            Self::List(inner) => Some(inner),
            _ => None,
        }
    }

    /// True when every value of `self` is already a valid value of `other`
    /// without any element conversion.
    #[must_use]
    pub fn is_subtype_of(&self, other: &DType) -> bool {
        match (self, other) {
            (a, b) if a == b => true,
            (Self::Null, _) | (_, Self::Any) => true,
            (Self::List(a), Self::List(b)) => a.is_subtype_of(b),
            _ => false,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool => f.write_str("bool"),
            Self::Int64 => f.write_str("int64"),
            Self::Float64 => f.write_str("float64"),
            Self::Utf8 => f.write_str("utf8"),
            Self::Date => f.write_str("date"),
            Self::DateTime => f.write_str("datetime"),
            Self::List(inner) => write!(f, "list<{inner}>"),
            Self::Any => f.write_str("any"),
        }
    }
}

/// Element type plus nullability, as reported for a whole column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnType {
    pub dtype: DType,
    pub nullable: bool,
}

impl ColumnType {
    #[must_use]
    pub fn new(dtype: DType, nullable: bool) -> Self {
        Self { dtype, nullable }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{}?", self.dtype)
        } else {
            write!(f, "{}", self.dtype)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullKind {
    Null,
    NaN,
    NaT,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null(NullKind),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// Multi-value cell, produced when several values land in one cell.
    List(Vec<Scalar>),
}

impl Scalar {
    #[must_use]
    pub fn null() -> Self {
        Self::Null(NullKind::Null)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null(_) => DType::Null,
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
            Self::Date(_) => DType::Date,
            Self::DateTime(_) => DType::DateTime,
            Self::List(items) => DType::list_of(infer_dtype(items)),
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null(_) => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn missing_for_dtype(dtype: &DType) -> Self {
        match dtype {
            DType::Float64 => Self::Null(NullKind::NaN),
            DType::Date | DType::DateTime => Self::Null(NullKind::NaT),
            _ => Self::Null(NullKind::Null),
        }
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float64(a), Self::Float64(b)) => (a.is_nan() && b.is_nan()) || (a == b),
            (Self::Null(NullKind::NaN), Self::Float64(v))
            | (Self::Float64(v), Self::Null(NullKind::NaN)) => v.is_nan(),
            (Self::Null(_), Self::Null(_)) => true,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.semantic_eq(y))
            }
            _ => self == other,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null(kind) => Err(TypeError::ValueIsMissing { kind: *kind }),
            other => Err(TypeError::NonNumericValue {
                value: other.to_string(),
                dtype: other.dtype(),
            }),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null(_) => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => f.write_str(v),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::DateTime(v) => write!(f, "{}", v.format("%Y-%m-%dT%H:%M:%S%.f")),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int64(i64::from(value))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl From<NaiveDate> for Scalar {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDateTime> for Scalar {
    fn from(value: NaiveDateTime) -> Self {
        Self::DateTime(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or_else(Self::null, Into::into)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("cannot cast scalar of dtype {from} to {to}")]
    InvalidCast { from: DType, to: DType },
    #[error("cannot cast float {value} to int64 without loss")]
    LossyFloatToInt { value: f64 },
    #[error("expected 0/1 for bool cast from int64 but found {value}")]
    InvalidBoolInt { value: i64 },
    #[error("expected 0.0/1.0 for bool cast from float64 but found {value}")]
    InvalidBoolFloat { value: f64 },
    #[error("value {value:?} has non-numeric dtype {dtype}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value is missing ({kind:?})")]
    ValueIsMissing { kind: NullKind },
    #[error("cannot parse {value:?} as {target}")]
    Unparsable { value: String, target: DType },
    #[error("no converter registered from {from} to {to}")]
    NoConverter { from: DType, to: DType },
}

/// Least upper bound of two element types.
pub fn common_dtype(left: &DType, right: &DType) -> DType {
    use DType::{Any, Float64, Int64, List, Null};

    match (left, right) {
        (a, b) if a == b => a.clone(),
        (Null, other) | (other, Null) => other.clone(),
        (Any, _) | (_, Any) => Any,
        (Int64, Float64) | (Float64, Int64) => Float64,
        (List(a), List(b)) => DType::list_of(common_dtype(a, b)),
        (List(inner), scalar) | (scalar, List(inner)) => DType::list_of(common_dtype(inner, scalar)),
        _ => Any,
    }
}

/// Folds [`common_dtype`] over a set of types. An empty set yields `Null`.
pub fn common_supertype<'a>(types: impl IntoIterator<Item = &'a DType>) -> DType {
    types
        .into_iter()
        .fold(DType::Null, |acc, dtype| common_dtype(&acc, dtype))
}

/// Column-level supertype: element types unify, nullability is sticky.
pub fn common_column_type(types: &[ColumnType]) -> ColumnType {
    ColumnType {
        dtype: common_supertype(types.iter().map(|t| &t.dtype)),
        nullable: types.iter().any(|t| t.nullable),
    }
}

pub fn infer_dtype(values: &[Scalar]) -> DType {
    let mut current = DType::Null;
    for value in values {
        if value.is_null() {
            continue;
        }
        current = common_dtype(&current, &value.dtype());
    }
    current
}

/// Coerce a scalar along the type lattice, taking ownership to skip clones
/// when the value already has the target type. This never parses or formats
/// strings; that is the job of [`ConverterRegistry`].
pub fn cast_scalar_owned(value: Scalar, target: &DType) -> Result<Scalar, TypeError> {
    if value.is_null() {
        return Ok(Scalar::missing_for_dtype(target));
    }
    let from = value.dtype();
    if &from == target || matches!(target, DType::Any) {
        return Ok(value);
    }

    match target {
        DType::Null => Ok(Scalar::null()),
        DType::List(inner) => match value {
            Scalar::List(items) => items
                .into_iter()
                .map(|item| cast_scalar_owned(item, inner))
                .collect::<Result<Vec<_>, _>>()
                .map(Scalar::List),
            single => Ok(Scalar::List(vec![cast_scalar_owned(single, inner)?])),
        },
        DType::Bool => match &value {
            Scalar::Int64(v) => match *v {
                0 => Ok(Scalar::Bool(false)),
                1 => Ok(Scalar::Bool(true)),
                _ => Err(TypeError::InvalidBoolInt { value: *v }),
            },
            Scalar::Float64(v) => {
                if *v == 0.0 {
                    Ok(Scalar::Bool(false))
                } else if *v == 1.0 {
                    Ok(Scalar::Bool(true))
                } else {
                    Err(TypeError::InvalidBoolFloat { value: *v })
                }
            }
            _ => Err(TypeError::InvalidCast { from, to: target.clone() }),
        },
        DType::Int64 => match &value {
            Scalar::Bool(v) => Ok(Scalar::Int64(i64::from(*v))),
            Scalar::Float64(v) => {
                if !v.is_finite() || *v != v.trunc() {
                    return Err(TypeError::LossyFloatToInt { value: *v });
                }
                // i64::MAX rounds up to 2^63 as f64, so the upper bound is exclusive.
                if *v < i64::MIN as f64 || *v >= 9_223_372_036_854_775_808.0 {
                    return Err(TypeError::LossyFloatToInt { value: *v });
                }
                Ok(Scalar::Int64(*v as i64))
            }
            _ => Err(TypeError::InvalidCast { from, to: target.clone() }),
        },
        DType::Float64 => match &value {
            Scalar::Bool(v) => Ok(Scalar::Float64(if *v { 1.0 } else { 0.0 })),
            Scalar::Int64(v) => Ok(Scalar::Float64(*v as f64)),
            _ => Err(TypeError::InvalidCast { from, to: target.clone() }),
        },
        DType::DateTime => match &value {
            Scalar::Date(d) => Ok(Scalar::DateTime(d.and_time(chrono::NaiveTime::MIN))),
            _ => Err(TypeError::InvalidCast { from, to: target.clone() }),
        },
        DType::Utf8 | DType::Date | DType::Any => {
            Err(TypeError::InvalidCast { from, to: target.clone() })
        }
    }
}

/// Cast a scalar reference to a target dtype (clones only when conversion is needed).
pub fn cast_scalar(value: &Scalar, target: &DType) -> Result<Scalar, TypeError> {
    cast_scalar_owned(value.clone(), target)
}

// ── String parsers ─────────────────────────────────────────────────────

/// Parsers tried by [`parse_any`], narrowest first.
pub const PARSE_ORDER: [DType; 5] = [
    DType::Int64,
    DType::Float64,
    DType::Bool,
    DType::Date,
    DType::DateTime,
];

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_uppercase().as_str() {
        "T" | "TRUE" | "YES" => Some(true),
        "F" | "FALSE" | "NO" => Some(false),
        _ => None,
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    text.parse::<NaiveDateTime>()
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").ok())
}

/// Parse `text` as a value of `target`. `Utf8` and `Any` accept any text.
pub fn parse_scalar(text: &str, target: &DType) -> Result<Scalar, TypeError> {
    let trimmed = text.trim();
    let parsed = match target {
        DType::Utf8 | DType::Any => Some(Scalar::Utf8(text.to_owned())),
        DType::Int64 => trimmed.parse::<i64>().ok().map(Scalar::Int64),
        DType::Float64 => trimmed.parse::<f64>().ok().map(Scalar::Float64),
        DType::Bool => parse_bool(trimmed).map(Scalar::Bool),
        DType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .map(Scalar::Date),
        DType::DateTime => parse_datetime(trimmed).map(Scalar::DateTime),
        DType::Null | DType::List(_) => None,
    };
    parsed.ok_or_else(|| TypeError::Unparsable {
        value: text.to_owned(),
        target: target.clone(),
    })
}

/// Try every parser in [`PARSE_ORDER`]; text nothing accepts stays `Utf8`.
#[must_use]
pub fn parse_any(text: &str) -> Scalar {
    PARSE_ORDER
        .iter()
        .find_map(|dtype| parse_scalar(text, dtype).ok())
        .unwrap_or_else(|| Scalar::Utf8(text.to_owned()))
}

// ── Converter registry ─────────────────────────────────────────────────

/// Element converter applied to non-missing values only.
pub type Converter = Arc<dyn Fn(&Scalar) -> Result<Scalar, TypeError> + Send + Sync>;

/// Cache of `(from, to)` element converters.
///
/// Lookups populate the cache on miss. Two threads racing on the same miss
/// build equivalent converters and the first insert wins, so the race is
/// harmless. Pass a registry explicitly to every cast; there is no global one.
#[derive(Default)]
pub struct ConverterRegistry {
    cache: RwLock<HashMap<(DType, DType), Option<Converter>>>,
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("cached_pairs", &self.cached_pairs())
            .finish()
    }
}

impl ConverterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or override the converter for one pair.
    pub fn register<F>(&self, from: DType, to: DType, converter: F)
    where
        F: Fn(&Scalar) -> Result<Scalar, TypeError> + Send + Sync + 'static,
    {
        self.cache
            .write()
            .insert((from, to), Some(Arc::new(converter)));
    }

    #[must_use]
    pub fn cached_pairs(&self) -> usize {
        self.cache.read().len()
    }

    pub fn converter(&self, from: &DType, to: &DType) -> Option<Converter> {
        let key = (from.clone(), to.clone());
        if let Some(hit) = self.cache.read().get(&key) {
            return hit.clone();
        }
        trace!(%from, %to, "converter cache miss");
        let built = builtin_converter(from, to);
        self.cache.write().entry(key).or_insert(built).clone()
    }

    /// Convert one value to `to`. Missing values map to the target's missing marker.
    pub fn convert(&self, value: &Scalar, to: &DType) -> Result<Scalar, TypeError> {
        if value.is_null() {
            return Ok(Scalar::missing_for_dtype(to));
        }
        let from = value.dtype();
        if from.is_subtype_of(to) {
            return Ok(value.clone());
        }
        let converter = self
            .converter(&from, to)
            .ok_or_else(|| TypeError::NoConverter {
                from: from.clone(),
                to: to.clone(),
            })?;
        converter(value)
    }
}

fn builtin_converter(from: &DType, to: &DType) -> Option<Converter> {
    use DType::{Any, Bool, Date, DateTime, Float64, Int64, List, Utf8};

    match (from, to) {
        (_, Any) => Some(Arc::new(|value: &Scalar| Ok(value.clone()))),
        (List(_), List(inner)) => {
            let target = (**inner).clone();
            Some(Arc::new(move |value: &Scalar| match value {
                Scalar::List(items) => items
                    .iter()
                    .map(|item| convert_builtin(item, &target))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Scalar::List),
                other => convert_builtin(other, &target).map(|v| Scalar::List(vec![v])),
            }))
        }
        (_, List(inner)) => {
            let target = (**inner).clone();
            Some(Arc::new(move |value: &Scalar| {
                convert_builtin(value, &target).map(|v| Scalar::List(vec![v]))
            }))
        }
        (_, Utf8) => Some(Arc::new(|value: &Scalar| Ok(Scalar::Utf8(value.to_string())))),
        (Utf8, Int64 | Float64 | Bool | Date | DateTime) => {
            let target = to.clone();
            Some(Arc::new(move |value: &Scalar| match value {
                Scalar::Utf8(text) => parse_scalar(text, &target),
                other => cast_scalar(other, &target),
            }))
        }
        (Bool | Int64 | Float64, Bool | Int64 | Float64) | (Date, DateTime) => {
            let target = to.clone();
            Some(Arc::new(move |value: &Scalar| cast_scalar(value, &target)))
        }
        (DateTime, Date) => Some(Arc::new(|value: &Scalar| match value {
            Scalar::DateTime(v) => Ok(Scalar::Date(v.date())),
            other => Err(TypeError::InvalidCast {
                from: other.dtype(),
                to: DType::Date,
            }),
        })),
        _ => None,
    }
}

fn convert_builtin(value: &Scalar, to: &DType) -> Result<Scalar, TypeError> {
    if value.is_null() {
        return Ok(Scalar::missing_for_dtype(to));
    }
    let from = value.dtype();
    if from.is_subtype_of(to) {
        return Ok(value.clone());
    }
    match builtin_converter(&from, to) {
        Some(converter) => converter(value),
        None => Err(TypeError::NoConverter { from, to: to.clone() }),
    }
}

// ── Nanops: null-skipping numeric reductions ───────────────────────────

fn collect_finite(values: &[Scalar]) -> Vec<f64> {
    values
        .iter()
        .filter(|v| !v.is_missing())
        .filter_map(|v| v.to_f64().ok())
        .collect()
}

pub fn nansum(values: &[Scalar]) -> Scalar {
    let nums = collect_finite(values);
    if nums.is_empty() {
        return Scalar::Float64(0.0);
    }
    Scalar::Float64(nums.iter().sum())
}

pub fn nanmean(values: &[Scalar]) -> Scalar {
    let nums = collect_finite(values);
    if nums.is_empty() {
        return Scalar::Null(NullKind::NaN);
    }
    let sum: f64 = nums.iter().sum();
    Scalar::Float64(sum / nums.len() as f64)
}

pub fn nancount(values: &[Scalar]) -> Scalar {
    let n = values.iter().filter(|v| !v.is_missing()).count();
    Scalar::Int64(n as i64)
}

pub fn nanmin(values: &[Scalar]) -> Scalar {
    let nums = collect_finite(values);
    if nums.is_empty() {
        return Scalar::Null(NullKind::NaN);
    }
    Scalar::Float64(nums.iter().copied().fold(f64::INFINITY, f64::min))
}

pub fn nanmax(values: &[Scalar]) -> Scalar {
    let nums = collect_finite(values);
    if nums.is_empty() {
        return Scalar::Null(NullKind::NaN);
    }
    Scalar::Float64(nums.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

pub fn nanmedian(values: &[Scalar]) -> Scalar {
    let mut nums = collect_finite(values);
    if nums.is_empty() {
        return Scalar::Null(NullKind::NaN);
    }
    nums.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = nums.len() / 2;
    if nums.len() % 2 == 0 {
        Scalar::Float64((nums[mid - 1] + nums[mid]) / 2.0)
    } else {
        Scalar::Float64(nums[mid])
    }
}

pub fn nanvar(values: &[Scalar], ddof: usize) -> Scalar {
    let nums = collect_finite(values);
    if nums.len() <= ddof {
        return Scalar::Null(NullKind::NaN);
    }
    let mean: f64 = nums.iter().sum::<f64>() / nums.len() as f64;
    let sum_sq: f64 = nums.iter().map(|x| (x - mean).powi(2)).sum();
    Scalar::Float64(sum_sq / (nums.len() - ddof) as f64)
}

pub fn nanstd(values: &[Scalar], ddof: usize) -> Scalar {
    match nanvar(values, ddof) {
        Scalar::Float64(v) => Scalar::Float64(v.sqrt()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{
        ColumnType, ConverterRegistry, DType, NullKind, Scalar, TypeError, cast_scalar,
        common_column_type, common_dtype, common_supertype, infer_dtype, parse_any, parse_scalar,
    };

    #[test]
    fn dtype_inference_widens_numeric_values() {
        let values = vec![Scalar::Int64(7), Scalar::Float64(3.5), Scalar::null()];
        assert_eq!(infer_dtype(&values), DType::Float64);
    }

    #[test]
    fn missing_values_get_target_missing_marker() {
        let cast = cast_scalar(&Scalar::null(), &DType::Float64).expect("missing casts");
        assert_eq!(cast, Scalar::Null(NullKind::NaN));
    }

    #[test]
    fn semantic_eq_treats_nan_as_equal() {
        let left = Scalar::Float64(f64::NAN);
        let right = Scalar::Null(NullKind::NaN);
        assert!(left.semantic_eq(&right));
    }

    // ── Lattice ────────────────────────────────────────────────────────

    #[test]
    fn heterogeneous_mix_falls_back_to_any() {
        assert_eq!(common_dtype(&DType::Utf8, &DType::Int64), DType::Any);
        assert_eq!(common_dtype(&DType::Bool, &DType::Int64), DType::Any);
    }

    #[test]
    fn empty_type_set_is_null() {
        assert_eq!(common_supertype(std::iter::empty()), DType::Null);
    }

    #[test]
    fn single_type_is_returned_unchanged() {
        assert_eq!(common_supertype([&DType::Date]), DType::Date);
    }

    #[test]
    fn lists_unify_element_types() {
        let ints = DType::list_of(DType::Int64);
        let floats = DType::list_of(DType::Float64);
        assert_eq!(common_dtype(&ints, &floats), DType::list_of(DType::Float64));
    }

    #[test]
    fn list_and_scalar_promote_to_list() {
        let ints = DType::list_of(DType::Int64);
        assert_eq!(common_dtype(&DType::Int64, &ints), ints);
        assert_eq!(
            common_supertype([&DType::Float64, &ints]),
            DType::list_of(DType::Float64)
        );
    }

    #[test]
    fn column_type_nullability_is_sticky() {
        let unified = common_column_type(&[
            ColumnType::new(DType::Int64, false),
            ColumnType::new(DType::Float64, true),
        ]);
        assert_eq!(unified, ColumnType::new(DType::Float64, true));
        assert_eq!(unified.to_string(), "float64?");
    }

    #[test]
    fn subtype_relation() {
        assert!(DType::Null.is_subtype_of(&DType::Int64));
        assert!(DType::Utf8.is_subtype_of(&DType::Any));
        assert!(!DType::Int64.is_subtype_of(&DType::Float64));
        assert!(DType::list_of(DType::Null).is_subtype_of(&DType::list_of(DType::Utf8)));
    }

    #[test]
    fn scalar_is_wrapped_when_cast_to_list() {
        let cast = cast_scalar(&Scalar::Int64(3), &DType::list_of(DType::Float64))
            .expect("wrap into list");
        assert_eq!(cast, Scalar::List(vec![Scalar::Float64(3.0)]));
    }

    #[test]
    fn lattice_cast_never_parses() {
        let err = cast_scalar(&Scalar::from("12"), &DType::Int64).expect_err("must fail");
        assert_eq!(
            err,
            TypeError::InvalidCast {
                from: DType::Utf8,
                to: DType::Int64
            }
        );
    }

    #[test]
    fn float_to_int_rejects_values_past_i64_range() {
        let two_pow_63 = 9_223_372_036_854_775_808.0_f64;
        let err = cast_scalar(&Scalar::Float64(two_pow_63), &DType::Int64).expect_err("out of range");
        assert_eq!(err, TypeError::LossyFloatToInt { value: two_pow_63 });

        let min = cast_scalar(&Scalar::Float64(-two_pow_63), &DType::Int64).expect("i64::MIN fits");
        assert_eq!(min, Scalar::Int64(i64::MIN));
        let whole = cast_scalar(&Scalar::Float64(42.0), &DType::Int64).expect("whole float");
        assert_eq!(whole, Scalar::Int64(42));
    }

    // ── Parsers ────────────────────────────────────────────────────────

    #[test]
    fn parse_bool_accepts_short_forms() {
        assert_eq!(parse_scalar("yes", &DType::Bool), Ok(Scalar::Bool(true)));
        assert_eq!(parse_scalar("F", &DType::Bool), Ok(Scalar::Bool(false)));
        assert!(parse_scalar("maybe", &DType::Bool).is_err());
    }

    #[test]
    fn parse_float_accepts_special_values() {
        let nan = parse_scalar("NaN", &DType::Float64).expect("nan parses");
        assert!(nan.is_missing());
        assert_eq!(
            parse_scalar("-inf", &DType::Float64),
            Ok(Scalar::Float64(f64::NEG_INFINITY))
        );
    }

    #[test]
    fn parse_any_picks_narrowest_parser() {
        assert_eq!(parse_any("42"), Scalar::Int64(42));
        assert_eq!(parse_any("4.5"), Scalar::Float64(4.5));
        assert_eq!(parse_any("true"), Scalar::Bool(true));
        assert_eq!(
            parse_any("2024-02-29"),
            Scalar::Date(NaiveDate::from_ymd_opt(2024, 2, 29).expect("valid date"))
        );
        assert!(matches!(parse_any("2024-02-29T10:30:00"), Scalar::DateTime(_)));
        assert_eq!(parse_any("hello"), Scalar::from("hello"));
    }

    // ── Converter registry ─────────────────────────────────────────────

    #[test]
    fn registry_parses_strings_and_caches_pairs() {
        let registry = ConverterRegistry::new();
        let out = registry
            .convert(&Scalar::from("17"), &DType::Int64)
            .expect("parse");
        assert_eq!(out, Scalar::Int64(17));
        assert_eq!(registry.cached_pairs(), 1);
        registry
            .convert(&Scalar::from("18"), &DType::Int64)
            .expect("parse");
        assert_eq!(registry.cached_pairs(), 1);
    }

    #[test]
    fn registry_formats_anything_as_string() {
        let registry = ConverterRegistry::new();
        let out = registry
            .convert(&Scalar::List(vec![Scalar::Int64(1), Scalar::Int64(2)]), &DType::Utf8)
            .expect("format");
        assert_eq!(out, Scalar::from("[1, 2]"));
    }

    #[test]
    fn registry_reports_unparsable_values() {
        let registry = ConverterRegistry::new();
        let err = registry
            .convert(&Scalar::from("abc"), &DType::Int64)
            .expect_err("must fail");
        assert!(matches!(err, TypeError::Unparsable { .. }));
    }

    #[test]
    fn registry_rejects_unknown_pairs() {
        let registry = ConverterRegistry::new();
        let err = registry
            .convert(&Scalar::Bool(true), &DType::Date)
            .expect_err("no converter");
        assert_eq!(
            err,
            TypeError::NoConverter {
                from: DType::Bool,
                to: DType::Date
            }
        );
    }

    #[test]
    fn registry_accepts_custom_converters() {
        let registry = ConverterRegistry::new();
        registry.register(DType::Bool, DType::Date, |_| {
            Ok(Scalar::Date(
                NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid date"),
            ))
        });
        let out = registry
            .convert(&Scalar::Bool(true), &DType::Date)
            .expect("custom converter");
        assert!(matches!(out, Scalar::Date(_)));
    }

    #[test]
    fn registry_narrows_datetime_to_date() {
        let registry = ConverterRegistry::new();
        let value = parse_any("2024-01-02 03:04:05");
        let out = registry.convert(&value, &DType::Date).expect("narrow");
        assert_eq!(out.to_string(), "2024-01-02");
    }

    // ── Nanops ─────────────────────────────────────────────────────────

    #[test]
    fn nansum_skips_nulls() {
        let vals = vec![
            Scalar::Float64(1.0),
            Scalar::null(),
            Scalar::Float64(2.0),
            Scalar::Float64(f64::NAN),
            Scalar::Int64(7),
        ];
        assert_eq!(super::nansum(&vals), Scalar::Float64(10.0));
    }

    #[test]
    fn nanmean_all_null_returns_nan() {
        let vals = vec![Scalar::null(), Scalar::Float64(f64::NAN)];
        assert!(super::nanmean(&vals).is_missing());
    }

    #[test]
    fn nanmedian_even_count_averages_middle() {
        let vals: Vec<Scalar> = [4, 1, 3, 2].into_iter().map(Scalar::Int64).collect();
        assert_eq!(super::nanmedian(&vals), Scalar::Float64(2.5));
    }

    #[test]
    fn nanstd_sample() {
        let vals: Vec<Scalar> = [2, 4, 4, 4, 5, 5, 7, 9].into_iter().map(Scalar::Int64).collect();
        let Scalar::Float64(std) = super::nanstd(&vals, 0) else {
            panic!("expected float");
        };
        assert!((std - 2.0).abs() < 1e-12);
    }
}
