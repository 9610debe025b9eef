//! Typed covariate columns, their values, and training rows.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ForestError;

/// The value type a covariate column holds.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CovariateKind {
    /// Real-valued column, split by threshold.
    Numeric,
    /// Two-valued column with exactly one possible split.
    Boolean,
    /// Categorical column with an explicit, ordered level list.
    Factor {
        /// Declared level names; a value stores its position in this list.
        levels: Vec<String>,
    },
}

/// A named covariate column shared read-only by every row and split rule.
///
/// `index` is the zero-based position of this covariate's value in every
/// [`Row`]. The covariate remembers whether [`Covariate::parse_value`] has
/// ever produced a missing value.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Covariate {
    name: String,
    index: usize,
    kind: CovariateKind,
    #[serde(skip)]
    missing_seen: AtomicBool,
}

impl Clone for Covariate {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            index: self.index,
            kind: self.kind.clone(),
            missing_seen: AtomicBool::new(self.has_missing()),
        }
    }
}

impl PartialEq for Covariate {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.index == other.index && self.kind == other.kind
    }
}

impl Covariate {
    /// Create a numeric covariate.
    #[must_use]
    pub fn numeric(name: impl Into<String>, index: usize) -> Self {
        Self::with_kind(name.into(), index, CovariateKind::Numeric)
    }

    /// Create a boolean covariate.
    #[must_use]
    pub fn boolean(name: impl Into<String>, index: usize) -> Self {
        Self::with_kind(name.into(), index, CovariateKind::Boolean)
    }

    /// Create a factor covariate with the given level names.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`ForestError::NoLevels`] | `levels` is empty |
    /// | [`ForestError::DuplicateLevel`] | a level name appears twice |
    pub fn factor(
        name: impl Into<String>,
        index: usize,
        levels: Vec<String>,
    ) -> Result<Self, ForestError> {
        let name = name.into();
        if levels.is_empty() {
            return Err(ForestError::NoLevels { covariate: name });
        }
        for (i, level) in levels.iter().enumerate() {
            if levels[..i].contains(level) {
                return Err(ForestError::DuplicateLevel {
                    covariate: name,
                    level: level.clone(),
                });
            }
        }
        Ok(Self::with_kind(name, index, CovariateKind::Factor { levels }))
    }

    fn with_kind(name: String, index: usize, kind: CovariateKind) -> Self {
        Self {
            name,
            index,
            kind,
            missing_seen: AtomicBool::new(false),
        }
    }

    /// Return the covariate name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the position of this covariate's value in every row.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Return the column type.
    #[must_use]
    pub fn kind(&self) -> &CovariateKind {
        &self.kind
    }

    /// Number of declared levels (zero for non-factor covariates).
    #[must_use]
    pub fn n_levels(&self) -> usize {
        match &self.kind {
            CovariateKind::Factor { levels } => levels.len(),
            _ => 0,
        }
    }

    /// Name of a factor level, if this is a factor and the level exists.
    #[must_use]
    pub fn level_name(&self, level: u32) -> Option<&str> {
        match &self.kind {
            CovariateKind::Factor { levels } => levels.get(level as usize).map(String::as_str),
            _ => None,
        }
    }

    /// Return `true` once a missing value has been parsed or noted for this covariate.
    #[must_use]
    pub fn has_missing(&self) -> bool {
        self.missing_seen.load(Ordering::Relaxed)
    }

    /// Record that this covariate has a missing value somewhere in the data.
    pub fn note_missing(&self) {
        self.missing_seen.store(true, Ordering::Relaxed);
    }

    /// Convert raw text into a typed value.
    ///
    /// Empty text and `na` (any case) are the missing sentinel.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`ForestError::UnparsableNumber`] | numeric text does not parse |
    /// | [`ForestError::UnparsableBoolean`] | boolean text is not `true`/`false`/`1`/`0` |
    /// | [`ForestError::UnknownLevel`] | factor text is not a declared level |
    pub fn parse_value(&self, raw: &str) -> Result<CovariateValue, ForestError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("na") {
            self.note_missing();
            return Ok(CovariateValue::Missing);
        }

        match &self.kind {
            CovariateKind::Numeric => {
                let value: f64 = raw.parse().map_err(|_| ForestError::UnparsableNumber {
                    covariate: self.name.clone(),
                    raw: raw.to_string(),
                })?;
                if value.is_nan() {
                    self.note_missing();
                    return Ok(CovariateValue::Missing);
                }
                Ok(CovariateValue::Numeric(value))
            }
            CovariateKind::Boolean => {
                if raw.eq_ignore_ascii_case("true") || raw == "1" {
                    Ok(CovariateValue::Boolean(true))
                } else if raw.eq_ignore_ascii_case("false") || raw == "0" {
                    Ok(CovariateValue::Boolean(false))
                } else {
                    Err(ForestError::UnparsableBoolean {
                        covariate: self.name.clone(),
                        raw: raw.to_string(),
                    })
                }
            }
            CovariateKind::Factor { levels } => levels
                .iter()
                .position(|level| level == raw)
                .map(|pos| CovariateValue::Factor(pos as u32))
                .ok_or_else(|| ForestError::UnknownLevel {
                    covariate: self.name.clone(),
                    level: raw.to_string(),
                }),
        }
    }
}

impl fmt::Display for Covariate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.index)
    }
}

/// A typed covariate datum, or the missing sentinel.
///
/// A value does not reference its covariate; its position in the row's
/// value array identifies the owning [`Covariate`].
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CovariateValue {
    /// A numeric datum.
    Numeric(f64),
    /// A boolean datum.
    Boolean(bool),
    /// A factor datum stored as the level's position.
    Factor(u32),
    /// No observation.
    Missing,
}

impl CovariateValue {
    /// Return `true` for the missing sentinel.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, CovariateValue::Missing)
    }
}

/// A training or prediction row: covariate values, a stable id and an outcome.
///
/// The id survives bootstrap resampling and determines out-of-bag membership.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Row<Y> {
    id: usize,
    values: Vec<CovariateValue>,
    response: Y,
}

impl<Y> Row<Y> {
    /// Create a row.
    #[must_use]
    pub fn new(id: usize, values: Vec<CovariateValue>, response: Y) -> Self {
        Self {
            id,
            values,
            response,
        }
    }

    /// Return the row id.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Return the value of the covariate at `index`.
    ///
    /// Indices past the end read as missing.
    #[must_use]
    pub fn value(&self, index: usize) -> CovariateValue {
        self.values
            .get(index)
            .copied()
            .unwrap_or(CovariateValue::Missing)
    }

    /// Return all covariate values.
    #[must_use]
    pub fn values(&self) -> &[CovariateValue] {
        &self.values
    }

    /// Return the outcome.
    #[must_use]
    pub fn response(&self) -> &Y {
        &self.response
    }
}

impl<Y: Clone> Row<Y> {
    /// Copy this row with one covariate value replaced.
    #[must_use]
    pub fn with_value(&self, index: usize, value: CovariateValue) -> Self {
        let mut values = self.values.clone();
        if let Some(slot) = values.get_mut(index) {
            *slot = value;
        }
        Self {
            id: self.id,
            values,
            response: self.response.clone(),
        }
    }
}

/// Check that covariate indices match their positions and every row has one value per covariate.
pub(crate) fn validate_rows<Y>(
    rows: &[Row<Y>],
    covariates: &[Covariate],
) -> Result<(), ForestError> {
    if rows.is_empty() {
        return Err(ForestError::EmptyDataset);
    }
    if covariates.is_empty() {
        return Err(ForestError::NoCovariates);
    }
    for (position, covariate) in covariates.iter().enumerate() {
        if covariate.index() != position {
            return Err(ForestError::CovariateIndexMismatch {
                name: covariate.name().to_string(),
                declared: covariate.index(),
                position,
            });
        }
    }
    for row in rows {
        if row.values().len() != covariates.len() {
            return Err(ForestError::ValueCountMismatch {
                row_id: row.id(),
                expected: covariates.len(),
                got: row.values().len(),
            });
        }
    }
    Ok(())
}
