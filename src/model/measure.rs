//! Numeric attributes on a fact table: stored sums and derived computations
//! (§4.5).

use crate::model::types::ScalarType;

/// The kind of a measure: a stored, additive [`Sum`](MeasureKind::Sum), or a
/// [`Computed`](MeasureKind::Computed) value derived from other measures in
/// the same space.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasureKind {
    Sum(ScalarType),
    Computed(Computed),
}

/// A derived measure and the names of the measures it reads (§4.5). Argument
/// order is significant: it is passed positionally to [`Computed::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Computed {
    /// `count == 0 -> 0, else total / count`.
    Average { total: String, count: String },
    /// `a - b`.
    Difference { a: String, b: String },
}

impl Computed {
    /// Argument names in evaluation order.
    pub fn args(&self) -> Vec<&str> {
        match self {
            Computed::Average { total, count } => vec![total, count],
            Computed::Difference { a, b } => vec![a, b],
        }
    }

    /// Evaluate given argument values in `self.args()` order.
    pub fn evaluate(&self, values: &[f64]) -> f64 {
        match self {
            Computed::Average { .. } => {
                let (total, count) = (values[0], values[1]);
                if count == 0.0 {
                    0.0
                } else {
                    total / count
                }
            }
            Computed::Difference { .. } => values[0] - values[1],
        }
    }
}

/// A measure declared on a [`Space`](crate::model::space::Space). Measures
/// are equal and hashed by name only (§4.5).
#[derive(Debug, Clone)]
pub struct Measure {
    pub name: String,
    pub kind: MeasureKind,
}

impl PartialEq for Measure {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for Measure {}

impl std::hash::Hash for Measure {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl Measure {
    pub fn sum(name: impl Into<String>, scalar_type: ScalarType) -> Self {
        Measure {
            name: name.into(),
            kind: MeasureKind::Sum(scalar_type),
        }
    }

    pub fn average(name: impl Into<String>, total: impl Into<String>, count: impl Into<String>) -> Self {
        Measure {
            name: name.into(),
            kind: MeasureKind::Computed(Computed::Average {
                total: total.into(),
                count: count.into(),
            }),
        }
    }

    pub fn difference(name: impl Into<String>, a: impl Into<String>, b: impl Into<String>) -> Self {
        Measure {
            name: name.into(),
            kind: MeasureKind::Computed(Computed::Difference { a: a.into(), b: b.into() }),
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self.kind, MeasureKind::Sum(_))
    }

    pub fn sql_type(&self) -> &'static str {
        match &self.kind {
            MeasureKind::Sum(ScalarType::Int) => "INTEGER",
            MeasureKind::Sum(_) => "REAL",
            MeasureKind::Computed(_) => "REAL",
        }
    }

    /// `old + new`, the only increment semantics a stored Sum supports
    /// (§4.1's *increment* load mode).
    pub fn increment(&self, old: f64, new: f64) -> f64 {
        old + new
    }

    /// Render a value per the measure's declared scalar type: whole numbers
    /// for `Int` sums, two decimal places for everything else, matching the
    /// original's locale-formatted float display.
    pub fn format(&self, value: f64) -> String {
        match &self.kind {
            MeasureKind::Sum(ScalarType::Int) => format!("{}", value.round() as i64),
            _ => format!("{value:.2}"),
        }
    }
}

/// A running aggregator for streaming use (optional per §4.5); mirrors the
/// stored measure's increment semantics without requiring a backend round
/// trip.
pub trait Aggregator {
    fn push(&mut self, value: f64);
    fn finish(self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SumAggregator {
    total: f64,
}

impl Aggregator for SumAggregator {
    fn push(&mut self, value: f64) {
        self.total += value;
    }
    fn finish(self) -> f64 {
        self.total
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AverageAggregator {
    total: f64,
    count: u64,
}

impl Aggregator for AverageAggregator {
    fn push(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }
    fn finish(self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}
