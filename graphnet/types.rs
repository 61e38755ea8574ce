use ndarray::{Array1, ArrayView1};
use std::ops::{Deref, DerefMut};

/// Magnitude at or below which a coefficient counts as zero when measuring
/// the support of a solution.
pub const NONZERO_TOLERANCE: f64 = 1e-8;

/// One solution of the penalized problem: a weight per design column plus the
/// unpenalized intercept.
#[derive(Clone, Debug, PartialEq)]
pub struct Coefficients {
    values: Array1<f64>,
    intercept: f64,
}

impl Coefficients {
    pub fn new(values: Array1<f64>, intercept: f64) -> Self {
        Self { values, intercept }
    }

    pub fn zeros(len: usize) -> Self {
        Self::new(Array1::zeros(len), 0.0)
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.values
    }

    /// Number of entries whose magnitude exceeds [`NONZERO_TOLERANCE`].
    pub fn count_nonzero(&self) -> usize {
        self.values
            .iter()
            .filter(|v| v.abs() > NONZERO_TOLERANCE)
            .count()
    }

    pub fn support(&self) -> Vec<bool> {
        self.values
            .iter()
            .map(|v| v.abs() > NONZERO_TOLERANCE)
            .collect()
    }

    /// Flat export with the intercept appended as the final entry.
    pub fn with_intercept(&self) -> Array1<f64> {
        let mut flat = Vec::with_capacity(self.values.len() + 1);
        flat.extend(self.values.iter().copied());
        flat.push(self.intercept);
        Array1::from_vec(flat)
    }
}

impl Deref for Coefficients {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl DerefMut for Coefficients {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.values
    }
}

impl From<Coefficients> for Array1<f64> {
    fn from(values: Coefficients) -> Self {
        values.values
    }
}

/// Signed distances `x·β + b` for each row of a design.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct Margins(pub Array1<f64>);

impl Margins {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.0
    }
}

impl Deref for Margins {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Array1<f64>> for Margins {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

/// The two numeric codes applied to the two observed raw labels.
///
/// `raw[0]` is the larger observed raw label and maps to `codes[0]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LabelEncoding {
    pub raw: [f64; 2],
    pub codes: [f64; 2],
}

impl LabelEncoding {
    pub fn encode(&self, raw_label: f64) -> Option<f64> {
        if raw_label == self.raw[0] {
            Some(self.codes[0])
        } else if raw_label == self.raw[1] {
            Some(self.codes[1])
        } else {
            None
        }
    }

    pub fn class_of(&self, raw_label: f64) -> Option<usize> {
        if raw_label == self.raw[0] {
            Some(0)
        } else if raw_label == self.raw[1] {
            Some(1)
        } else {
            None
        }
    }
}
