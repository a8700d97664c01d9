//! Regularized harmonic regression of a single band.
//!
//! The curve of a segment is
//!
//! ```text
//! y(t) = intercept + slope·t + Σₕ (aₕ·cos(h·ω·t) + bₕ·sin(h·ω·t)),  ω = 2π / 365.2425
//! ```
//!
//! with `h` running up to three harmonics. The coefficients minimize
//! `(1/2n)‖y − ŷ‖² + λ‖β‖₁` over the slope and harmonic terms, the intercept
//! isn't penalized. Columns are centered, the least-squares solution of the
//! normal equations is used as a warm start and covariance coordinate descent
//! applies the L1 penalty.

use std::f64::consts::TAU;

use accurate::{sum::Kahan, traits::SumAccumulator as _};
use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::{BandModel, CurveQa, Parameters, error::FitError};

/// Highest harmonic the curve supports.
pub const MAX_HARMONICS: usize = 3;

/// Length of every coefficient tuple: slope plus a cosine and sine per harmonic.
pub const COEFFICIENTS: usize = 1 + 2 * MAX_HARMONICS;

/// Mean length of a year in days.
pub const AVERAGE_DAYS_PER_YEAR: f64 = 365.2425;

/// Angular frequency of the first harmonic, in radians per day.
pub const ANGULAR_FREQUENCY: f64 = TAU / AVERAGE_DAYS_PER_YEAR;

/// Remaining fraction of a column's variance below which it counts as collinear.
const COLLINEAR: f64 = 1e-9;

/// Coefficients, intercept included, of a curve with `harmonics` harmonics.
#[must_use]
pub const fn coefficient_count(harmonics: usize) -> usize {
    2 + 2 * harmonics
}

/// Harmonics supported by a segment of `observations`, capped by the configured order.
#[must_use]
pub fn harmonics_for(observations: usize, parameters: &Parameters) -> usize {
    let factor = parameters.observation_factor;

    let harmonics = if observations < coefficient_count(2) * factor {
        1
    } else if observations < coefficient_count(3) * factor {
        2
    } else {
        3
    };

    harmonics.min(parameters.harmonic_order)
}

/// Fitted curve of one band plus its caveats.
#[derive(Debug, Clone, PartialEq)]
pub struct BandFit {
    /// Coefficients and summary statistics.
    pub model: BandModel,
    /// Caveats raised while fitting.
    pub qa: CurveQa,
}

/// Centered design matrix of a run of days, shared by every band.
///
/// Crate internal, [`crate::fit_band`] is the public way to fit a curve.
#[derive(Debug, Clone)]
pub struct Design {
    /// Centered active columns, one row per observation.
    columns: Array2<f64>,
    /// Column means removed by centering.
    means: Array1<f64>,
    /// `columnsᵀ·columns / n`, with the ridge load on the diagonal if one was needed.
    gram: Array2<f64>,
    /// Lower triangular Cholesky factor of `gram`.
    factor: Array2<f64>,
    /// Caveats of the design itself.
    qa: CurveQa,
}

impl Design {
    /// Build the design for a run of days, dropping harmonics or loading the diagonal when singular.
    ///
    /// # Errors
    ///
    /// - When there are fewer days than the lowest order model has coefficients.
    /// - When the normal equations stay singular even with ridge stabilization.
    pub fn new(days: &[i64], harmonics: usize, parameters: &Parameters) -> Result<Self, FitError> {
        let lowest = coefficient_count(1);
        if branches::unlikely(days.len() < lowest) {
            return Err(FitError::Underdetermined {
                observations: days.len(),
                coefficients: lowest,
            });
        }

        // Never ask for more coefficients than observations
        let supported = (days.len() - 2) / 2;
        let mut harmonics = harmonics.clamp(1, MAX_HARMONICS).min(supported);

        loop {
            let (columns, means, gram) = normal_equations(days, harmonics);

            if let Some(factor) = cholesky(&gram) {
                let order = if harmonics < parameters.harmonic_order {
                    CurveQa::REDUCED_ORDER
                } else {
                    CurveQa::FULL_ORDER
                };

                return Ok(Self {
                    columns,
                    means,
                    gram,
                    factor,
                    qa: order,
                });
            }

            if harmonics > 1 {
                tracing::warn!(harmonics, "singular design, dropping a harmonic");
                harmonics -= 1;
                continue;
            }

            // Even the lowest order is singular, load the diagonal
            tracing::warn!("singular design, falling back to ridge");
            let load = parameters.ridge * gram.diag().mean().unwrap_or(0.0);
            let mut gram = gram;
            gram.diag_mut().mapv_inplace(|value| value + load);

            let factor = cholesky(&gram).ok_or(FitError::Singular)?;

            return Ok(Self {
                columns,
                means,
                gram,
                factor,
                qa: CurveQa::RIDGE | CurveQa::REDUCED_ORDER,
            });
        }
    }

    /// Amount of observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.nrows()
    }

    /// Fit the curve of a band observed on the design's days.
    ///
    /// Callers pass one value per day, [`crate::fit_band`] checks this for outside input.
    #[must_use]
    pub fn fit(&self, values: &[f64], parameters: &Parameters) -> BandFit {
        debug_assert_eq!(values.len(), self.len(), "one value per design row");

        let observations = ArrayView1::from(values);
        #[allow(clippy::cast_precision_loss)]
        let count = values.len() as f64;
        let mean = kahan_sum(values.iter().copied()) / count;
        let centered = observations.mapv(|value| value - mean);

        // Correlation of each column with the observations
        let correlation = self.columns.t().dot(&centered) / count;

        // Least-squares warm start
        let mut beta = solve(&self.factor, &correlation);
        let mut qa = self.qa;
        if !descend(&self.gram, &correlation, &mut beta, centered.view(), parameters) {
            tracing::warn!(
                iterations = parameters.max_iterations,
                "coordinate descent did not converge"
            );
            qa |= CurveQa::NOT_CONVERGED;
        }

        // Residuals of the centered problem are the residuals of the full curve
        let residuals = &centered - &self.columns.dot(&beta);
        let rmse = (kahan_sum(residuals.iter().map(|residual| residual * residual)) / count).sqrt();

        let intercept = mean - beta.dot(&self.means);

        let mut coefficients = [0.0; COEFFICIENTS];
        coefficients[..beta.len()]
            .iter_mut()
            .zip(beta.iter())
            .for_each(|(coefficient, value)| *coefficient = *value);

        let magnitude = coefficients[1..]
            .iter()
            .map(|coefficient| coefficient * coefficient)
            .sum::<f64>()
            .sqrt();

        BandFit {
            model: BandModel {
                coefficients,
                intercept,
                magnitude,
                rmse,
            },
            qa,
        }
    }
}

/// Build the centered columns, their means and the scaled Gram matrix.
fn normal_equations(days: &[i64], harmonics: usize) -> (Array2<f64>, Array1<f64>, Array2<f64>) {
    let width = coefficient_count(harmonics) - 1;

    let mut columns = Array2::zeros((days.len(), width));
    for (mut row, &day) in columns.axis_iter_mut(Axis(0)).zip(days) {
        #[allow(clippy::cast_precision_loss)]
        let day = day as f64;
        row[0] = day;

        for harmonic in 1..=harmonics {
            #[allow(clippy::cast_precision_loss)]
            let angle = harmonic as f64 * ANGULAR_FREQUENCY * day;
            row[2 * harmonic - 1] = angle.cos();
            row[2 * harmonic] = angle.sin();
        }
    }

    let means = columns
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(width));
    columns -= &means;

    #[allow(clippy::cast_precision_loss)]
    let gram = columns.t().dot(&columns) / days.len() as f64;

    (columns, means, gram)
}

/// Cholesky factorization, `None` when a column is (nearly) a combination of the previous ones.
fn cholesky(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let size = matrix.nrows();
    let mut lower = Array2::<f64>::zeros((size, size));

    for row in 0..size {
        for column in 0..=row {
            let projected = (0..column)
                .map(|inner| lower[[row, inner]] * lower[[column, inner]])
                .sum::<f64>();

            if row == column {
                let diagonal = matrix[[row, row]];
                let pivot = diagonal - projected;

                // Relative to the column's own variance so the slope's scale doesn't matter
                if branches::unlikely(!(pivot > COLLINEAR * diagonal) || diagonal <= 0.0) {
                    return None;
                }

                lower[[row, row]] = pivot.sqrt();
            } else {
                lower[[row, column]] = (matrix[[row, column]] - projected) / lower[[column, column]];
            }
        }
    }

    Some(lower)
}

/// Solve `L·Lᵀ·x = b` by forward then backward substitution.
fn solve(lower: &Array2<f64>, rhs: &Array1<f64>) -> Array1<f64> {
    let size = rhs.len();

    let mut forward = Array1::<f64>::zeros(size);
    for row in 0..size {
        let known = (0..row)
            .map(|column| lower[[row, column]] * forward[column])
            .sum::<f64>();
        forward[row] = (rhs[row] - known) / lower[[row, row]];
    }

    let mut backward = Array1::<f64>::zeros(size);
    for row in (0..size).rev() {
        let known = (row + 1..size)
            .map(|column| lower[[column, row]] * backward[column])
            .sum::<f64>();
        backward[row] = (forward[row] - known) / lower[[row, row]];
    }

    backward
}

/// Covariance coordinate descent for the L1 penalty, returns whether it converged.
fn descend(
    gram: &Array2<f64>,
    correlation: &Array1<f64>,
    beta: &mut Array1<f64>,
    centered: ArrayView1<f64>,
    parameters: &Parameters,
) -> bool {
    let penalty = parameters.regularization;

    // Changes are measured in fitted value units, relative to the spread of the observations
    #[allow(clippy::cast_precision_loss)]
    let spread = (kahan_sum(centered.iter().map(|value| value * value)) / centered.len() as f64)
        .sqrt();
    let tolerance = parameters.tolerance * spread;

    for _ in 0..parameters.max_iterations {
        let mut largest_change = 0.0_f64;

        for index in 0..beta.len() {
            let diagonal = gram[[index, index]];
            let previous = beta[index];

            // Correlation with the partial residual that excludes this column
            let partial = correlation[index] - gram.row(index).dot(&*beta) + diagonal * previous;
            let updated = soft_threshold(partial, penalty) / diagonal;

            beta[index] = updated;
            largest_change = largest_change.max((updated - previous).abs() * diagonal.sqrt());
        }

        if largest_change <= tolerance {
            return true;
        }
    }

    false
}

/// Shrink towards zero by `threshold`.
#[inline]
fn soft_threshold(value: f64, threshold: f64) -> f64 {
    value.signum() * (value.abs() - threshold).max(0.0)
}

/// Compensated sum.
#[inline]
fn kahan_sum(values: impl Iterator<Item = f64>) -> f64 {
    let mut total = Kahan::zero();
    values.for_each(|value| total += value);

    total.sum()
}
