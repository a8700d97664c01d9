//! Segmentation state machine.

use std::collections::BTreeMap;

use ndarray::Array2;
use smallvec::SmallVec;

use crate::{
    Band, BandModel, ChangeModel, CurveQa, Parameters, Preprocessed,
    fit::{BandFit, Design, MAX_HARMONICS, coefficient_count, harmonics_for},
};

/// Phase of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Gathering a window of observations for a new segment.
    Initializing,
    /// Absorbing observations that agree with the segment's curves.
    Stable,
    /// Holding a run of anomalies that may confirm a break.
    Testing,
    /// Emitting the model of a segment whose break was confirmed.
    Closing,
    /// Every observation has been consumed.
    Done,
}

/// Cross-band evidence of a single observation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    /// Per band, indexed by [`Band::index`], whether the residual exceeded the threshold.
    flagged: [bool; Band::COUNT],
    /// Bands that voted.
    voters: usize,
}

impl Tally {
    /// Record the vote of a band.
    pub const fn record(&mut self, band: Band, exceeded: bool) {
        self.flagged[band.index()] = exceeded;
        self.voters += 1;
    }

    /// Whether a band voted for a break.
    #[must_use]
    pub const fn is_flagged(&self, band: Band) -> bool {
        self.flagged[band.index()]
    }

    /// Amount of bands that voted for a break.
    #[must_use]
    pub fn count(&self) -> usize {
        self.flagged.iter().filter(|&&flagged| flagged).count()
    }

    /// Amount of bands that voted.
    #[must_use]
    pub const fn voters(&self) -> usize {
        self.voters
    }

    /// Whether enough bands voted for a break.
    #[must_use]
    pub fn is_anomalous(&self, required: usize) -> bool {
        self.count() >= required
    }
}

/// Usable observations as days and one value column per configured band.
#[derive(Debug)]
struct Series {
    /// Day per usable observation.
    days: Vec<i64>,
    /// Values, one row per observation, one column per configured band.
    values: Array2<f64>,
}

impl Series {
    /// Extract the usable observations.
    fn new(preprocessed: &Preprocessed, parameters: &Parameters) -> Self {
        let usable = preprocessed.usable().collect::<Vec<_>>();

        let days = usable.iter().map(|observation| observation.day()).collect();
        let values = Array2::from_shape_fn((usable.len(), parameters.bands.len()), |(row, column)| {
            // Masking guarantees every configured band is present
            usable[row]
                .band(parameters.bands[column])
                .unwrap_or(f64::NAN)
        });

        Self { days, values }
    }

    /// Amount of observations.
    fn len(&self) -> usize {
        self.days.len()
    }

    /// Days of a set of observations.
    fn days_of(&self, indices: &[usize]) -> Vec<i64> {
        indices.iter().map(|&index| self.days[index]).collect()
    }

    /// Values of one band for a set of observations.
    fn values_of(&self, indices: &[usize], column: usize) -> Vec<f64> {
        indices
            .iter()
            .map(|&index| self.values[[index, column]])
            .collect()
    }
}

/// Working state of the segment being grown.
#[derive(Debug)]
struct Segment {
    /// Included observations, ascending.
    indices: Vec<usize>,
    /// Curve per configured band.
    fits: Vec<BandFit>,
    /// Residual normalization per configured band.
    scales: Vec<f64>,
    /// Amount of observations at the last refit.
    fitted: usize,
}

impl Segment {
    /// Start a segment from a window and its fits.
    fn new(indices: Vec<usize>, fits: Vec<BandFit>, variogram: &[f64], parameters: &Parameters) -> Self {
        let fitted = indices.len();
        let scales = comparison_scales(&fits, variogram, parameters);

        Self {
            indices,
            fits,
            scales,
            fitted,
        }
    }

    /// Refit every band on the included observations.
    ///
    /// Keeps the previous curves when the fit fails.
    fn refit(&mut self, series: &Series, variogram: &[f64], parameters: &Parameters) {
        match fit_bands(series, &self.indices, harmonics_for(self.indices.len(), parameters), parameters) {
            Some(fits) => {
                self.scales = comparison_scales(&fits, variogram, parameters);
                self.fits = fits;
                self.fitted = self.indices.len();
            }
            None => tracing::warn!(
                observations = self.indices.len(),
                "refit failed, keeping previous curves"
            ),
        }
    }

    /// Whether the segment grew enough since the last fit to warrant a refit.
    fn needs_refit(&self, parameters: &Parameters) -> bool {
        let length = self.indices.len();

        // Refit on every observation until the highest order is supported, then on each third of growth
        length < coefficient_count(MAX_HARMONICS) * parameters.observation_factor
            || 3 * length >= 4 * self.fitted
    }

    /// First and last day.
    fn span(&self, series: &Series) -> (i64, i64) {
        let first = self.indices.first().map_or(0, |&index| series.days[index]);
        let last = self.indices.last().map_or(0, |&index| series.days[index]);

        (first, last)
    }

    /// Union of the curves' caveats.
    fn qa(&self) -> CurveQa {
        self.fits
            .iter()
            .fold(CurveQa::empty(), |qa, fit| qa | fit.qa)
    }

    /// Band models keyed by band.
    fn band_models(&self, parameters: &Parameters) -> BTreeMap<Band, BandModel> {
        parameters
            .bands
            .iter()
            .zip(&self.fits)
            .map(|(&band, fit)| (band, fit.model.clone()))
            .collect()
    }
}

/// Consecutive anomalies held while testing.
#[derive(Debug, Default)]
struct Anomalies {
    /// Held observations.
    indices: SmallVec<usize, 8>,
    /// Sum of flagged bands over the held observations.
    flagged: usize,
    /// Sum of voting bands over the held observations.
    voters: usize,
}

impl Anomalies {
    /// Hold an anomalous observation.
    fn push(&mut self, index: usize, tally: Tally) {
        self.indices.push(index);
        self.flagged += tally.count();
        self.voters += tally.voters();
    }

    /// Drop everything held.
    fn clear(&mut self) {
        self.indices.clear();
        self.flagged = 0;
        self.voters = 0;
    }

    /// Amount of held observations.
    fn len(&self) -> usize {
        self.indices.len()
    }

    /// Fraction of the votes that flagged a break.
    fn probability(&self) -> f64 {
        if self.voters == 0 {
            return 0.0;
        }

        #[allow(clippy::cast_precision_loss)]
        let probability = self.flagged as f64 / self.voters as f64;

        probability
    }
}

/// Drives segmentation of one time series.
#[derive(Debug)]
pub struct Detector<'a> {
    /// Run parameters.
    parameters: &'a Parameters,
    /// Usable observations.
    series: Series,
    /// Median absolute difference of consecutive observations, per configured band.
    variogram: Vec<f64>,
    /// Columns of the detection bands among the configured bands.
    detection: SmallVec<usize, { Band::COUNT }>,
    /// Current phase.
    state: State,
    /// Next observation to look at.
    cursor: usize,
    /// First observation of the initialization window.
    window_start: usize,
    /// Segment being grown.
    segment: Option<Segment>,
    /// Anomalies held while testing.
    anomalies: Anomalies,
    /// Emitted models.
    models: Vec<ChangeModel>,
}

impl<'a> Detector<'a> {
    /// Prepare a detector over the usable observations.
    #[must_use]
    pub fn new(preprocessed: &Preprocessed, parameters: &'a Parameters) -> Self {
        let series = Series::new(preprocessed, parameters);

        let variogram = (0..parameters.bands.len())
            .map(|column| {
                let differences = series
                    .values
                    .column(column)
                    .windows(2)
                    .into_iter()
                    .map(|pair| (pair[1] - pair[0]).abs())
                    .collect::<Vec<_>>();

                median(differences)
            })
            .collect();

        let detection = parameters
            .detection_bands
            .iter()
            .filter_map(|band| parameters.bands.iter().position(|other| other == band))
            .collect();

        Self {
            parameters,
            series,
            variogram,
            detection,
            state: State::Initializing,
            cursor: 0,
            window_start: 0,
            segment: None,
            anomalies: Anomalies::default(),
            models: Vec::new(),
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Models emitted so far.
    #[must_use]
    pub fn models(&self) -> &[ChangeModel] {
        &self.models
    }

    /// Run until every observation is consumed and return the models in temporal order.
    #[must_use]
    pub fn run(mut self) -> Vec<ChangeModel> {
        while self.step() != State::Done {}

        self.models
    }

    /// Advance the state machine by one action and return the new phase.
    pub fn step(&mut self) -> State {
        let next = match self.state {
            State::Initializing => self.initialize(),
            State::Stable => self.stable(),
            State::Testing => self.testing(),
            State::Closing => self.close(),
            State::Done => State::Done,
        };

        if next != self.state {
            tracing::debug!(from = ?self.state, to = ?next, cursor = self.cursor, "transition");
        }
        self.state = next;

        next
    }

    /// Grow the window until it's long enough, then accept it if its curves are stable.
    fn initialize(&mut self) -> State {
        while !self.window_ready() && self.cursor < self.series.len() {
            self.cursor += 1;
        }

        let indices = (self.window_start..self.cursor).collect::<Vec<_>>();
        if !self.window_ready() {
            self.finish_leftovers(indices);

            return State::Done;
        }

        // Stability is judged on the lowest order curve
        let Some(fits) = fit_bands(&self.series, &indices, 1, self.parameters) else {
            self.window_start += 1;

            return State::Initializing;
        };

        let tally = self.stability(&indices, &fits);
        if tally.is_anomalous(self.parameters.required_votes()) {
            tracing::trace!(
                window_start = self.window_start,
                flagged = tally.count(),
                "unstable window, sliding"
            );
            self.window_start += 1;

            return State::Initializing;
        }

        let mut segment = Segment::new(indices, fits, &self.variogram, self.parameters);
        segment.refit(&self.series, &self.variogram, self.parameters);
        self.segment = Some(segment);

        State::Stable
    }

    /// Test the next observation against the committed curves.
    fn stable(&mut self) -> State {
        if self.cursor >= self.series.len() {
            self.finish_segment();

            return State::Done;
        }

        let index = self.cursor;
        self.cursor += 1;

        let tally = self.vote(index);
        if tally.is_anomalous(self.parameters.required_votes()) {
            tracing::trace!(day = self.series.days[index], flagged = tally.count(), "anomaly");
            self.anomalies.push(index, tally);

            return self.confirmed_or_testing();
        }

        self.absorb(index);

        State::Stable
    }

    /// Extend or break the run of anomalies.
    fn testing(&mut self) -> State {
        if self.cursor >= self.series.len() {
            tracing::debug!(held = self.anomalies.len(), "series ended before confirmation");
            self.anomalies.clear();
            self.finish_segment();

            return State::Done;
        }

        let index = self.cursor;
        self.cursor += 1;

        let tally = self.vote(index);
        if tally.is_anomalous(self.parameters.required_votes()) {
            self.anomalies.push(index, tally);

            return self.confirmed_or_testing();
        }

        // The run broke, the held observations were noise
        tracing::trace!(discarded = self.anomalies.len(), "anomalies discarded");
        self.anomalies.clear();
        self.absorb(index);

        State::Stable
    }

    /// Emit the segment with its confirmed break and seed the next window with the anomalies.
    fn close(&mut self) -> State {
        let (Some(&first_anomaly), Some(mut segment)) =
            (self.anomalies.indices.first(), self.segment.take())
        else {
            return State::Initializing;
        };
        segment.refit(&self.series, &self.variogram, self.parameters);

        let (start_day, end_day) = segment.span(&self.series);

        let model = ChangeModel {
            start_day,
            end_day,
            break_day: self.series.days[first_anomaly],
            observation_count: segment.indices.len(),
            change_probability: self.anomalies.probability(),
            curve_qa: segment.qa(),
            bands: segment.band_models(self.parameters),
        };
        tracing::debug!(
            start_day,
            end_day,
            break_day = model.break_day,
            observations = model.observation_count,
            "break confirmed"
        );
        self.models.push(model);

        self.window_start = first_anomaly;
        self.anomalies.clear();

        State::Initializing
    }

    /// Move to closing once the run of anomalies fills the confirmation window.
    fn confirmed_or_testing(&self) -> State {
        if self.anomalies.len() >= self.parameters.confirmation_window {
            State::Closing
        } else {
            State::Testing
        }
    }

    /// Include an observation in the segment, refitting when it grew enough.
    fn absorb(&mut self, index: usize) {
        let Some(segment) = self.segment.as_mut() else {
            return;
        };

        segment.indices.push(index);
        if segment.needs_refit(self.parameters) {
            segment.refit(&self.series, &self.variogram, self.parameters);
        }
    }

    /// Whether the window holds enough observations over a long enough span.
    fn window_ready(&self) -> bool {
        let count = self.cursor.saturating_sub(self.window_start);
        if count < self.parameters.minimum_segment_length {
            return false;
        }

        let span = self.series.days[self.cursor - 1] - self.series.days[self.window_start];

        span >= self.parameters.minimum_window_days
    }

    /// Normalized residuals of an observation against the segment's curves.
    fn vote(&self, index: usize) -> Tally {
        let mut tally = Tally::default();
        let Some(segment) = &self.segment else {
            return tally;
        };

        let day = self.series.days[index];
        for &column in &self.detection {
            let residual = self.series.values[[index, column]] - segment.fits[column].model.predict(day);
            let exceeded = residual.abs() / segment.scales[column] > self.parameters.residual_threshold;

            tally.record(self.parameters.bands[column], exceeded);
        }

        tally
    }

    /// Flag detection bands whose trend or end residuals are too large for a stable start.
    fn stability(&self, indices: &[usize], fits: &[BandFit]) -> Tally {
        let mut tally = Tally::default();
        let (Some(&first), Some(&last)) = (indices.first(), indices.last()) else {
            return tally;
        };

        let scales = comparison_scales(fits, &self.variogram, self.parameters);
        let (first_day, last_day) = (self.series.days[first], self.series.days[last]);
        #[allow(clippy::cast_precision_loss)]
        let span = (last_day - first_day) as f64;

        for &column in &self.detection {
            let model = &fits[column].model;
            let first_residual = self.series.values[[first, column]] - model.predict(first_day);
            let last_residual = self.series.values[[last, column]] - model.predict(last_day);

            let drift = (model.coefficients[0] * span).abs() + first_residual.abs() + last_residual.abs();

            tally.record(
                self.parameters.bands[column],
                drift / scales[column] > self.parameters.residual_threshold,
            );
        }

        tally
    }

    /// Emit the open segment as an unconfirmed trailing model.
    fn finish_segment(&mut self) {
        let Some(mut segment) = self.segment.take() else {
            return;
        };
        segment.refit(&self.series, &self.variogram, self.parameters);

        self.push_trailing(&segment);
    }

    /// Emit a trailing model from a window that never became stable, if it's long enough.
    fn finish_leftovers(&mut self, indices: Vec<usize>) {
        if indices.len() < self.parameters.minimum_segment_length {
            tracing::debug!(leftover = indices.len(), "too few observations for a trailing model");

            return;
        }

        let harmonics = harmonics_for(indices.len(), self.parameters);
        let Some(fits) = fit_bands(&self.series, &indices, harmonics, self.parameters) else {
            return;
        };

        let segment = Segment::new(indices, fits, &self.variogram, self.parameters);
        self.push_trailing(&segment);
    }

    /// Emit a model without a break.
    fn push_trailing(&mut self, segment: &Segment) {
        let (start_day, end_day) = segment.span(&self.series);

        tracing::debug!(
            start_day,
            end_day,
            observations = segment.indices.len(),
            "trailing segment"
        );

        self.models.push(ChangeModel {
            start_day,
            end_day,
            break_day: end_day,
            observation_count: segment.indices.len(),
            change_probability: 0.0,
            curve_qa: segment.qa() | CurveQa::UNCONFIRMED,
            bands: segment.band_models(self.parameters),
        });
    }
}

/// Fit every configured band on a set of observations, `None` when the design is unusable.
fn fit_bands(
    series: &Series,
    indices: &[usize],
    harmonics: usize,
    parameters: &Parameters,
) -> Option<Vec<BandFit>> {
    let days = series.days_of(indices);

    let design = match Design::new(&days, harmonics, parameters) {
        Ok(design) => design,
        Err(error) => {
            tracing::warn!(%error, observations = indices.len(), "can't fit segment");

            return None;
        }
    };

    Some(
        (0..parameters.bands.len())
            .map(|column| design.fit(&series.values_of(indices, column), parameters))
            .collect(),
    )
}

/// Residual normalization per band: the largest of rmse, variogram and the configured floor.
fn comparison_scales(fits: &[BandFit], variogram: &[f64], parameters: &Parameters) -> Vec<f64> {
    fits.iter()
        .zip(variogram)
        .map(|(fit, &variogram)| fit.model.rmse.max(variogram).max(parameters.minimum_rmse))
        .collect()
}

/// Median of a set of values, zero when empty.
fn median(mut values: Vec<f64>) -> f64 {
    let len = values.len();

    // Check the easy cases
    match len {
        0 => return 0.0,
        1 => return values[0],
        2 => return f64::midpoint(values[0], values[1]),
        _ => (),
    }

    // Handle the case of even and odd arrays
    if len.is_multiple_of(2) {
        // Take the two middle values
        let (_, left, rest) = values.select_nth_unstable_by(len / 2 - 1, f64::total_cmp);
        let left = *left;
        let (_, right, _) = rest.select_nth_unstable_by(0, f64::total_cmp);

        f64::midpoint(left, *right)
    } else {
        // Take the single midpoint value
        let (_, mid, _) = values.select_nth_unstable_by(len / 2, f64::total_cmp);

        *mid
    }
}
