//! Rolling averages over the most recent valid measurements.
//!
//! Each numeric field gets its own window, so a measurement without PDoA
//! values still feeds the distance and angle windows while the PDoA windows
//! keep what they had.

use crate::notification_decoder::RangeMeasurement;

use std::collections::VecDeque;

/// How many samples each window keeps unless told otherwise.
pub const DEFAULT_WINDOW: usize = 15;

/// A FIFO of at most `capacity` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    /// An empty window. A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one once the window is full.
    pub fn push(&mut self, value: f64) {
        self.samples.push_back(value);
        if self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Arithmetic mean of the current contents, NaN when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window holds nothing yet.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.samples.iter()
    }
}

/// Moving averages of the five numeric measurement fields. Any of them may
/// be NaN if its window is still empty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedMeasurement {
    /// Distance in centimeters
    pub distance_cm: f64,
    /// Azimuth in degrees
    pub azimuth_deg: f64,
    /// Elevation in degrees
    pub elevation_deg: f64,
    /// First PDoA channel in degrees
    pub pdoa1_deg: f64,
    /// Second PDoA channel in degrees
    pub pdoa2_deg: f64,
}

/// Windows for every field plus the count of valid measurements seen.
#[derive(Debug, Clone)]
pub struct MeasurementSmoother {
    distance: RollingWindow,
    azimuth: RollingWindow,
    elevation: RollingWindow,
    pdoa1: RollingWindow,
    pdoa2: RollingWindow,
    valid_count: u64,
    target_count: Option<u64>,
}

impl MeasurementSmoother {
    /// Windows of `window` samples. With a `target_count`, [push] reports
    /// once that many valid measurements have gone in. A target of 0 is no
    /// target at all.
    ///
    /// [push]: MeasurementSmoother::push
    pub fn new(window: usize, target_count: Option<u64>) -> Self {
        Self {
            distance: RollingWindow::new(window),
            azimuth: RollingWindow::new(window),
            elevation: RollingWindow::new(window),
            pdoa1: RollingWindow::new(window),
            pdoa2: RollingWindow::new(window),
            valid_count: 0,
            target_count: target_count.filter(|&n| n > 0),
        }
    }

    /// Feed one measurement. Measurements with a non-zero status are
    /// ignored. Returns true when the target count has been reached.
    pub fn push(&mut self, measurement: &RangeMeasurement) -> bool {
        if measurement.status != 0 {
            return false;
        }

        self.distance.push(measurement.distance_cm as f64);
        push_finite(&mut self.azimuth, Some(measurement.azimuth_deg));
        push_finite(&mut self.elevation, Some(measurement.elevation_deg));
        push_finite(&mut self.pdoa1, measurement.pdoa1_deg);
        push_finite(&mut self.pdoa2, measurement.pdoa2_deg);

        self.valid_count += 1;
        self.target_reached()
    }

    /// Current averages.
    pub fn smoothed(&self) -> SmoothedMeasurement {
        SmoothedMeasurement {
            distance_cm: self.distance.mean(),
            azimuth_deg: self.azimuth.mean(),
            elevation_deg: self.elevation.mean(),
            pdoa1_deg: self.pdoa1.mean(),
            pdoa2_deg: self.pdoa2.mean(),
        }
    }

    /// Valid measurements pushed so far.
    pub fn valid_count(&self) -> u64 {
        self.valid_count
    }

    /// Whether a target count is set and has been met.
    pub fn target_reached(&self) -> bool {
        self.target_count
            .map_or(false, |target| self.valid_count >= target)
    }
}

impl Default for MeasurementSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, None)
    }
}

fn push_finite(window: &mut RollingWindow, value: Option<f64>) {
    if let Some(v) = value.filter(|v| v.is_finite()) {
        window.push(v);
    }
}
