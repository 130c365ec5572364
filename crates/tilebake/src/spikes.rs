//! Elevation spike detection and correction.
//!
//! A tile is reduced to a flat list of [`Sample`]s (one per vertex), the samples
//! are classified against winsorized statistics, and corrected elevations of the
//! samples marked [`SpikeStatus::Spike`] are written back onto the vertices.
//!
//! Two modes exist. When the whole tile is statistically calm (global deviation
//! below [`SpikeParams::mode_threshold`]) one global model is used. Otherwise the
//! tile-local domain is scanned with overlapping square windows and every window
//! is judged against its own statistics.

use std::collections::BTreeSet;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mesh::Tile;
use crate::stats::{Statistics, WinsorizedDeviation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpikeStatus {
    #[default]
    Undefined,
    Spike,
    NoSpike,
}

/// One vertex elevation under test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub east: f64,
    pub north: f64,
    pub original: f64,
    pub corrected: f64,
    pub status: SpikeStatus,
    /// Index of the owning object within the tile.
    pub object: usize,
    /// Index of the vertex within the owning object.
    pub vertex: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMode {
    Global,
    Tiled,
}

/// Tunables of the corrector. Defaults match the production bake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeParams {
    /// Sigma multiplier for the whole-tile statistics.
    pub global_sigma: f64,
    /// Sigma multiplier inside each tiled-mode window.
    pub tiled_sigma: f64,
    /// Global deviation at or above which tiled mode is used.
    pub mode_threshold: f64,
    /// Tile-local domain scanned by tiled mode, on both axes: `[min, max)`.
    pub domain_min: f64,
    pub domain_max: f64,
    /// Distance between consecutive window origins.
    pub window_step: f64,
    /// Window edge length; windows overlap when larger than the step.
    pub window_width: f64,
    pub deviation: WinsorizedDeviation,
}

impl Default for SpikeParams {
    fn default() -> Self {
        Self {
            global_sigma: 5.0,
            tiled_sigma: 3.0,
            mode_threshold: 5.0,
            domain_min: -500.0,
            domain_max: 500.0,
            window_step: 150.0,
            window_width: 300.0,
            deviation: WinsorizedDeviation::AllSamples,
        }
    }
}

impl SpikeParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("global_sigma", self.global_sigma),
            ("tiled_sigma", self.tiled_sigma),
            ("window_step", self.window_step),
            ("window_width", self.window_width),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigError::Invalid(format!(
                    "spike.{} must be a positive number, got {}",
                    name, value
                )));
            }
        }

        if !(self.domain_min < self.domain_max) {
            return Err(ConfigError::Invalid(format!(
                "spike domain [{}, {}) is empty",
                self.domain_min, self.domain_max
            )));
        }

        Ok(())
    }

    /// Window origins along one axis: `domain_min + k * window_step < domain_max`.
    pub fn window_origins(&self) -> Vec<f64> {
        if !(self.window_step > 0.0) {
            return Vec::new();
        }

        let mut origins = Vec::new();
        let mut k = 0u32;
        loop {
            let origin = self.domain_min + f64::from(k) * self.window_step;
            if origin >= self.domain_max {
                break;
            }
            origins.push(origin);
            k += 1;
        }
        origins
    }
}

/// Samples of one tile, in object-then-vertex order.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    samples: Vec<Sample>,
}

impl SampleSet {
    pub fn from_tile(tile: &Tile) -> Self {
        let samples = tile
            .objects
            .iter()
            .enumerate()
            .flat_map(|(object, o)| {
                o.vertices.iter().enumerate().map(move |(vertex, v)| Sample {
                    east: v[0],
                    north: v[1],
                    original: v[2],
                    corrected: v[2],
                    status: SpikeStatus::Undefined,
                    object,
                    vertex,
                })
            })
            .collect();

        Self { samples }
    }

    /// Samples for bare points, all attributed to object 0.
    pub fn from_points(points: &[[f64; 3]]) -> Self {
        let samples = points
            .iter()
            .enumerate()
            .map(|(vertex, p)| Sample {
                east: p[0],
                north: p[1],
                original: p[2],
                corrected: p[2],
                status: SpikeStatus::Undefined,
                object: 0,
                vertex,
            })
            .collect();

        Self { samples }
    }

    #[inline]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn spike_count(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| s.status == SpikeStatus::Spike)
            .count()
    }

    /// Whole-set statistics on the original elevations.
    pub fn statistics(&self, sigma: f64, deviation: WinsorizedDeviation) -> Option<Statistics> {
        let elevations: Vec<f64> = self.samples.iter().map(|s| s.original).collect();
        Statistics::compute(&elevations, sigma, deviation)
    }

    /// Pick the mode from the global statistics and classify every sample.
    pub fn correct(&mut self, params: &SpikeParams) -> Option<(CorrectionMode, Statistics)> {
        let global = self.statistics(params.global_sigma, params.deviation)?;

        if global.std_dev < params.mode_threshold {
            self.correct_global(&global);
            Some((CorrectionMode::Global, global))
        } else {
            self.correct_tiled(params);
            Some((CorrectionMode::Tiled, global))
        }
    }

    /// Classify every sample against one set of statistics.
    pub fn correct_global(&mut self, stats: &Statistics) {
        for sample in &mut self.samples {
            classify(sample, stats);
        }
    }

    /// Classify samples window by window; later windows overwrite earlier ones
    /// where they overlap.
    pub fn correct_tiled(&mut self, params: &SpikeParams) {
        let origins = params.window_origins();
        let width = params.window_width;

        let mut members: Vec<usize> = Vec::new();
        let mut elevations: Vec<f64> = Vec::new();

        for &east in &origins {
            for &north in &origins {
                members.clear();
                members.extend(self.samples.iter().enumerate().filter_map(|(i, s)| {
                    let inside = s.east >= east
                        && s.east <= east + width
                        && s.north >= north
                        && s.north <= north + width;
                    inside.then_some(i)
                }));

                elevations.clear();
                elevations.extend(members.iter().map(|&i| self.samples[i].original));

                let Some(stats) =
                    Statistics::compute(&elevations, params.tiled_sigma, params.deviation)
                else {
                    continue;
                };

                for &i in &members {
                    classify(&mut self.samples[i], &stats);
                }
            }
        }
    }

    /// Write corrected elevations of spike samples onto the tile's vertices.
    ///
    /// Returns the indices of the objects that changed, ascending.
    pub fn apply(&self, tile: &mut Tile) -> Vec<usize> {
        let mut mutated = BTreeSet::new();

        for sample in self.samples.iter().filter(|s| s.status == SpikeStatus::Spike) {
            if let Some(vertex) = tile
                .objects
                .get_mut(sample.object)
                .and_then(|o| o.vertices.get_mut(sample.vertex))
            {
                vertex[2] = sample.corrected;
                mutated.insert(sample.object);
            }
        }

        mutated.into_iter().collect()
    }
}

/// Outliers become spikes pulled to the mean, unless an earlier pass already
/// cleared them. In-range samples are always cleared.
#[inline]
fn classify(sample: &mut Sample, stats: &Statistics) {
    if stats.is_outlier(sample.original) {
        if sample.status != SpikeStatus::NoSpike {
            sample.status = SpikeStatus::Spike;
            sample.corrected = stats.mean;
        }
    } else {
        sample.status = SpikeStatus::NoSpike;
        sample.corrected = sample.original;
    }
}

/// Outcome of [`correct_tile`].
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionReport {
    /// `None` for a tile without vertices.
    pub mode: Option<CorrectionMode>,
    pub samples: usize,
    pub spikes: usize,
    /// Objects whose vertices moved, ascending.
    pub mutated_objects: Vec<usize>,
    pub global: Option<Statistics>,
}

/// Gather samples from `tile`, correct them, and write the spikes back.
pub fn correct_tile(tile: &mut Tile, params: &SpikeParams) -> CorrectionReport {
    let mut samples = SampleSet::from_tile(tile);

    let Some((mode, global)) = samples.correct(params) else {
        return CorrectionReport {
            mode: None,
            samples: 0,
            spikes: 0,
            mutated_objects: Vec::new(),
            global: None,
        };
    };

    let mutated_objects = samples.apply(tile);
    let spikes = samples.spike_count();

    debug!(
        "{}: {:?} mode, {} samples, {} spikes, global mean {:.2} std {:.2}",
        tile.path.display(),
        mode,
        samples.len(),
        spikes,
        global.mean,
        global.std_dev
    );

    CorrectionReport {
        mode: Some(mode),
        samples: samples.len(),
        spikes,
        mutated_objects,
        global: Some(global),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshObject;

    /// `n × n` grid over `[-450, 450]` at a gently sloping elevation.
    fn terrain(n: usize, elevation: impl Fn(f64, f64) -> f64) -> Vec<[f64; 3]> {
        let step = 900.0 / (n - 1) as f64;
        let mut points = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                let x = -450.0 + i as f64 * step;
                let y = -450.0 + j as f64 * step;
                points.push([x, y, elevation(x, y)]);
            }
        }
        points
    }

    fn tile_from(points: Vec<[f64; 3]>) -> Tile {
        let n = points.len() as u32;
        Tile {
            size: [1000.0, 1000.0],
            objects: vec![MeshObject {
                id: "terrain".to_owned(),
                triangles: (0..n.saturating_sub(2)).flat_map(|i| [i, i + 1, i + 2]).collect(),
                vertices: points,
                ..MeshObject::default()
            }],
            ..Tile::default()
        }
    }

    #[test]
    fn default_windows_cover_the_domain_with_overlap() {
        let params = SpikeParams::default();
        assert_eq!(
            params.window_origins(),
            vec![-500.0, -350.0, -200.0, -50.0, 100.0, 250.0, 400.0]
        );
    }

    #[test]
    fn flat_tile_uses_global_mode_and_pulls_spike_to_mean() {
        let mut points = terrain(21, |x, _| 10.0 + x * 0.001);
        points[100][2] = 250.0;

        let mut tile = tile_from(points);
        let report = correct_tile(&mut tile, &SpikeParams::default());

        assert_eq!(report.mode, Some(CorrectionMode::Global));
        assert_eq!(report.spikes, 1);
        assert_eq!(report.mutated_objects, vec![0]);

        let fixed = tile.objects[0].vertices[100][2];
        assert!((fixed - 10.0).abs() < 1.0, "spike moved to {}", fixed);
    }

    #[test]
    fn second_global_pass_over_corrected_tile_moves_nothing() {
        let mut points = terrain(15, |x, y| 3.0 + 0.002 * (x + y));
        points[7][2] = 90.0;
        points[50][2] = -60.0;

        let params = SpikeParams::default();
        let mut tile = tile_from(points);

        let first = correct_tile(&mut tile, &params);
        assert_eq!(first.mode, Some(CorrectionMode::Global));
        assert_eq!(first.spikes, 2);
        assert_eq!(first.mutated_objects, vec![0]);

        let corrected = tile.objects[0].vertices.clone();
        assert!(corrected.iter().all(|v| (v[2] - 3.0).abs() < 2.0));

        // Samples are gathered again from the corrected vertices.
        let second = correct_tile(&mut tile, &params);
        assert_eq!(second.mode, Some(CorrectionMode::Global));
        assert_eq!(second.spikes, 0);
        assert!(second.mutated_objects.is_empty());
        assert_eq!(tile.objects[0].vertices, corrected);
    }

    #[test]
    fn cleared_sample_is_never_turned_into_spike() {
        let mut samples = SampleSet::from_points(&[[0.0, 0.0, 10.0], [1.0, 0.0, 10.0]]);
        samples.samples[0].status = SpikeStatus::NoSpike;

        let narrow = Statistics {
            mean: 0.0,
            std_dev: 0.0,
            floor: -1.0,
            ceiling: 1.0,
            raw_mean: 0.0,
            raw_std_dev: 0.0,
            in_bounds: 2,
            insufficient_data: false,
        };
        samples.correct_global(&narrow);

        assert_eq!(samples.samples()[0].status, SpikeStatus::NoSpike);
        assert_eq!(samples.samples()[0].corrected, 10.0);
        assert_eq!(samples.samples()[1].status, SpikeStatus::Spike);
        assert_eq!(samples.samples()[1].corrected, 0.0);
    }

    #[test]
    fn hilly_tile_switches_to_tiled_mode_and_fixes_local_spike() {
        // Two plateaus 100 m apart: the global deviation is large, each window is calm.
        let mut points = terrain(31, |x, _| if x < 0.0 { 0.0 } else { 100.0 });
        let spike = points
            .iter()
            .position(|p| p[0] > 200.0 && p[1] > 200.0)
            .unwrap();
        points[spike][2] = 400.0;

        let mut tile = tile_from(points);
        let report = correct_tile(&mut tile, &SpikeParams::default());

        assert_eq!(report.mode, Some(CorrectionMode::Tiled));
        assert!(report.spikes >= 1);

        let fixed = tile.objects[0].vertices[spike][2];
        assert!(fixed < 150.0, "spike left at {}", fixed);

        // Plateau vertices far from the step are untouched.
        let calm = tile.objects[0]
            .vertices
            .iter()
            .enumerate()
            .filter(|(i, v)| *i != spike && v[0] < -300.0)
            .all(|(_, v)| v[2] == 0.0);
        assert!(calm);
    }

    #[test]
    fn overlapping_windows_resolve_last_write_wins() {
        // A single sample inside two windows: a spike in the first, cleared in the second.
        let params = SpikeParams {
            domain_min: 0.0,
            domain_max: 20.0,
            window_step: 10.0,
            window_width: 10.0,
            tiled_sigma: 1.0,
            ..SpikeParams::default()
        };

        // x = 10 belongs to both column windows [0, 10] and [10, 20].
        let mut points = vec![[10.0, 5.0, 50.0]];
        for i in 0..9 {
            points.push([1.0 + i as f64 * 0.5, 5.0, 0.0]);
        }
        for i in 0..9 {
            points.push([11.0 + i as f64 * 0.5, 5.0, 50.0 + (i % 2) as f64]);
        }

        let mut samples = SampleSet::from_points(&points);
        samples.correct_tiled(&params);

        let shared = samples.samples()[0];
        assert_eq!(shared.status, SpikeStatus::NoSpike);
        assert_eq!(shared.corrected, 50.0);
    }

    #[test]
    fn empty_tile_reports_no_mode() {
        let mut tile = Tile::default();
        let report = correct_tile(&mut tile, &SpikeParams::default());
        assert_eq!(report.mode, None);
        assert_eq!(report.samples, 0);
    }

    #[test]
    fn zero_step_is_rejected() {
        let params = SpikeParams {
            window_step: 0.0,
            ..SpikeParams::default()
        };
        assert!(params.validate().is_err());
        assert!(params.window_origins().is_empty());
    }
}
