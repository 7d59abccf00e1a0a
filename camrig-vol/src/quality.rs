//! Residual-based quality control of an optimized capture volume.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use camrig_board::BoardSpec;
use camrig_bundle_adj::OptimizeSummary;
use camrig_types::Port;

use crate::{CaptureVolume, Result};

/// One observation with its reprojection quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationQuality {
    pub camera: Port,
    pub sync_index: u64,
    pub point_id: u32,
    pub obj_index: usize,
    /// Euclidean reprojection residual, pixels.
    pub reproj_error: f64,
    /// Fraction of observations with a strictly smaller residual, in
    /// `[0, 1)`.
    pub percentile: f64,
}

/// Deviation of one triangulated corner pair from the board's known
/// geometry. The primary ground-truth quality metric: unlike reprojection
/// error it cannot be flattered by overfitting the cameras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistanceError {
    pub sync_index: u64,
    pub corner_a: u32,
    pub corner_b: u32,
    pub world_distance: f64,
    pub board_distance: f64,
    /// `world_distance - board_distance`, meters.
    pub error: f64,
}

/// Computes per-observation quality, filters outliers and drives
/// re-optimization.
pub struct QualityController;

impl QualityController {
    /// Per-observation residual magnitude and percentile rank.
    pub fn observation_quality(volume: &CaptureVolume) -> Result<Vec<ObservationQuality>> {
        let errors = volume.xy_reprojection_errors()?;
        let n = errors.len();

        // percentile by rank: position in the sorted error order over n
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|a, b| errors[*a].total_cmp(&errors[*b]));
        let mut percentile = vec![0.0; n];
        for (rank, i) in order.iter().enumerate() {
            percentile[*i] = rank as f64 / n as f64;
        }

        let pe = &volume.point_estimates;
        Ok((0..n)
            .map(|i| ObservationQuality {
                camera: pe.camera_indices[i],
                sync_index: pe.sync_indices[i],
                point_id: pe.point_ids[i],
                obj_index: pe.obj_indices[i],
                reproj_error: errors[i],
                percentile: percentile[i],
            })
            .collect())
    }

    /// Retain observations below the `cutoff` residual percentile
    /// (`0 < cutoff <= 1`), dropping 3D points left under-observed, and
    /// re-run bundle adjustment on the survivors.
    ///
    /// Filtering at a cutoff never raises the surviving set's RMSE: the
    /// removed observations are exactly the largest residuals, and the
    /// subsequent adjustment only improves from there.
    pub fn filter_by_percentile(
        volume: &mut CaptureVolume,
        cutoff: f64,
    ) -> Result<OptimizeSummary> {
        let quality = Self::observation_quality(volume)?;
        let keep: Vec<bool> = quality.iter().map(|q| q.percentile < cutoff).collect();
        let kept = keep.iter().filter(|k| **k).count();
        tracing::info!(
            cutoff,
            kept,
            total = keep.len(),
            "filtering observations by residual percentile"
        );

        volume.point_estimates.retain_observations(&keep);
        volume.point_estimates.validate()?;
        let summary = volume.optimize()?;
        Ok(summary)
    }

    /// Distances between every pair of board corners triangulated at the
    /// same sync index, compared against the board's known geometry.
    pub fn distance_errors(
        volume: &CaptureVolume,
        board: &BoardSpec,
    ) -> Result<Vec<DistanceError>> {
        let pe = &volume.point_estimates;

        // unique 3D points per sync index
        let mut by_sync: std::collections::BTreeMap<u64, Vec<usize>> = Default::default();
        for i in 0..pe.n_observations() {
            let entry = by_sync.entry(pe.sync_indices[i]).or_default();
            if !entry.contains(&pe.obj_indices[i]) {
                entry.push(pe.obj_indices[i]);
            }
        }

        let mut out = Vec::new();
        for (sync_index, obj_indices) in &by_sync {
            for pair in obj_indices.iter().sorted().combinations(2) {
                let (a, b) = (*pair[0], *pair[1]);
                let (id_a, id_b) = (pe.obj_point_ids[a], pe.obj_point_ids[b]);
                let Some(board_distance) = board.corner_distance(id_a, id_b) else {
                    continue;
                };
                let world_distance = (pe.obj[a] - pe.obj[b]).norm();
                out.push(DistanceError {
                    sync_index: *sync_index,
                    corner_a: id_a,
                    corner_b: id_b,
                    world_distance,
                    board_distance,
                    error: world_distance - board_distance,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_support::{moving_points, observation_rows, test_array};
    use crate::{build_point_estimates, CaptureVolume};
    use rand::{Rng, SeedableRng};

    fn noisy_volume() -> CaptureVolume {
        let array = test_array(3);
        let landmarks = moving_points(6);
        let mut rows = observation_rows(&array, &landmarks);

        // contaminate a minority of detections with pixel noise
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for row in rows.iter_mut() {
            if rng.random_range(0.0..1.0) < 0.2 {
                row.img_loc_x += rng.random_range(-3.0..3.0);
                row.img_loc_y += rng.random_range(-3.0..3.0);
            }
        }

        let estimates = build_point_estimates(&array, &rows).unwrap();
        let mut volume = CaptureVolume::new(array, estimates);
        volume.optimize().unwrap();
        volume
    }

    #[test]
    fn percentiles_rank_residuals() {
        let volume = noisy_volume();
        let quality = QualityController::observation_quality(&volume).unwrap();

        let max = quality
            .iter()
            .max_by(|a, b| a.reproj_error.total_cmp(&b.reproj_error))
            .unwrap();
        let min = quality
            .iter()
            .min_by(|a, b| a.reproj_error.total_cmp(&b.reproj_error))
            .unwrap();
        assert!(max.percentile > min.percentile);
        assert_eq!(min.percentile, 0.0);
        assert!(max.percentile >= 1.0 - 1.0 / quality.len() as f64 - 1e-12);
    }

    /// Filter at the median: the surviving count lands between 40% and 50%
    /// of the original (pruning under-observed points can push it below
    /// half), and re-optimization cannot worsen the RMSE.
    #[test]
    fn median_filter_and_reoptimize_improves_rmse() {
        let mut volume = noisy_volume();
        let before_count = volume.point_estimates.n_observations();
        let before_rmse = volume.rmse().unwrap();

        let summary = QualityController::filter_by_percentile(&mut volume, 0.5).unwrap();

        let after_count = volume.point_estimates.n_observations();
        let fraction = after_count as f64 / before_count as f64;
        assert!(
            (0.40..=0.52).contains(&fraction),
            "surviving fraction {fraction}"
        );
        assert!(summary.final_rmse <= before_rmse);
        volume.point_estimates.validate().unwrap();
    }

    #[test]
    fn distance_errors_match_board_on_clean_data() {
        let array = test_array(3);
        let landmarks = moving_points(2);
        let rows = observation_rows(&array, &landmarks);
        let estimates = build_point_estimates(&array, &rows).unwrap();
        let volume = CaptureVolume::new(array, estimates);

        // the synthetic landmark grid matches a 5x4 board with 8 cm squares
        let board = BoardSpec::new(5, 4, 0.08, "DICT_4X4_50", 0.75, false);
        let errors = QualityController::distance_errors(&volume, &board).unwrap();
        assert!(!errors.is_empty());
        for e in &errors {
            assert!(
                e.error.abs() < 5e-4,
                "corner pair ({}, {}) off by {} m",
                e.corner_a,
                e.corner_b,
                e.error
            );
        }
    }
}
