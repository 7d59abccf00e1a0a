use std::collections::BTreeMap;

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use camrig_types::Port;

use crate::{Result, VolError};

/// Flat, indexed observation structure feeding bundle adjustment.
///
/// Rows `0..m` over the parallel observation arrays; `0..n` over the unique
/// 3D points, one per observed `(sync_index, point_id)` pair. `img` holds
/// *undistorted* pixel coordinates. Invariants (checked by
/// [`Self::validate`]):
///
/// - all observation arrays share length `m`, both point arrays length `n`;
/// - `point_ids[i] == obj_point_ids[obj_indices[i]]` for every `i`;
/// - every 3D point is referenced by at least two observations (a point
///   seen once is unobservable and must be pruned before optimization).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointEstimates {
    pub sync_indices: Vec<u64>,
    pub camera_indices: Vec<Port>,
    pub point_ids: Vec<u32>,
    pub img: Vec<Point2<f64>>,
    pub obj_indices: Vec<usize>,
    pub obj: Vec<Point3<f64>>,
    pub obj_point_ids: Vec<u32>,
}

impl PointEstimates {
    pub fn n_observations(&self) -> usize {
        self.img.len()
    }

    pub fn n_points(&self) -> usize {
        self.obj.len()
    }

    pub fn n_cameras(&self) -> usize {
        let mut ports: Vec<Port> = self.camera_indices.clone();
        ports.sort_unstable();
        ports.dedup();
        ports.len()
    }

    pub fn validate(&self) -> Result<()> {
        let m = self.img.len();
        if self.sync_indices.len() != m
            || self.camera_indices.len() != m
            || self.point_ids.len() != m
            || self.obj_indices.len() != m
        {
            return Err(VolError::Inconsistent("observation array lengths differ"));
        }
        if self.obj.len() != self.obj_point_ids.len() {
            return Err(VolError::Inconsistent("3D point array lengths differ"));
        }
        let mut ref_counts = vec![0usize; self.obj.len()];
        for (i, oi) in self.obj_indices.iter().enumerate() {
            if *oi >= self.obj.len() {
                return Err(VolError::Inconsistent("object index out of range"));
            }
            if self.obj_point_ids[*oi] != self.point_ids[i] {
                return Err(VolError::Inconsistent(
                    "observation point id disagrees with its 3D point",
                ));
            }
            ref_counts[*oi] += 1;
        }
        if ref_counts.iter().any(|c| *c < 2) {
            return Err(VolError::Inconsistent(
                "3D point with fewer than two observations",
            ));
        }
        Ok(())
    }

    /// Keep only the observations flagged in `keep`, then drop 3D points
    /// left with fewer than two observations and rebuild `obj_indices`
    /// contiguously.
    pub fn retain_observations(&mut self, keep: &[bool]) {
        assert_eq!(keep.len(), self.n_observations());
        macro_rules! retain {
            ($field:ident) => {{
                let mut flags = keep.iter();
                self.$field.retain(|_| *flags.next().expect("sized"));
            }};
        }
        retain!(sync_indices);
        retain!(camera_indices);
        retain!(point_ids);
        retain!(img);
        retain!(obj_indices);

        self.prune_underobserved();
    }

    /// Drop 3D points referenced by fewer than two observations (and the
    /// orphaned observations with them), re-indexing `obj_indices` to stay
    /// contiguous.
    pub fn prune_underobserved(&mut self) {
        loop {
            let mut ref_counts = vec![0usize; self.obj.len()];
            for oi in &self.obj_indices {
                ref_counts[*oi] += 1;
            }
            if ref_counts.iter().all(|c| *c >= 2) {
                return;
            }

            // map old object indices to new, skipping the under-observed
            let mut remap: BTreeMap<usize, usize> = BTreeMap::new();
            let mut new_obj = Vec::new();
            let mut new_obj_point_ids = Vec::new();
            for (old, count) in ref_counts.iter().enumerate() {
                if *count >= 2 {
                    remap.insert(old, new_obj.len());
                    new_obj.push(self.obj[old]);
                    new_obj_point_ids.push(self.obj_point_ids[old]);
                }
            }

            let keep: Vec<bool> = self
                .obj_indices
                .iter()
                .map(|oi| remap.contains_key(oi))
                .collect();
            let mut flags = keep.iter();
            self.sync_indices.retain(|_| *flags.next().expect("sized"));
            let mut flags = keep.iter();
            self.camera_indices.retain(|_| *flags.next().expect("sized"));
            let mut flags = keep.iter();
            self.point_ids.retain(|_| *flags.next().expect("sized"));
            let mut flags = keep.iter();
            self.img.retain(|_| *flags.next().expect("sized"));

            let mut new_obj_indices = Vec::with_capacity(self.obj_indices.len());
            for (oi, kept) in self.obj_indices.iter().zip(keep.iter()) {
                if *kept {
                    new_obj_indices.push(remap[oi]);
                }
            }
            self.obj_indices = new_obj_indices;
            self.obj = new_obj;
            self.obj_point_ids = new_obj_point_ids;
            // dropping observations can push other points under the
            // threshold, so iterate to a fixed point
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PointEstimates {
        // two 3D points: point 0 seen 3x, point 1 seen 2x
        PointEstimates {
            sync_indices: vec![0, 0, 0, 1, 1],
            camera_indices: vec![0, 1, 2, 0, 1],
            point_ids: vec![7, 7, 7, 9, 9],
            img: vec![Point2::new(0.0, 0.0); 5],
            obj_indices: vec![0, 0, 0, 1, 1],
            obj: vec![Point3::new(0.0, 0.0, 1.0), Point3::new(0.1, 0.0, 1.0)],
            obj_point_ids: vec![7, 9],
        }
    }

    #[test]
    fn validates_consistent_estimates() {
        sample().validate().unwrap();
    }

    #[test]
    fn catches_point_id_mismatch() {
        let mut pe = sample();
        pe.point_ids[0] = 8;
        assert!(pe.validate().is_err());
    }

    #[test]
    fn pruning_drops_singletons_and_reindexes() {
        let mut pe = sample();
        // orphan point 1 down to a single observation
        pe.retain_observations(&[true, true, true, true, false]);

        assert_eq!(pe.n_points(), 1);
        assert_eq!(pe.obj_point_ids, vec![7]);
        assert_eq!(pe.obj_indices, vec![0, 0, 0]);
        assert_eq!(pe.n_observations(), 3);
        pe.validate().unwrap();
    }

    #[test]
    fn pruning_cascades() {
        // point 0 seen twice, point 1 twice; dropping one observation of
        // point 0 leaves it single, pruning it entirely
        let mut pe = PointEstimates {
            sync_indices: vec![0, 0, 1, 1],
            camera_indices: vec![0, 1, 0, 1],
            point_ids: vec![7, 7, 9, 9],
            img: vec![Point2::new(0.0, 0.0); 4],
            obj_indices: vec![0, 0, 1, 1],
            obj: vec![Point3::new(0.0, 0.0, 1.0), Point3::new(0.1, 0.0, 1.0)],
            obj_point_ids: vec![7, 9],
        };
        pe.retain_observations(&[true, false, true, true]);
        assert_eq!(pe.n_points(), 1);
        assert_eq!(pe.obj_point_ids, vec![9]);
        pe.validate().unwrap();
    }
}
