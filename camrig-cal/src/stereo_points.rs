//! Intersection of two ports' point sets at one sync index.

use itertools::Itertools;
use nalgebra::{Point2, Point3};

use camrig_types::{PointPacket, Port, StereoPointsPacket, SyncPacket};

/// Produces the matched point pairs every stereo stage consumes.
pub struct StereoPointsBuilder {
    pairs: Vec<(Port, Port)>,
}

impl StereoPointsBuilder {
    /// All unordered port pairs, lower port first.
    pub fn new(ports: &[Port]) -> Self {
        let pairs = ports
            .iter()
            .copied()
            .sorted()
            .combinations(2)
            .map(|pair| (pair[0], pair[1]))
            .collect();
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(Port, Port)] {
        &self.pairs
    }

    /// Match the common point ids of two packets, in ascending id order.
    /// Returns `None` when the intersection is empty.
    pub fn stereo_points_packet(
        &self,
        sync_index: u64,
        port_a: Port,
        points_a: &PointPacket,
        port_b: Port,
        points_b: &PointPacket,
    ) -> Option<StereoPointsPacket> {
        let mut common: Vec<(u32, usize, usize)> = points_a
            .point_ids
            .iter()
            .enumerate()
            .filter_map(|(ia, id)| points_b.position(*id).map(|ib| (*id, ia, ib)))
            .collect();
        common.sort_by_key(|(id, _, _)| *id);

        if common.is_empty() {
            return None;
        }

        let common_ids: Vec<u32> = common.iter().map(|(id, _, _)| *id).collect();
        let img_loc_a: Vec<Point2<f64>> =
            common.iter().map(|(_, ia, _)| points_a.img_loc[*ia]).collect();
        let img_loc_b: Vec<Point2<f64>> =
            common.iter().map(|(_, _, ib)| points_b.img_loc[*ib]).collect();
        let obj_loc: Option<Vec<Point3<f64>>> = points_a
            .obj_loc
            .as_ref()
            .map(|obj| common.iter().map(|(_, ia, _)| obj[*ia]).collect());

        Some(StereoPointsPacket {
            sync_index,
            port_a,
            port_b,
            common_ids,
            img_loc_a,
            img_loc_b,
            obj_loc,
        })
    }

    /// Apply to every port pair of a sync packet; pairs without common
    /// points (or with a dropped frame) are skipped.
    pub fn synched_stereo_points(&self, sync_packet: &SyncPacket) -> Vec<StereoPointsPacket> {
        let mut packets = Vec::new();
        for (port_a, port_b) in &self.pairs {
            let (Some(Some(fp_a)), Some(Some(fp_b))) = (
                sync_packet.frame_packets.get(port_a),
                sync_packet.frame_packets.get(port_b),
            ) else {
                continue;
            };
            let (Some(points_a), Some(points_b)) = (&fp_a.points, &fp_b.points) else {
                continue;
            };
            if let Some(packet) = self.stereo_points_packet(
                sync_packet.sync_index,
                *port_a,
                points_a,
                *port_b,
                points_b,
            ) {
                packets.push(packet);
            }
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(ids: &[u32]) -> PointPacket {
        let img = ids
            .iter()
            .map(|id| Point2::new(*id as f64 * 10.0, *id as f64 * 5.0))
            .collect();
        let obj = ids
            .iter()
            .map(|id| Point3::new(*id as f64 * 0.03, 0.0, 0.0))
            .collect();
        PointPacket::new(ids.to_vec(), img, Some(obj)).unwrap()
    }

    #[test]
    fn pairs_are_ordered_ascending() {
        let builder = StereoPointsBuilder::new(&[2, 0, 1]);
        assert_eq!(builder.pairs(), &[(0, 1), (0, 2), (1, 2)]);
    }

    #[test]
    fn intersection_aligns_all_arrays() {
        let builder = StereoPointsBuilder::new(&[0, 1]);
        let a = packet(&[5, 1, 9, 3]);
        let b = packet(&[3, 9, 7]);

        let sp = builder.stereo_points_packet(4, 0, &a, 1, &b).unwrap();
        assert_eq!(sp.common_ids, vec![3, 9]);
        assert_eq!(sp.img_loc_a[0], Point2::new(30.0, 15.0));
        assert_eq!(sp.img_loc_b[1], Point2::new(90.0, 45.0));
        let obj = sp.obj_loc.unwrap();
        assert_eq!(obj[0].x, 0.09);
        assert_eq!(sp.sync_index, 4);
    }

    #[test]
    fn empty_intersection_is_none() {
        let builder = StereoPointsBuilder::new(&[0, 1]);
        let a = packet(&[1, 2]);
        let b = packet(&[3, 4]);
        assert!(builder.stereo_points_packet(0, 0, &a, 1, &b).is_none());
    }
}
