//! Geometry of the charuco calibration target.
//!
//! A board is a `columns` x `rows` checkerboard with fiducial markers in the
//! light squares. The trackable landmarks are the interior chessboard
//! corners; their positions in the board frame of reference are the ground
//! truth every calibration stage leans on. All lengths are meters.

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// Immutable description of a printed charuco board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardSpec {
    columns: u32,
    rows: u32,
    /// Edge length of one checkerboard square, meters.
    square_edge_length: f64,
    /// Fiducial dictionary identifier, e.g. `DICT_4X4_50`.
    dictionary: String,
    /// Marker edge length as a fraction of the square edge.
    aruco_scale: f64,
    /// True when the printed board is white-on-black.
    inverted: bool,
}

impl BoardSpec {
    pub fn new(
        columns: u32,
        rows: u32,
        square_edge_length: f64,
        dictionary: impl Into<String>,
        aruco_scale: f64,
        inverted: bool,
    ) -> Self {
        assert!(columns >= 2 && rows >= 2, "board needs at least 2x2 squares");
        Self {
            columns,
            rows,
            square_edge_length,
            dictionary: dictionary.into(),
            aruco_scale,
            inverted,
        }
    }

    #[inline]
    pub fn columns(&self) -> u32 {
        self.columns
    }

    #[inline]
    pub fn rows(&self) -> u32 {
        self.rows
    }

    #[inline]
    pub fn square_edge_length(&self) -> f64 {
        self.square_edge_length
    }

    #[inline]
    pub fn dictionary(&self) -> &str {
        &self.dictionary
    }

    #[inline]
    pub fn aruco_scale(&self) -> f64 {
        self.aruco_scale
    }

    #[inline]
    pub fn inverted(&self) -> bool {
        self.inverted
    }

    /// Number of interior chessboard corners.
    #[inline]
    pub fn corner_count(&self) -> u32 {
        (self.columns - 1) * (self.rows - 1)
    }

    /// Board-frame position of an interior corner.
    ///
    /// Ids run in raster order over the interior grid: id `r*(columns-1)+c`
    /// sits at `((c+1)*s, (r+1)*s, 0)`. z is zero for every id; the board is
    /// planar by definition.
    pub fn object_corner(&self, id: u32) -> Option<Point3<f64>> {
        if id >= self.corner_count() {
            return None;
        }
        let per_row = self.columns - 1;
        let r = id / per_row;
        let c = id % per_row;
        let s = self.square_edge_length;
        Some(Point3::new((c + 1) as f64 * s, (r + 1) as f64 * s, 0.0))
    }

    /// Board-frame positions for a list of corner ids. Unknown ids are
    /// silently skipped, so the output may be shorter than the input.
    pub fn object_corners(&self, ids: &[u32]) -> Vec<Point3<f64>> {
        ids.iter().filter_map(|id| self.object_corner(*id)).collect()
    }

    /// Ground-truth distance between two corners on the board.
    pub fn corner_distance(&self, id_a: u32, id_b: u32) -> Option<f64> {
        let a = self.object_corner(id_a)?;
        let b = self.object_corner(id_b)?;
        Some((a - b).norm())
    }

    /// Pairs of corner ids lying on a shared board row or column.
    ///
    /// Used only for overlay rendering; calibration never consumes this. The
    /// pairs join every two corners on a line, not just adjacent neighbours,
    /// and are normalized so `id_a < id_b`.
    pub fn connected_corners(&self) -> Vec<(u32, u32)> {
        let per_row = self.columns - 1;
        let per_col = self.rows - 1;
        let mut pairs = Vec::new();

        for r in 0..per_col {
            for c0 in 0..per_row {
                for c1 in (c0 + 1)..per_row {
                    pairs.push((r * per_row + c0, r * per_row + c1));
                }
            }
        }
        for c in 0..per_row {
            for r0 in 0..per_col {
                for r1 in (r0 + 1)..per_col {
                    pairs.push((r0 * per_row + c, r1 * per_row + c));
                }
            }
        }
        pairs
    }

    /// Number of fiducial markers on the board (one per light square).
    pub fn marker_count(&self) -> u32 {
        let mut count = 0;
        for y in 0..self.rows {
            for x in 0..self.columns {
                if (x + y) % 2 == 1 {
                    count += 1;
                }
            }
        }
        count
    }

    /// Board-frame corner quad of a fiducial marker, in (tl, tr, br, bl)
    /// order.
    ///
    /// Markers occupy the light squares in raster order; each is centered in
    /// its square with edge `square_edge_length * aruco_scale`.
    pub fn marker_corners(&self, marker_id: u32) -> Option<[Point2<f64>; 4]> {
        let mut index = 0;
        for y in 0..self.rows {
            for x in 0..self.columns {
                if (x + y) % 2 != 1 {
                    continue;
                }
                if index == marker_id {
                    let s = self.square_edge_length;
                    let m = s * self.aruco_scale;
                    let margin = (s - m) / 2.0;
                    let x0 = x as f64 * s + margin;
                    let y0 = y as f64 * s + margin;
                    return Some([
                        Point2::new(x0, y0),
                        Point2::new(x0 + m, y0),
                        Point2::new(x0 + m, y0 + m),
                        Point2::new(x0, y0 + m),
                    ]);
                }
                index += 1;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn demo_board() -> BoardSpec {
        // 4x5 squares, 3 cm edge
        BoardSpec::new(4, 5, 0.03, "DICT_4X4_50", 0.75, false)
    }

    #[test]
    fn corner_grid_layout() {
        let board = demo_board();
        assert_eq!(board.corner_count(), 12);

        // id 0 is the first interior corner, one square in from the origin
        let c0 = board.object_corner(0).unwrap();
        assert_relative_eq!(c0.x, 0.03, epsilon = 1e-12);
        assert_relative_eq!(c0.y, 0.03, epsilon = 1e-12);
        assert_eq!(c0.z, 0.0);

        // raster order: id 3 starts the second interior row
        let c3 = board.object_corner(3).unwrap();
        assert_relative_eq!(c3.x, 0.03, epsilon = 1e-12);
        assert_relative_eq!(c3.y, 0.06, epsilon = 1e-12);

        assert!(board.object_corner(12).is_none());

        for id in 0..board.corner_count() {
            assert_eq!(board.object_corner(id).unwrap().z, 0.0);
        }
    }

    #[test]
    fn neighbouring_corner_distance_is_square_edge() {
        let board = demo_board();
        assert_relative_eq!(board.corner_distance(0, 1).unwrap(), 0.03, epsilon = 1e-12);
        assert_relative_eq!(board.corner_distance(0, 3).unwrap(), 0.03, epsilon = 1e-12);
        // diagonal
        assert_relative_eq!(
            board.corner_distance(0, 4).unwrap(),
            0.03 * 2.0_f64.sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn connected_corners_join_full_lines() {
        let board = demo_board();
        let pairs = board.connected_corners();
        // 3x4 interior grid: 4 rows of C(3,2) pairs + 3 columns of C(4,2).
        assert_eq!(pairs.len(), 4 * 3 + 3 * 6);
        for (a, b) in &pairs {
            assert!(a < b);
            let pa = board.object_corner(*a).unwrap();
            let pb = board.object_corner(*b).unwrap();
            assert!(pa.x == pb.x || pa.y == pb.y);
        }
    }

    #[test]
    fn marker_layout() {
        let board = demo_board();
        // 4x5 board: 10 light squares.
        assert_eq!(board.marker_count(), 10);

        let quad = board.marker_corners(0).unwrap();
        // first light square is (1, 0); marker inset by (s - m)/2
        let s = 0.03;
        let m = s * 0.75;
        let margin = (s - m) / 2.0;
        assert_relative_eq!(quad[0].x, s + margin, epsilon = 1e-12);
        assert_relative_eq!(quad[0].y, margin, epsilon = 1e-12);
        assert_relative_eq!((quad[1] - quad[0]).norm(), m, epsilon = 1e-12);

        assert!(board.marker_corners(10).is_none());
    }
}
