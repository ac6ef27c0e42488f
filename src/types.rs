//! Definition of basic scalar and configuration types.

use crate::constants::NCRIT;

pub type PointType = f64;
pub type KeyType = u64;

/// An axis-aligned bounding box: `origin` is the lower corner, `diameter` the
/// extent along each axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Domain {
    pub origin: [PointType; 3],
    pub diameter: [PointType; 3],
}

impl Domain {
    /// The smallest `Domain` containing every point in `points`.
    pub fn from_points(points: &[[PointType; 3]]) -> Self {
        let mut min = [PointType::INFINITY; 3];
        let mut max = [PointType::NEG_INFINITY; 3];

        for p in points {
            for i in 0..3 {
                min[i] = min[i].min(p[i]);
                max[i] = max[i].max(p[i]);
            }
        }

        let mut diameter = [0.0; 3];
        for i in 0..3 {
            diameter[i] = (max[i] - min[i]).max(PointType::EPSILON);
        }

        Domain {
            origin: min,
            diameter,
        }
    }
}

/// Runtime configuration threaded explicitly through the driver API, replacing the
/// original implementation's process-wide globals (`args`, singleton `TreeMPI`).
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum bodies per leaf before subdivision.
    pub ncrit: usize,
    /// Number of periodic image shells; `0` disables periodicity.
    pub images: u32,
    /// Periodic repeat length along each axis, only meaningful if `images > 0`.
    pub cycle: [PointType; 3],
    /// Maximum octree depth to traverse.
    pub num_levels: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ncrit: NCRIT,
            images: 0,
            cycle: [1.0, 1.0, 1.0],
            num_levels: 16,
        }
    }
}
