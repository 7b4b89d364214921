use itertools::iproduct;
use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::mesh::Mesh;

/// Axis-aligned bounding box, also used as a cluster cell. Starts
/// inverted so any point expands it.
#[derive(Debug, Clone)]
pub struct Aabb {
    pub id: i32,
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Default for Aabb {
    fn default() -> Self {
        Aabb {
            id: -1,
            min: Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            max: Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }
}

impl Aabb {
    /// Componentwise containment, boundaries included.
    pub fn inside(&self, point: &Point3<f64>) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Grow to contain `point`.
    pub fn expand(&mut self, point: &Point3<f64>) {
        self.min = self.min.inf(point);
        self.max = self.max.sup(point);
    }
}

/// A spatial cluster: its cell, a debug colour and the element ids it
/// owns (vertex ids after partitioning, face ids after voting).
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: i32,
    pub aabb: Aabb,
    pub color: Vector3<f64>,
    pub elements: Vec<u32>,
}

/// Tile the mesh bounding box into `factor^3` cells and assign every
/// vertex to the first cell that contains it, so points on a shared
/// boundary land deterministically in the lower-index cell. The cluster
/// id is written back onto each vertex.
pub fn partition_grid(factor: u32, mesh: &Mesh) -> Vec<Cluster> {
    let bounds = mesh.aabb();
    let step = (bounds.max - bounds.min).abs() / factor as f64;

    let mut clusters: Vec<Cluster> = iproduct!(0..factor, 0..factor, 0..factor)
        .enumerate()
        .map(|(id, (x, y, z))| {
            let min = Point3::new(
                bounds.min.x + x as f64 * step.x,
                bounds.min.y + y as f64 * step.y,
                bounds.min.z + z as f64 * step.z,
            );
            let aabb = Aabb {
                id: id as i32,
                min,
                max: min + step,
            };
            // colours only matter for debugging, but keep them stable
            // between runs by seeding from the cell id
            let mut rng = StdRng::seed_from_u64(id as u64);
            Cluster {
                id: id as i32,
                aabb,
                color: Vector3::new(rng.gen(), rng.gen(), rng.gen()),
                elements: Vec::new(),
            }
        })
        .collect();

    for (&id, vertex) in mesh.vertices() {
        let position = vertex.data().position;
        if let Some(cluster) = clusters.iter_mut().find(|c| c.aabb.inside(&position)) {
            cluster.elements.push(id);
            vertex.data().cluster_id = cluster.id;
        }
    }

    clusters
}
