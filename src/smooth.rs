use std::collections::BTreeSet;

use ahash::AHashMap;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use crate::mesh::{Mesh, VertexId};

// Taubin's inflate/deflate pair: a positive Laplacian step followed by a
// slightly larger negative one cancels the shrinkage plain smoothing
// causes.
const LAMBDA: f64 = 0.5;
const MU: f64 = -0.67;

/// Uniform-weight Taubin smoothing. Each pass moves every interior
/// vertex towards the centroid of its neighbours and then back out
/// again; border vertices are pinned so the boundary keeps its shape.
pub fn taubin_smooth(mesh: &mut Mesh, passes: u32) {
    mesh.update_borders();

    // neighbour sets from face connectivity; the topology does not
    // change while smoothing
    let mut neighbours: AHashMap<VertexId, BTreeSet<VertexId>> = AHashMap::new();
    for face in mesh.faces().values() {
        let data = face.data();
        if data.invalid {
            continue;
        }
        for (a, b) in data.edge_pairs() {
            neighbours.entry(a).or_default().insert(b);
            neighbours.entry(b).or_default().insert(a);
        }
    }

    let ids: Vec<VertexId> = mesh.vertices().keys().copied().collect();

    for _ in 0..passes {
        // gather phase: new positions from a snapshot, so the result
        // does not depend on vertex order
        let positions: AHashMap<VertexId, Point3<f64>> = ids
            .iter()
            .filter_map(|&id| mesh.position(id).map(|p| (id, p)))
            .collect();

        let moved: Vec<(VertexId, Point3<f64>)> = ids
            .par_iter()
            .filter_map(|&id| {
                let p = *positions.get(&id)?;
                let around = neighbours.get(&id)?;

                let mut cog = Vector3::zeros();
                let mut valence = 0.0;
                for other in around {
                    if let Some(q) = positions.get(other) {
                        cog += q.coords;
                        valence += 1.0;
                    }
                }
                if valence == 0.0 {
                    return None;
                }
                let cog = cog / valence;

                // both steps use the same centroid
                let inflated = p + (cog - p.coords) * LAMBDA;
                let settled = inflated + (cog - inflated.coords) * MU;
                Some((id, settled))
            })
            .collect();

        for (id, position) in &moved {
            if let Some(vertex) = mesh.vertex(*id) {
                let mut data = vertex.data();
                if data.on_border {
                    continue;
                }
                data.position = *position;
            }
        }
        for (_, position) in &moved {
            mesh.update_aabb(position);
        }
    }
}
