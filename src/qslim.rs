use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use ahash::AHashMap;
use log::debug;

use crate::edge::{edge_key, Edge, EdgeKey};
use crate::geometry;
use crate::heap::EdgeHeap;
use crate::mesh::{FaceId, Mesh, VertexId};
use crate::partition::Aabb;
use crate::quadric::Quadric;
use crate::simplifier::{SimplifyOptions, Weighting};

// The pass-wide cost ceiling, stored as raw f64 bits. Written once per
// iteration before workers are dispatched, read by every worker's
// contraction loop.
static ERROR_LEVEL: AtomicU64 = AtomicU64::new(0);

/// Publish the cost ceiling for the coming pass. The store is
/// sequentially consistent so it lands before any worker is dispatched;
/// workers read it with acquire loads.
pub fn set_error_level(value: f64) {
    ERROR_LEVEL.store(value.to_bits(), Ordering::SeqCst);
}

/// The current pass's maximum acceptable contraction cost.
pub fn error_level() -> f64 {
    f64::from_bits(ERROR_LEVEL.load(Ordering::Acquire))
}

// Tests that exercise the contraction loop serialise on this so they do
// not fight over the process-wide threshold.
#[cfg(test)]
pub(crate) static ERROR_LEVEL_GUARD: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// A per-cluster simplification worker: collects quadrics over the
/// cluster's faces, builds the contraction heap and drains it until the
/// cheapest remaining collapse costs more than the pass threshold.
pub struct QSlim<'a> {
    mesh: &'a Mesh,
    keys: Vec<FaceId>,
    options: &'a SimplifyOptions,
    cluster_aabbs: Vec<Aabb>,
    iteration: u32,
    edges: AHashMap<EdgeKey, Edge>,
    heap: EdgeHeap,
}

impl<'a> QSlim<'a> {
    pub fn new(
        mesh: &'a Mesh,
        keys: Vec<FaceId>,
        options: &'a SimplifyOptions,
        iteration: u32,
    ) -> Self {
        QSlim {
            mesh,
            keys,
            options,
            cluster_aabbs: Vec::new(),
            iteration,
            edges: AHashMap::new(),
            heap: EdgeHeap::new(),
        }
    }

    pub fn set_cluster_aabbs(&mut self, aabbs: Vec<Aabb>) {
        self.cluster_aabbs = aabbs;
    }

    pub fn initialize(&mut self) {
        self.collect_quadrics();
        self.collect_edges();
        self.build_heap();
    }

    pub fn simplify(&mut self) {
        let start = Instant::now();
        let heap_size = self.heap.len();

        self.apply_contraction();

        if self.options.verbose {
            debug!(
                "worker {:>2} | iteration {} | heap size = {:>8} | time = {:.2}s",
                rayon::current_thread_index().unwrap_or(0),
                self.iteration,
                heap_size,
                start.elapsed().as_secs_f64()
            );
        }
    }

    /// Accumulate a quadric on every vertex of the cluster: each face
    /// contributes its own quadric (optionally scaled by area) to its
    /// three corners. Faces whose quadric degenerates to a non-finite
    /// constant term are skipped.
    fn collect_quadrics(&mut self) {
        let mesh = self.mesh;
        let dim = self.options.quadric.dim();

        for &fid in &self.keys {
            let face = match mesh.face(fid) {
                Some(face) => face,
                None => continue,
            };
            let index = face.data().index;
            let (Some(p), Some(q), Some(r)) = (
                mesh.position(index[0]),
                mesh.position(index[1]),
                mesh.position(index[2]),
            ) else {
                continue;
            };

            face.data().normal = geometry::compute_normal(&p, &q, &r);

            // vertex normals feed the attribute space, keep them unit
            // length
            for vid in index {
                if let Some(vertex) = mesh.vertex(vid) {
                    let mut data = vertex.data();
                    data.normal = data.normal.normalize();
                }
            }

            let attrs: Vec<_> = index
                .iter()
                .filter_map(|&vid| mesh.vertex(vid).map(|v| v.data().attributes()))
                .collect();
            if attrs.len() != 3 {
                continue;
            }

            let mut quadric = geometry::face_quadric(dim, &attrs[0], &attrs[1], &attrs[2]);
            if !quadric.c.is_finite() {
                continue;
            }

            if self.options.weighting == Weighting::Area {
                quadric.multiply(geometry::compute_area(&p, &q, &r));
            }

            for vid in index {
                if let Some(vertex) = mesh.vertex(vid) {
                    vertex.data().add_quadric(&quadric);
                }
            }
        }
    }

    /// Build the cluster's edge map. Border edges additionally push a
    /// penalty plane into both endpoint quadrics when running the plain
    /// positional metric.
    fn collect_edges(&mut self) {
        let mesh = self.mesh;
        let dim = self.options.quadric.dim();

        for mut edge in mesh.create_edges(&self.keys) {
            if mesh.is_border_edge(&edge) && dim == 3 {
                if let Some(penalty) = geometry::border_penalty(mesh, &edge) {
                    for vid in [edge.v, edge.u] {
                        if let Some(vertex) = mesh.vertex(vid) {
                            vertex.data().add_quadric(&penalty);
                        }
                    }
                }
            }

            let mut quadric = Quadric::zeros(dim);
            for vid in [edge.v, edge.u] {
                if let Some(vertex) = mesh.vertex(vid) {
                    if let Some(q) = &vertex.data().quadric {
                        quadric.add(q);
                    }
                }
            }
            edge.quadric = Some(quadric);
            self.edges.insert(edge.key(), edge);
        }
    }

    fn build_heap(&mut self) {
        let mut keys: Vec<EdgeKey> = self.edges.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            self.update_heap_entry(&key);
        }
    }

    /// Recompute an edge's optimum and (re)insert it into the heap.
    fn update_heap_entry(&mut self, key: &EdgeKey) {
        let mesh = self.mesh;
        let edge = match self.edges.get_mut(key) {
            Some(edge) => edge,
            None => return,
        };
        if !mesh.is_valid_edge(edge) {
            return;
        }

        let attrs_v = match mesh.vertex(edge.v) {
            Some(v) => v.data().attributes(),
            None => return,
        };
        let attrs_u = match mesh.vertex(edge.u) {
            Some(u) => u.data().attributes(),
            None => return,
        };
        edge.compute_optimum(&attrs_v, &attrs_u);

        if edge.in_heap {
            self.heap.erase(key);
        }
        self.heap.push(*key, edge.cost);
        edge.in_heap = true;
    }

    /// Drain the heap cheapest-first. Popped edges that went invalid,
    /// straddle a cluster boundary, flip a neighbour or lose the lock
    /// race are skipped without retry; the first edge above the pass
    /// threshold ends the worker.
    fn apply_contraction(&mut self) {
        while let Some((key, _)) = self.heap.pop() {
            let mut edge = match self.edges.remove(&key) {
                Some(edge) => edge,
                None => continue,
            };
            edge.in_heap = false;

            if !self.mesh.is_valid_edge(&edge) {
                continue;
            }
            if !self.mesh.same_cluster(&edge) {
                continue;
            }
            if edge.cost > error_level() {
                break;
            }

            self.contract(&edge);
        }
    }

    fn contract(&mut self, edge: &Edge) {
        if geometry::flipped(self.mesh, edge) {
            return;
        }
        if !geometry::moved_to_target(self.mesh, edge) {
            return;
        }
        self.update_edge(edge);
    }

    /// After a collapse onto `edge.v`, every surviving edge incident to
    /// it carries a stale quadric: rebuild it from the current endpoint
    /// quadrics, re-queue the edge and re-home its endpoints into their
    /// cells.
    fn update_edge(&mut self, edge: &Edge) {
        let mesh = self.mesh;
        let default_dim = self.options.quadric.dim();
        for key in self.edges_for_vertex(edge.v) {
            if let Some(neighbour) = self.edges.get_mut(&key) {
                let dim = match &neighbour.quadric {
                    Some(q) => q.dim(),
                    None => default_dim,
                };
                let mut quadric = Quadric::zeros(dim);
                for vid in [neighbour.v, neighbour.u] {
                    if let Some(vertex) = mesh.vertex(vid) {
                        if let Some(q) = &vertex.data().quadric {
                            quadric.add(q);
                        }
                    }
                }
                neighbour.quadric = Some(quadric);
            }

            self.update_heap_entry(&key);

            if let Some(neighbour) = self.edges.get(&key) {
                geometry::move_to_cluster(mesh, neighbour, &self.cluster_aabbs);
            }
        }
    }

    /// Keys of the still-valid edges in this cluster's map incident to a
    /// vertex.
    fn edges_for_vertex(&self, id: VertexId) -> Vec<EdgeKey> {
        let mesh = self.mesh;
        if !mesh.is_valid_vertex(id) {
            return Vec::new();
        }

        let mut keys: BTreeSet<EdgeKey> = BTreeSet::new();
        for fid in mesh.faces_for_vertex(id) {
            if let Some(face) = mesh.face(fid) {
                for (a, b) in face.data().edge_pairs() {
                    keys.insert(edge_key(a, b));
                }
            }
        }

        keys.into_iter()
            .filter(|key| {
                self.edges
                    .get(key)
                    .map(|edge| mesh.is_valid_edge(edge))
                    .unwrap_or(false)
            })
            .collect()
    }
}
