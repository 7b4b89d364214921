use std::collections::BTreeSet;
use std::time::Instant;

use anyhow::{Context, Result};
use log::info;
use rayon::prelude::*;

use crate::mesh::{FaceId, Mesh};
use crate::partition::{partition_grid, Aabb, Cluster};
use crate::qslim::{self, QSlim};
use crate::quadric::QuadricKind;

/// How a face's quadric is weighted before accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weighting {
    None,
    Area,
}

impl Weighting {
    /// Parse the numeric selector used on the command line.
    pub fn from_flag(flag: u32) -> Option<Self> {
        match flag {
            0 => Some(Weighting::None),
            1 => Some(Weighting::Area),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimplifyOptions {
    /// Worker threads in the pool.
    pub threads: usize,
    /// Partition factor: the grid is `clusters^3` cells.
    pub clusters: u32,
    /// Maximum outer iterations.
    pub max_iter: u32,
    /// Target remaining-vertex percentage; 0 disables the target and the
    /// loop runs exactly `max_iter` passes.
    pub reduction: u32,
    /// Exponent of the error-threshold growth curve, 1.0 to 10.0.
    pub aggressiveness: f64,
    pub weighting: Weighting,
    pub quadric: QuadricKind,
    pub verbose: bool,
}

impl Default for SimplifyOptions {
    fn default() -> Self {
        SimplifyOptions {
            threads: 4,
            clusters: 2,
            max_iter: 10,
            reduction: 0,
            aggressiveness: 7.0,
            weighting: Weighting::None,
            quadric: QuadricKind::Position,
            verbose: false,
        }
    }
}

/// The cost ceiling for a pass grows polynomially with the iteration
/// number; higher aggressiveness lets later passes collapse much more.
fn threshold_for(iteration: u32, aggressiveness: f64) -> f64 {
    1e-9 * f64::from(iteration + 3).powf(aggressiveness)
}

/// A face joins a cluster when at least two of its three vertices were
/// assigned to it.
fn vote(mesh: &Mesh, fid: FaceId, cluster_id: i32) -> bool {
    let face = match mesh.face(fid) {
        Some(face) => face,
        None => return false,
    };
    let index = face.data().index;
    index
        .iter()
        .filter(|&&vid| {
            mesh.vertex(vid)
                .map(|v| v.data().cluster_id == cluster_id)
                .unwrap_or(false)
        })
        .count()
        >= 2
}

/// Turn a vertex cluster into a face cluster by majority vote, marking
/// the claimed faces.
fn vote_cluster(mesh: &Mesh, cluster: &Cluster) -> Cluster {
    let mut keys: BTreeSet<FaceId> = BTreeSet::new();
    for &vid in &cluster.elements {
        for fid in mesh.faces_for_vertex(vid) {
            if keys.contains(&fid) {
                continue;
            }
            if vote(mesh, fid, cluster.id) {
                keys.insert(fid);
                if let Some(face) = mesh.face(fid) {
                    face.data().clustered = true;
                }
            }
        }
    }
    Cluster {
        id: cluster.id,
        aabb: cluster.aabb.clone(),
        color: cluster.color,
        elements: keys.into_iter().collect(),
    }
}

/// The outer simplification loop: partition, vote faces into clusters,
/// run one QSlim worker per occupied cluster on the pool, join, compact
/// the mesh and adapt the error threshold. With a reduction target the
/// iteration budget stretches up to twice `max_iter`; the final pass is
/// followed by a single reindex for the writer.
pub fn simplify(mesh: &mut Mesh, options: &SimplifyOptions) -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.threads)
        .build()
        .context("building the worker pool")?;

    let input_vertices = mesh.vertex_count() as f64;
    let mut budget = options.max_iter;
    let mut iteration = 0;

    qslim::set_error_level(threshold_for(0, options.aggressiveness));
    mesh.update_borders();

    info!(
        "simplification started: {} vertices, {} faces",
        mesh.vertex_count(),
        mesh.face_count()
    );

    while iteration < budget {
        let start = Instant::now();
        let before = mesh.vertex_count() as f64;

        {
            let shared: &Mesh = mesh;

            let cells = partition_grid(options.clusters, shared);
            let occupied: Vec<&Cluster> =
                cells.iter().filter(|c| !c.elements.is_empty()).collect();
            let aabbs: Vec<Aabb> = occupied.iter().map(|c| c.aabb.clone()).collect();

            let voted: Vec<Cluster> = pool.install(|| {
                occupied
                    .par_iter()
                    .map(|cluster| vote_cluster(shared, cluster))
                    .collect()
            });

            pool.install(|| {
                voted.par_iter().for_each(|cluster| {
                    if cluster.elements.is_empty() {
                        return;
                    }
                    let mut worker =
                        QSlim::new(shared, cluster.elements.clone(), options, iteration);
                    worker.set_cluster_aabbs(aabbs.clone());
                    worker.initialize();
                    worker.simplify();
                });
            });
        }

        mesh.update();

        let remaining = mesh.vertex_count() as f64;
        let step = (1.0 - remaining / before) * 100.0;
        let global = (remaining / input_vertices) * 100.0;

        info!(
            "iteration {:>3} | step = {:>8.3}% | remaining = {:>7.3}% | error level = {:.10} | time = {:.2}s",
            iteration + 1,
            step,
            global,
            qslim::error_level(),
            start.elapsed().as_secs_f64()
        );

        if options.reduction > 0 && global < options.reduction as f64 {
            // target met, stop after this pass
            budget = 0;
        } else if options.reduction > 0
            && global > options.reduction as f64
            && iteration == budget - 1
        {
            // target missed on the last planned pass: stretch the
            // budget, but never past twice the configured maximum
            budget += 1;
            if budget > 2 * options.max_iter {
                budget = 0;
            }
        }

        qslim::set_error_level(threshold_for(iteration + 1, options.aggressiveness));
        iteration += 1;
    }

    mesh.reindex();

    info!(
        "simplification finished: vertices reduced by {:.2}%",
        (1.0 - mesh.vertex_count() as f64 / input_vertices) * 100.0
    );

    Ok(())
}
