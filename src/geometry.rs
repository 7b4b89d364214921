use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DVector, Point3, Vector3};
use parking_lot::MutexGuard;

use crate::edge::Edge;
use crate::mesh::{FaceData, FaceId, Mesh, VertexData, VertexId};
use crate::partition::Aabb;
use crate::quadric::Quadric;

/// Heron's formula for an arbitrary triangle.
pub fn compute_area(p: &Point3<f64>, q: &Point3<f64>, r: &Point3<f64>) -> f64 {
    let a = (p - q).norm();
    let b = (q - r).norm();
    let c = (r - p).norm();
    let s = (a + b + c) / 2.0;
    (s * (s - a) * (s - b) * (s - c)).sqrt()
}

/// Right-handed unit normal of the triangle (p, q, r).
pub fn compute_normal(p: &Point3<f64>, q: &Point3<f64>, r: &Point3<f64>) -> Vector3<f64> {
    (q - p).cross(&(r - p)).normalize()
}

/// Orthonormalise the pair (h, k): `e1` along `h`, `e2` the component of
/// `k` orthogonal to it.
pub fn gram_schmidt(k: &DVector<f64>, h: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
    let e1 = h.normalize();
    let a = k - &e1 * k.dot(&e1);
    let e2 = a.normalize();
    (e1, e2)
}

/// Build the error quadric a single face contributes, from the full 9-D
/// attribute vectors of its corners. Dimension 3 uses the supporting
/// plane; 6 and 9 use the face's tangent subspace in attribute space.
pub fn face_quadric(dim: usize, p: &DVector<f64>, q: &DVector<f64>, r: &DVector<f64>) -> Quadric {
    if dim == 3 {
        let pp = Point3::new(p[0], p[1], p[2]);
        let qq = Point3::new(q[0], q[1], q[2]);
        let rr = Point3::new(r[0], r[1], r[2]);
        let n = compute_normal(&pp, &qq, &rr);
        let d = -n.dot(&pp.coords);
        return Quadric::from_plane(&n, d);
    }

    let h = q.rows(0, dim) - p.rows(0, dim);
    let k = r.rows(0, dim) - p.rows(0, dim);
    let (e1, e2) = gram_schmidt(&k, &h);
    Quadric::from_tangent_frame(&p.rows(0, dim).into_owned(), &e1, &e2)
}

/// A plane through the edge perpendicular to its incident face,
/// penalising any drift away from the boundary. `None` when the edge
/// carries no usable face reference.
pub fn border_penalty(mesh: &Mesh, edge: &Edge) -> Option<Quadric> {
    let fid = edge.face_id?;
    let face = mesh.face(fid)?;
    let face_normal = face.data().normal;

    let v = mesh.position(edge.v)?;
    let u = mesh.position(edge.u)?;

    let n = (v - u).cross(&face_normal).normalize();
    let d = -n.dot(&u.coords);
    Some(Quadric::from_plane(&n, d))
}

/// If exactly one face contains both endpoints the edge lies on the mesh
/// boundary; both endpoints and that face are marked.
pub fn check_border(mesh: &Mesh, a: VertexId, b: VertexId) -> bool {
    let faces = mesh.faces_for_edge(a, b);
    if faces.len() != 1 {
        return false;
    }
    if let Some(vertex) = mesh.vertex(a) {
        vertex.data().on_border = true;
    }
    if let Some(vertex) = mesh.vertex(b) {
        vertex.data().on_border = true;
    }
    if let Some(face) = mesh.face(faces[0]) {
        face.data().on_border = true;
    }
    true
}

/// Would collapsing this edge to its target fold a neighbouring triangle
/// over or squash it flat? Checks every face incident to an endpoint
/// except the ones the collapse retires: a near-collinear silhouette
/// (|cos| > 0.999) or a large orientation change against the current
/// face plane (cos < 0.2) rejects the collapse.
pub fn flipped(mesh: &Mesh, edge: &Edge) -> bool {
    if !mesh.is_valid_edge(edge) {
        return false;
    }

    let remove: BTreeSet<FaceId> = mesh.faces_for_edge(edge.v, edge.u).into_iter().collect();
    let mut silhouette = mesh.faces_for_vertex(edge.v);
    silhouette.extend(mesh.faces_for_vertex(edge.u));
    silhouette.retain(|fid| !remove.contains(fid));

    for fid in silhouette {
        let face = match mesh.face(fid) {
            Some(face) => face,
            None => continue,
        };
        let (kept, o1, o2) = {
            let data = face.data();
            let kept = if data.has_vertex(edge.u) {
                edge.u
            } else {
                edge.v
            };
            let (o1, o2) = data.opposite_edge(kept);
            (kept, o1, o2)
        };

        let (Some(p1), Some(p2), Some(pk)) =
            (mesh.position(o1), mesh.position(o2), mesh.position(kept))
        else {
            continue;
        };

        let uvec = (p1.coords - edge.target).normalize();
        let vvec = (p2.coords - edge.target).normalize();

        if uvec.dot(&vvec).abs() > 0.999 {
            return true;
        }

        let n = uvec.cross(&vvec).normalize();
        if n.dot(&compute_normal(&pk, &p1, &p2)) < 0.2 {
            return true;
        }
    }

    false
}

/// The atomic contraction: move `v` to the edge target, absorb `u`'s
/// quadric, retire the shared faces and relink `u`'s remaining faces
/// onto `v`.
///
/// The whole neighbourhood (every face around either endpoint and every
/// vertex of those faces) is pinned with non-blocking try-locks first.
/// Any lock that cannot be taken immediately aborts the collapse and
/// releases everything already held, so contention at cluster borders
/// resolves by yielding and no lock is ever waited on while another is
/// held.
pub fn moved_to_target(mesh: &Mesh, edge: &Edge) -> bool {
    // read the flags one at a time so no two blocking locks are ever
    // held together
    let v_border = match mesh.vertex(edge.v) {
        Some(v) => v.data().on_border,
        None => return false,
    };
    let u_border = match mesh.vertex(edge.u) {
        Some(u) => u.data().on_border,
        None => return false,
    };
    if v_border != u_border {
        return false;
    }

    // the faces touching either endpoint, deduplicated: the element
    // locks are not reentrant, so each one is taken exactly once
    let face_ids: BTreeSet<FaceId> = mesh
        .faces_around_edge(edge.u, edge.v)
        .into_iter()
        .collect();

    let mut face_guards: BTreeMap<FaceId, MutexGuard<'_, FaceData>> = BTreeMap::new();
    for &fid in &face_ids {
        let face = match mesh.face(fid) {
            Some(face) => face,
            None => return false,
        };
        match face.try_data() {
            Some(guard) => {
                face_guards.insert(fid, guard);
            }
            // dropping the maps releases everything acquired so far
            None => return false,
        }
    }

    let mut vertex_ids: BTreeSet<VertexId> = BTreeSet::new();
    vertex_ids.insert(edge.u);
    vertex_ids.insert(edge.v);
    for guard in face_guards.values() {
        for vid in guard.index {
            vertex_ids.insert(vid);
        }
    }

    let mut vertex_guards: BTreeMap<VertexId, MutexGuard<'_, VertexData>> = BTreeMap::new();
    for &vid in &vertex_ids {
        let vertex = match mesh.vertex(vid) {
            Some(vertex) => vertex,
            None => return false,
        };
        match vertex.try_data() {
            Some(guard) => {
                vertex_guards.insert(vid, guard);
            }
            None => return false,
        }
    }

    // re-check now that the neighbourhood is pinned; another worker may
    // have collapsed an endpoint in the meantime
    if vertex_guards[&edge.u].invalid || vertex_guards[&edge.v].invalid {
        return false;
    }

    // the one or two faces sharing both endpoints are retired
    let remove: Vec<FaceId> = face_guards
        .iter()
        .filter(|(_, g)| !g.invalid && g.has_vertex(edge.u) && g.has_vertex(edge.v))
        .map(|(&fid, _)| fid)
        .collect();

    let u_quadric = vertex_guards[&edge.u].quadric.clone();
    {
        let v_data = match vertex_guards.get_mut(&edge.v) {
            Some(data) => data,
            None => return false,
        };
        v_data.update(&edge.optimized);
        if let Some(q) = &u_quadric {
            v_data.add_quadric(q);
        }
    }

    for fid in &remove {
        let index = face_guards[fid].index;
        if let Some(g) = face_guards.get_mut(fid) {
            g.invalid = true;
        }
        for vid in index {
            if let Some(vg) = vertex_guards.get_mut(&vid) {
                vg.faces.remove(fid);
            }
        }
    }

    if let Some(ug) = vertex_guards.get_mut(&edge.u) {
        ug.invalid = true;
    }

    // every face still hanging off u gets rewritten to reference v and
    // relinked into the surviving endpoints' face sets
    let u_faces: Vec<FaceId> = vertex_guards[&edge.u].faces.iter().copied().collect();
    for fid in u_faces {
        let old_index = match face_guards.get_mut(&fid) {
            Some(g) => {
                if g.invalid {
                    continue;
                }
                let old_index = g.index;
                g.reconnect(edge.u, edge.v);
                old_index
            }
            None => continue,
        };

        for vid in old_index {
            if let Some(vg) = vertex_guards.get_mut(&vid) {
                vg.faces.remove(&fid);
            }
        }
        for vid in old_index.map(|vid| if vid == edge.u { edge.v } else { vid }) {
            if let Some(vg) = vertex_guards.get_mut(&vid) {
                vg.faces.insert(fid);
            }
        }
    }

    // guards drop here, releasing the neighbourhood
    true
}

/// Re-home both endpoints of an edge into the first cluster cell that
/// contains their current position; vertices outside every cell keep
/// their assignment.
pub fn move_to_cluster(mesh: &Mesh, edge: &Edge, cluster_aabbs: &[Aabb]) {
    for id in [edge.v, edge.u] {
        let position = match mesh.position(id) {
            Some(position) => position,
            None => continue,
        };
        if let Some(aabb) = cluster_aabbs.iter().find(|a| a.inside(&position)) {
            if let Some(vertex) = mesh.vertex(id) {
                vertex.data().cluster_id = aabb.id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::fixtures::{assert_adjacency_consistent, patch_mesh};
    use approx::relative_eq;

    #[test]
    fn test_area_and_normal() {
        let p = Point3::new(0.0, 0.0, 0.0);
        let q = Point3::new(2.0, 0.0, 0.0);
        let r = Point3::new(0.0, 2.0, 0.0);

        assert!(relative_eq!(
            compute_area(&p, &q, &r),
            2.0,
            epsilon = 1e-12
        ));
        assert!(relative_eq!(
            compute_normal(&p, &q, &r),
            Vector3::new(0.0, 0.0, 1.0),
            epsilon = 1e-12
        ));
    }

    #[test]
    fn test_gram_schmidt() {
        let h = DVector::from_vec(vec![2.0, 0.0, 0.0]);
        let k = DVector::from_vec(vec![1.0, 3.0, 0.0]);
        let (e1, e2) = gram_schmidt(&k, &h);

        assert!(relative_eq!(e1.norm(), 1.0, epsilon = 1e-12));
        assert!(relative_eq!(e2.norm(), 1.0, epsilon = 1e-12));
        assert!(relative_eq!(e1.dot(&e2), 0.0, epsilon = 1e-12));
        assert!(relative_eq!(e1[0], 1.0, epsilon = 1e-12));
        assert!(relative_eq!(e2[1], 1.0, epsilon = 1e-12));
    }

    #[test]
    fn test_face_quadric_vanishes_on_corners() {
        // each corner of a face lies on the face's own subspace, so its
        // quadric error there is zero for every flavour
        let p = DVector::from_vec(vec![0.0, 0.0, 0.0, 0.9, 0.1, 0.1, 0.0, 0.0, 1.0]);
        let q = DVector::from_vec(vec![1.0, 0.0, 0.0, 0.1, 0.9, 0.1, 0.0, 0.0, 1.0]);
        let r = DVector::from_vec(vec![0.0, 1.0, 0.0, 0.1, 0.1, 0.9, 0.0, 0.0, 1.0]);

        for dim in [3usize, 6, 9] {
            let quadric = face_quadric(dim, &p, &q, &r);
            for corner in [&p, &q, &r] {
                let v = corner.rows(0, dim).into_owned();
                assert!(
                    relative_eq!(quadric.evaluate(&v), 0.0, epsilon = 1e-9),
                    "dim {} corner error not zero",
                    dim
                );
            }
        }
    }

    #[test]
    fn test_check_border() {
        let mesh = patch_mesh();
        assert!(check_border(&mesh, 5, 4));
        assert!(!check_border(&mesh, 7, 3));

        // the single-face edge marked its endpoints and face
        assert!(mesh.vertex(5).unwrap().data().on_border);
        assert!(mesh.vertex(4).unwrap().data().on_border);
        let fid = mesh.faces_for_edge(5, 4)[0];
        assert!(mesh.face(fid).unwrap().data().on_border);
    }

    #[test]
    fn test_flipped() {
        let mesh = patch_mesh();

        // pulling 7 across to 3 folds neighbouring triangles over
        let mut edge = Edge::new(7, 3);
        edge.target = mesh.position(7).unwrap().coords;
        assert!(flipped(&mesh, &edge));

        // collapsing 7 into 3 keeps the silhouette intact
        let mut edge = Edge::new(3, 7);
        edge.target = mesh.position(3).unwrap().coords;
        assert!(!flipped(&mesh, &edge));
    }

    #[test]
    fn test_moved_to_target() {
        let mesh = patch_mesh();

        let mut edge = Edge::new(3, 7);
        let keep = mesh.vertex(3).unwrap().data().attributes();
        edge.target = mesh.position(3).unwrap().coords;
        edge.optimized = keep;
        edge.quadric = Some(Quadric::zeros(3));

        assert!(moved_to_target(&mesh, &edge));

        // vertex 7 and the two shared faces are gone, the rest of 7's
        // fan now hangs off vertex 3
        assert!(!mesh.is_valid_vertex(7));
        assert_eq!(mesh.faces_for_vertex(3).len(), 9);
        assert_eq!(mesh.faces_for_edge(0, 3).len(), 2);
        assert_adjacency_consistent(&mesh);
    }

    #[test]
    fn test_moved_to_target_border_mismatch() {
        let mesh = patch_mesh();
        mesh.update_borders();

        // 3 is interior, 4 is on the boundary: the collapse is refused
        let mut edge = Edge::new(3, 4);
        edge.target = mesh.position(3).unwrap().coords;
        assert!(!moved_to_target(&mesh, &edge));
        assert!(mesh.is_valid_vertex(4));
    }

    #[test]
    fn test_moved_to_target_backs_off_on_contention() {
        let mesh = patch_mesh();

        let mut edge = Edge::new(3, 7);
        edge.target = mesh.position(3).unwrap().coords;
        edge.optimized = mesh.vertex(3).unwrap().data().attributes();

        // somebody else is holding a vertex in the neighbourhood
        let _held = mesh.vertex(5).unwrap().data();
        assert!(!moved_to_target(&mesh, &edge));

        // nothing was mutated
        assert!(mesh.is_valid_vertex(7));
        assert_eq!(mesh.faces_for_vertex(3).len(), 7);
    }

    #[test]
    fn test_move_to_cluster() {
        let mesh = patch_mesh();
        let cells = vec![
            Aabb {
                id: 0,
                min: Point3::new(0.0, 0.0, 0.0),
                max: Point3::new(1.0, 1.0, 1.0),
            },
            Aabb {
                id: 1,
                min: Point3::new(4.0, 2.0, 0.0),
                max: Point3::new(5.0, 3.0, 1.0),
            },
        ];

        let edge = Edge::new(3, 7);
        move_to_cluster(&mesh, &edge, &cells);

        assert_eq!(mesh.vertex(3).unwrap().data().cluster_id, 1);
        assert_eq!(mesh.vertex(7).unwrap().data().cluster_id, 1);
    }

    #[test]
    fn test_border_penalty_plane_contains_edge() {
        let mesh = patch_mesh();
        let edges = mesh.create_edges(&mesh.face_keys());
        let border = edges
            .iter()
            .find(|e| e.key() == (5, 4))
            .expect("fixture has the (5, 4) edge");

        let q = border_penalty(&mesh, border).unwrap();

        // both endpoints lie on the penalty plane
        for id in [border.v, border.u] {
            let p = mesh.position(id).unwrap();
            let v = DVector::from_vec(vec![p.x, p.y, p.z]);
            assert!(relative_eq!(q.evaluate(&v), 0.0, epsilon = 1e-9));
        }
    }
}
