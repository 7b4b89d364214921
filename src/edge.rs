use nalgebra::{DVector, Vector3};

use crate::mesh::{FaceId, VertexId};
use crate::quadric::Quadric;

/// Canonical identifier of a geometric edge: the larger endpoint id
/// first, so `(a, b)` and `(b, a)` map to the same key.
pub type EdgeKey = (VertexId, VertexId);

pub fn edge_key(a: VertexId, b: VertexId) -> EdgeKey {
    (a.max(b), a.min(b))
}

/// A contraction candidate. Collapsing the edge removes `u` and moves
/// `v` to the optimised target; edges are transient and live only inside
/// a worker's heap and edge map.
#[derive(Debug, Clone)]
pub struct Edge {
    pub v: VertexId,
    pub u: VertexId,
    /// An arbitrary face incident to the edge, recorded at collection
    /// time. Needed for the border penalty plane.
    pub face_id: Option<FaceId>,
    /// Sum of the endpoint quadrics (plus border penalty where it
    /// applies).
    pub quadric: Option<Quadric>,
    pub cost: f64,
    /// Position the surviving vertex moves to.
    pub target: Vector3<f64>,
    /// Full attribute vector of the optimum, first three components are
    /// `target`.
    pub optimized: DVector<f64>,
    pub in_heap: bool,
}

impl Edge {
    pub fn new(v: VertexId, u: VertexId) -> Self {
        Edge {
            v,
            u,
            face_id: None,
            quadric: None,
            cost: f64::INFINITY,
            target: Vector3::zeros(),
            optimized: DVector::zeros(9),
            in_heap: false,
        }
    }

    pub fn key(&self) -> EdgeKey {
        edge_key(self.v, self.u)
    }

    /// Find the contraction target and its cost. Tries the quadric's
    /// minimiser first; when `A` is singular, evaluates both endpoint
    /// attribute vectors and their midpoint and keeps the cheapest
    /// (midpoint wins ties, then the second endpoint).
    pub fn compute_optimum(&mut self, attrs_v: &DVector<f64>, attrs_u: &DVector<f64>) {
        let q = match &self.quadric {
            Some(q) => q,
            None => return,
        };

        let (cost, optimum) = match q.optimize() {
            Some(optimum) => (q.evaluate(&optimum), optimum),
            None => {
                let dim = q.dim();
                let a = attrs_v.rows(0, dim).into_owned();
                let b = attrs_u.rows(0, dim).into_owned();
                let mid = (&a + &b) / 2.0;

                let error_a = q.evaluate(&a);
                let error_b = q.evaluate(&b);
                let error_mid = q.evaluate(&mid);
                let error = error_a.min(error_b).min(error_mid);

                let mut optimum = a;
                if error_b == error {
                    optimum = b;
                }
                if error_mid == error {
                    optimum = mid;
                }
                (error, optimum)
            }
        };

        self.cost = cost;
        self.target = Vector3::new(optimum[0], optimum[1], optimum[2]);
        self.optimized = optimum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::relative_eq;
    use nalgebra::Vector3 as V3;

    #[test]
    fn test_edge_key_canonical() {
        assert_eq!(edge_key(3, 7), (7, 3));
        assert_eq!(edge_key(7, 3), (7, 3));
        assert_eq!(edge_key(0, 1), edge_key(1, 0));
        assert_eq!(Edge::new(2, 9).key(), Edge::new(9, 2).key());
    }

    #[test]
    fn test_optimum_from_solvable_quadric() {
        // three orthogonal planes through (1, 2, 3)
        let mut q = Quadric::from_plane(&V3::new(1.0, 0.0, 0.0), -1.0);
        q.add(&Quadric::from_plane(&V3::new(0.0, 1.0, 0.0), -2.0));
        q.add(&Quadric::from_plane(&V3::new(0.0, 0.0, 1.0), -3.0));

        let mut edge = Edge::new(0, 1);
        edge.quadric = Some(q);
        edge.compute_optimum(&DVector::zeros(9), &DVector::zeros(9));

        assert!(relative_eq!(
            edge.target,
            V3::new(1.0, 2.0, 3.0),
            epsilon = 1e-9
        ));
        assert!(relative_eq!(edge.cost, 0.0, epsilon = 1e-9));
    }

    #[test]
    fn test_optimum_fallback_picks_minimum() {
        // a single plane z = 0 is singular, forcing the fallback; the
        // midpoint of the endpoints lies on the plane and must win
        let q = Quadric::from_plane(&V3::new(0.0, 0.0, 1.0), 0.0);

        let mut attrs_v = DVector::zeros(9);
        attrs_v[2] = 1.0;
        let mut attrs_u = DVector::zeros(9);
        attrs_u[2] = -1.0;

        let mut edge = Edge::new(0, 1);
        edge.quadric = Some(q.clone());
        edge.compute_optimum(&attrs_v, &attrs_u);

        let dim = 3;
        let expected = q
            .evaluate(&attrs_v.rows(0, dim).into_owned())
            .min(q.evaluate(&attrs_u.rows(0, dim).into_owned()))
            .min(q.evaluate(&((attrs_v.rows(0, dim) + attrs_u.rows(0, dim)) / 2.0).into_owned()));

        assert_eq!(edge.cost, expected);
        assert!(relative_eq!(edge.cost, 0.0, epsilon = 1e-12));
        assert!(relative_eq!(edge.target, V3::zeros(), epsilon = 1e-12));
    }
}
