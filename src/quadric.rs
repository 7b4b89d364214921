use nalgebra::{DMatrix, DVector, Vector3};

/// Which error metric the simplification runs with, named by the
/// attributes it measures. The dimension is the length of the attribute
/// vector the quadric operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuadricKind {
    /// Squared distance to planes, positions only.
    Position,
    /// Position and colour in a combined 6-D space.
    PositionColor,
    /// Position, colour and normal in a combined 9-D space.
    PositionColorNormal,
}

impl QuadricKind {
    pub fn dim(&self) -> usize {
        match self {
            QuadricKind::Position => 3,
            QuadricKind::PositionColor => 6,
            QuadricKind::PositionColorNormal => 9,
        }
    }

    /// Parse the numeric selector used on the command line.
    pub fn from_dim(dim: u32) -> Option<Self> {
        match dim {
            3 => Some(QuadricKind::Position),
            6 => Some(QuadricKind::PositionColor),
            9 => Some(QuadricKind::PositionColorNormal),
            _ => None,
        }
    }
}

/// A quadric error form `Q(v) = v^T A v + 2 b^T v + c` of dimension 3, 6
/// or 9. `A` accumulates the outer products of the constraint planes,
/// `b` their displacements and `c` the constant term, so quadrics from
/// different faces can be summed componentwise.
#[derive(Debug, Clone)]
pub struct Quadric {
    pub a: DMatrix<f64>,
    pub b: DVector<f64>,
    pub c: f64,
}

impl Quadric {
    pub fn zeros(dim: usize) -> Self {
        Quadric {
            a: DMatrix::zeros(dim, dim),
            b: DVector::zeros(dim),
            c: 0.0,
        }
    }

    /// Quadric of a plane `n . v + d = 0`: A = n n^T, b = d n, c = d^2.
    pub fn from_plane(n: &Vector3<f64>, d: f64) -> Self {
        let n = DVector::from_column_slice(n.as_slice());
        Quadric {
            a: &n * n.transpose(),
            b: d * &n,
            c: d * d,
        }
    }

    /// Quadric measuring squared distance to the affine subspace through
    /// `p` spanned by the orthonormal directions `e1`, `e2` in attribute
    /// space. Used by the 6-D and 9-D flavours where a face is a plane in
    /// the combined position/colour/normal space.
    pub fn from_tangent_frame(p: &DVector<f64>, e1: &DVector<f64>, e2: &DVector<f64>) -> Self {
        let dim = p.len();
        let pe1 = p.dot(e1);
        let pe2 = p.dot(e2);

        Quadric {
            a: DMatrix::identity(dim, dim) - e1 * e1.transpose() - e2 * e2.transpose(),
            b: pe1 * e1 + pe2 * e2 - p,
            c: p.dot(p) - pe1 * pe1 - pe2 * pe2,
        }
    }

    pub fn dim(&self) -> usize {
        self.b.len()
    }

    /// Zero all terms, keeping the dimension.
    pub fn reset(&mut self) {
        self.a.fill(0.0);
        self.b.fill(0.0);
        self.c = 0.0;
    }

    /// Componentwise sum with another quadric of the same dimension.
    pub fn add(&mut self, other: &Quadric) {
        debug_assert_eq!(self.dim(), other.dim());
        self.a += &other.a;
        self.b += &other.b;
        self.c += other.c;
    }

    pub fn multiply(&mut self, s: f64) {
        self.a *= s;
        self.b *= s;
        self.c *= s;
    }

    /// Evaluate the full quadratic form `v^T A v + 2 b^T v + c`.
    pub fn evaluate(&self, v: &DVector<f64>) -> f64 {
        (&self.a * v).dot(v) + 2.0 * self.b.dot(v) + self.c
    }

    /// Solve `A x = -b` for the minimiser of the quadric with a
    /// full-pivot LU. Returns `None` when `A` is rank deficient, in which
    /// case the caller falls back to evaluating the endpoints and the
    /// midpoint of the edge.
    pub fn optimize(&self) -> Option<DVector<f64>> {
        let lu = self.a.clone().full_piv_lu();
        if !lu.is_invertible() {
            return None;
        }
        lu.solve(&(-&self.b))
    }
}
