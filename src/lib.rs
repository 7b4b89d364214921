pub mod edge;
pub mod geometry;
pub mod heap;
pub mod mesh;
pub mod partition;
pub mod ply;
pub mod qslim;
pub mod quadric;
pub mod simplifier;
pub mod smooth;

pub use mesh::{Face, FaceId, Mesh, Vertex, VertexId};
pub use ply::MeshAttributes;
pub use quadric::{Quadric, QuadricKind};
pub use simplifier::{simplify, SimplifyOptions, Weighting};
