use std::fs;
use std::io::{BufWriter, Write};
use std::mem::size_of;
use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use bytemuck::{Pod, Zeroable};
use log::info;
use nalgebra::{Point3, Vector3};

use crate::geometry;
use crate::mesh::{Face, FaceId, Mesh, Vertex, VertexId};

/// Which per-vertex properties the PLY files carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshAttributes {
    /// `float x, y, z; float nx, ny, nz; uchar red, green, blue, alpha`
    GeometryColorNormal,
    /// `float x, y, z` only
    Geometry,
}

impl MeshAttributes {
    /// Parse the numeric selector used on the command line.
    pub fn from_flag(flag: u32) -> Option<Self> {
        match flag {
            1 => Some(MeshAttributes::GeometryColorNormal),
            2 => Some(MeshAttributes::Geometry),
            _ => None,
        }
    }
}

// The binary vertex/face records, cast straight out of the payload.

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GeometryVertexRecord {
    x: f32,
    y: f32,
    z: f32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FullVertexRecord {
    x: f32,
    y: f32,
    z: f32,
    nx: f32,
    ny: f32,
    nz: f32,
    red: u8,
    green: u8,
    blue: u8,
    alpha: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FaceRecord {
    n: u8,
    v1: i32,
    v2: i32,
    v3: i32,
}

#[derive(Debug)]
struct PlyHeader {
    vertex_count: usize,
    face_count: usize,
    /// Byte offset of the binary payload, just past `end_header`.
    payload: usize,
}

fn parse_header(bytes: &[u8]) -> Result<PlyHeader> {
    let terminator = b"end_header\n";
    let end = bytes
        .windows(terminator.len())
        .position(|w| w == terminator)
        .ok_or_else(|| anyhow!("no end_header found, not a PLY file?"))?;
    let header = std::str::from_utf8(&bytes[..end]).context("PLY header is not valid text")?;

    let mut format_ok = false;
    let mut vertex_count = None;
    let mut face_count = None;

    for line in header.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["format", "binary_little_endian", "1.0"] => format_ok = true,
            ["format", other, ..] => {
                ensure!(
                    *other == "binary_little_endian",
                    "unsupported PLY format `{}`, only binary_little_endian is read",
                    other
                );
            }
            ["element", "vertex", n] => {
                vertex_count = Some(n.parse().context("bad vertex count")?);
            }
            ["element", "face", n] => {
                face_count = Some(n.parse().context("bad face count")?);
            }
            // "ply", comments and property declarations
            _ => (),
        }
    }

    ensure!(format_ok, "PLY header is missing the format declaration");
    Ok(PlyHeader {
        vertex_count: vertex_count.ok_or_else(|| anyhow!("missing `element vertex`"))?,
        face_count: face_count.ok_or_else(|| anyhow!("missing `element face`"))?,
        payload: end + terminator.len(),
    })
}

/// Read a binary little-endian PLY file into a mesh, growing the global
/// bounding box vertex by vertex and stamping every face with its plane
/// normal.
pub fn read_mesh(path: &Path, attributes: MeshAttributes) -> Result<Mesh> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let header = parse_header(&bytes)?;
    let payload = &bytes[header.payload..];

    let mut mesh = Mesh::new();

    let face_bytes = match attributes {
        MeshAttributes::Geometry => {
            let need = header.vertex_count * size_of::<GeometryVertexRecord>();
            ensure!(payload.len() >= need, "vertex data is truncated");
            let records: &[GeometryVertexRecord] = bytemuck::try_cast_slice(&payload[..need])
                .map_err(|_| anyhow!("could not interpret vertex data"))?;

            for (id, record) in records.iter().enumerate() {
                let position =
                    Point3::new(record.x as f64, record.y as f64, record.z as f64);
                mesh.update_aabb(&position);
                mesh.insert_vertex(Vertex::new(position, id as VertexId));
            }
            &payload[need..]
        }
        MeshAttributes::GeometryColorNormal => {
            let need = header.vertex_count * size_of::<FullVertexRecord>();
            ensure!(payload.len() >= need, "vertex data is truncated");
            let records: &[FullVertexRecord] = bytemuck::try_cast_slice(&payload[..need])
                .map_err(|_| anyhow!("could not interpret vertex data"))?;

            for (id, record) in records.iter().enumerate() {
                let position =
                    Point3::new(record.x as f64, record.y as f64, record.z as f64);
                let color = Vector3::new(
                    record.red as f64 / 255.0,
                    record.green as f64 / 255.0,
                    record.blue as f64 / 255.0,
                );
                let normal =
                    Vector3::new(record.nx as f64, record.ny as f64, record.nz as f64);
                mesh.update_aabb(&position);
                mesh.insert_vertex(Vertex::with_attributes(
                    position,
                    color,
                    normal,
                    id as VertexId,
                ));
            }
            &payload[need..]
        }
    };

    let need = header.face_count * size_of::<FaceRecord>();
    ensure!(face_bytes.len() >= need, "face data is truncated");
    let records: &[FaceRecord] = bytemuck::try_cast_slice(&face_bytes[..need])
        .map_err(|_| anyhow!("could not interpret face data"))?;

    let count = header.vertex_count as i32;
    for (id, record) in records.iter().enumerate() {
        let (n, v1, v2, v3) = (record.n, record.v1, record.v2, record.v3);
        ensure!(n == 3, "face {} has {} vertices, only triangles are read", id, n);
        for v in [v1, v2, v3] {
            ensure!(
                v >= 0 && v < count,
                "face {} references vertex {} outside the file",
                id,
                v
            );
        }

        let face = Face::new(v1 as VertexId, v2 as VertexId, v3 as VertexId, id as FaceId);
        if let (Some(p), Some(q), Some(r)) = (
            mesh.position(v1 as VertexId),
            mesh.position(v2 as VertexId),
            mesh.position(v3 as VertexId),
        ) {
            face.data().normal = geometry::compute_normal(&p, &q, &r);
        }
        mesh.insert_face(face);
    }

    info!(
        "input mesh: {} vertices, {} faces",
        mesh.vertex_count(),
        mesh.face_count()
    );
    Ok(mesh)
}

/// Write the mesh as ASCII PLY with the same property set the input
/// carried. Face indices refer to the reindexed, consecutive vertex
/// numbering, which matches the store order walked here.
pub fn write_mesh(path: &Path, mesh: &Mesh, attributes: MeshAttributes) -> Result<()> {
    let file =
        fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "ply")?;
    writeln!(out, "format ascii 1.0")?;
    writeln!(out, "element vertex {}", mesh.vertex_count())?;
    writeln!(out, "property float x")?;
    writeln!(out, "property float y")?;
    writeln!(out, "property float z")?;
    if attributes == MeshAttributes::GeometryColorNormal {
        writeln!(out, "property float nx")?;
        writeln!(out, "property float ny")?;
        writeln!(out, "property float nz")?;
        writeln!(out, "property uchar red")?;
        writeln!(out, "property uchar green")?;
        writeln!(out, "property uchar blue")?;
        writeln!(out, "property uchar alpha")?;
    }
    writeln!(out, "element face {}", mesh.face_count())?;
    writeln!(out, "property list uchar int vertex_indices")?;
    writeln!(out, "end_header")?;

    for vertex in mesh.vertices().values() {
        let data = vertex.data();
        let p = data.position;
        match attributes {
            MeshAttributes::Geometry => {
                writeln!(out, "{} {} {}", p.x as f32, p.y as f32, p.z as f32)?;
            }
            MeshAttributes::GeometryColorNormal => {
                let n = data.normal;
                let c = data.color * 255.0;
                writeln!(
                    out,
                    "{} {} {} {} {} {} {} {} {} 255",
                    p.x as f32,
                    p.y as f32,
                    p.z as f32,
                    n.x as f32,
                    n.y as f32,
                    n.z as f32,
                    c.x.round().clamp(0.0, 255.0) as u8,
                    c.y.round().clamp(0.0, 255.0) as u8,
                    c.z.round().clamp(0.0, 255.0) as u8,
                )?;
            }
        }
    }

    for face in mesh.faces().values() {
        let index = face.data().index;
        writeln!(out, "3 {} {} {}", index[0], index[1], index[2])?;
    }
    out.flush()?;

    info!(
        "output mesh: {} vertices, {} faces saved to {}",
        mesh.vertex_count(),
        mesh.face_count(),
        path.display()
    );
    Ok(())
}
