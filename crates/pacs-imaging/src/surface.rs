//! 等值面提取与网格抽稀

use crate::error::{ReconstructionError, Result};
use crate::volume::Spacing;
use lin_alg::f32::Vec3;
use mcubes::{MarchingCubes, MeshSide};
use ndarray::{s, Array3};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// 三角网格，顶点坐标为物理空间 (x, y, z) mm
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
    /// 抽稀前的顶点数
    pub original_vertex_count: usize,
    pub decimated: bool,
}

impl Mesh {
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

/// 二值掩膜的表面（等值 0.5）
pub fn mask_surface(mask: &Array3<bool>, spacing: Spacing) -> Result<Mesh> {
    extract_isosurface(&mask.mapv(|m| if m { 1.0 } else { 0.0 }), spacing, 0.5)
}

/// Marching Cubes 等值面；体数据四周补一层背景以保证表面闭合
pub fn extract_isosurface(data: &Array3<f32>, spacing: Spacing, iso_level: f32) -> Result<Mesh> {
    let (depth, rows, columns) = data.dim();
    if depth == 0 || rows == 0 || columns == 0 {
        return Ok(Mesh::default());
    }
    let background = data.iter().copied().fold(f32::INFINITY, f32::min).min(iso_level) - 1.0;
    let mut padded = Array3::from_elem((depth + 2, rows + 2, columns + 2), background);
    padded.slice_mut(s![1..=depth, 1..=rows, 1..=columns]).assign(data);
    let (slices, rows, cols) = padded.dim();

    // mcubes 的索引顺序为 x + y*cols + z*cols*rows，与标准布局一致
    let values: Vec<f32> = padded.iter().copied().collect();
    let mc = MarchingCubes::new(
        (cols, rows, slices),
        (
            cols as f32 * spacing.column,
            rows as f32 * spacing.row,
            slices as f32 * spacing.depth,
        ),
        (cols as f32, rows as f32, slices as f32),
        Vec3::new(-spacing.column, -spacing.row, -spacing.depth),
        values,
        iso_level,
    )
    .map_err(|e| ReconstructionError::Internal(format!("Marching Cubes 初始化失败: {:?}", e)))?;
    let mesh = mc.generate(MeshSide::OutsideOnly);

    let vertices: Vec<[f32; 3]> = mesh
        .vertices
        .iter()
        .map(|v| [v.posit.x, v.posit.y, v.posit.z])
        .collect();
    let faces: Vec<[u32; 3]> = mesh
        .indices
        .chunks_exact(3)
        .map(|f| [f[0] as u32, f[1] as u32, f[2] as u32])
        .collect();
    if faces.is_empty() {
        warn!("等值面为空 (iso = {:.2})", iso_level);
    }
    debug!("等值面: {} 顶点, {} 三角形", vertices.len(), faces.len());

    Ok(Mesh {
        original_vertex_count: vertices.len(),
        vertices,
        faces,
        decimated: false,
    })
}

/// 顶点数超过 `ceiling` 时按网格聚类抽稀到不超过 `target` 个顶点
pub fn decimate(mesh: Mesh, ceiling: usize, target: usize) -> Mesh {
    if mesh.vertices.len() <= ceiling || target == 0 {
        return mesh;
    }

    let (min, max) = bounds(&mesh.vertices);
    let extent = (0..3).map(|i| max[i] - min[i]).fold(0.0f32, f32::max).max(f32::EPSILON);
    let mut cell = extent / (target as f32).cbrt();
    let mut clusters = cluster(&mesh.vertices, min, cell);
    for _ in 0..32 {
        if clusters.1.len() <= target {
            break;
        }
        cell *= 1.25;
        clusters = cluster(&mesh.vertices, min, cell);
    }
    let (remap, sums) = clusters;

    let vertices: Vec<[f32; 3]> = sums
        .iter()
        .map(|(sum, n)| [sum[0] / *n as f32, sum[1] / *n as f32, sum[2] / *n as f32])
        .collect();
    let mut seen = std::collections::HashSet::new();
    let faces: Vec<[u32; 3]> = mesh
        .faces
        .iter()
        .map(|f| [remap[f[0] as usize], remap[f[1] as usize], remap[f[2] as usize]])
        .filter(|[a, b, c]| a != b && b != c && a != c)
        .filter(|face| {
            let mut key = *face;
            key.sort_unstable();
            seen.insert(key)
        })
        .collect();

    debug!("网格抽稀: {} -> {} 顶点", mesh.vertices.len(), vertices.len());
    Mesh {
        vertices,
        faces,
        original_vertex_count: mesh.original_vertex_count,
        decimated: true,
    }
}

fn bounds(vertices: &[[f32; 3]]) -> ([f32; 3], [f32; 3]) {
    vertices.iter().fold(
        ([f32::INFINITY; 3], [f32::NEG_INFINITY; 3]),
        |(mut lo, mut hi), v| {
            for i in 0..3 {
                lo[i] = lo[i].min(v[i]);
                hi[i] = hi[i].max(v[i]);
            }
            (lo, hi)
        },
    )
}

/// 顶点到聚类的映射，以及各聚类的坐标和与数量
fn cluster(vertices: &[[f32; 3]], origin: [f32; 3], cell: f32) -> (Vec<u32>, Vec<([f32; 3], usize)>) {
    let mut index: HashMap<[i64; 3], u32> = HashMap::new();
    let mut sums: Vec<([f32; 3], usize)> = Vec::new();
    let remap = vertices
        .iter()
        .map(|v| {
            let key = [
                ((v[0] - origin[0]) / cell).floor() as i64,
                ((v[1] - origin[1]) / cell).floor() as i64,
                ((v[2] - origin[2]) / cell).floor() as i64,
            ];
            let id = *index.entry(key).or_insert_with(|| {
                sums.push(([0.0; 3], 0));
                (sums.len() - 1) as u32
            });
            let entry = &mut sums[id as usize];
            for i in 0..3 {
                entry.0[i] += v[i];
            }
            entry.1 += 1;
            id
        })
        .collect();
    (remap, sums)
}
