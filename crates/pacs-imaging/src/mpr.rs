//! 多平面重建 (MPR)
//!
//! 正交平面切片的二维形状：轴位 (行, 列)，冠状 (深度, 列)，矢状 (深度, 行)。

use crate::error::{ReconstructionError, Result};
use crate::projection::{project, ProjectionMode};
use crate::volume::Volume;
use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// 正交平面
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plane {
    Axial,
    Coronal,
    Sagittal,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::Axial, Plane::Coronal, Plane::Sagittal];

    /// 垂直于该平面的体数据轴
    pub fn axis(self) -> Axis {
        match self {
            Plane::Axial => Axis(0),
            Plane::Coronal => Axis(1),
            Plane::Sagittal => Axis(2),
        }
    }

    /// 该平面方向上的切片数
    pub fn extent(self, volume: &Volume) -> usize {
        volume.data.len_of(self.axis())
    }

    /// 中间切片序号
    pub fn middle(self, volume: &Volume) -> usize {
        self.extent(volume) / 2
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plane::Axial => "axial",
            Plane::Coronal => "coronal",
            Plane::Sagittal => "sagittal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "axial" => Some(Plane::Axial),
            "coronal" => Some(Plane::Coronal),
            "sagittal" => Some(Plane::Sagittal),
            _ => None,
        }
    }
}

/// 取正交平面上的一张切片
pub fn extract_slice(volume: &Volume, plane: Plane, index: usize) -> Result<Array2<f32>> {
    check_index(volume, plane, index)?;
    Ok(volume.data.index_axis(plane.axis(), index).to_owned())
}

fn check_index(volume: &Volume, plane: Plane, index: usize) -> Result<()> {
    let extent = plane.extent(volume);
    if index >= extent {
        return Err(ReconstructionError::InvalidRequest(format!(
            "{}切片序号 {} 超出范围 0..{}",
            plane.as_str(),
            index,
            extent
        )));
    }
    Ok(())
}

/// 以 `index` 为中心、厚度为 `thickness` 层的厚层投影
pub fn thick_slab(volume: &Volume, plane: Plane, index: usize, thickness: usize, mode: ProjectionMode) -> Result<Array2<f32>> {
    check_index(volume, plane, index)?;
    if thickness == 0 {
        return Err(ReconstructionError::InvalidRequest("厚层厚度必须大于0".to_string()));
    }
    let extent = plane.extent(volume);
    let start = index.saturating_sub((thickness - 1) / 2);
    let end = (start + thickness).min(extent);
    project(volume.data.view(), plane, mode, Some(start..end))
}

/// 斜切平面：经过 `center`（体素坐标，深度/行/列），法向量为 `normal`（物理空间，同轴序）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObliquePlane {
    pub center: [f32; 3],
    pub normal: [f32; 3],
}

/// 斜切平面输出边长上限
pub const MAX_OBLIQUE_SIZE: usize = 4096;

/// 斜切平面重建，三线性插值；输出为 `size`×`size` 的正方形图像，越界处取体数据最小值
pub fn oblique_slice(volume: &Volume, plane: &ObliquePlane, size: usize) -> Result<Array2<f32>> {
    let normal = normalize(plane.normal)
        .ok_or_else(|| ReconstructionError::InvalidRequest("斜切平面法向量不能为零".to_string()))?;
    if size == 0 || size > MAX_OBLIQUE_SIZE {
        return Err(ReconstructionError::InvalidRequest(format!(
            "输出尺寸必须在 1..={} 之间: {}",
            MAX_OBLIQUE_SIZE, size
        )));
    }

    // 平面内两个正交基向量
    let helper = if normal[0].abs() < 0.9 { [1.0, 0.0, 0.0] } else { [0.0, 1.0, 0.0] };
    let u = normalize(cross(normal, helper)).unwrap_or([0.0, 0.0, 1.0]);
    let v = cross(normal, u);

    let spacing = [volume.spacing.depth, volume.spacing.row, volume.spacing.column];
    let step = spacing.iter().copied().fold(f32::INFINITY, f32::min).max(f32::EPSILON);
    let center_mm = [
        plane.center[0] * spacing[0],
        plane.center[1] * spacing[1],
        plane.center[2] * spacing[2],
    ];
    let background = volume.min_max().0;
    let half = size as f32 / 2.0;

    let pixels: Vec<f32> = (0..size * size)
        .into_par_iter()
        .map(|i| {
            let (row, col) = ((i / size) as f32 - half, (i % size) as f32 - half);
            let mut voxel = [0.0f32; 3];
            for axis in 0..3 {
                let mm = center_mm[axis] + (row * v[axis] + col * u[axis]) * step;
                voxel[axis] = mm / spacing[axis];
            }
            trilinear(&volume.data, voxel).unwrap_or(background)
        })
        .collect();

    Array2::from_shape_vec((size, size), pixels).map_err(|e| ReconstructionError::Internal(e.to_string()))
}

/// 三线性插值，坐标越界返回 `None`
pub fn trilinear(data: &Array3<f32>, position: [f32; 3]) -> Option<f32> {
    let dims = data.dim();
    let dims = [dims.0, dims.1, dims.2];
    let mut base = [0usize; 3];
    let mut frac = [0.0f32; 3];
    for axis in 0..3 {
        let p = position[axis];
        if !(p >= 0.0) || p > (dims[axis] - 1) as f32 {
            return None;
        }
        base[axis] = (p.floor() as usize).min(dims[axis].saturating_sub(2));
        frac[axis] = p - base[axis] as f32;
    }

    let sample = |dz: usize, dy: usize, dx: usize| {
        let z = (base[0] + dz).min(dims[0] - 1);
        let y = (base[1] + dy).min(dims[1] - 1);
        let x = (base[2] + dx).min(dims[2] - 1);
        data[[z, y, x]]
    };
    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;

    let c00 = lerp(sample(0, 0, 0), sample(0, 0, 1), frac[2]);
    let c01 = lerp(sample(0, 1, 0), sample(0, 1, 1), frac[2]);
    let c10 = lerp(sample(1, 0, 0), sample(1, 0, 1), frac[2]);
    let c11 = lerp(sample(1, 1, 0), sample(1, 1, 1), frac[2]);
    let c0 = lerp(c00, c01, frac[1]);
    let c1 = lerp(c10, c11, frac[1]);
    Some(lerp(c0, c1, frac[0]))
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

fn normalize(v: [f32; 3]) -> Option<[f32; 3]> {
    let length = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    (length > f32::EPSILON && length.is_finite()).then(|| [v[0] / length, v[1] / length, v[2] / length])
}
