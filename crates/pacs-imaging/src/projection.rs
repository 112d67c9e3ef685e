//! 强度投影 (MIP / MinIP / 平均)

use crate::error::{ReconstructionError, Result};
use crate::mpr::Plane;
use ndarray::{Array2, ArrayView3, Slice};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// 投影归约方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionMode {
    Max,
    Min,
    Mean,
}

impl ProjectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectionMode::Max => "max",
            ProjectionMode::Min => "min",
            ProjectionMode::Mean => "mean",
        }
    }
}

/// 沿 `plane` 的法向轴投影；`range` 为该轴上的子范围
pub fn project(
    data: ArrayView3<'_, f32>,
    plane: Plane,
    mode: ProjectionMode,
    range: Option<Range<usize>>,
) -> Result<Array2<f32>> {
    let axis = plane.axis();
    let extent = data.len_of(axis);
    let range = range.unwrap_or(0..extent);
    if range.start >= range.end || range.end > extent {
        return Err(ReconstructionError::InvalidRequest(format!(
            "投影范围 {:?} 无效（{}方向共 {} 层）",
            range,
            plane.as_str(),
            extent
        )));
    }
    let view = data.slice_axis(axis, Slice::from(range));

    let image = match mode {
        ProjectionMode::Max => view.fold_axis(axis, f32::NEG_INFINITY, |acc, &v| acc.max(v)),
        ProjectionMode::Min => view.fold_axis(axis, f32::INFINITY, |acc, &v| acc.min(v)),
        ProjectionMode::Mean => view
            .mean_axis(axis)
            .ok_or_else(|| ReconstructionError::Internal("空投影范围".to_string()))?,
    };
    Ok(image)
}

/// 三个正交方向的投影
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionSet {
    pub axial: Array2<f32>,
    pub coronal: Array2<f32>,
    pub sagittal: Array2<f32>,
}

impl ProjectionSet {
    pub fn get(&self, plane: Plane) -> &Array2<f32> {
        match plane {
            Plane::Axial => &self.axial,
            Plane::Coronal => &self.coronal,
            Plane::Sagittal => &self.sagittal,
        }
    }
}

/// 整个体数据在三个方向上的投影
pub fn project_all(data: ArrayView3<'_, f32>, mode: ProjectionMode) -> Result<ProjectionSet> {
    Ok(ProjectionSet {
        axial: project(data, Plane::Axial, mode, None)?,
        coronal: project(data, Plane::Coronal, mode, None)?,
        sagittal: project(data, Plane::Sagittal, mode, None)?,
    })
}
