//! 三维体数据

use ndarray::Array3;
use rayon::prelude::*;
use serde::Serialize;

/// 体素间距 (mm)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spacing {
    /// 切片方向
    pub depth: f32,
    /// 行方向（图像纵向）
    pub row: f32,
    /// 列方向（图像横向）
    pub column: f32,
}

impl Spacing {
    pub fn new(depth: f32, row: f32, column: f32) -> Self {
        Self { depth, row, column }
    }

    /// 单个体素体积 (mm³)
    pub fn voxel_volume(&self) -> f64 {
        self.depth as f64 * self.row as f64 * self.column as f64
    }

    pub fn in_plane(&self) -> f32 {
        self.row.min(self.column)
    }
}

impl Default for Spacing {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }
}

/// PET剂量信息，用于SUV计算
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PetAcquisition {
    pub patient_weight_kg: Option<f64>,
    /// 注射总剂量 (Bq)
    pub injected_dose_bq: Option<f64>,
    pub half_life_secs: Option<f64>,
    /// 注射到采集的间隔（秒）
    pub elapsed_secs: Option<f64>,
}

/// 组装完成的体数据，轴顺序为 (深度, 行, 列)
#[derive(Debug, Clone)]
pub struct Volume {
    pub series_uid: String,
    pub modality: String,
    /// 物理强度（已应用 rescale slope/intercept）
    pub data: Array3<f32>,
    pub spacing: Spacing,
    /// 第一张切片的患者坐标
    pub origin: Option<[f64; 3]>,
    /// 实际采集的切片数
    pub acquired_slices: usize,
    /// 解码失败、已补零的切片数
    pub zero_filled_slices: usize,
    /// 含有插值合成的切片
    pub interpolated: bool,
    /// 已沿深度方向重采样
    pub resampled: bool,
    /// 组装时系列的影像数
    pub instance_count: usize,
    /// 影像自带的窗宽窗位
    pub default_window: Option<(f32, f32)>,
    pub pet: Option<PetAcquisition>,
}

impl Volume {
    /// 由已标定的体数据直接构造
    pub fn from_array(
        series_uid: impl Into<String>,
        modality: impl Into<String>,
        data: Array3<f32>,
        spacing: Spacing,
    ) -> Self {
        let depth = data.dim().0;
        Self {
            series_uid: series_uid.into(),
            modality: modality.into(),
            data,
            spacing,
            origin: None,
            acquired_slices: depth,
            zero_filled_slices: 0,
            interpolated: false,
            resampled: false,
            instance_count: depth,
            default_window: None,
            pet: None,
        }
    }

    /// (深度, 行, 列)
    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn depth(&self) -> usize {
        self.data.dim().0
    }

    pub fn rows(&self) -> usize {
        self.data.dim().1
    }

    pub fn columns(&self) -> usize {
        self.data.dim().2
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    /// 强度范围
    pub fn min_max(&self) -> (f32, f32) {
        min_max(self.data.iter().copied())
    }

    pub fn summary(&self) -> VolumeSummary {
        VolumeSummary {
            shape: self.shape(),
            spacing: self.spacing,
            interpolated: self.interpolated,
            resampled: self.resampled,
            acquired_slices: self.acquired_slices,
            zero_filled_slices: self.zero_filled_slices,
        }
    }
}

/// 随重建结果返回给客户端的体数据形状信息
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumeSummary {
    pub shape: (usize, usize, usize),
    pub spacing: Spacing,
    pub interpolated: bool,
    pub resampled: bool,
    pub acquired_slices: usize,
    pub zero_filled_slices: usize,
}

pub(crate) fn min_max(values: impl Iterator<Item = f32>) -> (f32, f32) {
    let (min, max) = values
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if min > max {
        (0.0, 0.0)
    } else {
        (min, max)
    }
}

/// 线性插值百分位（与 numpy 默认方式一致），`values` 会被排序
pub(crate) fn percentiles(values: &mut [f32], ranks: &[f64]) -> Vec<f32> {
    if values.is_empty() {
        return vec![0.0; ranks.len()];
    }
    values.par_sort_unstable_by(f32::total_cmp);
    let last = (values.len() - 1) as f64;
    ranks
        .iter()
        .map(|rank| {
            let position = (rank.clamp(0.0, 100.0) / 100.0) * last;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            let weight = (position - lower as f64) as f32;
            values[lower] + (values[upper] - values[lower]) * weight
        })
        .collect()
}

pub(crate) fn mean(values: impl Iterator<Item = f32>) -> Option<f32> {
    let (sum, count) = values.fold((0.0f64, 0usize), |(sum, count), v| (sum + v as f64, count + 1));
    (count > 0).then(|| (sum / count as f64) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_match_linear_interpolation() {
        let mut values: Vec<f32> = (1..=5).map(|v| v as f32).collect();
        values.reverse();
        let p = percentiles(&mut values, &[0.0, 50.0, 100.0, 25.0]);
        assert_eq!(p, vec![1.0, 3.0, 5.0, 2.0]);
    }

    #[test]
    fn test_min_max_ignores_nan() {
        assert_eq!(min_max([3.0, f32::NAN, -1.0].into_iter()), (-1.0, 3.0));
        assert_eq!(min_max(std::iter::empty()), (0.0, 0.0));
        assert_eq!(mean([1.0, 2.0, 3.0].into_iter()), Some(2.0));
        assert_eq!(mean(std::iter::empty()), None);
    }
}
