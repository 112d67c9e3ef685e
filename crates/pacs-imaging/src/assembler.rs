//! 体数据组装
//!
//! 切片按空间位置重新排序（到达顺序不可信），标定为物理强度后堆叠。
//! 切片过少时沿深度方向做样条插值，并可重采样为近似各向同性体素。

use crate::config::ImagingConfig;
use crate::error::{ReconstructionError, Result};
use crate::jobs::JobContext;
use crate::loader::{LoadedSeries, RawSlice, SliceHeader};
use crate::volume::{Spacing, Volume};
use ndarray::{s, Array2, Array3, Axis, Zip};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

/// 切片排序依据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceOrdering {
    /// 图像位置在切片法向量上的投影
    PositionAlongNormal,
    SliceLocation,
    InstanceNumber,
    /// 缺少全部空间信息时保持到达顺序
    Arrival,
}

/// 深度方向插值方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthInterpolation {
    Linear,
    /// Catmull-Rom 三次样条
    CubicSpline,
}

/// 体数据组装器
#[derive(Debug, Clone)]
pub struct VolumeAssembler {
    min_slices: usize,
    isotropic: bool,
    max_voxels: usize,
}

impl VolumeAssembler {
    pub fn new(config: &ImagingConfig) -> Self {
        Self {
            min_slices: config.min_slices,
            isotropic: config.isotropic_resampling,
            max_voxels: config.max_voxels,
        }
    }

    /// 组装系列；可读切片少于2张时返回 [`ReconstructionError::InsufficientData`]
    pub fn assemble(&self, mut series: LoadedSeries, ctx: &JobContext) -> Result<Volume> {
        ctx.stage(0.05, "排序切片")?;
        let ordering = order_slices(&mut series.slices);
        debug!("系列 {} 切片排序依据: {:?}", series.series_uid, ordering);

        let (rows, columns) = series
            .slices
            .iter()
            .find_map(|s| s.pixels.as_ref().map(|p| p.dim()))
            .ok_or_else(|| insufficient(&series.series_uid, 0))?;
        let readable = series
            .slices
            .iter()
            .filter(|s| s.pixels.as_ref().is_some_and(|p| p.dim() == (rows, columns)))
            .count();
        if readable < 2 {
            return Err(insufficient(&series.series_uid, readable));
        }

        ctx.stage(0.2, "标定并堆叠切片")?;
        let (row_spacing, column_spacing) = in_plane_spacing(&series.slices);
        let mut spacing = Spacing::new(depth_spacing(&series.slices, ordering), row_spacing, column_spacing);
        let (mut data, zero_filled) = stack_slices(&series.slices, rows, columns);
        if zero_filled > 0 {
            warn!("系列 {} 有 {} 张切片无法解码，已补零", series.series_uid, zero_filled);
        }
        let acquired = data.dim().0;

        let mut interpolated = false;
        if acquired < self.min_slices {
            ctx.stage(0.45, "薄层插值")?;
            let factor = (self.min_slices - 1).div_ceil(acquired - 1);
            let target = self.cap_depth((acquired - 1) * factor + 1, rows, columns);
            if target > acquired {
                spacing.depth *= (acquired - 1) as f32 / (target - 1) as f32;
                data = resample_depth(&data, target, DepthInterpolation::CubicSpline);
                interpolated = true;
                warn!(
                    "系列 {} 仅有 {} 张切片，已插值至 {} 张（含合成切片）",
                    series.series_uid, acquired, target
                );
            }
        }

        let mut resampled = false;
        if self.isotropic {
            ctx.stage(0.7, "各向同性重采样")?;
            let depth = data.dim().0;
            let in_plane = spacing.in_plane();
            if in_plane > 0.0 && spacing.depth > in_plane * 1.1 {
                let wanted = ((depth - 1) as f32 * spacing.depth / in_plane).round() as usize + 1;
                let target = self.cap_depth(wanted, rows, columns);
                if target > depth {
                    spacing.depth *= (depth - 1) as f32 / (target - 1) as f32;
                    data = resample_depth(&data, target, DepthInterpolation::Linear);
                    resampled = true;
                    debug!("系列 {} 重采样: {} -> {} 层", series.series_uid, depth, target);
                }
            }
        }

        ctx.stage(0.9, "体数据组装完成")?;
        let origin = series.slices.first().and_then(|s| s.header.image_position);
        let volume = Volume {
            series_uid: series.series_uid,
            modality: series.modality,
            data,
            spacing,
            origin,
            acquired_slices: acquired,
            zero_filled_slices: zero_filled,
            interpolated,
            resampled,
            instance_count: series.instance_count,
            default_window: series.default_window,
            pet: series.pet,
        };
        info!(
            "体数据组装完成 {}: {:?}, 间距 {:?}",
            volume.series_uid,
            volume.shape(),
            volume.spacing
        );
        Ok(volume)
    }

    /// 仅有一张可读切片时的单层体数据，用于降级显示
    pub fn single_slice(&self, series: LoadedSeries) -> Result<Volume> {
        let slice = series
            .slices
            .iter()
            .find(|s| s.pixels.is_some())
            .ok_or_else(|| insufficient(&series.series_uid, 0))?;
        let (rows, columns) = slice.pixels.as_ref().map(|p| p.dim()).unwrap_or_default();
        let (row_spacing, column_spacing) = in_plane_spacing(&series.slices);
        let thickness = slice.header.slice_thickness.map(|t| t as f32).unwrap_or(1.0);
        let (data, _) = stack_slices(std::slice::from_ref(slice), rows, columns);

        Ok(Volume {
            origin: slice.header.image_position,
            series_uid: series.series_uid,
            modality: series.modality,
            data,
            spacing: Spacing::new(thickness, row_spacing, column_spacing),
            acquired_slices: 1,
            zero_filled_slices: 0,
            interpolated: false,
            resampled: false,
            instance_count: series.instance_count,
            default_window: series.default_window,
            pet: series.pet,
        })
    }

    fn cap_depth(&self, depth: usize, rows: usize, columns: usize) -> usize {
        let plane = (rows * columns).max(1);
        depth.min(self.max_voxels / plane)
    }
}

fn insufficient(series_uid: &str, readable: usize) -> ReconstructionError {
    ReconstructionError::InsufficientData(format!("系列 {} 仅有 {} 张可读切片，至少需要2张", series_uid, readable))
}

/// 按空间信息排序切片，返回采用的排序依据
pub fn order_slices(slices: &mut [RawSlice]) -> SliceOrdering {
    let normal = slices.iter().find_map(|s| s.header.image_orientation).map(slice_normal);
    let ordering = match normal {
        Some(_) if slices.iter().all(|s| s.header.image_position.is_some()) => SliceOrdering::PositionAlongNormal,
        _ if slices.iter().all(|s| s.header.slice_location.is_some()) => SliceOrdering::SliceLocation,
        _ if slices.iter().all(|s| s.header.instance_number.is_some()) => SliceOrdering::InstanceNumber,
        _ => SliceOrdering::Arrival,
    };
    if ordering == SliceOrdering::Arrival {
        warn!("切片缺少位置信息，保持到达顺序");
        return ordering;
    }

    let normal = normal.unwrap_or([0.0, 0.0, 1.0]);
    slices.sort_by(|a, b| sort_key(&a.header, ordering, normal).total_cmp(&sort_key(&b.header, ordering, normal)));
    ordering
}

fn sort_key(header: &SliceHeader, ordering: SliceOrdering, normal: [f64; 3]) -> f64 {
    match ordering {
        SliceOrdering::PositionAlongNormal => header.image_position.map(|p| dot(p, normal)).unwrap_or_default(),
        SliceOrdering::SliceLocation => header.slice_location.unwrap_or_default(),
        SliceOrdering::InstanceNumber => header.instance_number.unwrap_or_default() as f64,
        SliceOrdering::Arrival => 0.0,
    }
}

/// 行、列方向余弦的叉积
fn slice_normal(orientation: [f64; 6]) -> [f64; 3] {
    let [rx, ry, rz, cx, cy, cz] = orientation;
    [ry * cz - rz * cy, rz * cx - rx * cz, rx * cy - ry * cx]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// 已排序切片的层间距：相邻位置差的中位数，其次为层厚
fn depth_spacing(slices: &[RawSlice], ordering: SliceOrdering) -> f32 {
    let normal = slices
        .iter()
        .find_map(|s| s.header.image_orientation)
        .map(slice_normal)
        .unwrap_or([0.0, 0.0, 1.0]);
    let positions: Vec<f64> = match ordering {
        SliceOrdering::PositionAlongNormal | SliceOrdering::SliceLocation => {
            slices.iter().map(|s| sort_key(&s.header, ordering, normal)).collect()
        }
        _ => Vec::new(),
    };
    let mut gaps: Vec<f64> = positions
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .filter(|gap| *gap > 1e-6)
        .collect();
    if !gaps.is_empty() {
        gaps.sort_by(f64::total_cmp);
        return gaps[gaps.len() / 2] as f32;
    }
    slices
        .iter()
        .find_map(|s| s.header.slice_thickness)
        .filter(|t| *t > 0.0)
        .map(|t| t as f32)
        .unwrap_or(1.0)
}

fn in_plane_spacing(slices: &[RawSlice]) -> (f32, f32) {
    slices
        .iter()
        .find_map(|s| s.header.pixel_spacing)
        .filter(|[r, c]| *r > 0.0 && *c > 0.0)
        .map(|[r, c]| (r as f32, c as f32))
        .unwrap_or((1.0, 1.0))
}

/// 标定并堆叠切片；缺失或尺寸不符的切片补零
fn stack_slices(slices: &[RawSlice], rows: usize, columns: usize) -> (Array3<f32>, usize) {
    let mut volume = Array3::<f32>::zeros((slices.len(), rows, columns));
    let mut zero_filled = 0;
    for (i, slice) in slices.iter().enumerate() {
        match &slice.pixels {
            Some(pixels) if pixels.dim() == (rows, columns) => {
                let slope = slice.header.rescale_slope as f32;
                let intercept = slice.header.rescale_intercept as f32;
                volume
                    .slice_mut(s![i, .., ..])
                    .assign(&pixels.mapv(|v| v * slope + intercept));
            }
            _ => zero_filled += 1,
        }
    }
    (volume, zero_filled)
}

/// 沿深度方向重采样到 `new_depth` 层，首末层保持不变
pub fn resample_depth(data: &Array3<f32>, new_depth: usize, method: DepthInterpolation) -> Array3<f32> {
    let (depth, rows, columns) = data.dim();
    if depth < 2 || new_depth < 2 || new_depth == depth {
        return data.clone();
    }
    let scale = (depth - 1) as f32 / (new_depth - 1) as f32;
    let layer = |j: isize| data.index_axis(Axis(0), j.clamp(0, depth as isize - 1) as usize);

    let planes: Vec<Array2<f32>> = (0..new_depth)
        .into_par_iter()
        .map(|k| {
            let t = k as f32 * scale;
            let i = (t.floor() as usize).min(depth - 2) as isize;
            let f = t - i as f32;
            match method {
                DepthInterpolation::Linear => Zip::from(layer(i))
                    .and(layer(i + 1))
                    .map_collect(|&a, &b| a + (b - a) * f),
                DepthInterpolation::CubicSpline => Zip::from(layer(i - 1))
                    .and(layer(i))
                    .and(layer(i + 1))
                    .and(layer(i + 2))
                    .map_collect(|&p0, &p1, &p2, &p3| catmull_rom(p0, p1, p2, p3, f)),
            }
        })
        .collect();

    let mut out = Array3::<f32>::zeros((new_depth, rows, columns));
    for (k, plane) in planes.iter().enumerate() {
        out.index_axis_mut(Axis(0), k).assign(plane);
    }
    out
}

fn catmull_rom(p0: f32, p1: f32, p2: f32, p3: f32, t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * (2.0 * p1
        + (p2 - p0) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (3.0 * p1 - p0 - 3.0 * p2 + p3) * t3)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AXIAL: [f64; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

    fn slice(value: f32, z: f64) -> RawSlice {
        let mut header = SliceHeader::new(format!("1.2.3.1.{}", value));
        header.image_orientation = Some(AXIAL);
        header.image_position = Some([0.0, 0.0, z]);
        header.pixel_spacing = Some([1.0, 1.0]);
        RawSlice::new(header, Array2::from_elem((4, 4), value))
    }

    fn assembler(min_slices: usize, isotropic: bool) -> VolumeAssembler {
        VolumeAssembler::new(&ImagingConfig {
            min_slices,
            isotropic_resampling: isotropic,
            ..Default::default()
        })
    }

    #[test]
    fn test_shuffled_slices_are_ordered_along_normal() {
        // 到达顺序被打乱
        let slices = [3, 0, 4, 1, 2].iter().map(|&k| slice(k as f32, k as f64 * 2.5)).collect();
        let series = LoadedSeries::new("1.2.3.1", "CT", slices);

        let volume = assembler(2, false).assemble(series, &JobContext::detached()).unwrap();
        assert_eq!(volume.shape(), (5, 4, 4));
        for k in 0..5 {
            assert_eq!(volume.data[[k, 1, 1]], k as f32);
        }
        assert!((volume.spacing.depth - 2.5).abs() < 1e-6);
        assert!(!volume.interpolated);
    }

    #[test]
    fn test_oblique_normal_projection() {
        // 法向量为 (0, 1, 0)：按 y 坐标排序，忽略 z
        let coronal = [1.0, 0.0, 0.0, 0.0, 0.0, -1.0];
        let mut slices: Vec<RawSlice> = [(0.0, 9.0, 1.0), (1.0, 3.0, 2.0), (2.0, 6.0, 0.0)]
            .iter()
            .map(|&(value, y, z)| {
                let mut s = slice(value, z);
                s.header.image_orientation = Some(coronal);
                s.header.image_position = Some([0.0, y, z]);
                s
            })
            .collect();

        assert_eq!(order_slices(&mut slices), SliceOrdering::PositionAlongNormal);
        let order: Vec<f32> = slices.iter().map(|s| s.pixels.as_ref().unwrap()[[0, 0]]).collect();
        assert_eq!(order, vec![1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_ordering_fallbacks() {
        let mut slices: Vec<RawSlice> = (0..3)
            .map(|k| {
                let mut header = SliceHeader::new(format!("{}", k));
                header.slice_location = Some(10.0 - k as f64);
                header.instance_number = Some(k);
                RawSlice::new(header, Array2::from_elem((2, 2), k as f32))
            })
            .collect();
        assert_eq!(order_slices(&mut slices), SliceOrdering::SliceLocation);
        assert_eq!(slices[0].header.instance_number, Some(2));

        slices.iter_mut().for_each(|s| s.header.slice_location = None);
        assert_eq!(order_slices(&mut slices), SliceOrdering::InstanceNumber);
        assert_eq!(slices[0].header.instance_number, Some(0));

        slices.iter_mut().for_each(|s| s.header.instance_number = None);
        assert_eq!(order_slices(&mut slices), SliceOrdering::Arrival);
    }

    #[test]
    fn test_rescale_is_applied() {
        let mut slices: Vec<RawSlice> = (0..2).map(|k| slice(1000.0, k as f64)).collect();
        for s in &mut slices {
            s.header.rescale_slope = 2.0;
            s.header.rescale_intercept = -1024.0;
        }
        let volume = assembler(2, false)
            .assemble(LoadedSeries::new("s", "CT", slices), &JobContext::detached())
            .unwrap();
        assert_eq!(volume.data[[0, 0, 0]], 976.0);
    }

    #[test]
    fn test_corrupt_slice_is_zero_filled() {
        let mut slices = vec![slice(5.0, 0.0), slice(5.0, 1.0), slice(5.0, 2.0)];
        slices[1].pixels = None;
        let volume = assembler(2, false)
            .assemble(LoadedSeries::new("s", "CT", slices), &JobContext::detached())
            .unwrap();
        assert_eq!(volume.zero_filled_slices, 1);
        assert_eq!(volume.data[[1, 2, 2]], 0.0);
        assert_eq!(volume.data[[2, 2, 2]], 5.0);
    }

    #[test]
    fn test_fewer_than_two_readable_slices_is_insufficient() {
        let mut slices = vec![slice(1.0, 0.0), slice(1.0, 1.0)];
        slices[0].pixels = None;
        let series = LoadedSeries::new("s", "CT", slices);

        let err = assembler(2, false).assemble(series.clone(), &JobContext::detached()).unwrap_err();
        assert_eq!(err.kind(), "insufficient_data");

        let single = assembler(2, false).single_slice(series).unwrap();
        assert_eq!(single.shape(), (1, 4, 4));
    }

    #[test]
    fn test_thin_stack_is_interpolated_and_flagged() {
        let slices = (0..4).map(|k| slice(k as f32 * 10.0, k as f64 * 3.0)).collect();
        let volume = assembler(8, false)
            .assemble(LoadedSeries::new("s", "CT", slices), &JobContext::detached())
            .unwrap();

        assert!(volume.interpolated);
        assert_eq!(volume.acquired_slices, 4);
        assert_eq!(volume.depth(), 10);
        assert!((volume.spacing.depth - 1.0).abs() < 1e-5);
        // 采集层保持原值
        assert!((volume.data[[3, 0, 0]] - 10.0).abs() < 1e-3);
        assert!((volume.data[[9, 0, 0]] - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_isotropic_resampling_respects_voxel_ceiling() {
        let slices: Vec<RawSlice> = (0..3).map(|k| slice(k as f32, k as f64 * 3.0)).collect();
        let volume = assembler(2, true)
            .assemble(LoadedSeries::new("s", "CT", slices.clone()), &JobContext::detached())
            .unwrap();
        assert!(volume.resampled);
        assert_eq!(volume.depth(), 7);
        assert!((volume.data[[1, 0, 0]] - 1.0 / 3.0).abs() < 1e-5);

        let capped = VolumeAssembler::new(&ImagingConfig {
            min_slices: 2,
            max_voxels: 5 * 16,
            ..Default::default()
        })
        .assemble(LoadedSeries::new("s", "CT", slices), &JobContext::detached())
        .unwrap();
        assert_eq!(capped.depth(), 5);
    }

    #[test]
    fn test_cancelled_assembly() {
        let (ctx, handle) = JobContext::new();
        handle.cancel();
        let series = LoadedSeries::new("s", "CT", vec![slice(1.0, 0.0), slice(1.0, 1.0)]);
        assert_eq!(
            assembler(2, false).assemble(series, &ctx).unwrap_err(),
            ReconstructionError::Cancelled
        );
    }
}
