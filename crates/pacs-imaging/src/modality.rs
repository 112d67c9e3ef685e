//! 模态相关分析：CT骨骼、MRI组织分割、PET SUV热点、SPECT灌注缺损
//!
//! 各分析都是在阈值分割、形态学与投影这些基础操作之上的策略，常量来自 [`ModalityPresets`]。

use crate::config::{ImagingConfig, MriPresets, PetPresets, SpectPresets};
use crate::error::{ReconstructionError, Result};
use crate::jobs::JobContext;
use crate::morphology::{closing, fill_holes, label_components, threshold_mask};
use crate::projection::{project_all, ProjectionMode, ProjectionSet};
use crate::surface::{decimate, mask_surface, Mesh};
use crate::volume::{mean, percentiles, PetAcquisition, Spacing, Volume};
use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 分割后处理与表面提取选项
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceOptions {
    pub closing: bool,
    pub fill_holes: bool,
    pub mesh: bool,
    pub mesh_ceiling: usize,
    pub mesh_target: usize,
}

impl SurfaceOptions {
    pub fn from_config(config: &ImagingConfig) -> Self {
        Self {
            closing: true,
            fill_holes: true,
            mesh: true,
            mesh_ceiling: config.mesh_vertex_ceiling,
            mesh_target: config.mesh_vertex_target,
        }
    }
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self::from_config(&ImagingConfig::default())
    }
}

/// 分割区域统计
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TissueStats {
    pub voxel_count: usize,
    pub volume_mm3: f64,
    pub mean: f32,
    pub max: f32,
}

impl TissueStats {
    fn measure(values: &Array3<f32>, mask: &Array3<bool>, spacing: Spacing) -> Self {
        let selected: Vec<f32> = Zip::from(values)
            .and(mask)
            .fold(Vec::new(), |mut acc, &v, &m| {
                if m {
                    acc.push(v);
                }
                acc
            });
        let max = selected.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Self {
            voxel_count: selected.len(),
            volume_mm3: selected.len() as f64 * spacing.voxel_volume(),
            mean: mean(selected.iter().copied()).unwrap_or(0.0),
            max: if selected.is_empty() { 0.0 } else { max },
        }
    }
}

fn postprocess(mask: Array3<bool>, options: &SurfaceOptions) -> Array3<bool> {
    let mask = if options.closing { closing(&mask) } else { mask };
    if options.fill_holes {
        fill_holes(&mask)
    } else {
        mask
    }
}

fn surface(mask: &Array3<bool>, spacing: Spacing, options: &SurfaceOptions) -> Result<Option<Mesh>> {
    if !options.mesh {
        return Ok(None);
    }
    let mesh = mask_surface(mask, spacing)?;
    Ok(Some(decimate(mesh, options.mesh_ceiling, options.mesh_target)))
}

fn masked(values: &Array3<f32>, mask: &Array3<bool>) -> Array3<f32> {
    Zip::from(values).and(mask).map_collect(|&v, &m| if m { v } else { 0.0 })
}

/// CT骨骼重建结果
#[derive(Debug, Clone)]
pub struct BoneAnalysis {
    pub threshold_hu: f32,
    pub stats: TissueStats,
    pub mesh: Option<Mesh>,
    /// 骨掩膜内的MIP
    pub projections: ProjectionSet,
}

/// 骨骼分割：HU阈值、形态学清理、表面提取、掩膜MIP
pub fn analyze_bone(volume: &Volume, threshold_hu: f32, options: &SurfaceOptions, ctx: &JobContext) -> Result<BoneAnalysis> {
    ctx.stage(0.1, "骨组织分割")?;
    let mask = threshold_mask(&volume.data, threshold_hu);

    ctx.stage(0.3, "形态学处理")?;
    let mask = postprocess(mask, options);
    let stats = TissueStats::measure(&volume.data, &mask, volume.spacing);

    ctx.stage(0.5, "生成骨表面")?;
    let mesh = surface(&mask, volume.spacing, options)?;

    ctx.stage(0.85, "生成投影")?;
    let projections = project_all(masked(&volume.data, &mask).view(), ProjectionMode::Max)?;

    info!(
        "骨骼重建完成 {}: {} 体素, {:.1} mm³",
        volume.series_uid, stats.voxel_count, stats.volume_mm3
    );
    Ok(BoneAnalysis {
        threshold_hu,
        stats,
        mesh,
        projections,
    })
}

/// MRI组织类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TissueType {
    Brain,
    Generic,
}

/// MRI组织分割结果
#[derive(Debug, Clone)]
pub struct MriAnalysis {
    pub tissue: TissueType,
    /// 归一化强度上的阈值
    pub threshold: f32,
    /// 归一化强度统计
    pub stats: TissueStats,
    pub mesh: Option<Mesh>,
    pub projections: ProjectionSet,
}

/// MRI组织分割：百分位归一化、高斯降噪、均值比例阈值
pub fn analyze_mri(
    volume: &Volume,
    tissue: TissueType,
    presets: &MriPresets,
    options: &SurfaceOptions,
    ctx: &JobContext,
) -> Result<MriAnalysis> {
    ctx.stage(0.1, "MRI强度归一化")?;
    let mut values: Vec<f32> = volume.data.iter().copied().collect();
    let bounds = percentiles(&mut values, &[presets.low_percentile, presets.high_percentile]);
    let (low, high) = (bounds[0], bounds[1]);
    if !(high - low > f32::EPSILON) {
        return Err(ReconstructionError::InsufficientData("MRI强度无变化，无法分割".to_string()));
    }
    let normalized = volume.data.mapv(|v| ((v - low) / (high - low)).clamp(0.0, 1.0));

    ctx.stage(0.3, "降噪")?;
    let smoothed = gaussian_smooth(&normalized, presets.smoothing_sigma);

    ctx.stage(0.5, "组织分割")?;
    let factor = match tissue {
        TissueType::Brain => presets.brain_threshold_factor,
        TissueType::Generic => presets.generic_threshold_factor,
    };
    let threshold = mean(smoothed.iter().copied().filter(|v| *v > 0.0)).unwrap_or(0.0) * factor;
    let mask = postprocess(smoothed.mapv(|v| v > threshold), options);
    let stats = TissueStats::measure(&smoothed, &mask, volume.spacing);

    ctx.stage(0.7, "生成组织表面")?;
    let mesh = surface(&mask, volume.spacing, options)?;

    ctx.stage(0.9, "生成投影")?;
    let projections = project_all(masked(&smoothed, &mask).view(), ProjectionMode::Max)?;

    info!("MRI {:?} 分割完成 {}: {} 体素", tissue, volume.series_uid, stats.voxel_count);
    Ok(MriAnalysis {
        tissue,
        threshold,
        stats,
        mesh,
        projections,
    })
}

/// 可分离三维高斯平滑，边界取最近值
pub fn gaussian_smooth(data: &Array3<f32>, sigma: f32) -> Array3<f32> {
    if !(sigma > 0.0) {
        return data.clone();
    }
    let radius = (3.0 * sigma).ceil().max(1.0) as isize;
    let weights: Vec<f32> = (-radius..=radius)
        .map(|k| (-(k * k) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f32 = weights.iter().sum();
    let weights: Vec<f32> = weights.iter().map(|w| w / total).collect();

    let dim = data.dim();
    let extents = [dim.0, dim.1, dim.2];
    let mut current = data.clone();
    for axis in 0..3 {
        let source = current;
        current = Array3::from_shape_fn(dim, |(z, y, x)| {
            let mut index = [z, y, x];
            let centre = index[axis] as isize;
            let mut sum = 0.0;
            for (offset, w) in (-radius..=radius).zip(&weights) {
                index[axis] = (centre + offset).clamp(0, extents[axis] as isize - 1) as usize;
                sum += w * source[index];
            }
            sum
        });
    }
    current
}

/// PET热点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hotspot {
    /// 按 SUVmax 降序的名次，从1开始
    pub rank: usize,
    pub voxel_count: usize,
    pub volume_ml: f64,
    pub suv_max: f32,
    pub suv_mean: f32,
    /// 体素坐标（深度, 行, 列）
    pub centroid: [f32; 3],
}

/// PET SUV分析结果
#[derive(Debug, Clone)]
pub struct PetAnalysis {
    pub suv_threshold: f32,
    /// 衰减校正后的剂量 / 体重换算系数
    pub suv_factor: f64,
    pub suv_max: f32,
    pub hotspots: Vec<Hotspot>,
    pub projections: ProjectionSet,
}

/// 体重SUV换算系数：体重(g) / 衰减校正后剂量(Bq)
pub fn suv_factor(pet: &PetAcquisition, presets: &PetPresets) -> Result<f64> {
    let weight_kg = pet.patient_weight_kg.filter(|w| *w > 0.0);
    let dose = pet.injected_dose_bq.filter(|d| *d > 0.0);
    let (Some(weight_kg), Some(dose)) = (weight_kg, dose) else {
        return Err(ReconstructionError::InsufficientData(
            "缺少患者体重或注射剂量，无法计算SUV".to_string(),
        ));
    };
    let half_life = pet
        .half_life_secs
        .filter(|h| *h > 0.0)
        .unwrap_or(presets.default_half_life_secs);
    let decayed = match pet.elapsed_secs {
        Some(elapsed) => dose * (-std::f64::consts::LN_2 * elapsed / half_life).exp(),
        None => {
            warn!("缺少注射时间，SUV未做衰减校正");
            dose
        }
    };
    Ok(weight_kg * 1000.0 / decayed)
}

/// PET SUV分析：SUV换算、阈值以上的连通热点排序
pub fn analyze_pet(volume: &Volume, presets: &PetPresets, ctx: &JobContext) -> Result<PetAnalysis> {
    ctx.stage(0.1, "计算SUV")?;
    let pet = volume
        .pet
        .as_ref()
        .ok_or_else(|| ReconstructionError::InsufficientData("系列缺少PET剂量信息".to_string()))?;
    let factor = suv_factor(pet, presets)?;
    let suv = volume.data.mapv(|v| (v as f64 * factor) as f32);

    ctx.stage(0.4, "检测热点")?;
    let mask = threshold_mask(&suv, presets.suv_threshold);
    let (labels, components) = label_components(&mask);

    let mut peaks = vec![f32::NEG_INFINITY; components.len()];
    let mut sums = vec![0.0f64; components.len()];
    Zip::from(&labels).and(&suv).for_each(|&label, &value| {
        if label > 0 {
            let i = label as usize - 1;
            peaks[i] = peaks[i].max(value);
            sums[i] += value as f64;
        }
    });
    let voxel_ml = volume.spacing.voxel_volume() / 1000.0;
    let mut hotspots: Vec<Hotspot> = components
        .iter()
        .enumerate()
        .map(|(i, c)| Hotspot {
            rank: 0,
            voxel_count: c.voxel_count,
            volume_ml: c.voxel_count as f64 * voxel_ml,
            suv_max: peaks[i],
            suv_mean: (sums[i] / c.voxel_count as f64) as f32,
            centroid: c.centroid,
        })
        .collect();
    hotspots.sort_by(|a, b| b.suv_max.total_cmp(&a.suv_max));
    hotspots.truncate(presets.max_hotspots);
    for (i, hotspot) in hotspots.iter_mut().enumerate() {
        hotspot.rank = i + 1;
    }

    ctx.stage(0.8, "生成SUV投影")?;
    let projections = project_all(suv.view(), ProjectionMode::Max)?;
    let suv_max = suv.iter().copied().fold(0.0f32, f32::max);

    info!(
        "PET分析完成 {}: SUVmax {:.2}, {} 个热点",
        volume.series_uid,
        suv_max,
        hotspots.len()
    );
    Ok(PetAnalysis {
        suv_threshold: presets.suv_threshold,
        suv_factor: factor,
        suv_max,
        hotspots,
        projections,
    })
}

/// 灌注缺损区域
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefectRegion {
    pub voxel_count: usize,
    pub volume_ml: f64,
    /// 相对参考摄取的平均值
    pub mean_relative_uptake: f32,
    pub centroid: [f32; 3],
}

/// SPECT灌注分析结果
#[derive(Debug, Clone)]
pub struct SpectAnalysis {
    pub reference_uptake: f32,
    pub myocardium_voxels: usize,
    pub defect_voxels: usize,
    /// 缺损体素占心肌区域的百分比
    pub defect_extent_percent: f32,
    pub defects: Vec<DefectRegion>,
    pub projections: ProjectionSet,
}

/// SPECT心肌灌注：以心肌区域高百分位为参考，低于参考比例的体素为缺损
pub fn analyze_spect(volume: &Volume, presets: &SpectPresets, ctx: &JobContext) -> Result<SpectAnalysis> {
    ctx.stage(0.1, "识别心肌区域")?;
    let (_, max) = volume.min_max();
    if !(max > 0.0) {
        return Err(ReconstructionError::InsufficientData("SPECT计数为零".to_string()));
    }
    let region = threshold_mask(&volume.data, max * presets.myocardium_fraction);
    let mut region_values: Vec<f32> = Zip::from(&volume.data)
        .and(&region)
        .fold(Vec::new(), |mut acc, &v, &m| {
            if m {
                acc.push(v);
            }
            acc
        });
    let myocardium_voxels = region_values.len();
    let reference = percentiles(&mut region_values, &[presets.reference_percentile])[0];

    ctx.stage(0.4, "检测灌注缺损")?;
    let cutoff = reference * presets.defect_fraction;
    let defect_mask = Zip::from(&volume.data)
        .and(&region)
        .map_collect(|&v, &m| m && v < cutoff);
    let (labels, components) = label_components(&defect_mask);

    let mut sums = vec![0.0f64; components.len()];
    Zip::from(&labels).and(&volume.data).for_each(|&label, &value| {
        if label > 0 {
            sums[label as usize - 1] += value as f64;
        }
    });
    let voxel_ml = volume.spacing.voxel_volume() / 1000.0;
    let defects: Vec<DefectRegion> = components
        .iter()
        .enumerate()
        .filter(|(_, c)| c.voxel_count >= presets.min_defect_voxels)
        .map(|(i, c)| DefectRegion {
            voxel_count: c.voxel_count,
            volume_ml: c.voxel_count as f64 * voxel_ml,
            mean_relative_uptake: (sums[i] / c.voxel_count as f64) as f32 / reference,
            centroid: c.centroid,
        })
        .collect();
    let defect_voxels: usize = defects.iter().map(|d| d.voxel_count).sum();
    let defect_extent_percent = defect_voxels as f32 / myocardium_voxels.max(1) as f32 * 100.0;

    ctx.stage(0.8, "生成投影")?;
    let projections = project_all(volume.data.view(), ProjectionMode::Max)?;

    info!(
        "SPECT分析完成 {}: 缺损范围 {:.1}%, {} 个区域",
        volume.series_uid,
        defect_extent_percent,
        defects.len()
    );
    Ok(SpectAnalysis {
        reference_uptake: reference,
        myocardium_voxels,
        defect_voxels,
        defect_extent_percent,
        defects,
        projections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> JobContext {
        JobContext::detached()
    }

    fn no_mesh() -> SurfaceOptions {
        SurfaceOptions {
            mesh: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_bone_analysis_statistics() {
        // 空气背景中的 3×3×3 骨块
        let mut data = Array3::from_elem((7, 7, 7), -1000.0f32);
        for z in 2..5 {
            for y in 2..5 {
                for x in 2..5 {
                    data[[z, y, x]] = 700.0;
                }
            }
        }
        data[[3, 3, 3]] = 1200.0;
        let volume = Volume::from_array("s", "CT", data, Spacing::new(2.0, 0.5, 0.5));

        let bone = analyze_bone(&volume, 200.0, &SurfaceOptions::default(), &ctx()).unwrap();
        assert_eq!(bone.stats.voxel_count, 27);
        assert!((bone.stats.volume_mm3 - 13.5).abs() < 1e-9);
        assert_eq!(bone.stats.max, 1200.0);
        assert!(bone.mesh.as_ref().is_some_and(|m| !m.is_empty()));
        assert_eq!(bone.projections.axial[[3, 3]], 1200.0);
        assert_eq!(bone.projections.axial[[0, 0]], 0.0);
    }

    #[test]
    fn test_mri_segmentation_finds_bright_region() {
        let data = Array3::from_shape_fn((8, 8, 8), |(z, y, x)| {
            if (2..6).contains(&z) && (2..6).contains(&y) && (2..6).contains(&x) {
                800.0
            } else {
                10.0
            }
        });
        let volume = Volume::from_array("s", "MR", data, Spacing::default());
        let mri = analyze_mri(&volume, TissueType::Brain, &MriPresets::default(), &no_mesh(), &ctx()).unwrap();

        assert!(mri.stats.voxel_count >= 64);
        assert!(mri.stats.voxel_count < 512);
        assert!(mri.projections.axial[[4, 4]] > 0.5);

        let flat = Volume::from_array("s", "MR", Array3::from_elem((3, 3, 3), 5.0), Spacing::default());
        let err = analyze_mri(&flat, TissueType::Generic, &MriPresets::default(), &no_mesh(), &ctx()).unwrap_err();
        assert_eq!(err.kind(), "insufficient_data");
    }

    #[test]
    fn test_gaussian_preserves_constant_field() {
        let data = Array3::from_elem((4, 5, 6), 3.0f32);
        let smoothed = gaussian_smooth(&data, 1.0);
        assert!(smoothed.iter().all(|v| (v - 3.0).abs() < 1e-5));
    }

    #[test]
    fn test_suv_factor_with_decay() {
        let presets = PetPresets::default();
        let pet = PetAcquisition {
            patient_weight_kg: Some(70.0),
            injected_dose_bq: Some(370e6),
            half_life_secs: None,
            elapsed_secs: Some(6586.2),
        };
        // 经过一个半衰期，剂量减半
        let factor = suv_factor(&pet, &presets).unwrap();
        assert!((factor - 70_000.0 / 185e6).abs() < 1e-12);

        let missing = PetAcquisition {
            injected_dose_bq: None,
            ..pet
        };
        assert_eq!(suv_factor(&missing, &presets).unwrap_err().kind(), "insufficient_data");
    }

    #[test]
    fn test_pet_hotspots_ranked_by_suv_max() {
        let mut data = Array3::from_elem((6, 6, 6), 1000.0f32);
        data[[1, 1, 1]] = 6000.0;
        data[[1, 1, 2]] = 5000.0;
        data[[4, 4, 4]] = 9000.0;
        let mut volume = Volume::from_array("s", "PT", data, Spacing::default());
        // 体重 1kg、剂量 1000 kBq：SUV = 活度 / 1000
        volume.pet = Some(PetAcquisition {
            patient_weight_kg: Some(1.0),
            injected_dose_bq: Some(1_000_000.0),
            half_life_secs: None,
            elapsed_secs: None,
        });

        let pet = analyze_pet(&volume, &PetPresets::default(), &ctx()).unwrap();
        assert_eq!(pet.hotspots.len(), 2);
        assert_eq!(pet.hotspots[0].rank, 1);
        assert!((pet.hotspots[0].suv_max - 9.0).abs() < 1e-4);
        assert_eq!(pet.hotspots[0].centroid, [4.0, 4.0, 4.0]);
        assert_eq!(pet.hotspots[1].voxel_count, 2);
        assert!((pet.hotspots[1].suv_mean - 5.5).abs() < 1e-4);
        assert!((pet.suv_max - 9.0).abs() < 1e-4);

        volume.pet = None;
        assert!(analyze_pet(&volume, &PetPresets::default(), &ctx()).is_err());
    }

    #[test]
    fn test_spect_defect_extent() {
        // 心肌区域 4×4×4，其中一个 2×2×2 角落摄取降低
        let mut data = Array3::from_elem((6, 6, 6), 0.0f32);
        for z in 1..5 {
            for y in 1..5 {
                for x in 1..5 {
                    data[[z, y, x]] = if z < 3 && y < 3 && x < 3 { 40.0 } else { 100.0 };
                }
            }
        }
        let volume = Volume::from_array("s", "NM", data, Spacing::default());
        let spect = analyze_spect(&volume, &SpectPresets::default(), &ctx()).unwrap();

        assert_eq!(spect.myocardium_voxels, 64);
        assert_eq!(spect.reference_uptake, 100.0);
        assert_eq!(spect.defect_voxels, 8);
        assert_eq!(spect.defects.len(), 1);
        assert!((spect.defect_extent_percent - 12.5).abs() < 1e-4);
        assert!((spect.defects[0].mean_relative_uptake - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_analysis_honours_cancellation() {
        let (context, handle) = JobContext::new();
        handle.cancel();
        let volume = Volume::from_array("s", "CT", Array3::zeros((2, 2, 2)), Spacing::default());
        assert_eq!(
            analyze_bone(&volume, 200.0, &no_mesh(), &context).unwrap_err(),
            ReconstructionError::Cancelled
        );
    }
}
