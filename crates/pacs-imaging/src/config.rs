//! 重建配置与模态预设

use serde::{Deserialize, Serialize};

/// 重建引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    /// 体数据缓存容量（系列数）
    pub volume_cache_capacity: usize,
    /// 切片图像缓存容量
    pub slice_cache_capacity: usize,
    /// 低于该切片数时沿深度方向插值
    pub min_slices: usize,
    /// 是否重采样为近似各向同性体素
    pub isotropic_resampling: bool,
    /// 重采样后的体素数上限
    pub max_voxels: usize,
    /// 重建线程数，0 表示使用全部CPU核心
    pub worker_threads: usize,
    /// 网格顶点数上限，超过后抽稀
    pub mesh_vertex_ceiling: usize,
    /// 抽稀目标顶点数
    pub mesh_vertex_target: usize,
    pub presets: ModalityPresets,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            volume_cache_capacity: 6,
            slice_cache_capacity: 800,
            min_slices: 32,
            isotropic_resampling: true,
            max_voxels: 256 * 1024 * 1024,
            worker_threads: 0,
            mesh_vertex_ceiling: 50_000,
            mesh_vertex_target: 25_000,
            presets: ModalityPresets::default(),
        }
    }
}

impl ImagingConfig {
    /// 检查配置取值
    pub fn validate(&self) -> Result<(), String> {
        if self.volume_cache_capacity == 0 || self.slice_cache_capacity == 0 {
            return Err("缓存容量必须大于0".to_string());
        }
        if self.min_slices < 2 {
            return Err("最小切片数不能小于2".to_string());
        }
        if self.max_voxels == 0 {
            return Err("体素数上限必须大于0".to_string());
        }
        if self.mesh_vertex_target == 0 || self.mesh_vertex_target > self.mesh_vertex_ceiling {
            return Err("网格抽稀目标必须在 1..=顶点上限 之间".to_string());
        }
        Ok(())
    }
}

/// 各模态的阈值与常量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ModalityPresets {
    pub ct: CtPresets,
    pub mri: MriPresets,
    pub pet: PetPresets,
    pub spect: SpectPresets,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtPresets {
    /// 骨阈值 (HU)
    pub bone_threshold_hu: f32,
    pub soft_tissue_window_width: f32,
    pub soft_tissue_window_level: f32,
    pub bone_window_width: f32,
    pub bone_window_level: f32,
}

impl Default for CtPresets {
    fn default() -> Self {
        Self {
            bone_threshold_hu: 200.0,
            soft_tissue_window_width: 400.0,
            soft_tissue_window_level: 40.0,
            bone_window_width: 2000.0,
            bone_window_level: 500.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MriPresets {
    /// 强度归一化的下/上百分位
    pub low_percentile: f64,
    pub high_percentile: f64,
    /// 降噪高斯核标准差（体素）
    pub smoothing_sigma: f32,
    /// 脑组织阈值 = 非零均值 × 该系数
    pub brain_threshold_factor: f32,
    pub generic_threshold_factor: f32,
}

impl Default for MriPresets {
    fn default() -> Self {
        Self {
            low_percentile: 1.0,
            high_percentile: 99.0,
            smoothing_sigma: 0.5,
            brain_threshold_factor: 0.3,
            generic_threshold_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PetPresets {
    /// 未提供核素半衰期时使用的 F-18 半衰期（秒）
    pub default_half_life_secs: f64,
    pub suv_threshold: f32,
    pub max_hotspots: usize,
}

impl Default for PetPresets {
    fn default() -> Self {
        Self {
            default_half_life_secs: 6586.2,
            suv_threshold: 2.5,
            max_hotspots: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectPresets {
    /// 心肌区域：不低于最大计数的该比例
    pub myocardium_fraction: f32,
    /// 参考摄取取心肌区域的该百分位
    pub reference_percentile: f64,
    /// 低于参考摄取该比例的体素视为灌注缺损
    pub defect_fraction: f32,
    /// 小于该体素数的缺损区域忽略
    pub min_defect_voxels: usize,
}

impl Default for SpectPresets {
    fn default() -> Self {
        Self {
            myocardium_fraction: 0.3,
            reference_percentile: 95.0,
            defect_fraction: 0.5,
            min_defect_voxels: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ImagingConfig::default();
        assert_eq!(config.volume_cache_capacity, 6);
        assert_eq!(config.slice_cache_capacity, 800);
        assert_eq!(config.min_slices, 32);
        assert_eq!(config.presets.ct.bone_threshold_hu, 200.0);
        assert_eq!(config.presets.pet.suv_threshold, 2.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: ImagingConfig =
            serde_json::from_str(r#"{"slice_cache_capacity": 100, "presets": {"pet": {"suv_threshold": 3.0}}}"#)
                .unwrap();
        assert_eq!(config.slice_cache_capacity, 100);
        assert_eq!(config.volume_cache_capacity, 6);
        assert_eq!(config.presets.pet.suv_threshold, 3.0);
        assert_eq!(config.presets.pet.default_half_life_secs, 6586.2);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = ImagingConfig {
            slice_cache_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
