//! 重建引擎：体数据缓存、切片缓存与各类重建请求的统一入口
//!
//! 每个请求都接收一个 [`JobContext`]，调用方通过对应的 [`crate::JobHandle`] 观察进度或取消。
//! 只有成功完成的任务才会写入缓存。

use crate::assembler::VolumeAssembler;
use crate::cache::{CacheStats, EncodedImage, LruCache, SliceKey, SliceView};
use crate::config::ImagingConfig;
use crate::encode::encode_png;
use crate::error::{ErrorBody, ReconstructionError, Result};
use crate::jobs::{JobContext, JobRunner};
use crate::loader::{LoadedSeries, SeriesSource};
use crate::modality::{
    analyze_bone, analyze_mri, analyze_pet, analyze_spect, DefectRegion, Hotspot, SurfaceOptions, TissueStats,
    TissueType,
};
use crate::mpr::{extract_slice, oblique_slice, thick_slab, ObliquePlane, Plane, MAX_OBLIQUE_SIZE};
use crate::projection::{project, ProjectionMode, ProjectionSet};
use crate::surface::Mesh;
use crate::volume::{Volume, VolumeSummary};
use crate::windowing::{apply_window, auto_window, data_range_window, Window};
use ndarray::Array2;
use pacs_dicom::SeriesObserver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// 体数据组装占整个任务进度的比例
const ASSEMBLY_SHARE: f32 = 0.6;

/// 斜切平面的默认输出尺寸
const DEFAULT_OBLIQUE_SIZE: usize = 256;

/// 正交MPR请求；未给出序号时取中间层，未给出窗口时自动选择
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MprRequest {
    pub series_uid: String,
    pub plane: Plane,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub window: Option<Window>,
    #[serde(default)]
    pub invert: bool,
}

impl MprRequest {
    pub fn new(series_uid: impl Into<String>, plane: Plane) -> Self {
        Self {
            series_uid: series_uid.into(),
            plane,
            index: None,
            window: None,
            invert: false,
        }
    }
}

/// 厚层MPR请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlabRequest {
    pub series_uid: String,
    pub plane: Plane,
    #[serde(default)]
    pub index: Option<usize>,
    pub thickness: usize,
    pub mode: ProjectionMode,
    #[serde(default)]
    pub window: Option<Window>,
    #[serde(default)]
    pub invert: bool,
}

/// 斜切MPR请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObliqueRequest {
    pub series_uid: String,
    pub plane: ObliquePlane,
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub window: Option<Window>,
    #[serde(default)]
    pub invert: bool,
}

/// 投影请求；`range` 为投影轴上的子范围
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRequest {
    pub series_uid: String,
    pub planes: Vec<Plane>,
    pub mode: ProjectionMode,
    #[serde(default)]
    pub range: Option<Range<usize>>,
    #[serde(default)]
    pub window: Option<Window>,
    #[serde(default)]
    pub invert: bool,
}

/// 阈值分割与表面提取参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceRequest {
    pub series_uid: String,
    /// CT为HU阈值；缺省取模态预设
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default = "enabled")]
    pub mesh: bool,
    #[serde(default = "enabled")]
    pub closing: bool,
    #[serde(default = "enabled")]
    pub fill_holes: bool,
}

fn enabled() -> bool {
    true
}

impl SurfaceRequest {
    pub fn new(series_uid: impl Into<String>) -> Self {
        Self {
            series_uid: series_uid.into(),
            threshold: None,
            mesh: true,
            closing: true,
            fill_holes: true,
        }
    }
}

/// 某个平面上的编码图像
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaneImage {
    pub plane: Plane,
    pub image: EncodedImage,
}

/// 单张图像的响应
#[derive(Debug, Clone, Serialize)]
pub struct ImageResponse {
    pub image: EncodedImage,
    pub plane: Option<Plane>,
    pub index: Option<usize>,
    pub window: Window,
    pub volume: VolumeSummary,
    pub warnings: Vec<ErrorBody>,
    /// 是否直接来自切片缓存
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectionResponse {
    pub mode: ProjectionMode,
    pub images: Vec<PlaneImage>,
    pub window: Window,
    pub volume: VolumeSummary,
    pub warnings: Vec<ErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoneResponse {
    pub threshold_hu: f32,
    pub stats: TissueStats,
    pub mesh: Option<Mesh>,
    pub projections: Vec<PlaneImage>,
    pub volume: VolumeSummary,
    pub warnings: Vec<ErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MriResponse {
    pub tissue: TissueType,
    pub threshold: f32,
    pub stats: TissueStats,
    pub mesh: Option<Mesh>,
    pub projections: Vec<PlaneImage>,
    pub volume: VolumeSummary,
    pub warnings: Vec<ErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PetResponse {
    pub suv_max: f32,
    pub suv_threshold: f32,
    pub suv_factor: f64,
    pub hotspots: Vec<Hotspot>,
    pub projections: Vec<PlaneImage>,
    pub volume: VolumeSummary,
    pub warnings: Vec<ErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpectResponse {
    pub reference_uptake: f32,
    pub myocardium_voxels: usize,
    pub defect_voxels: usize,
    pub defect_extent_percent: f32,
    pub defects: Vec<DefectRegion>,
    pub projections: Vec<PlaneImage>,
    pub volume: VolumeSummary,
    pub warnings: Vec<ErrorBody>,
}

/// 引擎缓存统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub volumes: CacheStats,
    pub slices: CacheStats,
}

enum Prepared {
    Cached(Arc<Volume>),
    Load(LoadedSeries),
}

/// 重建引擎
pub struct ReconstructionEngine {
    config: ImagingConfig,
    source: Arc<dyn SeriesSource>,
    runner: Arc<JobRunner>,
    assembler: VolumeAssembler,
    volumes: LruCache<String, Arc<Volume>>,
    slices: LruCache<SliceKey, EncodedImage>,
    /// 每个系列的失效代数；任务开始后代数变化则结果不再写入缓存
    generations: Mutex<HashMap<String, u64>>,
}

impl ReconstructionEngine {
    /// 按配置创建专用计算线程池
    pub fn new(config: ImagingConfig, source: Arc<dyn SeriesSource>) -> Result<Self> {
        let runner = Arc::new(JobRunner::new(config.worker_threads)?);
        Ok(Self::with_runner(config, source, runner))
    }

    pub fn with_runner(config: ImagingConfig, source: Arc<dyn SeriesSource>, runner: Arc<JobRunner>) -> Self {
        info!(
            "重建引擎初始化: 体数据缓存 {}, 切片缓存 {}, 计算线程 {}",
            config.volume_cache_capacity,
            config.slice_cache_capacity,
            runner.threads()
        );
        Self {
            assembler: VolumeAssembler::new(&config),
            volumes: LruCache::new(config.volume_cache_capacity),
            slices: LruCache::new(config.slice_cache_capacity),
            generations: Mutex::new(HashMap::new()),
            config,
            source,
            runner,
        }
    }

    pub fn config(&self) -> &ImagingConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            volumes: self.volumes.stats(),
            slices: self.slices.stats(),
        }
    }

    /// 丢弃系列的体数据与切片缓存
    pub fn invalidate(&self, series_uid: &str) {
        self.evict(series_uid);
    }

    /// 递增系列代次并清除其缓存，返回新代次
    fn evict(&self, series_uid: &str) -> u64 {
        let generation = {
            let mut generations = self.generations.lock().unwrap_or_else(|p| p.into_inner());
            let generation = generations.entry(series_uid.to_string()).or_default();
            *generation += 1;
            *generation
        };
        let volume = self.volumes.remove(&series_uid.to_string()).is_some();
        let slices = self.slices.retain(|key| key.series_uid != series_uid);
        if volume || slices > 0 {
            debug!("系列 {} 缓存失效: 体数据 {}, 切片 {}", series_uid, volume, slices);
        }
        generation
    }

    /// 取得（必要时组装）系列体数据
    pub async fn volume(&self, series_uid: &str, ctx: JobContext) -> Result<Arc<Volume>> {
        let (volume, ()) = self.execute(series_uid, ctx, |_, _| Ok(())).await?;
        Ok(volume)
    }

    /// 正交平面MPR
    pub async fn mpr(&self, request: MprRequest, ctx: JobContext) -> Result<ImageResponse> {
        let (prepared, generation) = self.prepare(&request.series_uid).await?;
        if let Prepared::Cached(volume) = &prepared {
            let index = request.index.unwrap_or_else(|| request.plane.middle(volume));
            let window = self.window_for(volume, request.window);
            let key = SliceKey::new(&request.series_uid, SliceView::Mpr(request.plane), index, window, request.invert);
            if let Some(image) = self.slices.get(&key) {
                debug!("切片缓存命中: {:?}", key);
                return Ok(ImageResponse {
                    image,
                    plane: Some(request.plane),
                    index: Some(index),
                    window,
                    volume: volume.summary(),
                    warnings: volume_warnings(volume),
                    cached: true,
                });
            }
        }

        let requested_window = request.window;
        let presets = self.config.presets.clone();
        let (plane, invert) = (request.plane, request.invert);
        let requested_index = request.index;
        let (volume, (image, index, window)) = self
            .run_prepared(prepared, generation, ctx, move |volume, ctx| {
                ctx.stage(0.2, "提取切片")?;
                let index = requested_index.unwrap_or_else(|| plane.middle(volume));
                let window = requested_window.unwrap_or_else(|| auto_window(volume, &presets));
                let pixels = extract_slice(volume, plane, index)?;
                ctx.stage(0.6, "窗宽窗位与编码")?;
                let image = encode_png(&apply_window(pixels.view(), window, invert))?;
                Ok((image, index, window))
            })
            .await?;

        if self.is_current(&request.series_uid, generation) {
            let key = SliceKey::new(&request.series_uid, SliceView::Mpr(plane), index, window, invert);
            self.slices.insert(key, image.clone());
        }
        Ok(ImageResponse {
            image,
            plane: Some(plane),
            index: Some(index),
            window,
            volume: volume.summary(),
            warnings: volume_warnings(&volume),
            cached: false,
        })
    }

    /// 厚层MPR
    pub async fn thick_slab(&self, request: SlabRequest, ctx: JobContext) -> Result<ImageResponse> {
        let presets = self.config.presets.clone();
        let SlabRequest {
            series_uid,
            plane,
            index,
            thickness,
            mode,
            window,
            invert,
        } = request;
        let (volume, (image, index, window)) = self
            .execute(&series_uid, ctx, move |volume, ctx| {
                ctx.stage(0.2, "厚层投影")?;
                let index = index.unwrap_or_else(|| plane.middle(volume));
                let window = window.unwrap_or_else(|| auto_window(volume, &presets));
                let pixels = thick_slab(volume, plane, index, thickness, mode)?;
                ctx.stage(0.6, "窗宽窗位与编码")?;
                Ok((encode_png(&apply_window(pixels.view(), window, invert))?, index, window))
            })
            .await?;
        Ok(ImageResponse {
            image,
            plane: Some(plane),
            index: Some(index),
            window,
            volume: volume.summary(),
            warnings: volume_warnings(&volume),
            cached: false,
        })
    }

    /// 斜切MPR
    pub async fn oblique(&self, request: ObliqueRequest, ctx: JobContext) -> Result<ImageResponse> {
        let presets = self.config.presets.clone();
        let ObliqueRequest {
            series_uid,
            plane,
            size,
            window,
            invert,
        } = request;
        let size = size.unwrap_or(DEFAULT_OBLIQUE_SIZE);
        let within_budget = size.checked_mul(size).is_some_and(|pixels| pixels <= self.config.max_voxels);
        if size == 0 || size > MAX_OBLIQUE_SIZE || !within_budget {
            return Err(ReconstructionError::InvalidRequest(format!(
                "斜切输出尺寸无效: {} (上限 {})",
                size, MAX_OBLIQUE_SIZE
            )));
        }
        let (volume, (image, window)) = self
            .execute(&series_uid, ctx, move |volume, ctx| {
                ctx.stage(0.2, "斜切平面采样")?;
                let window = window.unwrap_or_else(|| auto_window(volume, &presets));
                let pixels = oblique_slice(volume, &plane, size)?;
                ctx.stage(0.7, "窗宽窗位与编码")?;
                Ok((encode_png(&apply_window(pixels.view(), window, invert))?, window))
            })
            .await?;
        Ok(ImageResponse {
            image,
            plane: None,
            index: None,
            window,
            volume: volume.summary(),
            warnings: volume_warnings(&volume),
            cached: false,
        })
    }

    /// MIP / MinIP / 平均投影，每个请求的平面一张图像；全范围投影进入切片缓存
    pub async fn projection(&self, request: ProjectionRequest, ctx: JobContext) -> Result<ProjectionResponse> {
        if request.planes.is_empty() {
            return Err(ReconstructionError::InvalidRequest("未指定投影平面".to_string()));
        }
        let presets = self.config.presets.clone();
        let ProjectionRequest {
            series_uid,
            planes,
            mode,
            range,
            window,
            invert,
        } = request;
        let whole = range.is_none();
        let (prepared, generation) = self.prepare(&series_uid).await?;
        let (volume, (images, window)) = self
            .run_prepared(prepared, generation, ctx, move |volume, ctx| {
                let window = window.unwrap_or_else(|| auto_window(volume, &presets));
                let total = planes.len() as f32;
                let mut images = Vec::with_capacity(planes.len());
                for (i, plane) in planes.into_iter().enumerate() {
                    ctx.stage(i as f32 / total, "投影")?;
                    let pixels = project(volume.data.view(), plane, mode, range.clone())?;
                    let image = encode_png(&apply_window(pixels.view(), window, invert))?;
                    images.push(PlaneImage { plane, image });
                }
                Ok((images, window))
            })
            .await?;

        if whole && self.is_current(&series_uid, generation) {
            for item in &images {
                let key = SliceKey::new(&series_uid, SliceView::Projection(item.plane, mode), 0, window, invert);
                self.slices.insert(key, item.image.clone());
            }
        }
        Ok(ProjectionResponse {
            mode,
            images,
            window,
            volume: volume.summary(),
            warnings: volume_warnings(&volume),
        })
    }

    /// CT骨骼重建
    pub async fn bone(&self, request: SurfaceRequest, ctx: JobContext) -> Result<BoneResponse> {
        let ct = self.config.presets.ct.clone();
        let threshold = request.threshold.unwrap_or(ct.bone_threshold_hu);
        let options = self.surface_options(&request);
        let (volume, (analysis, projections)) = self
            .execute(&request.series_uid, ctx, move |volume, ctx| {
                let analysis = analyze_bone(volume, threshold, &options, ctx)?;
                let window = Window::new(ct.bone_window_width, ct.bone_window_level);
                let projections = encode_projections(&analysis.projections, window)?;
                Ok((analysis, projections))
            })
            .await?;
        Ok(BoneResponse {
            threshold_hu: analysis.threshold_hu,
            stats: analysis.stats,
            mesh: analysis.mesh,
            projections,
            volume: volume.summary(),
            warnings: volume_warnings(&volume),
        })
    }

    /// MRI组织分割
    pub async fn mri(&self, request: SurfaceRequest, tissue: TissueType, ctx: JobContext) -> Result<MriResponse> {
        let presets = self.config.presets.mri.clone();
        let options = self.surface_options(&request);
        let (volume, (analysis, projections)) = self
            .execute(&request.series_uid, ctx, move |volume, ctx| {
                let analysis = analyze_mri(volume, tissue, &presets, &options, ctx)?;
                // 归一化强度范围为 0..1
                let projections = encode_projections(&analysis.projections, Window::new(1.0, 0.5))?;
                Ok((analysis, projections))
            })
            .await?;
        Ok(MriResponse {
            tissue: analysis.tissue,
            threshold: analysis.threshold,
            stats: analysis.stats,
            mesh: analysis.mesh,
            projections,
            volume: volume.summary(),
            warnings: volume_warnings(&volume),
        })
    }

    /// PET SUV与热点
    pub async fn pet(&self, series_uid: &str, ctx: JobContext) -> Result<PetResponse> {
        let presets = self.config.presets.pet.clone();
        let (volume, (analysis, projections)) = self
            .execute(series_uid, ctx, move |volume, ctx| {
                let analysis = analyze_pet(volume, &presets, ctx)?;
                let window = data_range_window([0.0, analysis.suv_max].into_iter());
                let projections = encode_projections(&analysis.projections, window)?;
                Ok((analysis, projections))
            })
            .await?;
        Ok(PetResponse {
            suv_max: analysis.suv_max,
            suv_threshold: analysis.suv_threshold,
            suv_factor: analysis.suv_factor,
            hotspots: analysis.hotspots,
            projections,
            volume: volume.summary(),
            warnings: volume_warnings(&volume),
        })
    }

    /// SPECT灌注缺损
    pub async fn spect(&self, series_uid: &str, ctx: JobContext) -> Result<SpectResponse> {
        let presets = self.config.presets.spect.clone();
        let (volume, (analysis, projections)) = self
            .execute(series_uid, ctx, move |volume, ctx| {
                let analysis = analyze_spect(volume, &presets, ctx)?;
                let window = data_range_window(volume.data.iter().copied());
                let projections = encode_projections(&analysis.projections, window)?;
                Ok((analysis, projections))
            })
            .await?;
        Ok(SpectResponse {
            reference_uptake: analysis.reference_uptake,
            myocardium_voxels: analysis.myocardium_voxels,
            defect_voxels: analysis.defect_voxels,
            defect_extent_percent: analysis.defect_extent_percent,
            defects: analysis.defects,
            projections,
            volume: volume.summary(),
            warnings: volume_warnings(&volume),
        })
    }

    fn surface_options(&self, request: &SurfaceRequest) -> SurfaceOptions {
        SurfaceOptions {
            closing: request.closing,
            fill_holes: request.fill_holes,
            mesh: request.mesh,
            ..SurfaceOptions::from_config(&self.config)
        }
    }

    fn window_for(&self, volume: &Volume, requested: Option<Window>) -> Window {
        requested.unwrap_or_else(|| auto_window(volume, &self.config.presets))
    }

    fn generation(&self, series_uid: &str) -> u64 {
        let generations = self.generations.lock().unwrap_or_else(|p| p.into_inner());
        generations.get(series_uid).copied().unwrap_or(0)
    }

    fn is_current(&self, series_uid: &str, generation: u64) -> bool {
        self.generation(series_uid) == generation
    }

    /// 缓存的体数据仍与系列影像数一致时直接使用，否则读取切片
    ///
    /// 同时返回读取数据之前的系列代次；之后发生的失效会让本次结果不进入缓存。
    async fn prepare(&self, series_uid: &str) -> Result<(Prepared, u64)> {
        let mut generation = self.generation(series_uid);
        let count = self.source.instance_count(series_uid).await?;
        if let Some(volume) = self.volumes.get(&series_uid.to_string()) {
            if volume.instance_count == count {
                return Ok((Prepared::Cached(volume), generation));
            }
            warn!(
                "系列 {} 体数据已过期（{} -> {} 张影像），重新组装",
                series_uid, volume.instance_count, count
            );
            generation = self.evict(series_uid);
        }
        Ok((Prepared::Load(self.source.load_series(series_uid).await?), generation))
    }

    async fn execute<T, F>(&self, series_uid: &str, ctx: JobContext, work: F) -> Result<(Arc<Volume>, T)>
    where
        T: Send + 'static,
        F: FnOnce(&Volume, &JobContext) -> Result<T> + Send + 'static,
    {
        let (prepared, generation) = self.prepare(series_uid).await?;
        self.run_prepared(prepared, generation, ctx, work).await
    }

    async fn run_prepared<T, F>(
        &self,
        prepared: Prepared,
        generation: u64,
        ctx: JobContext,
        work: F,
    ) -> Result<(Arc<Volume>, T)>
    where
        T: Send + 'static,
        F: FnOnce(&Volume, &JobContext) -> Result<T> + Send + 'static,
    {
        let assembler = self.assembler.clone();
        let (volume, fresh, output) = self
            .runner
            .run(ctx, move |ctx| {
                let (volume, fresh, work_ctx) = match prepared {
                    Prepared::Cached(volume) => (volume, false, ctx.clone()),
                    Prepared::Load(series) => {
                        let volume = build_volume(&assembler, series, &ctx.scoped(0.0, ASSEMBLY_SHARE))?;
                        (Arc::new(volume), true, ctx.scoped(ASSEMBLY_SHARE, 1.0))
                    }
                };
                let output = work(volume.as_ref(), &work_ctx)?;
                Ok((volume, fresh, output))
            })
            .await?;

        if fresh && self.is_current(&volume.series_uid, generation) {
            self.volumes.insert(volume.series_uid.clone(), volume.clone());
        }
        Ok((volume, output))
    }
}

impl SeriesObserver for ReconstructionEngine {
    fn series_changed(&self, series_uid: &str) {
        self.invalidate(series_uid);
    }
}

/// 组装体数据；仅一张可读切片时降级为单层体数据
fn build_volume(assembler: &VolumeAssembler, series: LoadedSeries, ctx: &JobContext) -> Result<Volume> {
    if series.readable() == 1 {
        ctx.stage(0.5, "单层体数据")?;
        warn!("系列 {} 仅有1张可读切片，按单层显示", series.series_uid);
        return assembler.single_slice(series);
    }
    assembler.assemble(series, ctx)
}

/// 体数据的降级与合成提示
fn volume_warnings(volume: &Volume) -> Vec<ErrorBody> {
    let mut warnings = Vec::new();
    if volume.acquired_slices < 2 {
        warnings.push(
            ReconstructionError::InsufficientData(format!(
                "系列 {} 仅有 {} 张可读切片，至少需要2张，已按单层显示",
                volume.series_uid, volume.acquired_slices
            ))
            .to_body(),
        );
    }
    if volume.zero_filled_slices > 0 {
        warnings.push(ErrorBody {
            kind: "zero_filled".to_string(),
            message: format!("{} 张切片无法解码，已补零", volume.zero_filled_slices),
        });
    }
    if volume.interpolated {
        warnings.push(ErrorBody {
            kind: "interpolated".to_string(),
            message: format!("仅采集 {} 张切片，体数据包含插值合成的切片", volume.acquired_slices),
        });
    }
    warnings
}

fn encode_projections(set: &ProjectionSet, window: Window) -> Result<Vec<PlaneImage>> {
    Plane::ALL
        .iter()
        .map(|&plane| {
            let pixels: &Array2<f32> = set.get(plane);
            Ok(PlaneImage {
                plane,
                image: encode_png(&apply_window(pixels.view(), window, false))?,
            })
        })
        .collect()
}
