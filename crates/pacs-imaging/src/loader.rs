//! 系列切片加载
//!
//! [`SeriesSource`] 提供组装体数据所需的原始切片。单张切片解码失败不会中断整个系列，
//! 该切片以缺失像素返回，由组装器补零。

use crate::error::{ReconstructionError, Result};
use crate::jobs::JobRunner;
use crate::volume::PetAcquisition;
use async_trait::async_trait;
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, InMemDicomObject};
use dicom::pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption};
use ndarray::{s, Array2};
use pacs_core::{utils, Instance};
use pacs_database::MetadataStore;
use pacs_dicom::{DicomParser, ParsedDicomObject};
use pacs_storage::StorageManager;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// 切片空间与标定信息
#[derive(Debug, Clone, PartialEq)]
pub struct SliceHeader {
    pub sop_instance_uid: String,
    pub rows: Option<u16>,
    pub columns: Option<u16>,
    pub image_position: Option<[f64; 3]>,
    pub image_orientation: Option<[f64; 6]>,
    pub slice_location: Option<f64>,
    pub instance_number: Option<i32>,
    /// (行间距, 列间距)
    pub pixel_spacing: Option<[f64; 2]>,
    pub slice_thickness: Option<f64>,
    pub rescale_slope: f64,
    pub rescale_intercept: f64,
}

impl SliceHeader {
    pub fn new(sop_instance_uid: impl Into<String>) -> Self {
        Self {
            sop_instance_uid: sop_instance_uid.into(),
            rows: None,
            columns: None,
            image_position: None,
            image_orientation: None,
            slice_location: None,
            instance_number: None,
            pixel_spacing: None,
            slice_thickness: None,
            rescale_slope: 1.0,
            rescale_intercept: 0.0,
        }
    }

    /// 以数据库中的影像记录为基础
    fn from_instance(instance: &Instance) -> Self {
        Self {
            image_position: instance.image_position,
            slice_location: instance.slice_location,
            instance_number: instance.instance_number,
            ..Self::new(instance.sop_instance_uid.clone())
        }
    }

    fn merge_parsed(&mut self, parsed: &ParsedDicomObject) {
        let (slope, intercept) = parsed.rescale();
        self.rows = parsed.rows;
        self.columns = parsed.columns;
        self.image_position = parsed.image_position.or(self.image_position);
        self.image_orientation = parsed.image_orientation;
        self.slice_location = parsed.slice_location.or(self.slice_location);
        self.instance_number = parsed.instance_number.or(self.instance_number);
        self.pixel_spacing = parsed.pixel_spacing;
        self.slice_thickness = parsed.slice_thickness;
        self.rescale_slope = slope;
        self.rescale_intercept = intercept;
    }
}

/// 一张原始切片，像素为存储值（未标定）
#[derive(Debug, Clone)]
pub struct RawSlice {
    pub header: SliceHeader,
    /// 解码失败时为 `None`
    pub pixels: Option<Array2<f32>>,
}

impl RawSlice {
    pub fn new(header: SliceHeader, pixels: Array2<f32>) -> Self {
        Self {
            header,
            pixels: Some(pixels),
        }
    }

    pub fn unreadable(header: SliceHeader) -> Self {
        Self { header, pixels: None }
    }
}

/// 一个系列的全部原始切片（顺序为到达顺序）
#[derive(Debug, Clone)]
pub struct LoadedSeries {
    pub series_uid: String,
    pub modality: String,
    pub slices: Vec<RawSlice>,
    /// 加载时系列的影像数
    pub instance_count: usize,
    pub default_window: Option<(f32, f32)>,
    pub pet: Option<PetAcquisition>,
}

impl LoadedSeries {
    pub fn new(series_uid: impl Into<String>, modality: impl Into<String>, slices: Vec<RawSlice>) -> Self {
        let instance_count = slices.len();
        Self {
            series_uid: series_uid.into(),
            modality: modality.into(),
            slices,
            instance_count,
            default_window: None,
            pet: None,
        }
    }

    /// 可解码的切片数
    pub fn readable(&self) -> usize {
        self.slices.iter().filter(|s| s.pixels.is_some()).count()
    }
}

/// 系列切片来源
#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// 系列当前的影像数，用于判断缓存是否过期
    async fn instance_count(&self, series_uid: &str) -> Result<usize>;

    async fn load_series(&self, series_uid: &str) -> Result<LoadedSeries>;
}

/// 从元数据库与对象存储加载切片
///
/// 切片解码在重建线程池内并行执行，不占用全局rayon线程池。
pub struct StoredSeriesSource {
    store: Arc<dyn MetadataStore>,
    storage: StorageManager,
    runner: Arc<JobRunner>,
}

impl StoredSeriesSource {
    pub fn new(store: Arc<dyn MetadataStore>, storage: StorageManager, runner: Arc<JobRunner>) -> Self {
        Self { store, storage, runner }
    }
}

#[async_trait]
impl SeriesSource for StoredSeriesSource {
    async fn instance_count(&self, series_uid: &str) -> Result<usize> {
        Ok(self.store.series_instances(series_uid).await?.len())
    }

    async fn load_series(&self, series_uid: &str) -> Result<LoadedSeries> {
        let series = self
            .store
            .find_series(series_uid)
            .await?
            .ok_or_else(|| ReconstructionError::NotFound(format!("系列 {}", series_uid)))?;
        let instances = self.store.series_instances(series_uid).await?;
        if instances.is_empty() {
            return Err(ReconstructionError::InsufficientData(format!("系列 {} 没有影像", series_uid)));
        }

        let files: Vec<(PathBuf, SliceHeader)> = instances
            .iter()
            .map(|instance| (self.storage.absolute_path(&instance.file_path), SliceHeader::from_instance(instance)))
            .collect();
        let instance_count = files.len();
        debug!("加载系列 {}: {} 张影像", series_uid, instance_count);

        let loaded = self
            .runner
            .install(move || {
                files
                    .into_par_iter()
                    .map(|(path, header)| load_slice(path, header))
                    .collect::<Vec<_>>()
            })
            .await?;

        let mut default_window = None;
        let mut pet = None;
        let mut slices = Vec::with_capacity(loaded.len());
        for (slice, extras) in loaded {
            if let Some(extras) = extras {
                default_window = default_window.or(extras.window);
                pet = pet.or(extras.pet);
            }
            slices.push(slice);
        }

        let series_loaded = LoadedSeries {
            series_uid: series_uid.to_string(),
            modality: series.modality,
            slices,
            instance_count,
            default_window,
            pet,
        };
        info!(
            "系列 {} 加载完成: {}/{} 张可读",
            series_uid,
            series_loaded.readable(),
            instance_count
        );
        Ok(series_loaded)
    }
}

struct SliceExtras {
    window: Option<(f32, f32)>,
    pet: Option<PetAcquisition>,
}

fn load_slice(path: PathBuf, mut header: SliceHeader) -> (RawSlice, Option<SliceExtras>) {
    let (obj, parsed) = match DicomParser::parse_file(&path) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("切片 {} 无法读取，将补零: {}", header.sop_instance_uid, e);
            return (RawSlice::unreadable(header), None);
        }
    };
    header.merge_parsed(&parsed);

    let extras = SliceExtras {
        window: match (parsed.window_width, parsed.window_center) {
            (Some(width), Some(level)) if width > 0.0 => Some((width as f32, level as f32)),
            _ => None,
        },
        pet: (parsed.modality_or_default() == "PT").then(|| pet_acquisition(&obj, &parsed)),
    };

    match decode_pixels(&obj) {
        Ok(pixels) => (RawSlice::new(header, pixels), Some(extras)),
        Err(e) => {
            warn!("切片 {} 像素解码失败，将补零: {}", header.sop_instance_uid, e);
            (RawSlice::unreadable(header), Some(extras))
        }
    }
}

/// 解码第一帧的存储值（不应用LUT）
fn decode_pixels(obj: &DefaultDicomObject) -> std::result::Result<Array2<f32>, String> {
    let decoded = obj.decode_pixel_data().map_err(|e| e.to_string())?;
    let options = ConvertOptions::new()
        .with_modality_lut(ModalityLutOption::None)
        .with_voi_lut(VoiLutOption::Identity);
    let frames = decoded
        .to_ndarray_with_options::<f32>(&options)
        .map_err(|e| e.to_string())?;
    Ok(frames.slice_move(s![0, .., .., 0]))
}

fn pet_acquisition(obj: &InMemDicomObject, parsed: &ParsedDicomObject) -> PetAcquisition {
    let info = obj
        .element(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE)
        .ok()
        .and_then(|e| e.items())
        .and_then(|items| items.first());
    let float = |item: &InMemDicomObject, tag| item.element(tag).ok().and_then(|e| e.to_float64().ok());
    let time = |item: &InMemDicomObject, tag| {
        item.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .and_then(|v| utils::parse_dicom_time(&v))
    };

    let injected_at = info.and_then(|i| time(i, tags::RADIOPHARMACEUTICAL_START_TIME));
    let acquired_at = time(obj, tags::ACQUISITION_TIME).or_else(|| time(obj, tags::SERIES_TIME));
    let elapsed_secs = match (injected_at, acquired_at) {
        (Some(start), Some(end)) => {
            let secs = (end - start).num_milliseconds() as f64 / 1000.0;
            // 跨越午夜
            Some(if secs < 0.0 { secs + 86_400.0 } else { secs })
        }
        _ => None,
    };

    PetAcquisition {
        patient_weight_kg: parsed.patient_weight,
        injected_dose_bq: info.and_then(|i| float(i, tags::RADIONUCLIDE_TOTAL_DOSE)),
        half_life_secs: info.and_then(|i| float(i, tags::RADIONUCLIDE_HALF_LIFE)),
        elapsed_secs,
    }
}

/// 内存中的切片来源
#[derive(Default)]
pub struct MemorySeriesSource {
    series: Mutex<HashMap<String, LoadedSeries>>,
}

impl MemorySeriesSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入或替换整个系列
    pub fn put(&self, series: LoadedSeries) {
        self.entries().insert(series.series_uid.clone(), series);
    }

    /// 追加一张切片
    pub fn push_slice(&self, series_uid: &str, slice: RawSlice) {
        if let Some(series) = self.entries().get_mut(series_uid) {
            series.slices.push(slice);
            series.instance_count = series.slices.len();
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, LoadedSeries>> {
        self.series.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SeriesSource for MemorySeriesSource {
    async fn instance_count(&self, series_uid: &str) -> Result<usize> {
        self.entries()
            .get(series_uid)
            .map(|s| s.instance_count)
            .ok_or_else(|| ReconstructionError::NotFound(format!("系列 {}", series_uid)))
    }

    async fn load_series(&self, series_uid: &str) -> Result<LoadedSeries> {
        self.entries()
            .get(series_uid)
            .cloned()
            .ok_or_else(|| ReconstructionError::NotFound(format!("系列 {}", series_uid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_database::InMemoryMetadataStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unknown_series_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let runner = Arc::new(JobRunner::new(1).unwrap());
        let source = StoredSeriesSource::new(store, StorageManager::new(dir.path()), runner);

        let err = source.load_series("1.2.999").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(source.instance_count("1.2.999").await.unwrap(), 0);
    }

    #[test]
    fn test_missing_file_yields_unreadable_slice() {
        let dir = TempDir::new().unwrap();
        let mut header = SliceHeader::new("1.2.3.1.1");
        header.instance_number = Some(4);

        let (slice, extras) = load_slice(dir.path().join("missing.dcm"), header);
        assert!(slice.pixels.is_none());
        assert!(extras.is_none());
        assert_eq!(slice.header.instance_number, Some(4));
    }

    #[tokio::test]
    async fn test_memory_source_tracks_instance_count() {
        let source = MemorySeriesSource::new();
        source.put(LoadedSeries::new("1.2.3.1", "CT", Vec::new()));
        source.push_slice("1.2.3.1", RawSlice::new(SliceHeader::new("a"), Array2::zeros((2, 2))));

        assert_eq!(source.instance_count("1.2.3.1").await.unwrap(), 1);
        assert_eq!(source.load_series("1.2.3.1").await.unwrap().readable(), 1);
    }
}
