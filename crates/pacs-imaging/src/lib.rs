//! # 影像重建模块
//!
//! 将系列切片组装为三维体数据，提供MPR、强度投影、阈值表面与各模态分析，
//! 计算在专用线程池上执行并支持进度上报与取消。

pub mod assembler;
pub mod cache;
pub mod config;
pub mod encode;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod loader;
pub mod modality;
pub mod morphology;
pub mod mpr;
pub mod projection;
pub mod surface;
pub mod volume;
pub mod windowing;

pub use assembler::{SliceOrdering, VolumeAssembler};
pub use cache::{CacheStats, EncodedImage, LruCache, SliceKey, SliceView};
pub use config::{CtPresets, ImagingConfig, ModalityPresets, MriPresets, PetPresets, SpectPresets};
pub use engine::{
    BoneResponse, EngineStats, ImageResponse, MprRequest, MriResponse, ObliqueRequest, PetResponse, PlaneImage,
    ProjectionRequest, ProjectionResponse, ReconstructionEngine, SlabRequest, SpectResponse, SurfaceRequest,
};
pub use error::{ErrorBody, ReconstructionError, Result};
pub use jobs::{JobContext, JobHandle, JobRunner, Progress};
pub use loader::{LoadedSeries, MemorySeriesSource, RawSlice, SeriesSource, SliceHeader, StoredSeriesSource};
pub use modality::TissueType;
pub use mpr::{ObliquePlane, Plane};
pub use projection::ProjectionMode;
pub use surface::Mesh;
pub use volume::{Spacing, Volume, VolumeSummary};
pub use windowing::Window;
