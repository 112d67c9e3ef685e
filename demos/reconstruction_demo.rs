//! 三维重建演示程序
//!
//! 用合成的CT系列演示：
//! - 体数据组装与轴位/冠状/矢状MPR
//! - MIP 投影
//! - 骨骼阈值重建与进度订阅
//! - 任务取消

use anyhow::Result;
use ndarray::Array2;
use pacs_imaging::{
    ImagingConfig, JobContext, LoadedSeries, MemorySeriesSource, MprRequest, Plane, ProjectionMode,
    ProjectionRequest, RawSlice, ReconstructionEngine, ReconstructionError, SliceHeader, SurfaceRequest,
};
use std::sync::Arc;
use tracing::{info, warn};

const SERIES_UID: &str = "1.2.826.0.1.3680043.8.498.1";
const SIZE: usize = 64;
const SLICES: usize = 40;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("启动三维重建演示");

    let source = Arc::new(MemorySeriesSource::new());
    source.put(synthetic_series());
    let engine = ReconstructionEngine::new(ImagingConfig::default(), source)?;

    demo_mpr(&engine).await?;
    demo_projection(&engine).await?;
    demo_bone(&engine).await?;
    demo_cancellation(&engine).await;

    info!("缓存统计: {:?}", engine.stats());
    info!("三维重建演示完成");
    Ok(())
}

/// 水模中央一根“骨柱”，切片以乱序到达
fn synthetic_series() -> LoadedSeries {
    let centre = SIZE as f32 / 2.0;
    let mut slices: Vec<RawSlice> = (0..SLICES)
        .map(|z| {
            let mut header = SliceHeader::new(format!("{}.{}", SERIES_UID, z + 1));
            header.image_position = Some([0.0, 0.0, z as f64 * 2.5]);
            header.image_orientation = Some([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
            header.pixel_spacing = Some([0.8, 0.8]);
            header.slice_thickness = Some(2.5);
            header.rescale_intercept = -1024.0;
            let pixels = Array2::from_shape_fn((SIZE, SIZE), |(r, c)| {
                let d = ((r as f32 - centre).powi(2) + (c as f32 - centre).powi(2)).sqrt();
                if d < 6.0 {
                    2000.0
                } else if d < 28.0 {
                    1064.0
                } else {
                    0.0
                }
            });
            RawSlice::new(header, pixels)
        })
        .collect();
    slices.reverse();
    slices.swap(3, 17);
    LoadedSeries::new(SERIES_UID, "CT", slices)
}

async fn demo_mpr(engine: &ReconstructionEngine) -> Result<()> {
    info!("MPR演示");
    for plane in Plane::ALL {
        let response = engine
            .mpr(MprRequest::new(SERIES_UID, plane), JobContext::detached())
            .await?;
        info!(
            "  {}: 第{}层, {}x{} PNG {} 字节, 体数据 {:?}",
            plane.as_str(),
            response.index.unwrap_or_default(),
            response.image.width,
            response.image.height,
            response.image.len(),
            response.volume.shape
        );
    }

    let repeat = engine
        .mpr(MprRequest::new(SERIES_UID, Plane::Axial), JobContext::detached())
        .await?;
    info!("  重复请求命中缓存: {}", repeat.cached);
    Ok(())
}

async fn demo_projection(engine: &ReconstructionEngine) -> Result<()> {
    info!("MIP演示");
    let response = engine
        .projection(
            ProjectionRequest {
                series_uid: SERIES_UID.to_string(),
                planes: Plane::ALL.to_vec(),
                mode: ProjectionMode::Max,
                range: None,
                window: None,
                invert: false,
            },
            JobContext::detached(),
        )
        .await?;
    for item in &response.images {
        info!("  {} MIP: {}x{}", item.plane.as_str(), item.image.width, item.image.height);
    }
    Ok(())
}

async fn demo_bone(engine: &ReconstructionEngine) -> Result<()> {
    info!("骨骼重建演示");
    let (context, handle) = JobContext::new();
    let mut progress = handle.subscribe();
    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = progress.borrow().clone();
            info!("  进度 {:>3.0}% {}", p.fraction * 100.0, p.stage);
        }
    });

    let bone = engine.bone(SurfaceRequest::new(SERIES_UID), context).await?;
    info!(
        "  骨体素 {}, 体积 {:.1} mm³, 平均 {:.0} HU",
        bone.stats.voxel_count, bone.stats.volume_mm3, bone.stats.mean
    );
    if let Some(mesh) = &bone.mesh {
        info!(
            "  表面网格: {} 顶点, {} 三角形 (抽稀: {})",
            mesh.vertices.len(),
            mesh.faces.len(),
            mesh.decimated
        );
    }
    drop(handle);
    watcher.await.ok();
    Ok(())
}

async fn demo_cancellation(engine: &ReconstructionEngine) {
    info!("取消演示");
    let (context, handle) = JobContext::new();
    handle.cancel();
    match engine.bone(SurfaceRequest::new(SERIES_UID), context).await {
        Err(ReconstructionError::Cancelled) => info!("  任务已取消，缓存未写入"),
        Err(e) => warn!("  意外错误: {}", e.to_body().message),
        Ok(_) => warn!("  任务未被取消"),
    }
}
