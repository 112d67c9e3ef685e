//! PACS服务器主程序

mod config;

use crate::config::ServerSettings;
use anyhow::{Context, Result};
use clap::Parser;
use pacs_core::SystemClock;
use pacs_database::{DatabasePool, DatabaseQueries, InMemoryMetadataStore, MetadataStore};
use pacs_dicom::{
    AeRegistry, AssociationGate, CEchoService, CStoreService, DicomServer, DicomValidator, IngestPipeline,
    Notifier, ReceiverStats, SecurityManager, ServiceManager, TracingNotificationSink,
};
use pacs_imaging::{JobRunner, ReconstructionEngine, StoredSeriesSource};
use pacs_storage::StorageManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// PACS服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-server")]
#[command(about = "DICOM接收与三维重建服务")]
struct Args {
    /// 服务器端口
    #[arg(short, long)]
    port: Option<u16>,

    /// AE标题 (Application Entity Title)
    #[arg(short, long)]
    ae_title: Option<String>,

    /// DICOM文件存储目录
    #[arg(short, long)]
    storage_dir: Option<PathBuf>,

    /// PostgreSQL连接字符串；不指定时使用内存存储
    #[arg(long)]
    database_url: Option<String>,

    /// 配置文件路径 (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别；RUST_LOG 优先
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, settings: &mut ServerSettings) {
        if let Some(port) = self.port {
            settings.dicom.port = port;
        }
        if let Some(ae_title) = &self.ae_title {
            settings.dicom.ae_title = ae_title.clone();
        }
        if let Some(dir) = &self.storage_dir {
            settings.storage.root = dir.clone();
        }
        if let Some(url) = &self.database_url {
            settings.database.url = Some(url.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    let mut settings = ServerSettings::load(args.config.as_deref())?;
    args.apply(&mut settings);
    settings.validate()?;

    info!("启动PACS服务器...");
    info!("  AE标题: {}", settings.dicom.ae_title);
    info!("  监听: {}:{}", settings.dicom.bind_address, settings.dicom.port);
    info!("  存储目录: {}", settings.storage.root.display());
    info!("  公网模式: {}", settings.dicom.external_access);

    let store = open_store(&settings).await?;
    let storage = StorageManager::new(settings.storage.root.clone());
    storage.ensure_root().await?;

    let stats = Arc::new(ReceiverStats::new());
    let notifier = Notifier::new(Arc::clone(&store), Arc::new(TracingNotificationSink));

    let registry = Arc::new(AeRegistry::new(Arc::clone(&store)));
    let facilities = registry.refresh().await.context("加载AE注册表失败")?;
    info!("已注册机构: {}", facilities);
    if facilities == 0 {
        warn!("没有启用的机构，所有关联都将被拒绝");
    }

    let mut gate = AssociationGate::new(Arc::clone(&registry), Arc::clone(&stats)).with_notifier(notifier.clone());
    if settings.dicom.external_access {
        gate = gate.with_security(Arc::new(SecurityManager::new(
            settings.security.clone(),
            Arc::new(SystemClock),
        )));
    }
    let gate = Arc::new(gate);

    let runner = Arc::new(JobRunner::new(settings.imaging.worker_threads)?);
    let source = Arc::new(StoredSeriesSource::new(Arc::clone(&store), storage.clone(), Arc::clone(&runner)));
    let engine = Arc::new(ReconstructionEngine::with_runner(settings.imaging.clone(), source, runner));

    let pipeline = IngestPipeline::new(
        Arc::clone(&store),
        storage,
        DicomValidator::new(settings.validation.clone()),
        Arc::clone(&stats),
    )
    .with_notifier(notifier)
    .with_observer(engine.clone());
    let services = Arc::new(ServiceManager::new(
        Arc::new(CEchoService::new(Arc::clone(&stats))),
        Arc::new(CStoreService::new(Arc::new(pipeline)).with_gate(Arc::clone(&gate))),
    ));

    let cancel = CancellationToken::new();
    let refresher = Arc::clone(&registry).spawn_refresher(
        Duration::from_secs(settings.registry.refresh_interval_secs),
        cancel.clone(),
    );

    let server = Arc::new(DicomServer::new(settings.dicom.clone(), gate, services));
    let listener = server.bind().await?;
    let server_task = tokio::spawn(Arc::clone(&server).run(listener, cancel.clone()));

    tokio::signal::ctrl_c().await.context("无法监听退出信号")?;
    info!("收到退出信号，正在停止...");
    cancel.cancel();

    server_task.await.context("DICOM服务任务异常退出")??;
    refresher.await.context("注册表刷新任务异常退出")?;

    info!("接收统计: {}", serde_json::to_string(&stats.snapshot())?);
    info!("重建缓存统计: {}", serde_json::to_string(&engine.stats())?);
    info!("PACS服务器已停止");
    Ok(())
}

/// 配置了数据库地址时使用PostgreSQL，否则使用内存存储
async fn open_store(settings: &ServerSettings) -> Result<Arc<dyn MetadataStore>> {
    match &settings.database.url {
        Some(url) => {
            let pool = DatabasePool::connect(url, &settings.database).await?;
            let queries = DatabaseQueries::new(pool);
            queries.create_tables().await?;
            Ok(Arc::new(queries))
        }
        None => {
            warn!("未配置数据库，使用内存元数据存储（重启后数据丢失）");
            Ok(Arc::new(InMemoryMetadataStore::new()))
        }
    }
}
