//! 服务器配置加载
//!
//! 层次：内置默认值 → TOML 配置文件 → `PACS__` 前缀环境变量 → 命令行参数。

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use pacs_database::DatabaseConfig;
use pacs_dicom::{DicomServerConfig, RegistryConfig, SecurityConfig, ValidationPolicy};
use pacs_imaging::ImagingConfig;
use pacs_storage::StorageConfig;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// AE标题最大长度
const MAX_AE_TITLE_LENGTH: usize = 16;

/// 服务器完整配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub dicom: DicomServerConfig,
    pub registry: RegistryConfig,
    pub security: SecurityConfig,
    pub validation: ValidationPolicy,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub imaging: ImagingConfig,
}

impl ServerSettings {
    /// 加载配置文件与环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("PACS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("读取配置失败")?;

        let settings: ServerSettings = settings.try_deserialize().context("解析配置失败")?;
        match path {
            Some(path) => info!("配置已加载: {}", path.display()),
            None => info!("未指定配置文件，使用默认配置与环境变量"),
        }
        Ok(settings)
    }

    /// 拒绝无法运行的配置
    pub fn validate(&self) -> Result<()> {
        let ae_title = self.dicom.ae_title.trim();
        if ae_title.is_empty() {
            bail!("AE标题不能为空");
        }
        if ae_title.len() > MAX_AE_TITLE_LENGTH {
            bail!("AE标题 {} 超过{}个字符", ae_title, MAX_AE_TITLE_LENGTH);
        }
        if self.dicom.port == 0 {
            bail!("监听端口不能为0");
        }
        if self.dicom.max_associations == 0 {
            bail!("最大关联数不能为0");
        }
        if self.dicom.negotiation_timeout_secs == 0 || self.dicom.idle_timeout_secs == 0 {
            bail!("关联协商与空闲超时不能为0");
        }
        if self.registry.refresh_interval_secs == 0 {
            bail!("注册表刷新间隔不能为0");
        }
        if self.validation.min_uid_length > self.validation.max_uid_length {
            bail!(
                "UID长度范围无效: {}..={}",
                self.validation.min_uid_length,
                self.validation.max_uid_length
            );
        }
        if self.database.url.is_some() && self.database.max_connections == 0 {
            bail!("数据库最大连接数不能为0");
        }
        if let Err(reason) = self.imaging.validate() {
            bail!("重建配置无效: {}", reason);
        }
        Ok(())
    }
}
