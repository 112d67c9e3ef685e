//! 数据库连接管理

use pacs_core::{PacsError, Result};
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// 数据库配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 连接字符串；为空时使用内存存储
    pub url: Option<String>,
    /// 最大连接数
    pub max_connections: u32,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            connect_timeout_secs: 10,
        }
    }
}

/// 数据库连接池
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// 建立连接池
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| PacsError::Database(format!("无法连接数据库: {}", e)))?;

        info!("数据库连接池已建立，最大连接数: {}", config.max_connections);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
