//! # PACS数据库模块
//!
//! 负责医学影像元数据的存储和管理：定义元数据存储接口，提供PostgreSQL实现与内存实现。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::{DatabaseConfig, DatabasePool};
pub use memory::InMemoryMetadataStore;
pub use queries::DatabaseQueries;
pub use store::*;
