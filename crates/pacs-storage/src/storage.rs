//! 影像存储管理
//!
//! 对象按 `{StudyInstanceUID}/{SeriesInstanceUID}/{SOPInstanceUID}.dcm` 写入存储根目录。
//! 写入先落临时文件再重命名，同一路径重复写入为空操作。

use pacs_core::{PacsError, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 存储配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 存储根目录
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/dicom"),
        }
    }
}

/// 已存储对象的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// 相对存储根目录的路径
    pub relative_path: String,
    pub file_size: i64,
    /// SHA-256 十六进制
    pub checksum: String,
    /// 文件在本次写入前已存在
    pub already_present: bool,
}

/// 存储管理器
#[derive(Debug, Clone)]
pub struct StorageManager {
    base_path: PathBuf,
}

impl StorageManager {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 确保根目录存在
    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| PacsError::Storage(format!("无法创建存储目录 {:?}: {}", self.base_path, e)))
    }

    /// 由三级UID生成对象路径
    pub fn object_key(study_uid: &str, series_uid: &str, sop_instance_uid: &str) -> Result<String> {
        for uid in [study_uid, series_uid, sop_instance_uid] {
            if !is_safe_component(uid) {
                return Err(PacsError::Storage(format!("UID不能作为路径: {:?}", uid)));
            }
        }
        Ok(format!("{}/{}/{}.dcm", study_uid, series_uid, sop_instance_uid))
    }

    /// 对象的绝对路径
    pub fn absolute_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    /// 存储DICOM文件
    ///
    /// 目标已存在时不覆盖，返回现有文件的大小与校验和。
    pub async fn store_object(&self, key: &str, data: &[u8]) -> Result<StoredObject> {
        let full_path = self.absolute_path(key);

        if let Ok(existing) = tokio::fs::read(&full_path).await {
            debug!("对象已存在，跳过写入: {}", key);
            return Ok(StoredObject {
                relative_path: key.to_string(),
                file_size: existing.len() as i64,
                checksum: checksum(&existing),
                already_present: true,
            });
        }

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PacsError::Storage(format!("无法创建目录 {:?}: {}", parent, e)))?;
        }

        let tmp_path = full_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp_path, data).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(PacsError::Storage(format!("写入文件失败 {}: {}", key, e)));
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &full_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(PacsError::Storage(format!("提交文件失败 {}: {}", key, e)));
        }

        info!("DICOM文件已存储: {} ({} bytes)", key, data.len());
        Ok(StoredObject {
            relative_path: key.to_string(),
            file_size: data.len() as i64,
            checksum: checksum(data),
            already_present: false,
        })
    }

    /// 删除对象（元数据事务失败时回收本次新写入的文件）
    pub async fn remove_object(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.absolute_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("删除对象失败 {}: {}", key, e);
                Err(PacsError::Storage(e.to_string()))
            }
        }
    }

    /// 获取文件
    pub async fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.absolute_path(key))
            .await
            .map_err(|e| PacsError::Storage(format!("读取文件失败 {}: {}", key, e)))
    }
}

/// 计算SHA-256校验和
pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn is_safe_component(uid: &str) -> bool {
    !uid.is_empty()
        && uid != "."
        && uid != ".."
        && uid.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_object_key() {
        assert_eq!(
            StorageManager::object_key("1.2.3", "1.2.3.1", "1.2.3.1.1").unwrap(),
            "1.2.3/1.2.3.1/1.2.3.1.1.dcm"
        );
        assert!(StorageManager::object_key("..", "1", "2").is_err());
        assert!(StorageManager::object_key("1/2", "1", "2").is_err());
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::new(dir.path());
        let key = StorageManager::object_key("1.2.3", "1.2.3.1", "1.2.3.1.1").unwrap();

        let first = storage.store_object(&key, b"DICM-data").await.unwrap();
        assert!(!first.already_present);
        assert_eq!(first.file_size, 9);

        let second = storage.store_object(&key, b"other").await.unwrap();
        assert!(second.already_present);
        assert_eq!(second.checksum, first.checksum);
        assert_eq!(storage.get_file(&key).await.unwrap(), b"DICM-data");

        let series_dir = dir.path().join("1.2.3/1.2.3.1");
        let entries = std::fs::read_dir(series_dir).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_store_fails_when_root_is_a_file() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("root");
        std::fs::write(&blocker, b"x").unwrap();
        let storage = StorageManager::new(&blocker);

        let result = storage.store_object("1.2.3/1.2.3.1/1.dcm", b"data").await;
        assert!(matches!(result, Err(PacsError::Storage(_))));
    }

    #[tokio::test]
    async fn test_remove_missing_object_is_ok() {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::new(dir.path());
        assert!(storage.remove_object("1/2/3.dcm").await.is_ok());
    }
}
