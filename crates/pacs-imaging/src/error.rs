//! 重建错误定义

use pacs_core::PacsError;
use serde::Serialize;
use thiserror::Error;

/// 重建错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconstructionError {
    /// 可用切片不足或缺少必需的元数据
    #[error("数据不足: {0}")]
    InsufficientData(String),

    #[error("重建任务已取消")]
    Cancelled,

    #[error("无效的重建请求: {0}")]
    InvalidRequest(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("重建内部错误: {0}")]
    Internal(String),
}

impl ReconstructionError {
    /// 稳定的机器可读错误类型
    pub fn kind(&self) -> &'static str {
        match self {
            ReconstructionError::InsufficientData(_) => "insufficient_data",
            ReconstructionError::Cancelled => "cancelled",
            ReconstructionError::InvalidRequest(_) => "invalid_request",
            ReconstructionError::NotFound(_) => "not_found",
            ReconstructionError::Internal(_) => "internal",
        }
    }

    /// 只有内部错误属于意外情况
    pub fn is_unexpected(&self) -> bool {
        matches!(self, ReconstructionError::Internal(_))
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<PacsError> for ReconstructionError {
    fn from(err: PacsError) -> Self {
        match err {
            PacsError::NotFound(what) => ReconstructionError::NotFound(what),
            other => ReconstructionError::Internal(other.to_string()),
        }
    }
}

/// 对外返回的结构化错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, ReconstructionError>;
