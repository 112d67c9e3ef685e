//! # PACS存储模块
//!
//! 负责DICOM对象文件的确定性路径存储。

pub mod storage;

pub use storage::*;
