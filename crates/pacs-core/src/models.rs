//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 医疗机构（按AE标题登记的影像设备来源）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Uuid,
    pub name: String,     // 机构显示名称
    pub ae_title: String, // 设备AE标题，大小写不敏感唯一
    pub is_active: bool,
}

/// 患者基本信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub patient_id: String,           // 外部患者ID
    pub first_name: String,           // 名
    pub last_name: String,            // 姓
    pub sex: Option<Sex>,             // 性别
    pub birth_date: Option<NaiveDate>, // 出生日期
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    /// 用于展示的患者姓名
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

/// 性别枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
    Other,
}

impl Sex {
    /// 从DICOM代码(M/F/O)转换
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "M" => Some(Sex::Male),
            "F" => Some(Sex::Female),
            "O" => Some(Sex::Other),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Other => "O",
        }
    }
}

/// 检查信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub id: Uuid,
    pub study_uid: String, // DICOM Study Instance UID
    pub patient_id: Uuid,
    pub facility_id: Uuid,        // 创建时确定，之后不可更改
    pub accession_number: String, // 检查号
    pub study_date: Option<NaiveDate>,
    pub study_time: Option<NaiveTime>,
    pub modality: String,            // 检查设备类型 (CT, MR, DR等)
    pub description: String,         // 检查描述
    pub referring_physician: Option<String>,
    pub status: StudyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 检查状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StudyStatus {
    Scheduled,  // 已预约
    InProgress, // 检查中
    Completed,  // 已完成
    Canceled,   // 已取消
}

impl StudyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudyStatus::Scheduled => "SCHEDULED",
            StudyStatus::InProgress => "IN_PROGRESS",
            StudyStatus::Completed => "COMPLETED",
            StudyStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SCHEDULED" => Some(StudyStatus::Scheduled),
            "IN_PROGRESS" => Some(StudyStatus::InProgress),
            "COMPLETED" => Some(StudyStatus::Completed),
            "CANCELED" => Some(StudyStatus::Canceled),
            _ => None,
        }
    }
}

/// 系列信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub id: Uuid,
    pub series_uid: String, // DICOM Series Instance UID
    pub study_id: Uuid,
    pub modality: String,
    pub series_number: i32,
    pub description: Option<String>,
    pub slice_thickness: Option<f64>,
    pub pixel_spacing: Option<[f64; 2]>,     // 行间距, 列间距 (mm)
    pub image_orientation: Option<[f64; 6]>, // 行/列方向余弦
    pub images_count: i32,
    pub created_at: DateTime<Utc>,
}

/// 影像实例信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub sop_instance_uid: String, // DICOM SOP Instance UID
    pub series_id: Uuid,
    pub instance_number: Option<i32>,
    pub image_position: Option<[f64; 3]>,
    pub slice_location: Option<f64>,
    pub file_path: String, // 相对存储根目录的路径
    pub file_size: i64,
    pub checksum: String, // SHA-256
    pub transfer_syntax_uid: String,
    pub created_at: DateTime<Utc>,
}
