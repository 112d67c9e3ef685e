//! 元数据存储接口
//!
//! 接收服务只通过 [`MetadataStore`] 访问关系数据库。一次影像接收对应的
//! 患者、检查、系列、实例记录由 [`MetadataStore::upsert_instance`] 在单个事务内完成，
//! 依赖唯一约束实现幂等的 get-or-create 语义。

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use pacs_core::{Facility, Instance, Patient, Result, Series, Sex, Study};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 新患者数据（首次出现时写入，之后不覆盖）
#[derive(Debug, Clone)]
pub struct NewPatient {
    pub patient_id: String,
    pub first_name: String,
    pub last_name: String,
    pub sex: Option<Sex>,
    pub birth_date: Option<NaiveDate>,
}

/// 新检查数据
#[derive(Debug, Clone)]
pub struct NewStudy {
    pub study_uid: String,
    pub accession_number: String,
    pub study_date: Option<NaiveDate>,
    pub study_time: Option<NaiveTime>,
    pub modality: String,
    pub description: String,
    pub referring_physician: Option<String>,
}

/// 新系列数据
#[derive(Debug, Clone)]
pub struct NewSeries {
    pub series_uid: String,
    pub modality: String,
    pub series_number: i32,
    pub description: Option<String>,
    pub slice_thickness: Option<f64>,
    pub pixel_spacing: Option<[f64; 2]>,
    pub image_orientation: Option<[f64; 6]>,
}

/// 新实例数据
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub sop_instance_uid: String,
    pub instance_number: Option<i32>,
    pub image_position: Option<[f64; 3]>,
    pub slice_location: Option<f64>,
    pub file_path: String,
    pub file_size: i64,
    pub checksum: String,
    pub transfer_syntax_uid: String,
}

/// 一次接收需要写入的全部记录
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub facility_id: Uuid,
    pub patient: NewPatient,
    pub study: NewStudy,
    pub series: NewSeries,
    pub instance: NewInstance,
}

/// upsert结果：各层记录及其是否为本次新建
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub patient: Patient,
    pub study: Study,
    pub series: Series,
    pub instance: Instance,
    pub patient_created: bool,
    pub study_created: bool,
    pub series_created: bool,
    pub instance_created: bool,
}

/// 通知接收者角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientRole {
    Facility,
    Radiologist,
    Administrator,
}

impl RecipientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientRole::Facility => "facility",
            RecipientRole::Radiologist => "radiologist",
            RecipientRole::Administrator => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "facility" => Some(RecipientRole::Facility),
            "radiologist" => Some(RecipientRole::Radiologist),
            "admin" => Some(RecipientRole::Administrator),
            _ => None,
        }
    }
}

/// 通知接收者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: Uuid,
    pub role: RecipientRole,
    pub facility_id: Option<Uuid>,
}

/// 接收者范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientScope {
    /// 新检查：该机构用户以及所有放射科医生
    NewStudy { facility_id: Uuid },
    /// 安全告警：系统管理员
    Administrators,
}

impl RecipientScope {
    /// 判断接收者是否属于该范围
    pub fn includes(&self, recipient: &Recipient) -> bool {
        match self {
            RecipientScope::NewStudy { facility_id } => match recipient.role {
                RecipientRole::Radiologist => true,
                RecipientRole::Facility => recipient.facility_id == Some(*facility_id),
                RecipientRole::Administrator => false,
            },
            RecipientScope::Administrators => recipient.role == RecipientRole::Administrator,
        }
    }
}

/// 各表行数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub patients: u64,
    pub studies: u64,
    pub series: u64,
    pub instances: u64,
}

/// 元数据存储
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// 所有启用的机构
    async fn active_facilities(&self) -> Result<Vec<Facility>>;

    /// 在单个事务内 get-or-create 患者、检查、系列和实例
    ///
    /// 已存在的检查保持原有的机构归属；实例已存在时不做任何修改。
    async fn upsert_instance(&self, record: InstanceRecord) -> Result<UpsertOutcome>;

    async fn find_patient(&self, patient_id: &str) -> Result<Option<Patient>>;

    async fn find_study(&self, study_uid: &str) -> Result<Option<Study>>;

    async fn find_series(&self, series_uid: &str) -> Result<Option<Series>>;

    async fn find_instance(&self, sop_instance_uid: &str) -> Result<Option<Instance>>;

    /// 系列下的全部实例（顺序不保证）
    async fn series_instances(&self, series_uid: &str) -> Result<Vec<Instance>>;

    async fn recipients(&self, scope: RecipientScope) -> Result<Vec<Recipient>>;

    async fn counts(&self) -> Result<StoreCounts>;
}
