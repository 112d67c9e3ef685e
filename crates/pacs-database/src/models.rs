//! 数据库模型

use pacs_core::models::*;
use sqlx::FromRow;
use uuid::Uuid;
use chrono::{DateTime, Utc, NaiveDate, NaiveTime};

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库机构表
#[derive(Debug, FromRow)]
pub struct DbFacility {
    pub id: Uuid,
    pub name: String,
    pub ae_title: String,
    pub is_active: bool,
}

impl From<DbFacility> for Facility {
    fn from(db: DbFacility) -> Self {
        Facility {
            id: db.id,
            name: db.name,
            ae_title: db.ae_title,
            is_active: db.is_active,
        }
    }
}

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub id: Uuid,
    pub patient_id: String,
    pub first_name: String,
    pub last_name: String,
    pub sex: Option<String>, // 存储为字符串，转换为Sex枚举
    pub birth_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbPatient> for Patient {
    fn from(db_patient: DbPatient) -> Self {
        Patient {
            id: db_patient.id,
            patient_id: db_patient.patient_id,
            first_name: db_patient.first_name,
            last_name: db_patient.last_name,
            sex: db_patient.sex.as_deref().and_then(Sex::from_code),
            birth_date: db_patient.birth_date,
            created_at: db_patient.created_at,
            updated_at: db_patient.updated_at,
        }
    }
}

/// 数据库检查表
#[derive(Debug, FromRow)]
pub struct DbStudy {
    pub id: Uuid,
    pub study_uid: String,
    pub patient_id: Uuid,
    pub facility_id: Uuid,
    pub accession_number: String,
    pub study_date: Option<NaiveDate>,
    pub study_time: Option<NaiveTime>,
    pub modality: String,
    pub description: String,
    pub referring_physician: Option<String>,
    pub status: String, // 存储为字符串，转换为StudyStatus枚举
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbStudy> for Study {
    fn from(db_study: DbStudy) -> Self {
        Study {
            id: db_study.id,
            study_uid: db_study.study_uid,
            patient_id: db_study.patient_id,
            facility_id: db_study.facility_id,
            accession_number: db_study.accession_number,
            study_date: db_study.study_date,
            study_time: db_study.study_time,
            modality: db_study.modality,
            description: db_study.description,
            referring_physician: db_study.referring_physician,
            status: StudyStatus::parse(&db_study.status).unwrap_or(StudyStatus::Scheduled),
            created_at: db_study.created_at,
            updated_at: db_study.updated_at,
        }
    }
}

/// 数据库系列表
#[derive(Debug, FromRow)]
pub struct DbSeries {
    pub id: Uuid,
    pub series_uid: String,
    pub study_id: Uuid,
    pub modality: String,
    pub series_number: i32,
    pub description: Option<String>,
    pub slice_thickness: Option<f64>,
    pub pixel_spacing: Option<Vec<f64>>,
    pub image_orientation: Option<Vec<f64>>,
    pub images_count: i32,
    pub created_at: DateTime<Utc>,
}

impl From<DbSeries> for Series {
    fn from(db_series: DbSeries) -> Self {
        Series {
            id: db_series.id,
            series_uid: db_series.series_uid,
            study_id: db_series.study_id,
            modality: db_series.modality,
            series_number: db_series.series_number,
            description: db_series.description,
            slice_thickness: db_series.slice_thickness,
            pixel_spacing: db_series.pixel_spacing.and_then(|v| v.try_into().ok()),
            image_orientation: db_series.image_orientation.and_then(|v| v.try_into().ok()),
            images_count: db_series.images_count,
            created_at: db_series.created_at,
        }
    }
}

/// 数据库实例表
#[derive(Debug, FromRow)]
pub struct DbInstance {
    pub id: Uuid,
    pub sop_instance_uid: String,
    pub series_id: Uuid,
    pub instance_number: Option<i32>,
    pub image_position: Option<Vec<f64>>,
    pub slice_location: Option<f64>,
    pub file_path: String,
    pub file_size: i64,
    pub checksum: String,
    pub transfer_syntax_uid: String,
    pub created_at: DateTime<Utc>,
}

impl From<DbInstance> for Instance {
    fn from(db_instance: DbInstance) -> Self {
        Instance {
            id: db_instance.id,
            sop_instance_uid: db_instance.sop_instance_uid,
            series_id: db_instance.series_id,
            instance_number: db_instance.instance_number,
            image_position: db_instance.image_position.and_then(|v| v.try_into().ok()),
            slice_location: db_instance.slice_location,
            file_path: db_instance.file_path,
            file_size: db_instance.file_size,
            checksum: db_instance.checksum,
            transfer_syntax_uid: db_instance.transfer_syntax_uid,
            created_at: db_instance.created_at,
        }
    }
}

/// 数据库用户表（仅读取通知所需字段）
#[derive(Debug, FromRow)]
pub struct DbRecipient {
    pub id: Uuid,
    pub role: String,
    pub facility_id: Option<Uuid>,
}
