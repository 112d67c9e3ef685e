//! 内存元数据存储
//!
//! 以唯一键哈希表模拟关系表的唯一约束，整个upsert在一把锁内完成，等价于单事务。
//! 用于无数据库部署和测试。

use crate::store::*;
use async_trait::async_trait;
use chrono::Utc;
use pacs_core::{utils, Facility, Instance, PacsError, Patient, Result, Series, Study, StudyStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    facilities: Vec<Facility>,
    recipients: Vec<Recipient>,
    patients: HashMap<String, Patient>,
    studies: HashMap<String, Study>,
    series: HashMap<String, Series>,
    instances: HashMap<String, Instance>,
}

/// 内存元数据存储
#[derive(Default)]
pub struct InMemoryMetadataStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记机构，AE标题大小写不敏感地唯一
    pub fn add_facility(&self, name: &str, ae_title: &str) -> Result<Facility> {
        let mut tables = self.tables();
        if ae_title_conflicts(&tables.facilities, ae_title) {
            return Err(PacsError::Validation(format!("AE标题已被占用: {}", ae_title)));
        }
        let facility = Facility {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ae_title: ae_title.to_string(),
            is_active: true,
        };
        tables.facilities.push(facility.clone());
        Ok(facility)
    }

    /// 启用或停用机构
    pub fn set_facility_active(&self, facility_id: Uuid, active: bool) {
        if let Some(f) = self
            .tables()
            .facilities
            .iter_mut()
            .find(|f| f.id == facility_id)
        {
            f.is_active = active;
        }
    }

    pub fn add_recipient(&self, recipient: Recipient) {
        self.tables().recipients.push(recipient);
    }

    /// 之后的upsert全部以数据库错误失败（用于验证回滚路径）
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn active_facilities(&self) -> Result<Vec<Facility>> {
        Ok(self
            .tables()
            .facilities
            .iter()
            .filter(|f| f.is_active)
            .cloned()
            .collect())
    }

    async fn upsert_instance(&self, record: InstanceRecord) -> Result<UpsertOutcome> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PacsError::Database("事务提交失败".to_string()));
        }

        let now = Utc::now();
        let mut tables = self.tables();
        let InstanceRecord {
            facility_id,
            patient,
            study,
            series,
            instance,
        } = record;

        let patient_created = !tables.patients.contains_key(&patient.patient_id);
        let patient_row = tables
            .patients
            .entry(patient.patient_id.clone())
            .or_insert_with(|| Patient {
                id: Uuid::new_v4(),
                patient_id: patient.patient_id,
                first_name: patient.first_name,
                last_name: patient.last_name,
                sex: patient.sex,
                birth_date: patient.birth_date,
                created_at: now,
                updated_at: now,
            })
            .clone();

        let study_created = !tables.studies.contains_key(&study.study_uid);
        let study_row = tables
            .studies
            .entry(study.study_uid.clone())
            .or_insert_with(|| Study {
                id: Uuid::new_v4(),
                study_uid: study.study_uid,
                patient_id: patient_row.id,
                facility_id,
                accession_number: study.accession_number,
                study_date: study.study_date,
                study_time: study.study_time,
                modality: study.modality,
                description: study.description,
                referring_physician: study.referring_physician,
                status: StudyStatus::Scheduled,
                created_at: now,
                updated_at: now,
            })
            .clone();

        let series_created = !tables.series.contains_key(&series.series_uid);
        let series_row = tables
            .series
            .entry(series.series_uid.clone())
            .or_insert_with(|| Series {
                id: Uuid::new_v4(),
                series_uid: series.series_uid,
                study_id: study_row.id,
                modality: series.modality,
                series_number: series.series_number,
                description: series.description,
                slice_thickness: series.slice_thickness,
                pixel_spacing: series.pixel_spacing,
                image_orientation: series.image_orientation,
                images_count: 0,
                created_at: now,
            })
            .clone();

        let instance_created = !tables.instances.contains_key(&instance.sop_instance_uid);
        let instance_row = tables
            .instances
            .entry(instance.sop_instance_uid.clone())
            .or_insert_with(|| Instance {
                id: Uuid::new_v4(),
                sop_instance_uid: instance.sop_instance_uid,
                series_id: series_row.id,
                instance_number: instance.instance_number,
                image_position: instance.image_position,
                slice_location: instance.slice_location,
                file_path: instance.file_path,
                file_size: instance.file_size,
                checksum: instance.checksum,
                transfer_syntax_uid: instance.transfer_syntax_uid,
                created_at: now,
            })
            .clone();

        let mut series_row = series_row;
        if instance_created {
            if let Some(s) = tables.series.get_mut(&series_row.series_uid) {
                s.images_count += 1;
                series_row = s.clone();
            }
        }

        debug!(
            "内存upsert完成: 检查={} 系列={} 实例={} (新建实例: {})",
            study_row.study_uid, series_row.series_uid, instance_row.sop_instance_uid, instance_created
        );

        Ok(UpsertOutcome {
            patient: patient_row,
            study: study_row,
            series: series_row,
            instance: instance_row,
            patient_created,
            study_created,
            series_created,
            instance_created,
        })
    }

    async fn find_patient(&self, patient_id: &str) -> Result<Option<Patient>> {
        Ok(self.tables().patients.get(patient_id).cloned())
    }

    async fn find_study(&self, study_uid: &str) -> Result<Option<Study>> {
        Ok(self.tables().studies.get(study_uid).cloned())
    }

    async fn find_series(&self, series_uid: &str) -> Result<Option<Series>> {
        Ok(self.tables().series.get(series_uid).cloned())
    }

    async fn find_instance(&self, sop_instance_uid: &str) -> Result<Option<Instance>> {
        Ok(self.tables().instances.get(sop_instance_uid).cloned())
    }

    async fn series_instances(&self, series_uid: &str) -> Result<Vec<Instance>> {
        let tables = self.tables();
        let Some(series) = tables.series.get(series_uid) else {
            return Ok(Vec::new());
        };
        Ok(tables
            .instances
            .values()
            .filter(|i| i.series_id == series.id)
            .cloned()
            .collect())
    }

    async fn recipients(&self, scope: RecipientScope) -> Result<Vec<Recipient>> {
        Ok(self
            .tables()
            .recipients
            .iter()
            .filter(|r| scope.includes(r))
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let tables = self.tables();
        Ok(StoreCounts {
            patients: tables.patients.len() as u64,
            studies: tables.studies.len() as u64,
            series: tables.series.len() as u64,
            instances: tables.instances.len() as u64,
        })
    }
}

/// 机构AE标题是否大小写不敏感地冲突
fn ae_title_conflicts(existing: &[Facility], ae_title: &str) -> bool {
    let wanted = utils::normalize_ae_title(ae_title);
    existing
        .iter()
        .any(|f| utils::normalize_ae_title(&f.ae_title) == wanted)
}
