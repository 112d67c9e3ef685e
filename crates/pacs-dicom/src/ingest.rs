//! 影像接收流水线
//!
//! 校验 → 查重 → 写入确定性路径 → 单事务upsert元数据 → 新检查通知 → 系列变更回调。
//! 同一SOP实例重复接收为空操作并返回成功；元数据事务失败时回收本次新写入的文件。

use crate::dimse::DimseStatus;
use crate::notification::{NewStudyEvent, Notifier};
use crate::parser::{DicomParser, ParsedDicomObject};
use crate::stats::ReceiverStats;
use crate::validator::DicomValidator;
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use pacs_core::{utils, Clock, Facility, Sex, SystemClock};
use pacs_database::{
    InstanceRecord, MetadataStore, NewInstance, NewPatient, NewSeries, NewStudy, UpsertOutcome,
};
use pacs_storage::{StorageManager, StoredObject};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 接收失败的分类
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    /// 调用方无权写入（礼貌拒绝）
    #[error("拒绝接收: {0}")]
    Rejected(String),

    /// 输入对象不合规，未做任何写入
    #[error("数据校验失败: {0}")]
    ValidationFailed(String),

    /// 文件或元数据持久化失败，对端可重试
    #[error("存储失败: {0}")]
    StorageFailed(String),

    /// 意外的内部错误
    #[error("内部错误: {0}")]
    InternalError(String),
}

impl IngestError {
    /// 对应的DIMSE状态
    pub fn status(&self) -> DimseStatus {
        match self {
            IngestError::Rejected(_) => DimseStatus::RefusedNotAuthorized,
            IngestError::ValidationFailed(_) => DimseStatus::CannotUnderstand,
            IngestError::StorageFailed(_) => DimseStatus::OutOfResources,
            IngestError::InternalError(_) => DimseStatus::ProcessingFailure,
        }
    }
}

/// 从网络收到的对象
#[derive(Debug, Clone)]
pub struct ReceivedObject {
    pub dataset: InMemDicomObject,
    /// 表示上下文协商的传输语法
    pub transfer_syntax_uid: String,
    /// 命令中的 Affected SOP Class UID
    pub sop_class_uid: String,
}

/// 接收结果
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub study_uid: String,
    pub series_uid: String,
    pub sop_instance_uid: String,
    pub instance_id: Uuid,
    pub file_path: String,
    /// 实例此前已存在
    pub duplicate: bool,
    pub study_created: bool,
    pub series_created: bool,
}

/// 系列内容变化的订阅者（例如重建缓存）
pub trait SeriesObserver: Send + Sync {
    fn series_changed(&self, series_uid: &str);
}

/// 影像接收流水线
pub struct IngestPipeline {
    store: Arc<dyn MetadataStore>,
    storage: StorageManager,
    validator: DicomValidator,
    stats: Arc<ReceiverStats>,
    clock: Arc<dyn Clock>,
    notifier: Option<Notifier>,
    observers: Vec<Arc<dyn SeriesObserver>>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        storage: StorageManager,
        validator: DicomValidator,
        stats: Arc<ReceiverStats>,
    ) -> Self {
        Self {
            store,
            storage,
            validator,
            stats,
            clock: Arc::new(SystemClock),
            notifier: None,
            observers: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SeriesObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> &Arc<ReceiverStats> {
        &self.stats
    }

    /// 接收一个对象，`facility` 为关联解析出的机构
    pub async fn ingest(&self, received: ReceivedObject, facility: &Facility) -> Result<IngestOutcome, IngestError> {
        self.stats.object_received();

        if !facility.is_active {
            return Err(IngestError::Rejected(format!("机构未启用: {}", facility.ae_title)));
        }

        let parsed = DicomParser::extract_metadata(&received.dataset);
        let validation = self.validator.validate_for_store(&parsed);
        if !validation.is_valid {
            self.stats.validation_failure();
            warn!("拒收不合规对象 (来自 {}): {}", facility.ae_title, validation.error_message());
            return Err(IngestError::ValidationFailed(validation.error_message()));
        }

        let ids = RequiredIds::from_parsed(&parsed)?;

        if let Some(existing) = self.lookup_instance(&ids.sop_instance_uid).await? {
            self.stats.duplicate();
            info!("重复接收，忽略: {}", ids.sop_instance_uid);
            return Ok(IngestOutcome {
                study_uid: ids.study_uid,
                series_uid: ids.series_uid,
                sop_instance_uid: ids.sop_instance_uid,
                instance_id: existing.id,
                file_path: existing.file_path,
                duplicate: true,
                study_created: false,
                series_created: false,
            });
        }

        let transfer_syntax_uid = utils::trim_dicom_value(&received.transfer_syntax_uid).to_string();
        let sop_class_uid = parsed
            .sop_class_uid
            .clone()
            .unwrap_or_else(|| utils::trim_dicom_value(&received.sop_class_uid).to_string());
        let bytes = encode_file(received.dataset, &sop_class_uid, &ids.sop_instance_uid, &transfer_syntax_uid)?;

        let key = StorageManager::object_key(&ids.study_uid, &ids.series_uid, &ids.sop_instance_uid)
            .map_err(|e| IngestError::ValidationFailed(e.to_string()))?;
        let stored = self.storage.store_object(&key, &bytes).await.map_err(|e| {
            self.stats.storage_failure();
            error!("写入DICOM文件失败 {}: {}", key, e);
            IngestError::StorageFailed(e.to_string())
        })?;

        let record = self.build_record(facility, &parsed, &ids, &stored, transfer_syntax_uid);
        let outcome = match self.store.upsert_instance(record).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.storage_failure();
                error!("元数据事务失败 {}: {}", ids.sop_instance_uid, e);
                if !stored.already_present {
                    self.discard_unreferenced(&key, &ids.sop_instance_uid).await;
                }
                return Err(IngestError::StorageFailed(format!("元数据事务失败: {}", e)));
            }
        };

        if !outcome.instance_created {
            // 并发重复投递：另一路已完成写入
            self.stats.duplicate();
            debug!("并发重复接收: {}", ids.sop_instance_uid);
        } else {
            self.stats.object_stored(stored.file_size as u64, outcome.study_created);
        }

        if outcome.study_created {
            self.notify_new_study(facility, &outcome).await;
        }
        for observer in &self.observers {
            observer.series_changed(&ids.series_uid);
        }

        info!(
            "已接收 {} (检查 {}, 系列 {}, 机构 {})",
            ids.sop_instance_uid, ids.study_uid, ids.series_uid, facility.ae_title
        );

        Ok(IngestOutcome {
            study_uid: ids.study_uid,
            series_uid: ids.series_uid,
            sop_instance_uid: ids.sop_instance_uid,
            instance_id: outcome.instance.id,
            file_path: outcome.instance.file_path,
            duplicate: !outcome.instance_created,
            study_created: outcome.study_created,
            series_created: outcome.series_created,
        })
    }

    /// 回收元数据未提交的文件；并发投递中另一路已提交的实例引用同一路径时保留
    async fn discard_unreferenced(&self, key: &str, sop_instance_uid: &str) -> bool {
        match self.store.find_instance(sop_instance_uid).await {
            Ok(Some(existing)) if existing.file_path == key => {
                debug!("文件已被已提交实例引用，保留: {}", key);
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("无法确认文件是否被引用，保留 {}: {}", key, e);
                return false;
            }
        }
        match self.storage.remove_object(key).await {
            Ok(()) => true,
            Err(e) => {
                warn!("回收文件失败 {}: {}", key, e);
                false
            }
        }
    }

    async fn lookup_instance(&self, sop_instance_uid: &str) -> Result<Option<pacs_core::Instance>, IngestError> {
        self.store.find_instance(sop_instance_uid).await.map_err(|e| {
            self.stats.internal_failure();
            IngestError::InternalError(format!("查询实例失败: {}", e))
        })
    }

    fn build_record(
        &self,
        facility: &Facility,
        parsed: &ParsedDicomObject,
        ids: &RequiredIds,
        stored: &StoredObject,
        transfer_syntax_uid: String,
    ) -> InstanceRecord {
        let (first_name, last_name) = parsed
            .patient_name
            .as_deref()
            .map(utils::split_person_name)
            .unwrap_or_default();
        let modality = parsed.modality_or_default().to_string();

        InstanceRecord {
            facility_id: facility.id,
            patient: NewPatient {
                patient_id: ids.patient_id.clone(),
                first_name,
                last_name,
                sex: parsed.patient_sex.as_deref().and_then(Sex::from_code),
                birth_date: parsed.patient_birth_date.as_deref().and_then(utils::parse_dicom_date),
            },
            study: NewStudy {
                study_uid: ids.study_uid.clone(),
                accession_number: parsed
                    .accession_number
                    .clone()
                    .unwrap_or_else(|| utils::default_accession_number(self.clock.now())),
                study_date: parsed.study_date.as_deref().and_then(utils::parse_dicom_date),
                study_time: parsed.study_time.as_deref().and_then(utils::parse_dicom_time),
                modality: modality.clone(),
                description: parsed.study_description_or_default().to_string(),
                referring_physician: parsed.referring_physician_name.clone(),
            },
            series: NewSeries {
                series_uid: ids.series_uid.clone(),
                modality,
                series_number: parsed.series_number_or_default(),
                description: parsed.series_description.clone(),
                slice_thickness: parsed.slice_thickness,
                pixel_spacing: parsed.pixel_spacing,
                image_orientation: parsed.image_orientation,
            },
            instance: NewInstance {
                sop_instance_uid: ids.sop_instance_uid.clone(),
                instance_number: parsed.instance_number,
                image_position: parsed.image_position,
                slice_location: parsed.slice_location,
                file_path: stored.relative_path.clone(),
                file_size: stored.file_size,
                checksum: stored.checksum.clone(),
                transfer_syntax_uid,
            },
        }
    }

    async fn notify_new_study(&self, facility: &Facility, outcome: &UpsertOutcome) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let event = NewStudyEvent {
            study_id: outcome.study.id,
            study_uid: outcome.study.study_uid.clone(),
            accession_number: outcome.study.accession_number.clone(),
            facility_name: facility.name.clone(),
            modality_code: outcome.study.modality.clone(),
            patient_display_name: outcome.patient.display_name(),
        };
        let delivered = notifier.new_study(facility.id, event).await;
        debug!("新检查 {} 已通知 {} 名用户", outcome.study.study_uid, delivered);
    }
}

/// 校验通过后必然存在的标识
struct RequiredIds {
    study_uid: String,
    series_uid: String,
    sop_instance_uid: String,
    patient_id: String,
}

impl RequiredIds {
    fn from_parsed(parsed: &ParsedDicomObject) -> Result<Self, IngestError> {
        let take = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| IngestError::ValidationFailed(format!("{} 缺失", name)))
        };
        Ok(Self {
            study_uid: take(&parsed.study_instance_uid, "Study Instance UID")?,
            series_uid: take(&parsed.series_instance_uid, "Series Instance UID")?,
            sop_instance_uid: take(&parsed.sop_instance_uid, "SOP Instance UID")?,
            patient_id: take(&parsed.patient_id, "Patient ID")?,
        })
    }
}

/// 加上文件元信息后序列化为Part 10文件
fn encode_file(
    dataset: InMemDicomObject,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    transfer_syntax_uid: &str,
) -> Result<Vec<u8>, IngestError> {
    if TransferSyntaxRegistry.get(transfer_syntax_uid).is_none() {
        return Err(IngestError::ValidationFailed(format!("不支持的传输语法: {}", transfer_syntax_uid)));
    }

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(transfer_syntax_uid)
        .build()
        .map_err(|e| IngestError::InternalError(format!("无法构建文件元信息: {}", e)))?;

    let mut bytes = Vec::new();
    dataset
        .with_exact_meta(meta)
        .write_all(&mut bytes)
        .map_err(|e| IngestError::InternalError(format!("无法序列化DICOM对象: {}", e)))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::MemoryNotificationSink;
    use crate::validator::ValidationPolicy;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::dictionary_std::{tags, uids};
    use pacs_database::{InMemoryMetadataStore, Recipient, RecipientRole};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingObserver {
        changed: Mutex<Vec<String>>,
    }

    impl SeriesObserver for RecordingObserver {
        fn series_changed(&self, series_uid: &str) {
            self.changed.lock().unwrap().push(series_uid.to_string());
        }
    }

    fn object(study: &str, series: &str, sop: &str) -> ReceivedObject {
        let dataset = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop)),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study)),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(series)),
            DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P1")),
            DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("Doe^Jane")),
            DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
        ]);
        ReceivedObject {
            dataset,
            transfer_syntax_uid: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            sop_class_uid: uids::CT_IMAGE_STORAGE.to_string(),
        }
    }

    struct Fixture {
        dir: TempDir,
        store: Arc<InMemoryMetadataStore>,
        facility: Facility,
        sink: Arc<MemoryNotificationSink>,
        observer: Arc<RecordingObserver>,
        pipeline: IngestPipeline,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let facility = store.add_facility("CT Room", "CT_MAIN_01").unwrap();
        store.add_recipient(Recipient {
            user_id: Uuid::new_v4(),
            role: RecipientRole::Radiologist,
            facility_id: None,
        });
        let sink = Arc::new(MemoryNotificationSink::new());
        let observer = Arc::new(RecordingObserver::default());
        let validator = DicomValidator::new(ValidationPolicy {
            min_uid_length: 1,
            ..Default::default()
        });
        let pipeline = IngestPipeline::new(
            store.clone(),
            StorageManager::new(dir.path()),
            validator,
            Arc::new(ReceiverStats::new()),
        )
        .with_notifier(Notifier::new(store.clone(), sink.clone()))
        .with_observer(observer.clone());

        Fixture {
            dir,
            store,
            facility,
            sink,
            observer,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let f = fixture();
        let first = f.pipeline.ingest(object("1.2.3", "1.2.3.1", "1.2.3.1.1"), &f.facility).await.unwrap();
        assert!(!first.duplicate);
        assert!(first.study_created);
        assert_eq!(first.file_path, "1.2.3/1.2.3.1/1.2.3.1.1.dcm");

        let second = f.pipeline.ingest(object("1.2.3", "1.2.3.1", "1.2.3.1.1"), &f.facility).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.instance_id, first.instance_id);

        let counts = f.store.counts().await.unwrap();
        assert_eq!((counts.patients, counts.studies, counts.series, counts.instances), (1, 1, 1, 1));
        assert_eq!(f.sink.delivered().len(), 1);

        let stats = f.pipeline.stats().snapshot();
        assert_eq!(stats.objects_stored, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn test_study_facility_is_immutable() {
        let f = fixture();
        let other = f.store.add_facility("MR Room", "MR_01").unwrap();

        f.pipeline.ingest(object("1.2.3", "1.2.3.1", "1.2.3.1.1"), &f.facility).await.unwrap();
        let second = f.pipeline.ingest(object("1.2.3", "1.2.3.1", "1.2.3.1.2"), &other).await.unwrap();
        assert!(!second.study_created);

        let study = f.store.find_study("1.2.3").await.unwrap().unwrap();
        assert_eq!(study.facility_id, f.facility.id);
        // 只有首次建检查时发送通知
        assert_eq!(f.sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_uid_is_rejected_before_any_write() {
        let f = fixture();
        let mut received = object("1.2.3", "1.2.3.1", "1.2.3.1.1");
        received.dataset.remove_element(tags::SERIES_INSTANCE_UID);

        let err = f.pipeline.ingest(received, &f.facility).await.unwrap_err();
        assert!(matches!(err, IngestError::ValidationFailed(_)));
        assert_eq!(err.status(), DimseStatus::CannotUnderstand);
        assert_eq!(f.store.counts().await.unwrap().instances, 0);
        assert!(f.observer.changed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_failure_removes_new_file() {
        let f = fixture();
        f.store.set_fail_writes(true);

        let err = f.pipeline.ingest(object("1.2.3", "1.2.3.1", "1.2.3.1.1"), &f.facility).await.unwrap_err();
        assert!(matches!(err, IngestError::StorageFailed(_)));
        assert_eq!(err.status(), DimseStatus::OutOfResources);

        let path = f.dir.path().join("1.2.3/1.2.3.1/1.2.3.1.1.dcm");
        assert!(!path.exists());
        assert_eq!(f.store.counts().await.unwrap(), Default::default());
    }

    fn stored_files(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                files.extend(stored_files(&path));
            } else {
                files.push(path);
            }
        }
        files
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_delivery_stores_once() {
        let f = fixture();
        let pipeline = Arc::new(f.pipeline);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                let facility = f.facility.clone();
                tokio::spawn(async move {
                    pipeline.ingest(object("1.2.3", "1.2.3.1", "1.2.3.1.1"), &facility).await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(outcomes.iter().filter(|o| !o.duplicate).count(), 1);
        assert!(outcomes.iter().all(|o| o.instance_id == outcomes[0].instance_id));
        let counts = f.store.counts().await.unwrap();
        assert_eq!((counts.studies, counts.series, counts.instances), (1, 1, 1));
        assert_eq!(stored_files(f.dir.path()), vec![f.dir.path().join("1.2.3/1.2.3.1/1.2.3.1.1.dcm")]);
        assert_eq!(f.sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_keeps_file_referenced_by_committed_instance() {
        let f = fixture();
        f.pipeline.ingest(object("1.2.3", "1.2.3.1", "1.2.3.1.1"), &f.facility).await.unwrap();
        let key = "1.2.3/1.2.3.1/1.2.3.1.1.dcm";

        // 另一路投递的事务失败时，已提交实例的文件必须保留
        assert!(!f.pipeline.discard_unreferenced(key, "1.2.3.1.1").await);
        assert!(f.dir.path().join(key).exists());

        let stray = "1.2.3/1.2.3.1/1.2.3.1.9.dcm";
        f.pipeline.storage.store_object(stray, b"orphan").await.unwrap();
        assert!(f.pipeline.discard_unreferenced(stray, "1.2.3.1.9").await);
        assert!(!f.dir.path().join(stray).exists());
    }

    #[tokio::test]
    async fn test_observers_see_changed_series() {
        let f = fixture();
        f.pipeline.ingest(object("1.2.3", "1.2.3.1", "1.2.3.1.1"), &f.facility).await.unwrap();
        f.pipeline.ingest(object("1.2.3", "1.2.3.2", "1.2.3.2.1"), &f.facility).await.unwrap();

        assert_eq!(*f.observer.changed.lock().unwrap(), vec!["1.2.3.1", "1.2.3.2"]);
    }

    #[tokio::test]
    async fn test_inactive_facility_is_refused() {
        let f = fixture();
        let mut facility = f.facility.clone();
        facility.is_active = false;

        let err = f.pipeline.ingest(object("1.2.3", "1.2.3.1", "1.2.3.1.1"), &facility).await.unwrap_err();
        assert_eq!(err.status(), DimseStatus::RefusedNotAuthorized);
    }
}
