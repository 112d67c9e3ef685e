//! 端到端：机构注册 → 关联准入 → C-STORE接收 → 体数据重建

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use pacs_core::Facility;
use pacs_database::{InMemoryMetadataStore, MetadataStore};
use pacs_dicom::dimse::command_field;
use pacs_dicom::{
    AeRegistry, AssociationContext, AssociationGate, AssociationRejection, CEchoService, CStoreService, CommandSet,
    DicomValidator, DimseRequest, DimseStatus, IngestPipeline, ReceiverStats, ServiceManager, ValidationPolicy,
};
use pacs_imaging::{ImagingConfig, JobContext, JobRunner, MprRequest, Plane, ReconstructionEngine, StoredSeriesSource};
use pacs_storage::StorageManager;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tempfile::TempDir;

const ROWS: u16 = 4;
const COLUMNS: u16 = 6;

struct Harness {
    _dir: TempDir,
    store: Arc<InMemoryMetadataStore>,
    gate: Arc<AssociationGate>,
    services: ServiceManager,
    engine: Arc<ReconstructionEngine>,
}

fn harness(imaging: ImagingConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryMetadataStore::new());
    let storage = StorageManager::new(dir.path());
    let stats = Arc::new(ReceiverStats::new());

    let registry = Arc::new(AeRegistry::new(store.clone()));
    let gate = Arc::new(AssociationGate::new(registry, stats.clone()));

    let runner = Arc::new(JobRunner::new(imaging.worker_threads).unwrap());
    let source = Arc::new(StoredSeriesSource::new(store.clone(), storage.clone(), runner.clone()));
    let engine = Arc::new(ReconstructionEngine::with_runner(imaging, source, runner));

    let pipeline = IngestPipeline::new(
        store.clone(),
        storage,
        // 测试UID较短
        DicomValidator::new(ValidationPolicy {
            min_uid_length: 1,
            ..Default::default()
        }),
        stats.clone(),
    )
    .with_observer(engine.clone());
    let services = ServiceManager::new(
        Arc::new(CEchoService::new(stats)),
        Arc::new(CStoreService::new(Arc::new(pipeline)).with_gate(gate.clone())),
    );

    Harness {
        _dir: dir,
        store,
        gate,
        services,
        engine,
    }
}

fn peer() -> SocketAddr {
    "192.0.2.10:4100".parse().unwrap()
}

fn ct_image(sop_instance_uid: &str, instance_number: u16) -> InMemDicomObject {
    let pixels: Vec<u16> = (0..ROWS * COLUMNS).map(|i| i * 10 + instance_number * 100).collect();
    InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid)),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3")),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.1")),
        DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P1")),
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("Doe^Jane")),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
        DataElement::new(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from(instance_number.to_string())),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
        DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, PrimitiveValue::from("MONOCHROME2")),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(ROWS)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(COLUMNS)),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(pixels.into())),
    ])
}

fn store_request(dataset: InMemDicomObject) -> DimseRequest {
    let sop_instance_uid = dataset
        .element(tags::SOP_INSTANCE_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').to_string());
    DimseRequest {
        command: CommandSet {
            command_field: command_field::C_STORE_RQ,
            message_id: 1,
            affected_sop_class_uid: Some(uids::CT_IMAGE_STORAGE.to_string()),
            affected_sop_instance_uid: sop_instance_uid,
            has_data_set: true,
        },
        dataset: Some(dataset),
        transfer_syntax_uid: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
    }
}

async fn associate(harness: &Harness, calling_ae_title: &str) -> Result<AssociationContext, AssociationRejection> {
    let ip: IpAddr = peer().ip();
    let facility: Facility = harness.gate.admit(ip, calling_ae_title).await?;
    Ok(AssociationContext::new(peer(), calling_ae_title, "NOCTIS_SCP", facility))
}

#[tokio::test]
async fn test_ct_main_store_then_reconstruct() {
    let harness = harness(ImagingConfig::default());

    // 1. 注册机构
    let facility = harness.store.add_facility("CT Main", "CT_MAIN_01").unwrap();

    // 2. 已注册AE的关联与C-STORE
    let context = associate(&harness, "CT_MAIN_01").await.unwrap();
    assert_eq!(context.facility.id, facility.id);
    let response = harness
        .services
        .handle_request(&context, store_request(ct_image("1.2.3.1.1", 1)))
        .await;
    assert_eq!(response.status, DimseStatus::Success);

    let counts = harness.store.counts().await.unwrap();
    assert_eq!((counts.patients, counts.studies, counts.series, counts.instances), (1, 1, 1, 1));
    let study = harness.store.find_study("1.2.3").await.unwrap().unwrap();
    assert_eq!(study.facility_id, facility.id);

    // 3. 未注册AE被拒绝，不产生任何记录
    let rejection = associate(&harness, "UNKNOWN_DEV").await.unwrap_err();
    assert!(matches!(rejection, AssociationRejection::UnknownAeTitle { .. }));
    assert_eq!(harness.store.counts().await.unwrap(), counts);

    // 4. 单张切片的轴位中间层：返回图像并标注数据不足
    let mpr = harness
        .engine
        .mpr(MprRequest::new("1.2.3.1", Plane::Axial), JobContext::detached())
        .await
        .unwrap();
    assert!(!mpr.image.is_empty());
    assert_eq!(mpr.volume.shape, (1, ROWS as usize, COLUMNS as usize));
    assert_eq!((mpr.image.width, mpr.image.height), (COLUMNS as u32, ROWS as u32));
    assert!(mpr.warnings.iter().any(|w| w.kind == "insufficient_data"));
}

#[tokio::test]
async fn test_duplicate_delivery_and_new_slice_refresh_volume() {
    let harness = harness(ImagingConfig {
        min_slices: 2,
        ..Default::default()
    });
    harness.store.add_facility("CT Main", "CT_MAIN_01").unwrap();
    let context = associate(&harness, "ct_main_01").await.unwrap();

    for _ in 0..2 {
        let response = harness
            .services
            .handle_request(&context, store_request(ct_image("1.2.3.1.1", 1)))
            .await;
        assert_eq!(response.status, DimseStatus::Success);
    }
    assert_eq!(harness.store.counts().await.unwrap().instances, 1);

    let first = harness
        .engine
        .mpr(MprRequest::new("1.2.3.1", Plane::Axial), JobContext::detached())
        .await
        .unwrap();
    assert_eq!(first.volume.shape.0, 1);

    // 新切片到达后缓存失效，体数据按两张切片重建
    let response = harness
        .services
        .handle_request(&context, store_request(ct_image("1.2.3.1.2", 2)))
        .await;
    assert_eq!(response.status, DimseStatus::Success);
    assert_eq!(harness.engine.stats().volumes.entries, 0);

    let second = harness
        .engine
        .mpr(MprRequest::new("1.2.3.1", Plane::Coronal), JobContext::detached())
        .await
        .unwrap();
    assert_eq!(second.volume.shape, (2, ROWS as usize, COLUMNS as usize));
    assert!(second.warnings.is_empty());
}
