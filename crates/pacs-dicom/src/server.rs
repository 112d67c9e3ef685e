//! DICOM服务器实现
//!
//! 每个TCP连接一个异步任务；关联数受信号量限制，任务由 [`TaskTracker`] 跟踪，
//! 停止时等待在途关联结束（有上限）。
//! 关联协商阶段通过 [`FacilityAccessControl`] 调用 [`AssociationGate`]，
//! 被拒绝的对端收到 A-ASSOCIATE-RJ，不会进入DIMSE处理。
//! 协商与两次PDU之间的空闲都有超时，超时的对端被中止并释放名额。

use crate::association::{AdmissionDecision, AssociationContext, AssociationGate, AssociationManager};
use crate::dimse::{self, CommandSet, DimseParser, DimseStatus};
use crate::services::{DimseRequest, ServiceManager};
use crate::transfer_syntax::TransferSyntaxManager;
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_ul::association::server::AccessControl;
use dicom_ul::association::{AsyncServerAssociation, ServerAssociationOptions};
use dicom_ul::pdu::{AssociationRJServiceUserReason, PDataValue, PDataValueType, UserIdentity};
use dicom_ul::Pdu;
use pacs_core::{utils, PacsError, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// DICOM服务器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DicomServerConfig {
    /// 应用实体标题
    pub ae_title: String,
    pub bind_address: String,
    /// 监听端口
    pub port: u16,
    /// 最大并发关联数
    pub max_associations: usize,
    pub max_pdu_length: u32,
    /// 严格PDU校验
    pub strict: bool,
    /// 面向公网：启用限流与封禁
    pub external_access: bool,
    /// 接受任意抽象语法（仍只处理存储类与验证类）
    pub promiscuous: bool,
    /// 连接后完成关联协商的时限（秒）
    pub negotiation_timeout_secs: u64,
    /// 关联内两次PDU之间的最长空闲（秒）
    pub idle_timeout_secs: u64,
    /// 停止时等待在途关联结束的时限（秒）
    pub shutdown_timeout_secs: u64,
}

impl Default for DicomServerConfig {
    fn default() -> Self {
        Self {
            ae_title: "NOCTIS_SCP".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 11112,
            max_associations: 100,
            max_pdu_length: 16384,
            strict: false,
            external_access: false,
            promiscuous: false,
            negotiation_timeout_secs: 30,
            idle_timeout_secs: 300,
            shutdown_timeout_secs: 30,
        }
    }
}

impl DicomServerConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// 关联协商结果暂存
#[derive(Debug, Clone)]
struct Admission {
    calling_ae_title: String,
    called_ae_title: String,
    decision: AdmissionDecision,
}

/// 关联协商阶段的AE准入检查
///
/// 协商回调是同步的，判定只读注册表快照与安全状态，不阻塞运行时线程。
/// 判定连同待投递的告警一起暂存，协商结束后由连接任务取走。
pub struct FacilityAccessControl {
    gate: Arc<AssociationGate>,
    peer: IpAddr,
    admission: Arc<Mutex<Option<Admission>>>,
}

impl AccessControl for FacilityAccessControl {
    fn check_access(
        &self,
        _this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> std::result::Result<(), AssociationRJServiceUserReason> {
        let decision = self.gate.evaluate(self.peer, calling_ae_title);
        let reason = decision.result.as_ref().err().map(|rejection| rejection.service_user_reason());

        let admission = Admission {
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            decision,
        };
        *self.admission.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(admission);

        match reason {
            None => Ok(()),
            Some(reason) => Err(reason),
        }
    }
}

/// 下一步动作
enum Next {
    Pdu(Pdu),
    Idle,
    Shutdown,
    Closed(String),
}

/// DICOM服务器
pub struct DicomServer {
    config: DicomServerConfig,
    gate: Arc<AssociationGate>,
    services: Arc<ServiceManager>,
    associations: Arc<AssociationManager>,
    transfer_syntaxes: TransferSyntaxManager,
    limiter: Arc<Semaphore>,
}

impl DicomServer {
    /// 创建新的DICOM服务器
    pub fn new(config: DicomServerConfig, gate: Arc<AssociationGate>, services: Arc<ServiceManager>) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_associations.max(1)));
        Self {
            config,
            gate,
            services,
            associations: Arc::new(AssociationManager::new()),
            transfer_syntaxes: TransferSyntaxManager::new(),
            limiter,
        }
    }

    pub fn associations(&self) -> &Arc<AssociationManager> {
        &self.associations
    }

    /// 剩余可接受的连接数
    pub fn available_slots(&self) -> usize {
        self.limiter.available_permits()
    }

    /// 绑定监听地址
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| PacsError::Config(format!("无法监听 {}: {}", addr, e)))?;
        info!("DICOM服务器启动: AE={}, 地址={}", self.config.ae_title, addr);
        Ok(listener)
    }

    /// 接受连接直至取消，随后等待在途关联结束
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.limiter).acquire_owned() => {
                    permit.map_err(|e| PacsError::Internal(e.to_string()))?
                }
            };

            let (stream, remote_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                        continue;
                    }
                }
            };

            debug!("接受连接: {}", remote_addr);
            let server = Arc::clone(&self);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                let _permit = permit;
                if let Err(e) = server.handle_connection(stream, remote_addr, cancel).await {
                    warn!("处理连接失败 {}: {}", remote_addr, e);
                }
            });
        }

        tracker.close();
        info!("DICOM服务器停止接受新连接，等待 {} 个连接结束", tracker.len());
        if tokio::time::timeout(self.config.shutdown_timeout(), tracker.wait()).await.is_err() {
            warn!("等待连接结束超时，仍有 {} 个连接未结束", tracker.len());
        }
        info!("DICOM服务器已停止，活跃关联: {}", self.associations.len());
        Ok(())
    }

    /// 绑定并运行
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.run(listener, cancel).await
    }

    fn association_options(&self, access: FacilityAccessControl) -> ServerAssociationOptions<'static, FacilityAccessControl> {
        let mut options = ServerAssociationOptions::new()
            .ae_access_control(access)
            .ae_title(self.config.ae_title.clone())
            .strict(self.config.strict)
            .max_pdu_length(self.config.max_pdu_length);

        if self.config.promiscuous {
            options = options.promiscuous(true);
        } else {
            for uid in self.transfer_syntaxes.get_abstract_syntaxes() {
                options = options.with_abstract_syntax(uid);
            }
        }
        for ts in self.transfer_syntaxes.get_supported_syntaxes() {
            options = options.with_transfer_syntax(ts);
        }
        options
    }

    /// 处理客户端连接
    async fn handle_connection(&self, stream: TcpStream, remote_addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let admission = Arc::new(Mutex::new(None));
        let access = FacilityAccessControl {
            gate: Arc::clone(&self.gate),
            peer: remote_addr.ip(),
            admission: Arc::clone(&admission),
        };
        let options = self.association_options(access);

        let established =
            tokio::time::timeout(self.config.negotiation_timeout(), options.establish_async(stream)).await;
        let mut admitted = admission.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(alert) = admitted.as_mut().and_then(|a| a.decision.alert.take()) {
            self.gate.raise_alert(alert).await;
        }

        let association = match established {
            Ok(Ok(association)) => association,
            Ok(Err(e)) => {
                match admitted.as_ref().map(|a| &a.decision.result) {
                    Some(Err(rejection)) => debug!("关联被拒绝 {}: {}", remote_addr, rejection),
                    _ => warn!("关联协商失败 {}: {}", remote_addr, e),
                }
                return Ok(());
            }
            Err(_) => {
                warn!(
                    "关联协商超时 {} ({}s)，断开连接",
                    remote_addr,
                    self.config.negotiation_timeout().as_secs()
                );
                return Ok(());
            }
        };

        let (facility, calling, called) = match admitted {
            Some(Admission {
                decision: AdmissionDecision { result: Ok(facility), .. },
                calling_ae_title,
                called_ae_title,
            }) => (facility, calling_ae_title, called_ae_title),
            _ => {
                warn!("关联未经过准入检查，中止: {}", remote_addr);
                if let Err(e) = association.abort().await {
                    debug!("发送A-ABORT失败 {}: {}", remote_addr, e);
                }
                return Ok(());
            }
        };

        let context = AssociationContext::new(remote_addr, &calling, &called, facility);
        let association_id = context.id;
        self.associations.open(context.clone());

        let result = self.serve(association, &context, &cancel).await;
        self.associations.close(association_id);
        result
    }

    /// DIMSE消息循环
    async fn serve(
        &self,
        mut association: AsyncServerAssociation<TcpStream>,
        context: &AssociationContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let idle_timeout = self.config.idle_timeout();
        let mut command_buffer: Vec<u8> = Vec::new();
        let mut data_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
        let mut pending: Option<CommandSet> = None;

        loop {
            // 只在PDU边界响应停止信号，已开始处理的请求会完成
            let next = tokio::select! {
                _ = cancel.cancelled() => Next::Shutdown,
                received = tokio::time::timeout(idle_timeout, association.receive()) => match received {
                    Ok(Ok(pdu)) => Next::Pdu(pdu),
                    Ok(Err(e)) => Next::Closed(e.to_string()),
                    Err(_) => Next::Idle,
                },
            };

            let pdu = match next {
                Next::Pdu(pdu) => pdu,
                Next::Closed(reason) => {
                    debug!("关联 {} 连接结束: {}", context.id, reason);
                    return Ok(());
                }
                Next::Idle => {
                    warn!(
                        "关联 {} 空闲超过 {}s，中止: {}",
                        context.id,
                        idle_timeout.as_secs(),
                        context.calling_ae_title
                    );
                    if let Err(e) = association.abort().await {
                        debug!("发送A-ABORT失败 {}: {}", context.id, e);
                    }
                    return Ok(());
                }
                Next::Shutdown => {
                    info!("服务器停止，中止关联 {}: {}", context.id, context.calling_ae_title);
                    if let Err(e) = association.abort().await {
                        debug!("发送A-ABORT失败 {}: {}", context.id, e);
                    }
                    return Ok(());
                }
            };

            match pdu {
                Pdu::PData { data } => {
                    for value in data {
                        let pc_id = value.presentation_context_id;
                        match value.value_type {
                            PDataValueType::Command => {
                                command_buffer.extend_from_slice(&value.data);
                                if !value.is_last {
                                    continue;
                                }
                                let command = DimseParser::parse_command_set(&command_buffer);
                                command_buffer.clear();
                                let command = match command {
                                    Ok(command) => command,
                                    Err(e) => {
                                        warn!("无法解析DIMSE命令，断开关联 {}: {}", context.id, e);
                                        return Ok(());
                                    }
                                };
                                data_buffer.clear();
                                if command.has_data_set {
                                    pending = Some(command);
                                } else {
                                    self.dispatch(&mut association, context, pc_id, command, None).await?;
                                }
                            }
                            PDataValueType::Data => {
                                data_buffer.extend_from_slice(&value.data);
                                if !value.is_last {
                                    continue;
                                }
                                match pending.take() {
                                    Some(command) => {
                                        let payload = std::mem::take(&mut data_buffer);
                                        self.dispatch(&mut association, context, pc_id, command, Some(payload)).await?;
                                    }
                                    None => {
                                        warn!("收到没有命令的数据集，丢弃 ({} bytes)", data_buffer.len());
                                        data_buffer.clear();
                                    }
                                }
                            }
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    association
                        .send(&Pdu::ReleaseRP)
                        .await
                        .map_err(|e| PacsError::Dicom(format!("发送A-RELEASE-RP失败: {}", e)))?;
                    info!("关联已释放: {} ({})", context.calling_ae_title, context.remote_addr);
                    return Ok(());
                }
                Pdu::AbortRQ { source } => {
                    info!("对端中止关联 {}: {:?}", context.calling_ae_title, source);
                    return Ok(());
                }
                other => {
                    debug!("忽略PDU: {:?}", other);
                }
            }
        }
    }

    async fn dispatch(
        &self,
        association: &mut AsyncServerAssociation<TcpStream>,
        context: &AssociationContext,
        presentation_context_id: u8,
        command: CommandSet,
        payload: Option<Vec<u8>>,
    ) -> Result<()> {
        let transfer_syntax_uid = association
            .presentation_contexts()
            .iter()
            .find(|pc| pc.id == presentation_context_id)
            .map(|pc| utils::trim_dicom_value(&pc.transfer_syntax).to_string())
            .unwrap_or_default();

        let response = match payload.map(|bytes| decode_dataset(&bytes, &transfer_syntax_uid)) {
            Some(Err(e)) => {
                warn!("无法解码数据集 (语法 {}): {}", transfer_syntax_uid, e);
                let status = DimseStatus::CannotUnderstand;
                dimse::c_store_response(
                    command.message_id,
                    command.affected_sop_class_uid.as_deref().unwrap_or_default(),
                    command.affected_sop_instance_uid.as_deref().unwrap_or_default(),
                    status,
                )
            }
            decoded => {
                let request = DimseRequest {
                    command,
                    dataset: decoded.and_then(|d| d.ok()),
                    transfer_syntax_uid,
                };
                self.services.handle_request(context, request).await.command
            }
        };

        let bytes = DimseParser::encode_command(&response)?;
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: bytes,
            }],
        };
        association
            .send(&pdu)
            .await
            .map_err(|e| PacsError::Dicom(format!("发送DIMSE响应失败: {}", e)))
    }
}

fn decode_dataset(bytes: &[u8], transfer_syntax_uid: &str) -> Result<InMemDicomObject> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .ok_or_else(|| PacsError::Dicom(format!("未知传输语法: {}", transfer_syntax_uid)))?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts).map_err(|e| PacsError::DicomParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::command_field;
    use crate::ingest::IngestPipeline;
    use crate::registry::AeRegistry;
    use crate::services::{CEchoService, CStoreService};
    use crate::stats::ReceiverStats;
    use crate::validator::{DicomValidator, ValidationPolicy};
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::dictionary_std::{tags, uids};
    use dicom_ul::association::{AsyncClientAssociation, Error as UlError};
    use dicom_ul::pdu::AssociationRJSource;
    use dicom_ul::ClientAssociationOptions;
    use pacs_database::{InMemoryMetadataStore, MetadataStore};
    use pacs_storage::StorageManager;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    struct Running {
        _dir: TempDir,
        store: Arc<InMemoryMetadataStore>,
        server: Arc<DicomServer>,
        addr: SocketAddr,
        cancel: CancellationToken,
        task: JoinHandle<Result<()>>,
    }

    fn test_config() -> DicomServerConfig {
        DicomServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            negotiation_timeout_secs: 5,
            idle_timeout_secs: 5,
            shutdown_timeout_secs: 5,
            ..Default::default()
        }
    }

    async fn start(config: DicomServerConfig) -> Running {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        store.add_facility("CT Room", "CT_MAIN_01").unwrap();
        let stats = Arc::new(ReceiverStats::new());
        let registry = Arc::new(AeRegistry::new(store.clone()));
        registry.refresh().await.unwrap();
        let gate = Arc::new(AssociationGate::new(registry, stats.clone()));
        let pipeline = IngestPipeline::new(
            store.clone(),
            StorageManager::new(dir.path()),
            DicomValidator::new(ValidationPolicy {
                min_uid_length: 1,
                ..Default::default()
            }),
            stats.clone(),
        );
        let store_service = CStoreService::new(Arc::new(pipeline)).with_gate(gate.clone());
        let services = Arc::new(ServiceManager::new(Arc::new(CEchoService::new(stats)), Arc::new(store_service)));
        let server = Arc::new(DicomServer::new(config, gate, services));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&server).run(listener, cancel.clone()));
        Running {
            _dir: dir,
            store,
            server,
            addr,
            cancel,
            task,
        }
    }

    async fn connect(
        addr: SocketAddr,
        calling_ae_title: &str,
    ) -> std::result::Result<AsyncClientAssociation<TcpStream>, UlError> {
        ClientAssociationOptions::new()
            .calling_ae_title(calling_ae_title)
            .called_ae_title("NOCTIS_SCP")
            .with_presentation_context(uids::VERIFICATION, vec![uids::EXPLICIT_VR_LITTLE_ENDIAN])
            .with_presentation_context(uids::CT_IMAGE_STORAGE, vec![uids::EXPLICIT_VR_LITTLE_ENDIAN])
            .establish_async(addr)
            .await
    }

    fn context_id(association: &AsyncClientAssociation<TcpStream>, abstract_syntax: &str) -> u8 {
        association
            .presentation_contexts()
            .iter()
            .find(|pc| pc.abstract_syntax.trim_end_matches('\0') == abstract_syntax)
            .map(|pc| pc.id)
            .unwrap()
    }

    fn command_pdu(pc_id: u8, command: &InMemDicomObject) -> Pdu {
        Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: DimseParser::encode_command(command).unwrap(),
            }],
        }
    }

    async fn response_status(association: &mut AsyncClientAssociation<TcpStream>) -> u16 {
        match association.receive().await.unwrap() {
            Pdu::PData { data } => {
                let bytes: Vec<u8> = data.iter().flat_map(|v| v.data.iter().copied()).collect();
                let response = decode_dataset(&bytes, uids::IMPLICIT_VR_LITTLE_ENDIAN).unwrap();
                dimse::response_status(&response).unwrap()
            }
            other => panic!("unexpected PDU: {:?}", other),
        }
    }

    fn ct_dataset(sop_instance_uid: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid)),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3")),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.1")),
            DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P1")),
            DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("Doe^Jane")),
            DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
            DataElement::new(tags::STUDY_DESCRIPTION, VR::LO, PrimitiveValue::from("CHEST WITH CONTRAST")),
        ])
    }

    async fn shutdown(running: Running) {
        running.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), running.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = DicomServerConfig::default();
        assert_eq!(config.ae_title, "NOCTIS_SCP");
        assert_eq!(config.port, 11112);
        assert!(!config.external_access);
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(30));
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_decode_dataset() {
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from("P1"),
        )]);
        let ts = TransferSyntaxRegistry.get(uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        let mut bytes = Vec::new();
        obj.write_dataset_with_ts(&mut bytes, ts).unwrap();

        let decoded = decode_dataset(&bytes, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert_eq!(decoded.element(tags::PATIENT_ID).unwrap().to_str().unwrap(), "P1");
        assert!(decode_dataset(&bytes, "1.2.3.4").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_echo_and_fragmented_store_over_socket() {
        let running = start(test_config()).await;
        let mut association = connect(running.addr, "CT_MAIN_01").await.unwrap();

        let echo = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::VERIFICATION)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(command_field::C_ECHO_RQ)),
            DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(1_u16)),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(0x0101_u16)),
        ]);
        let echo_pc = context_id(&association, uids::VERIFICATION);
        association.send(&command_pdu(echo_pc, &echo)).await.unwrap();
        assert_eq!(response_status(&mut association).await, 0x0000);

        let store = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(command_field::C_STORE_RQ)),
            DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(2_u16)),
            DataElement::new(tags::PRIORITY, VR::US, PrimitiveValue::from(0_u16)),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(0x0000_u16)),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.1.1")),
        ]);
        let store_pc = context_id(&association, uids::CT_IMAGE_STORAGE);
        association.send(&command_pdu(store_pc, &store)).await.unwrap();

        let ts = TransferSyntaxRegistry.get(uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        let mut bytes = Vec::new();
        ct_dataset("1.2.3.1.1").write_dataset_with_ts(&mut bytes, ts).unwrap();
        let fragments: Vec<&[u8]> = bytes.chunks(48).collect();
        assert!(fragments.len() > 2);
        for (i, fragment) in fragments.iter().enumerate() {
            let pdu = Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: store_pc,
                    value_type: PDataValueType::Data,
                    is_last: i + 1 == fragments.len(),
                    data: fragment.to_vec(),
                }],
            };
            association.send(&pdu).await.unwrap();
        }
        assert_eq!(response_status(&mut association).await, 0x0000);
        association.release().await.unwrap();

        let counts = running.store.counts().await.unwrap();
        assert_eq!(counts.instances, 1);
        shutdown(running).await;
    }

    #[tokio::test]
    async fn test_unknown_ae_is_rejected_on_current_thread_runtime() {
        let running = start(test_config()).await;

        match connect(running.addr, "UNKNOWN_DEV").await {
            Err(UlError::Rejected { association_rj, .. }) => assert_eq!(
                association_rj.source,
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::CallingAETitleNotRecognized)
            ),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("unknown AE was accepted"),
        }

        // 拒绝后名额归还，已知AE仍可关联
        let association = connect(running.addr, "CT_MAIN_01").await.unwrap();
        association.release().await.unwrap();
        shutdown(running).await;
    }

    #[tokio::test]
    async fn test_silent_connection_releases_slot_after_negotiation_timeout() {
        let running = start(DicomServerConfig {
            max_associations: 1,
            negotiation_timeout_secs: 1,
            ..test_config()
        })
        .await;

        let _silent = TcpStream::connect(running.addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(running.server.available_slots(), 0);

        let association = tokio::time::timeout(Duration::from_secs(5), connect(running.addr, "CT_MAIN_01"))
            .await
            .unwrap()
            .unwrap();
        association.release().await.unwrap();
        shutdown(running).await;
    }

    #[tokio::test]
    async fn test_idle_association_is_aborted() {
        let running = start(DicomServerConfig {
            idle_timeout_secs: 1,
            ..test_config()
        })
        .await;

        let mut association = connect(running.addr, "CT_MAIN_01").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(running.server.associations().len(), 1);

        let pdu = tokio::time::timeout(Duration::from_secs(5), association.receive()).await.unwrap();
        assert!(matches!(pdu, Ok(Pdu::AbortRQ { .. }) | Err(_)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(running.server.associations().is_empty());
        assert_eq!(running.server.available_slots(), running.server.config.max_associations);
        shutdown(running).await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_open_associations() {
        let running = start(test_config()).await;
        let _association = connect(running.addr, "CT_MAIN_01").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(running.server.associations().len(), 1);

        let server = Arc::clone(&running.server);
        shutdown(running).await;
        assert!(server.associations().is_empty());
    }
}
