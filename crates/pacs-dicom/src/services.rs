//! DICOM服务实现
//!
//! 每个请求都必须得到响应：服务返回 [`DimseResponse`] 而不是错误。

use crate::association::{AssociationContext, AssociationGate};
use crate::dimse::{self, CommandSet, CommandType, DimseStatus};
use crate::ingest::{IngestError, IngestPipeline, ReceivedObject};
use crate::stats::ReceiverStats;
use crate::transfer_syntax::is_storage_sop_class;
use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// DICOM消息服务元素请求
#[derive(Debug, Clone)]
pub struct DimseRequest {
    pub command: CommandSet,
    pub dataset: Option<InMemDicomObject>,
    /// 数据集所在表示上下文的传输语法
    pub transfer_syntax_uid: String,
}

/// DICOM消息服务元素响应
#[derive(Debug, Clone)]
pub struct DimseResponse {
    pub command: InMemDicomObject,
    pub status: DimseStatus,
}

/// DICOM服务特征
#[async_trait]
pub trait DicomService: Send + Sync {
    async fn handle_request(&self, context: &AssociationContext, request: DimseRequest) -> DimseResponse;
}

/// C-ECHO服务：关联已通过AE校验，直接返回成功
pub struct CEchoService {
    stats: Arc<ReceiverStats>,
}

impl CEchoService {
    pub fn new(stats: Arc<ReceiverStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl DicomService for CEchoService {
    async fn handle_request(&self, context: &AssociationContext, request: DimseRequest) -> DimseResponse {
        debug!("处理C-ECHO请求: {} ({})", context.calling_ae_title, context.facility.name);
        self.stats.echo();
        DimseResponse {
            command: dimse::c_echo_response(request.command.message_id, DimseStatus::Success),
            status: DimseStatus::Success,
        }
    }
}

/// C-STORE服务
pub struct CStoreService {
    pipeline: Arc<IngestPipeline>,
    gate: Option<Arc<AssociationGate>>,
}

impl CStoreService {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self { pipeline, gate: None }
    }

    /// 校验失败计入对端失败次数（公网部署）
    pub fn with_gate(mut self, gate: Arc<AssociationGate>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl DicomService for CStoreService {
    async fn handle_request(&self, context: &AssociationContext, request: DimseRequest) -> DimseResponse {
        let command = &request.command;
        let sop_class_uid = command.affected_sop_class_uid.clone().unwrap_or_default();
        let sop_instance_uid = command.affected_sop_instance_uid.clone().unwrap_or_default();
        let respond = |status: DimseStatus| DimseResponse {
            command: dimse::c_store_response(command.message_id, &sop_class_uid, &sop_instance_uid, status),
            status,
        };

        let Some(dataset) = request.dataset else {
            warn!("C-STORE请求缺少数据集: {}", sop_instance_uid);
            return respond(DimseStatus::CannotUnderstand);
        };

        let received = ReceivedObject {
            dataset,
            transfer_syntax_uid: request.transfer_syntax_uid,
            sop_class_uid: sop_class_uid.clone(),
        };

        match self.pipeline.ingest(received, &context.facility).await {
            Ok(outcome) => {
                debug!("C-STORE完成: {} (重复: {})", outcome.sop_instance_uid, outcome.duplicate);
                respond(DimseStatus::Success)
            }
            Err(err) => {
                match &err {
                    IngestError::InternalError(_) => error!("C-STORE内部错误 {}: {}", sop_instance_uid, err),
                    IngestError::ValidationFailed(reason) => {
                        if let Some(gate) = &self.gate {
                            gate.record_peer_failure(context.remote_addr.ip(), reason).await;
                        }
                        warn!("C-STORE校验失败 {}: {}", sop_instance_uid, err)
                    }
                    _ => warn!("C-STORE失败 {}: {}", sop_instance_uid, err),
                }
                respond(err.status())
            }
        }
    }
}

/// DICOM服务管理器：按命令类型分发
pub struct ServiceManager {
    echo: Arc<dyn DicomService>,
    store: Arc<dyn DicomService>,
}

impl ServiceManager {
    pub fn new(echo: Arc<dyn DicomService>, store: Arc<dyn DicomService>) -> Self {
        Self { echo, store }
    }

    pub async fn handle_request(&self, context: &AssociationContext, request: DimseRequest) -> DimseResponse {
        match request.command.get_command_type() {
            CommandType::CEcho => self.echo.handle_request(context, request).await,
            CommandType::CStore => {
                let sop_class = request.command.affected_sop_class_uid.clone().unwrap_or_default();
                if is_storage_sop_class(&sop_class) {
                    self.store.handle_request(context, request).await
                } else {
                    warn!("不支持的SOP类: {}", sop_class);
                    let status = DimseStatus::SopClassNotSupported;
                    DimseResponse {
                        command: dimse::c_store_response(
                            request.command.message_id,
                            &sop_class,
                            request.command.affected_sop_instance_uid.as_deref().unwrap_or_default(),
                            status,
                        ),
                        status,
                    }
                }
            }
            other => {
                info!("不支持的DIMSE操作: {:?}", other);
                DimseResponse {
                    command: dimse::unsupported_response(&request.command),
                    status: DimseStatus::UnrecognizedOperation,
                }
            }
        }
    }
}
