//! # DICOM服务模块
//!
//! DICOM接收端：关联准入（AE注册表 + 安全管理）、C-ECHO/C-STORE服务、
//! 影像接收流水线以及基于 dicom-ul 的异步监听。

pub mod association;
pub mod dimse;
pub mod ingest;
pub mod notification;
pub mod parser;
pub mod registry;
pub mod security;
pub mod server;
pub mod services;
pub mod stats;
pub mod transfer_syntax;
pub mod validator;

pub use association::{AdmissionDecision, AssociationContext, AssociationGate, AssociationManager, AssociationRejection};
pub use dimse::{CommandSet, CommandType, DimseParser, DimseStatus};
pub use ingest::{IngestError, IngestOutcome, IngestPipeline, ReceivedObject, SeriesObserver};
pub use notification::{
    MemoryNotificationSink, NewStudyEvent, Notification, NotificationPayload, NotificationSink, Notifier,
    SecurityAlert, TracingNotificationSink,
};
pub use parser::{DicomParser, ParsedDicomObject};
pub use registry::{AeRegistry, RegistryConfig};
pub use security::{BlockList, InMemoryBlockList, PeerStatus, SecurityConfig, SecurityManager};
pub use server::{DicomServer, DicomServerConfig};
pub use services::*;
pub use stats::{ReceiverStats, ReceiverStatsSnapshot};
pub use transfer_syntax::TransferSyntaxManager;
pub use validator::{DicomValidator, ValidationPolicy, ValidationResult};
