//! DICOM关联管理
//!
//! [`AssociationGate`] 在接受关联前依次检查对端安全状态与调用方AE标题，
//! 解析出的机构在关联整个生命周期内复用。判定是同步的，只读注册表快照；
//! 封禁告警随判定结果返回，由调用方异步投递。

use crate::notification::{Notifier, SecurityAlert};
use crate::registry::AeRegistry;
use crate::security::{SecurityDenial, SecurityManager};
use crate::stats::ReceiverStats;
use chrono::{DateTime, Utc};
use dicom_ul::pdu::AssociationRJServiceUserReason;
use pacs_core::{utils, Facility};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 关联拒绝原因
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssociationRejection {
    #[error("未知或未启用的AE标题: {ae_title}")]
    UnknownAeTitle { ae_title: String },

    #[error("超出连接频率限制")]
    RateLimited,

    #[error("对端已被封禁至 {until}")]
    Blocked { until: DateTime<Utc> },
}

impl AssociationRejection {
    /// 对应的 A-ASSOCIATE-RJ 服务用户原因
    pub fn service_user_reason(&self) -> AssociationRJServiceUserReason {
        match self {
            AssociationRejection::UnknownAeTitle { .. } => AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            _ => AssociationRJServiceUserReason::NoReasonGiven,
        }
    }
}

/// 准入判定结果
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionDecision {
    pub result: Result<Facility, AssociationRejection>,
    /// 本次判定触发封禁时待投递的告警
    pub alert: Option<SecurityAlert>,
}

/// 关联上下文
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationContext {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// 由调用方AE解析出的机构
    pub facility: Facility,
    pub established_at: DateTime<Utc>,
}

impl AssociationContext {
    pub fn new(remote_addr: SocketAddr, calling_ae_title: &str, called_ae_title: &str, facility: Facility) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            calling_ae_title: utils::normalize_ae_title(calling_ae_title),
            called_ae_title: utils::normalize_ae_title(called_ae_title),
            facility,
            established_at: Utc::now(),
        }
    }
}

/// 关联准入检查
pub struct AssociationGate {
    registry: Arc<AeRegistry>,
    /// 仅公网部署启用
    security: Option<Arc<SecurityManager>>,
    notifier: Option<Notifier>,
    stats: Arc<ReceiverStats>,
}

impl AssociationGate {
    pub fn new(registry: Arc<AeRegistry>, stats: Arc<ReceiverStats>) -> Self {
        Self {
            registry,
            security: None,
            notifier: None,
            stats,
        }
    }

    /// 启用安全管理（公网部署）
    pub fn with_security(mut self, security: Arc<SecurityManager>) -> Self {
        self.security = Some(security);
        self
    }

    /// 封禁告警的通知通道
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registry(&self) -> &Arc<AeRegistry> {
        &self.registry
    }

    /// 判断是否接受来自 `peer` 的关联，并投递可能产生的告警
    ///
    /// 与 [`AssociationGate::evaluate`] 的区别是未命中时先等待一次注册表刷新。
    pub async fn admit(&self, peer: IpAddr, calling_ae_title: &str) -> Result<Facility, AssociationRejection> {
        let blocked = self.security.as_ref().is_some_and(|security| security.is_blocked(peer));
        if !blocked {
            self.registry.resolve(calling_ae_title).await;
        }
        let decision = self.evaluate(peer, calling_ae_title);
        if let Some(alert) = decision.alert {
            self.raise_alert(alert).await;
        }
        decision.result
    }

    /// 同步准入判定：不访问数据库，可在关联协商回调中直接调用
    pub fn evaluate(&self, peer: IpAddr, calling_ae_title: &str) -> AdmissionDecision {
        let (result, alert) = self.check(peer, calling_ae_title);
        match &result {
            Ok(facility) => {
                self.stats.association_accepted();
                info!("接受关联: {} from {} (机构: {})", calling_ae_title.trim(), peer, facility.name);
            }
            Err(rejection) => {
                self.stats.association_rejected();
                warn!(target: "pacs::security", "拒绝关联 {:?} from {}: {}", calling_ae_title.trim(), peer, rejection);
            }
        }
        AdmissionDecision { result, alert }
    }

    fn check(&self, peer: IpAddr, calling_ae_title: &str) -> (Result<Facility, AssociationRejection>, Option<SecurityAlert>) {
        if let Some(security) = &self.security {
            match security.check_connection(peer) {
                Ok(()) => {}
                Err(SecurityDenial::Blocked { until }) => {
                    return (Err(AssociationRejection::Blocked { until }), None);
                }
                Err(SecurityDenial::RateLimited { alert }) => {
                    return (Err(AssociationRejection::RateLimited), alert);
                }
            }
        }

        let ae_title = utils::normalize_ae_title(calling_ae_title);
        if !utils::is_valid_ae_title(&ae_title) {
            debug!("AE标题格式无效: {:?}", calling_ae_title);
        } else if let Some(facility) = self.registry.lookup(&ae_title) {
            return (Ok(facility), None);
        } else {
            self.registry.request_refresh();
        }

        let alert = self
            .security
            .as_ref()
            .and_then(|security| security.record_failure(peer, &format!("未知AE标题: {}", ae_title)));
        (Err(AssociationRejection::UnknownAeTitle { ae_title }), alert)
    }

    /// 通过通知通道投递封禁告警
    pub async fn raise_alert(&self, alert: SecurityAlert) {
        if let Some(notifier) = &self.notifier {
            let delivered = notifier.security_alert(alert).await;
            debug!("安全告警已发送给 {} 名管理员", delivered);
        }
    }

    /// 校验失败等在已接受关联上发生的失败，计入对端失败次数
    pub async fn record_peer_failure(&self, peer: IpAddr, reason: &str) {
        if let Some(security) = &self.security {
            if let Some(alert) = security.record_failure(peer, reason) {
                self.raise_alert(alert).await;
            }
        }
    }
}

/// DICOM关联管理器：记录活跃关联
#[derive(Debug, Default)]
pub struct AssociationManager {
    associations: Mutex<HashMap<Uuid, AssociationContext>>,
}

impl AssociationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新关联
    pub fn open(&self, context: AssociationContext) {
        info!(
            "建立DICOM关联 {}: {} from {} -> {}",
            context.id, context.calling_ae_title, context.remote_addr, context.called_ae_title
        );
        self.associations().insert(context.id, context);
    }

    /// 关闭DICOM关联
    pub fn close(&self, association_id: Uuid) {
        if let Some(association) = self.associations().remove(&association_id) {
            let elapsed = Utc::now() - association.established_at;
            info!(
                "关闭DICOM关联: {} from {} (持续 {} ms)",
                association.id,
                association.remote_addr,
                elapsed.num_milliseconds()
            );
        }
    }

    /// 获取关联信息
    pub fn get(&self, association_id: Uuid) -> Option<AssociationContext> {
        self.associations().get(&association_id).cloned()
    }

    /// 列出所有活跃的关联
    pub fn list(&self) -> Vec<AssociationContext> {
        self.associations().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.associations().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn associations(&self) -> MutexGuard<'_, HashMap<Uuid, AssociationContext>> {
        self.associations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::MemoryNotificationSink;
    use crate::security::SecurityConfig;
    use chrono::Duration;
    use pacs_core::ManualClock;
    use pacs_database::{InMemoryMetadataStore, MetadataStore, Recipient, RecipientRole};

    fn peer() -> IpAddr {
        "192.0.2.10".parse().unwrap()
    }

    async fn setup() -> (Arc<InMemoryMetadataStore>, AssociationGate, Arc<ReceiverStats>) {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.add_facility("CT Room", "CT_MAIN_01").unwrap();
        let registry = Arc::new(AeRegistry::new(store.clone()));
        registry.refresh().await.unwrap();
        let stats = Arc::new(ReceiverStats::new());
        let gate = AssociationGate::new(registry, stats.clone());
        (store, gate, stats)
    }

    #[tokio::test]
    async fn test_known_ae_is_admitted() {
        let (_store, gate, stats) = setup().await;
        let facility = gate.admit(peer(), "CT_MAIN_01").await.unwrap();
        assert_eq!(facility.ae_title, "CT_MAIN_01");
        assert_eq!(stats.snapshot().associations_accepted, 1);
    }

    #[tokio::test]
    async fn test_admit_picks_up_newly_registered_facility() {
        let (store, gate, _stats) = setup().await;
        store.add_facility("MR Room", "MR_01").unwrap();

        assert!(gate.evaluate(peer(), "MR_01").result.is_err());
        let facility = gate.admit(peer(), "MR_01").await.unwrap();
        assert_eq!(facility.ae_title, "MR_01");
    }

    #[tokio::test]
    async fn test_unknown_ae_is_rejected_without_side_effects() {
        let (store, gate, stats) = setup().await;
        let rejection = gate.admit(peer(), "UNKNOWN_DEV").await.unwrap_err();

        assert_eq!(
            rejection,
            AssociationRejection::UnknownAeTitle {
                ae_title: "UNKNOWN_DEV".to_string()
            }
        );
        assert_eq!(
            rejection.service_user_reason(),
            AssociationRJServiceUserReason::CallingAETitleNotRecognized
        );
        assert_eq!(stats.snapshot().associations_rejected, 1);
        assert_eq!(store.counts().await.unwrap().patients, 0);
    }

    #[tokio::test]
    async fn test_repeated_unknown_ae_blocks_peer_and_alerts_admins() {
        let (store, gate, _stats) = setup().await;
        store.add_recipient(Recipient {
            user_id: Uuid::new_v4(),
            role: RecipientRole::Administrator,
            facility_id: None,
        });
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let security = Arc::new(SecurityManager::new(SecurityConfig::default(), clock.clone()));
        let sink = Arc::new(MemoryNotificationSink::new());
        let gate = gate
            .with_security(security)
            .with_notifier(Notifier::new(store.clone(), sink.clone()));

        for _ in 0..5 {
            assert!(gate.admit(peer(), "UNKNOWN_DEV").await.is_err());
        }
        assert_eq!(sink.delivered().len(), 1);

        // 封禁期间即使AE合法也拒绝
        assert!(matches!(
            gate.admit(peer(), "CT_MAIN_01").await,
            Err(AssociationRejection::Blocked { .. })
        ));

        clock.advance(Duration::seconds(3601));
        assert!(gate.admit(peer(), "CT_MAIN_01").await.is_ok());
    }

    #[test]
    fn test_evaluate_needs_no_runtime_and_returns_pending_alert() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let security = Arc::new(SecurityManager::new(SecurityConfig::default(), clock));
        let gate = AssociationGate::new(Arc::new(AeRegistry::new(store)), Arc::new(ReceiverStats::new()))
            .with_security(security);

        for _ in 0..4 {
            let decision = gate.evaluate(peer(), "UNKNOWN_DEV");
            assert!(decision.result.is_err());
            assert!(decision.alert.is_none());
        }
        let decision = gate.evaluate(peer(), "UNKNOWN_DEV");
        assert_eq!(decision.alert.map(|a| a.failure_count), Some(5));
        assert!(matches!(
            gate.evaluate(peer(), "UNKNOWN_DEV").result,
            Err(AssociationRejection::Blocked { .. })
        ));
    }

    #[test]
    fn test_association_manager_bookkeeping() {
        let manager = AssociationManager::new();
        let facility = Facility {
            id: Uuid::new_v4(),
            name: "CT Room".to_string(),
            ae_title: "CT_MAIN_01".to_string(),
            is_active: true,
        };
        let context = AssociationContext::new("192.0.2.10:4000".parse().unwrap(), "ct_main_01", "NOCTIS_SCP", facility);
        let id = context.id;

        manager.open(context);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get(id).map(|c| c.calling_ae_title), Some("CT_MAIN_01".to_string()));

        manager.close(id);
        assert!(manager.is_empty());
    }
}
