//! 通知协作方
//!
//! 新检查事件按机构与角色分发给接收者，安全告警发送给管理员。
//! 投递失败只记录日志，不影响调用方。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacs_core::Result;
use pacs_database::{MetadataStore, Recipient, RecipientScope};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// 新检查事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStudyEvent {
    pub study_id: Uuid,
    pub study_uid: String,
    pub accession_number: String,
    pub facility_name: String,
    pub modality_code: String,
    pub patient_display_name: String,
}

/// 安全告警：对端被封禁
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAlert {
    pub ip: IpAddr,
    pub reason: String,
    pub failure_count: usize,
    pub blocked_until: DateTime<Utc>,
}

/// 通知内容
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationPayload {
    NewStudy(NewStudyEvent),
    SecurityAlert(SecurityAlert),
}

/// 发给单个接收者的通知
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub payload: NotificationPayload,
}

/// 通知投递
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: Notification) -> Result<()>;
}

/// 仅写日志的投递实现
#[derive(Debug, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn deliver(&self, notification: Notification) -> Result<()> {
        let payload = serde_json::to_string(&notification.payload)?;
        info!(
            target: "pacs::notification",
            "通知 {} ({}): {}",
            notification.recipient.user_id,
            notification.recipient.role.as_str(),
            payload
        );
        Ok(())
    }
}

/// 内存投递实现，保存全部通知
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    delivered: Mutex<Vec<Notification>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Notification> {
        match self.delivered.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn deliver(&self, notification: Notification) -> Result<()> {
        match self.delivered.lock() {
            Ok(mut guard) => guard.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
        Ok(())
    }
}

/// 通知分发器
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn MetadataStore>,
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(store: Arc<dyn MetadataStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, sink }
    }

    /// 新检查：通知该机构用户与所有放射科医生，返回成功投递数
    pub async fn new_study(&self, facility_id: Uuid, event: NewStudyEvent) -> usize {
        self.dispatch(
            RecipientScope::NewStudy { facility_id },
            NotificationPayload::NewStudy(event),
        )
        .await
    }

    /// 安全告警：通知所有管理员，返回成功投递数
    pub async fn security_alert(&self, alert: SecurityAlert) -> usize {
        self.dispatch(RecipientScope::Administrators, NotificationPayload::SecurityAlert(alert))
            .await
    }

    async fn dispatch(&self, scope: RecipientScope, payload: NotificationPayload) -> usize {
        let recipients = match self.store.recipients(scope).await {
            Ok(recipients) => recipients,
            Err(e) => {
                warn!("查询通知接收者失败: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for recipient in recipients {
            let user_id = recipient.user_id;
            let notification = Notification {
                recipient,
                payload: payload.clone(),
            };
            match self.sink.deliver(notification).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("通知投递失败 {}: {}", user_id, e),
            }
        }
        delivered
    }
}
