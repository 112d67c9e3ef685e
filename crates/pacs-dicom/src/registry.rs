//! AE注册表
//!
//! 将调用方AE标题解析为启用的机构。查询只读快照、不访问数据库，刷新时整体替换快照；
//! 未命中时在后台补一次刷新（有最小间隔），新登记的设备在下一次关联时即可通过。

use pacs_core::{utils, Facility, Result};
use pacs_database::MetadataStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 注册表配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 周期刷新间隔（秒）
    pub refresh_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
        }
    }
}

type FacilityMap = HashMap<String, Facility>;

/// 未命中触发的后台刷新最小间隔
const MISS_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// AE注册表
pub struct AeRegistry {
    store: Arc<dyn MetadataStore>,
    snapshot: RwLock<Arc<FacilityMap>>,
    /// 串行化刷新，避免未命中风暴同时打到数据库
    refresh_lock: tokio::sync::Mutex<()>,
    last_miss_refresh: Mutex<Option<Instant>>,
}

impl AeRegistry {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            refresh_lock: tokio::sync::Mutex::new(()),
            last_miss_refresh: Mutex::new(None),
        }
    }

    /// 从元数据存储重新加载启用机构，返回机构数量
    pub async fn refresh(&self) -> Result<usize> {
        let _guard = self.refresh_lock.lock().await;
        let facilities = self.store.active_facilities().await?;

        let map: FacilityMap = facilities
            .into_iter()
            .filter(|f| f.is_active)
            .map(|f| (utils::normalize_ae_title(&f.ae_title), f))
            .collect();
        let count = map.len();
        self.swap(Arc::new(map));

        info!("AE注册表已刷新: {} 个启用机构", count);
        Ok(count)
    }

    /// 在当前快照中查找AE标题（大小写不敏感），不访问数据库
    pub fn lookup(&self, ae_title: &str) -> Option<Facility> {
        let key = utils::normalize_ae_title(ae_title);
        if key.is_empty() {
            return None;
        }
        self.current().get(&key).cloned()
    }

    /// 解析AE标题；快照未命中时刷新一次后重试
    ///
    /// 会等待数据库，只用于异步调用方；协商回调使用 [`AeRegistry::lookup`]。
    pub async fn resolve(&self, ae_title: &str) -> Option<Facility> {
        if let Some(facility) = self.lookup(ae_title) {
            return Some(facility);
        }
        if utils::normalize_ae_title(ae_title).is_empty() {
            return None;
        }
        if let Err(e) = self.refresh().await {
            warn!("AE标题未命中后刷新注册表失败: {}", e);
            return None;
        }
        self.lookup(ae_title)
    }

    /// 未命中后请求一次后台刷新；距上次请求不足最小间隔或不在运行时内时忽略
    ///
    /// 返回是否真正发起了刷新。
    pub fn request_refresh(self: &Arc<Self>) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        {
            let mut last = self.last_miss_refresh.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if last.is_some_and(|at| at.elapsed() < MISS_REFRESH_INTERVAL) {
                return false;
            }
            *last = Some(Instant::now());
        }

        debug!("AE标题未命中，后台刷新注册表");
        let registry = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(e) = registry.refresh().await {
                warn!("AE注册表后台刷新失败: {}", e);
            }
        });
        true
    }

    /// 当前缓存的机构数
    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 启动周期刷新任务，取消令牌触发后退出
    pub fn spawn_refresher(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次tick立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("AE注册表刷新任务已停止");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            warn!("AE注册表周期刷新失败: {}", e);
                        }
                    }
                }
            }
        })
    }

    fn current(&self) -> Arc<FacilityMap> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap(&self, map: Arc<FacilityMap>) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = map,
            Err(poisoned) => *poisoned.into_inner() = map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_database::InMemoryMetadataStore;

    #[tokio::test]
    async fn test_resolve_is_case_insensitive() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let facility = store.add_facility("CT Room", "CT_MAIN_01").unwrap();
        let registry = AeRegistry::new(store.clone());
        assert!(registry.lookup("CT_MAIN_01").is_none());

        registry.refresh().await.unwrap();
        let resolved = registry.lookup("ct_main_01 ");
        assert_eq!(resolved.map(|f| f.id), Some(facility.id));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_refreshes_once_on_miss() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let registry = AeRegistry::new(store.clone());
        let facility = store.add_facility("CT Room", "CT_MAIN_01").unwrap();

        assert_eq!(registry.resolve("CT_MAIN_01").await.map(|f| f.id), Some(facility.id));
        assert!(registry.resolve("UNKNOWN_DEV").await.is_none());
        assert!(registry.resolve("   ").await.is_none());
    }

    #[tokio::test]
    async fn test_miss_requests_throttled_background_refresh() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let registry = Arc::new(AeRegistry::new(store.clone()));
        registry.refresh().await.unwrap();
        assert!(registry.is_empty());

        store.add_facility("MR", "MR_01").unwrap();
        assert!(registry.lookup("MR_01").is_none());
        assert!(registry.request_refresh());
        assert!(!registry.request_refresh());

        for _ in 0..50 {
            if registry.lookup("MR_01").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.lookup("MR_01").is_some());
        assert!(registry.lookup("UNKNOWN_DEV").is_none());
    }

    #[test]
    fn test_refresh_request_outside_runtime_is_ignored() {
        let registry = Arc::new(AeRegistry::new(Arc::new(InMemoryMetadataStore::new())));
        assert!(!registry.request_refresh());
    }

    #[tokio::test]
    async fn test_inactive_facility_is_not_resolved() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let facility = store.add_facility("US", "US_01").unwrap();
        store.set_facility_active(facility.id, false);
        let registry = AeRegistry::new(store);

        assert_eq!(registry.refresh().await.unwrap(), 0);
        assert!(registry.lookup("US_01").is_none());
    }

    #[tokio::test]
    async fn test_refresher_stops_on_cancel() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let registry = Arc::new(AeRegistry::new(store));
        let cancel = CancellationToken::new();

        let handle = registry.spawn_refresher(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        assert!(handle.await.is_ok());
    }
}
