//! 关联安全管理
//!
//! 面向公网部署时按对端IP限流、统计失败次数并临时封禁。
//! 状态机：`Unrestricted → RateLimited → Blocked`，封禁到期后回到 `Unrestricted`。

use crate::notification::SecurityAlert;
use chrono::{DateTime, Duration, Utc};
use pacs_core::Clock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// 跟踪的对端数达到该值时，在下一次连接检查中清理空闲对端
const PRUNE_THRESHOLD: usize = 256;

/// 安全配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// 限流窗口内允许的连接数
    pub max_connections_per_window: usize,
    /// 限流窗口（秒）
    pub rate_limit_window_secs: i64,
    /// 触发封禁的失败次数
    pub max_failed_attempts: usize,
    /// 失败统计窗口（秒）
    pub failure_window_secs: i64,
    /// 封禁时长（秒）
    pub block_duration_secs: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_connections_per_window: 10,
            rate_limit_window_secs: 300,
            max_failed_attempts: 5,
            failure_window_secs: 3600,
            block_duration_secs: 3600,
        }
    }
}

/// 封禁名单
///
/// 实现可以放在进程外的共享缓存中，使封禁在重启后仍然有效。
pub trait BlockList: Send + Sync {
    fn blocked_until(&self, ip: IpAddr) -> Option<DateTime<Utc>>;
    fn block(&self, ip: IpAddr, until: DateTime<Utc>);
    fn unblock(&self, ip: IpAddr);
}

/// 进程内封禁名单
#[derive(Debug, Default)]
pub struct InMemoryBlockList {
    entries: Mutex<HashMap<IpAddr, DateTime<Utc>>>,
}

impl InMemoryBlockList {
    fn entries(&self) -> MutexGuard<'_, HashMap<IpAddr, DateTime<Utc>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlockList for InMemoryBlockList {
    fn blocked_until(&self, ip: IpAddr) -> Option<DateTime<Utc>> {
        self.entries().get(&ip).copied()
    }

    fn block(&self, ip: IpAddr, until: DateTime<Utc>) {
        self.entries().insert(ip, until);
    }

    fn unblock(&self, ip: IpAddr) {
        self.entries().remove(&ip);
    }
}

/// 对端状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PeerStatus {
    Unrestricted,
    RateLimited,
    Blocked { until: DateTime<Utc> },
}

/// 安全检查拒绝原因
#[derive(Debug, Clone, PartialEq)]
pub enum SecurityDenial {
    /// 已被封禁（不再计入失败）
    Blocked { until: DateTime<Utc> },
    /// 超出限流，已计入一次失败；若因此触发封禁则附带告警
    RateLimited { alert: Option<SecurityAlert> },
}

#[derive(Debug, Default)]
struct PeerState {
    attempts: VecDeque<DateTime<Utc>>,
    failures: VecDeque<(DateTime<Utc>, String)>,
}

impl PeerState {
    fn expire(&mut self, attempts_since: DateTime<Utc>, failures_since: DateTime<Utc>) {
        while self.attempts.front().is_some_and(|t| *t <= attempts_since) {
            self.attempts.pop_front();
        }
        while self.failures.front().is_some_and(|(t, _)| *t <= failures_since) {
            self.failures.pop_front();
        }
    }

    fn is_idle(&self) -> bool {
        self.attempts.is_empty() && self.failures.is_empty()
    }
}

/// 关联安全管理器
pub struct SecurityManager {
    config: SecurityConfig,
    clock: Arc<dyn Clock>,
    blocklist: Arc<dyn BlockList>,
    peers: Mutex<HashMap<IpAddr, PeerState>>,
}

impl SecurityManager {
    pub fn new(config: SecurityConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_blocklist(config, clock, Arc::new(InMemoryBlockList::default()))
    }

    pub fn with_blocklist(config: SecurityConfig, clock: Arc<dyn Clock>, blocklist: Arc<dyn BlockList>) -> Self {
        Self {
            config,
            clock,
            blocklist,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// 关联前检查：封禁或限流时拒绝
    pub fn check_connection(&self, ip: IpAddr) -> Result<(), SecurityDenial> {
        if let Some(until) = self.active_block(ip) {
            return Err(SecurityDenial::Blocked { until });
        }
        if self.tracked_peers() >= PRUNE_THRESHOLD {
            self.prune();
        }
        if !self.record_attempt(ip) {
            let alert = self.record_failure(ip, "超出连接频率限制");
            return Err(SecurityDenial::RateLimited { alert });
        }
        Ok(())
    }

    /// 是否处于封禁期
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.active_block(ip).is_some()
    }

    /// 滑动窗口限流：窗口未满时记录本次尝试并返回 `true`，超限返回 `false`
    pub fn record_attempt(&self, ip: IpAddr) -> bool {
        let now = self.clock.now();
        let window_start = now - Duration::seconds(self.config.rate_limit_window_secs);
        let mut peers = self.peers();
        let state = peers.entry(ip).or_default();

        while state.attempts.front().is_some_and(|t| *t <= window_start) {
            state.attempts.pop_front();
        }
        if state.attempts.len() >= self.config.max_connections_per_window {
            debug!("对端 {} 超出限流: {} 次/{} 秒", ip, state.attempts.len(), self.config.rate_limit_window_secs);
            return false;
        }
        state.attempts.push_back(now);
        true
    }

    /// 清理两个窗口内都没有记录的对端，返回清理数量
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let attempts_since = now - Duration::seconds(self.config.rate_limit_window_secs);
        let failures_since = now - Duration::seconds(self.config.failure_window_secs);

        let mut peers = self.peers();
        let before = peers.len();
        peers.retain(|_, state| {
            state.expire(attempts_since, failures_since);
            !state.is_idle()
        });
        let removed = before - peers.len();
        if removed > 0 {
            debug!(target: "pacs::security", "清理空闲对端 {} 个，剩余 {}", removed, peers.len());
        }
        removed
    }

    /// 当前跟踪的对端数
    pub fn tracked_peers(&self) -> usize {
        self.peers().len()
    }

    /// 记录一次失败；达到阈值时封禁并返回告警
    pub fn record_failure(&self, ip: IpAddr, reason: &str) -> Option<SecurityAlert> {
        let now = self.clock.now();
        let window_start = now - Duration::seconds(self.config.failure_window_secs);

        let failure_count = {
            let mut peers = self.peers();
            let state = peers.entry(ip).or_default();
            state.failures.push_back((now, reason.to_string()));
            while state.failures.front().is_some_and(|(t, _)| *t <= window_start) {
                state.failures.pop_front();
            }
            let count = state.failures.len();
            if count >= self.config.max_failed_attempts {
                state.failures.clear();
                state.attempts.clear();
            }
            count
        };

        warn!(target: "pacs::security", "对端 {} 失败 ({}/{}): {}", ip, failure_count, self.config.max_failed_attempts, reason);

        if failure_count < self.config.max_failed_attempts {
            return None;
        }

        let blocked_until = now + Duration::seconds(self.config.block_duration_secs);
        self.blocklist.block(ip, blocked_until);
        let reason = format!("失败次数过多: {}", failure_count);
        warn!(target: "pacs::security", "封禁IP {} 至 {}: {}", ip, blocked_until, reason);

        Some(SecurityAlert {
            ip,
            reason,
            failure_count,
            blocked_until,
        })
    }

    /// 当前对端状态
    pub fn peer_status(&self, ip: IpAddr) -> PeerStatus {
        if let Some(until) = self.active_block(ip) {
            return PeerStatus::Blocked { until };
        }
        let window_start = self.clock.now() - Duration::seconds(self.config.rate_limit_window_secs);
        let peers = self.peers();
        let recent = peers
            .get(&ip)
            .map(|s| s.attempts.iter().filter(|t| **t > window_start).count())
            .unwrap_or(0);
        if recent >= self.config.max_connections_per_window {
            PeerStatus::RateLimited
        } else {
            PeerStatus::Unrestricted
        }
    }

    fn active_block(&self, ip: IpAddr) -> Option<DateTime<Utc>> {
        let until = self.blocklist.blocked_until(ip)?;
        if self.clock.now() < until {
            Some(until)
        } else {
            debug!(target: "pacs::security", "IP {} 封禁已到期", ip);
            self.blocklist.unblock(ip);
            None
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<IpAddr, PeerState>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
