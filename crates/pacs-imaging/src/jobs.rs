//! 重建任务：进度上报、协作式取消与专用计算线程池
//!
//! CPU密集的重建在独立的 rayon 线程池上执行，不占用处理DICOM关联的异步运行时。

use crate::error::{ReconstructionError, Result};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// 任务进度
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    /// 0.0 ..= 1.0
    pub fraction: f32,
    pub stage: String,
}

impl Progress {
    fn new(fraction: f32, stage: &str) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            stage: stage.to_string(),
        }
    }
}

/// 在计算线程内使用的任务上下文
#[derive(Clone)]
pub struct JobContext {
    id: Uuid,
    cancel: CancellationToken,
    progress: Arc<watch::Sender<Progress>>,
    /// 本上下文的进度区间
    span: (f32, f32),
}

impl JobContext {
    /// 新建任务，返回上下文及供调用方持有的句柄
    pub fn new() -> (Self, JobHandle) {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(Progress::new(0.0, "排队中"));
        let context = Self {
            id,
            cancel: cancel.clone(),
            progress: Arc::new(tx),
            span: (0.0, 1.0),
        };
        (context, JobHandle { id, cancel, progress: rx })
    }

    /// 无人观察的任务上下文
    pub fn detached() -> Self {
        Self::new().0
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 把进度区间 `start..end` 作为子任务的 0..1
    pub fn scoped(&self, start: f32, end: f32) -> Self {
        let (lo, hi) = self.span;
        Self {
            span: (lo + (hi - lo) * start, lo + (hi - lo) * end),
            ..self.clone()
        }
    }

    /// 阶段边界：已取消则返回 [`ReconstructionError::Cancelled`]，否则上报进度
    pub fn stage(&self, fraction: f32, stage: &str) -> Result<()> {
        self.checkpoint()?;
        let fraction = self.span.0 + (self.span.1 - self.span.0) * fraction;
        debug!("重建任务 {} [{:.0}%] {}", self.id, fraction * 100.0, stage);
        self.progress.send_replace(Progress::new(fraction, stage));
        Ok(())
    }

    /// 只检查取消，不上报进度
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ReconstructionError::Cancelled);
        }
        Ok(())
    }

    fn finish(&self) {
        self.progress.send_replace(Progress::new(1.0, "完成"));
    }
}

/// 调用方持有的任务句柄
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    cancel: CancellationToken,
    progress: watch::Receiver<Progress>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 请求取消；计算在下一个阶段边界停止
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 当前进度
    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    /// 订阅进度变化
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }
}

/// 重建计算线程池
pub struct JobRunner {
    pool: rayon::ThreadPool,
}

impl JobRunner {
    /// `threads` 为 0 时使用全部CPU核心
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("pacs-recon-{}", i))
            .build()
            .map_err(|e| ReconstructionError::Internal(format!("无法创建重建线程池: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// 在线程池上执行不带进度的辅助计算（例如切片解码）
    ///
    /// `work` 内的rayon并行迭代同样在本线程池上执行。
    pub async fn install<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(work))
                .map_err(|_| ReconstructionError::Internal("重建辅助计算发生panic".to_string()));
            let _ = tx.send(outcome);
        });
        rx.await
            .map_err(|_| ReconstructionError::Internal("重建辅助任务异常终止".to_string()))?
    }

    /// 在线程池上执行 `work` 并异步等待结果
    pub async fn run<T, F>(&self, context: JobContext, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&JobContext) -> Result<T> + Send + 'static,
    {
        context.checkpoint()?;
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| work(&context)))
                .unwrap_or_else(|_| Err(ReconstructionError::Internal("重建计算发生panic".to_string())));
            if outcome.is_ok() {
                context.finish();
            }
            let _ = tx.send(outcome);
        });

        let outcome = rx
            .await
            .map_err(|_| ReconstructionError::Internal("重建任务异常终止".to_string()))?;
        if let Err(err) = &outcome {
            if err.is_unexpected() {
                error!("重建任务失败: {}", err);
            } else {
                debug!("重建任务结束: {}", err);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_reports_progress_and_result() {
        let runner = JobRunner::new(2).unwrap();
        let (context, handle) = JobContext::new();
        let value = runner
            .run(context, |ctx| {
                ctx.stage(0.5, "计算中")?;
                Ok(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(handle.progress().fraction, 1.0);
    }

    #[tokio::test]
    async fn test_install_keeps_parallel_work_on_own_pool() {
        use rayon::prelude::*;

        let runner = JobRunner::new(2).unwrap();
        let names = runner
            .install(|| {
                (0..64)
                    .into_par_iter()
                    .map(|_| std::thread::current().name().unwrap_or_default().to_string())
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap();

        assert_eq!(names.len(), 64);
        assert!(names.iter().all(|name| name.starts_with("pacs-recon-")));
    }

    #[tokio::test]
    async fn test_cancelled_job_stops_at_stage_boundary() {
        let runner = JobRunner::new(1).unwrap();
        let (context, handle) = JobContext::new();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel::<()>();

        let job = runner.run(context, move |ctx| {
            ctx.stage(0.1, "第一阶段")?;
            started_tx.send(()).ok();
            resume_rx.recv().ok();
            ctx.stage(0.6, "第二阶段")?;
            Ok(())
        });
        let waiter = async {
            tokio::task::spawn_blocking(move || started_rx.recv().ok()).await.ok();
            handle.cancel();
            resume_tx.send(()).ok();
        };
        let (outcome, _) = tokio::join!(job, waiter);

        assert_eq!(outcome, Err(ReconstructionError::Cancelled));
        assert_eq!(handle.progress().stage, "第一阶段");
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let runner = JobRunner::new(1).unwrap();
        let outcome: Result<()> = runner.run(JobContext::detached(), |_| panic!("boom")).await;
        assert!(matches!(outcome, Err(ReconstructionError::Internal(_))));
    }

    #[test]
    fn test_scoped_context_maps_progress_into_span() {
        let (context, handle) = JobContext::new();
        let second_half = context.scoped(0.5, 1.0);
        second_half.stage(0.5, "分析").unwrap();
        assert_eq!(handle.progress().fraction, 0.75);

        second_half.scoped(0.0, 0.5).stage(1.0, "子阶段").unwrap();
        assert_eq!(handle.progress().fraction, 0.75);
    }
}
