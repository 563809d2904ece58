//! # pool：入站命令的有界工作线程池
//!
//! ## 角色定位（Why）
//! - 通道的投递线程只负责把请求交给线程池，命令在阻塞线程上执行；
//! - 池满时立即拒绝，调用方据此回复 not-found 哨兵，而不是让投递线程等待。
//!
//! ## 契约说明（What）
//! - 容量 = `max_threads`（同时执行）+ `queue_capacity`（排队）；
//! - [`WorkerPool::shutdown`]：先停止接收，再在超时内等待所有在途任务结束，最后释放资源；
//! - 任务 panic 只记录 `error` 日志，不影响池内其他任务。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, error, warn};

/// 任务被拒绝的原因。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PoolRejection {
    #[error("worker pool is shutting down")]
    Shutdown,
    #[error("worker pool is saturated")]
    Saturated,
}

/// 关闭结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// 所有在途任务已完成。
    Drained,
    /// 超时时仍有任务未完成；这些任务继续在后台运行直至结束。
    TimedOut { outstanding: usize },
}

/// 有界工作线程池。
///
/// # 教案式说明
/// - **执行逻辑 (How)**：
///   1. `admission` 信号量限制在途总量，`try_execute` 同步获取许可，失败即拒绝；
///   2. 已接纳的任务先在异步侧等待 `workers` 许可，再进入 `spawn_blocking`；
///   3. 关闭时一次性获取全部 `admission` 许可，即等价于“所有在途任务都已结束”。
/// - **风险提示 (Trade-offs)**：超时后未完成的任务不会被强制终止，阻塞线程无法安全抢占。
pub struct WorkerPool {
    name: Arc<str>,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    capacity: u32,
    accepting: AtomicBool,
    runtime: Handle,
}

impl WorkerPool {
    pub fn new(
        name: impl Into<Arc<str>>,
        max_threads: usize,
        queue_capacity: usize,
        runtime: Handle,
    ) -> Self {
        let max_threads = max_threads.clamp(1, Semaphore::MAX_PERMITS);
        let capacity = max_threads
            .saturating_add(queue_capacity)
            .min(u32::MAX as usize) as u32;
        Self {
            name: name.into(),
            admission: Arc::new(Semaphore::new(capacity as usize)),
            workers: Arc::new(Semaphore::new(max_threads)),
            capacity,
            accepting: AtomicBool::new(true),
            runtime,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 提交任务；池已关闭或已满时立即返回拒绝原因。
    pub fn try_execute<F>(&self, job: F) -> Result<(), PoolRejection>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PoolRejection::Shutdown);
        }
        let admitted = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(PoolRejection::Saturated),
            Err(TryAcquireError::Closed) => return Err(PoolRejection::Shutdown),
        };

        let workers = Arc::clone(&self.workers);
        let pool = Arc::clone(&self.name);
        self.runtime.spawn(async move {
            let _admitted = admitted;
            let Ok(worker) = workers.acquire_owned().await else {
                debug!(pool = %pool, "worker pool closed before job started");
                return;
            };
            let outcome = tokio::task::spawn_blocking(move || {
                let _worker = worker;
                job();
            })
            .await;
            if let Err(err) = outcome {
                error!(pool = %pool, error = %err, "worker pool job failed");
            }
        });
        Ok(())
    }

    /// 已接纳但尚未结束的任务数（包括排队中的任务）。
    pub fn in_flight(&self) -> usize {
        (self.capacity as usize).saturating_sub(self.admission.available_permits())
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// 停止接收、排空并释放；重复调用返回 [`ShutdownOutcome::Drained`]。
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        self.accepting.store(false, Ordering::Release);
        let outcome = match tokio::time::timeout(timeout, self.admission.acquire_many(self.capacity))
            .await
        {
            Ok(_) => ShutdownOutcome::Drained,
            Err(_) => {
                let outstanding = self.in_flight();
                warn!(
                    pool = %self.name,
                    outstanding,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker pool shutdown timed out"
                );
                ShutdownOutcome::TimedOut { outstanding }
            }
        };
        self.admission.close();
        self.workers.close();
        outcome
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn saturated_pool_rejects_and_drains_on_shutdown() {
        let pool = WorkerPool::new("saturation", 1, 0, Handle::current());
        let (release, gate) = mpsc::channel::<()>();
        pool.try_execute(move || {
            let _ = gate.recv();
        })
        .expect("first job admitted");

        assert_eq!(pool.try_execute(|| {}), Err(PoolRejection::Saturated));
        assert_eq!(pool.in_flight(), 1);

        release.send(()).expect("job waiting");
        assert_eq!(
            pool.shutdown(Duration::from_secs(5)).await,
            ShutdownOutcome::Drained
        );
        assert_eq!(pool.try_execute(|| {}), Err(PoolRejection::Shutdown));
        assert_eq!(
            pool.shutdown(Duration::from_millis(10)).await,
            ShutdownOutcome::Drained
        );
    }

    #[tokio::test]
    async fn shutdown_times_out_on_stuck_job() {
        let pool = WorkerPool::new("stuck", 2, 2, Handle::current());
        let (release, gate) = mpsc::channel::<()>();
        pool.try_execute(move || {
            let _ = gate.recv();
        })
        .expect("admitted");

        assert_eq!(
            pool.shutdown(Duration::from_millis(50)).await,
            ShutdownOutcome::TimedOut { outstanding: 1 }
        );
        let _ = release.send(());
    }

    #[tokio::test]
    async fn panicking_job_does_not_poison_pool() {
        let pool = WorkerPool::new("panics", 1, 1, Handle::current());
        pool.try_execute(|| panic!("job exploded")).expect("admitted");

        let (done, finished) = oneshot::channel();
        pool.try_execute(move || {
            let _ = done.send(7);
        })
        .expect("admitted");
        assert_eq!(finished.await, Ok(7));
    }
}
