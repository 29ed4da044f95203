//! 后台任务管理
//!
//! 统一管理管道后台任务的注册、启动和关闭。
//!
//! # 任务类型
//!
//! - [`TaskKind::Worker`] - 长期后台工作者 (投递处理)
//! - [`TaskKind::Listener`] - 事件监听器 (broker 确认/退回信号)
//! - [`TaskKind::Periodic`] - 定时任务 (outbox 排空)

use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Worker,
    Listener,
    Periodic,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Worker => write!(f, "Worker"),
            TaskKind::Listener => write!(f, "Listener"),
            TaskKind::Periodic => write!(f, "Periodic"),
        }
    }
}

struct RegisteredTask {
    name: &'static str,
    kind: TaskKind,
    handle: JoinHandle<()>,
}

/// 后台任务管理器
///
/// ```ignore
/// let mut tasks = BackgroundTasks::new();
/// let token = tasks.shutdown_token();
/// tasks.spawn("outbox_drain", TaskKind::Periodic, scheduler.run(token));
///
/// tasks.shutdown(Duration::from_secs(10)).await;
/// ```
pub struct BackgroundTasks {
    tasks: Vec<RegisteredTask>,
    /// 全局取消令牌
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// 使用外部取消令牌 (由 ServerState 持有)
    pub fn with_token(shutdown: CancellationToken) -> Self {
        Self {
            tasks: Vec::new(),
            shutdown,
        }
    }

    /// 获取取消令牌（用于任务内部监听 shutdown 信号）
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 注册并启动一个后台任务
    ///
    /// 任务会被包装以捕获 panic。取消前正常退出也会记录警告，
    /// 因为这里的任务都应当运行到关闭为止。
    pub fn spawn<F>(&mut self, name: &'static str, kind: TaskKind, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        let wrapped_future = async move {
            let result = AssertUnwindSafe(future).catch_unwind().await;
            match result {
                Ok(()) if token.is_cancelled() => {
                    tracing::debug!(task = %name, kind = %kind, "Background task stopped");
                }
                Ok(()) => {
                    tracing::warn!(task = %name, kind = %kind, "Background task completed unexpectedly");
                }
                Err(panic_info) => {
                    let panic_msg: String = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        (*s).to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_string()
                    };
                    tracing::error!(
                        task = %name,
                        kind = %kind,
                        panic = %panic_msg,
                        "Background task panicked"
                    );
                }
            }
        };

        let handle = tokio::spawn(wrapped_future);
        tracing::debug!(task = %name, kind = %kind, "Registered background task");
        self.tasks.push(RegisteredTask { name, kind, handle });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 打印任务摘要
    pub fn log_summary(&self) {
        let count = |k: TaskKind| self.tasks.iter().filter(|t| t.kind == k).count();
        tracing::info!(
            total = self.tasks.len(),
            workers = count(TaskKind::Worker),
            listeners = count(TaskKind::Listener),
            periodic = count(TaskKind::Periodic),
            "Background tasks registered"
        );
    }

    /// 返回已经退出的任务数量 (运行期间应为 0)
    pub fn check_health(&self) -> usize {
        let finished: Vec<_> = self
            .tasks
            .iter()
            .filter(|t| t.handle.is_finished())
            .collect();
        for task in &finished {
            tracing::error!(task = %task.name, kind = %task.kind, "Background task finished before shutdown");
        }
        finished.len()
    }

    /// Graceful shutdown - 取消所有任务并等待完成
    ///
    /// 超时仍未退出的任务会被 abort。
    pub async fn shutdown(self, timeout: Duration) {
        tracing::info!("Shutting down {} background tasks...", self.tasks.len());

        self.shutdown.cancel();

        for task in self.tasks {
            let abort = task.handle.abort_handle();
            match tokio::time::timeout(timeout, task.handle).await {
                Ok(Ok(())) => tracing::debug!(task = %task.name, "Task completed"),
                Ok(Err(e)) if e.is_cancelled() => tracing::debug!(task = %task.name, "Task cancelled"),
                Ok(Err(e)) => tracing::error!(task = %task.name, error = ?e, "Task panicked"),
                Err(_) => {
                    tracing::warn!(task = %task.name, "Task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        tracing::info!("All background tasks stopped");
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}
