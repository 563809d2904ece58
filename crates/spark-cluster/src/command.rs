//! # command：可跨节点执行的工作单元
//!
//! ## 角色定位（Why）
//! - 命令是一个可序列化的值，携带在某个消费者上下文上执行所需的全部参数；
//! - 通常以枚举表达一组封闭的变体，每个变体对应一种操作，由 [`Command::execute`] 统一分派。
//!
//! ## 契约要点（What）
//! - 命令在远端节点上反序列化后执行，执行结果（或捕获的错误）经响应帧回传；
//! - 本地旁路直接调用 [`Command::execute`]，不经过序列化；
//! - 执行期间的 panic 被捕获并转换为 [`CommandError`]，不会跨越分发边界传播。

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 命令执行失败的稳定错误码。
pub mod codes {
    /// 执行过程中发生 panic。
    pub const PANICKED: &str = "spark.cluster.panicked";
    /// 请求或响应无法编解码。
    pub const CODEC: &str = "spark.cluster.codec";
    /// 组播时单个成员的传输失败。
    pub const TRANSPORT: &str = "spark.cluster.transport";
}

/// 命令执行结果。
pub type CommandResponse<T> = Result<T, CommandError>;

/// 可序列化的执行错误，跨节点回传给调用方。
///
/// `code` 采用点分命名（如 `spark.cluster.codec`），业务命令可自定义自己的码空间。
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct CommandError {
    code: String,
    message: String,
}

impl CommandError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|text| (*text).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "command panicked".to_owned());
        Self::new(codes::PANICKED, message)
    }

    pub(crate) fn codec(message: impl Into<String>) -> Self {
        Self::new(codes::CODEC, message)
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::new(codes::TRANSPORT, message)
    }
}

/// 可分发的命令。
///
/// # 教案式说明
/// - **意图 (Why)**：把“在某个上下文上做一件事”固化为可以跨进程传输的值；
/// - **契约 (What)**：
///   - `Context` 由创建分发器的消费者提供，在所有节点上以同一标识注册；
///   - `Output` 必须可序列化，远端结果经响应帧回传；
///   - `execute` 可能在工作线程池中并发调用，实现需自行保证对 `Context` 的并发安全；
/// - **风险提示 (Trade-offs)**：`execute` 运行在阻塞线程池上，可以执行同步 I/O，
///   但长时间运行会占用工作线程并导致后续请求被拒绝。
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use spark_cluster::command::{Command, CommandError, CommandResponse};
/// use std::sync::atomic::{AtomicI64, Ordering};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// enum CounterCommand {
///     Add(i64),
///     Get,
/// }
///
/// impl Command for CounterCommand {
///     type Context = AtomicI64;
///     type Output = i64;
///
///     fn execute(&self, counter: &AtomicI64) -> CommandResponse<i64> {
///         match self {
///             CounterCommand::Add(delta) => Ok(counter.fetch_add(*delta, Ordering::SeqCst) + delta),
///             CounterCommand::Get => Ok(counter.load(Ordering::SeqCst)),
///         }
///     }
/// }
///
/// let counter = AtomicI64::new(1);
/// assert_eq!(CounterCommand::Add(2).execute(&counter), Ok(3));
/// # let _ = CommandError::new("demo", "unused");
/// ```
pub trait Command: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Context: Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn execute(&self, context: &Self::Context) -> CommandResponse<Self::Output>;
}

/// 执行命令并把 panic 转换为 [`CommandError`]。
pub(crate) fn run_command<K: Command>(command: &K, context: &K::Context) -> CommandResponse<K::Output> {
    match catch_unwind(AssertUnwindSafe(|| command.execute(context))) {
        Ok(response) => response,
        Err(payload) => Err(CommandError::panicked(payload.as_ref())),
    }
}
