//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中声明命令分发链路对外暴露的错误语义：注册冲突、上下文不一致、传输失败、远端执行失败、
//!   目标未找到（取消语义）与等待被中断；
//! - 本地旁路与远端调用共享同一套错误分类，调用方无需区分路由路径。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，可安全跨线程传播；
//! - “目标未找到”永远以 [`DispatchError::Cancelled`] 呈现，不会退化为通用错误；
//! - [`CommandError`](crate::command::CommandError) 可序列化，用于跨节点回传远端异常。

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::command::CommandError;
use crate::dispatcher::DispatcherId;
use crate::node::Node;
use crate::transport::{TransportAddress, TransportError};

/// 命令分发错误域。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `DuplicateIdentifier`/`ContextMismatch` 在创建阶段立即返回，不产生任何部分注册；
///   - `Transport` 包装底层通道的发送/接收失败；
///   - `Execution` 携带远端（或本地旁路）执行时捕获的 [`CommandError`]；
///   - `Cancelled` 覆盖调用方主动取消与“目标未注册”两种取消语义；
///   - `Interrupted` 表示等待期间工厂被关闭。
/// - **执行逻辑 (How)**：`From` 实现覆盖传输、编解码、执行与配置错误，调用点可直接使用 `?`。
#[derive(Debug, Error)]
pub enum DispatchError {
    /// 同一标识已注册分发器。
    #[error("dispatcher `{id}` is already registered")]
    DuplicateIdentifier { id: DispatcherId },

    /// 共享分发器时上下文对象（或命令类型）与首个所有者不一致。
    #[error("dispatcher `{id}` is already shared with a different context")]
    ContextMismatch { id: DispatcherId },

    /// 底层组通信通道失败。
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// 命令执行失败（远端捕获或本地旁路）。
    #[error("command execution failed: {0}")]
    Execution(#[from] CommandError),

    /// 命令被取消，见 [`CancellationReason`]。
    #[error("command cancelled: {reason}")]
    Cancelled { reason: CancellationReason },

    /// 请求或响应帧无法编解码。
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),

    /// 等待响应期间所属工厂开始关闭。
    #[error("wait for response was interrupted by dispatcher shutdown")]
    Interrupted,

    /// 当前视图为空，无法确定协调者。
    #[error("membership has no coordinator")]
    NoCoordinator,

    /// 分发器或工厂已关闭。
    #[error("dispatcher is closed")]
    Closed,

    /// 构造工厂时不在 Tokio 运行时内。
    #[error("dispatcher factory requires a Tokio runtime context")]
    Runtime,

    /// 配置无效。
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DispatchError {
    /// 是否属于取消语义（调用方取消或目标未找到）。
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DispatchError::Cancelled { .. })
    }

    /// 是否为“目标节点上未注册该分发器”。
    pub fn is_target_not_found(&self) -> bool {
        matches!(
            self,
            DispatchError::Cancelled {
                reason: CancellationReason::TargetNotFound { .. }
            }
        )
    }

    pub(crate) fn target_not_found(node: &Node, id: &DispatcherId) -> Self {
        DispatchError::Cancelled {
            reason: CancellationReason::TargetNotFound {
                address: node.address().clone(),
                id: id.clone(),
            },
        }
    }
}

/// 取消原因。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancellationReason {
    /// 调用方通过 [`CommandFuture::cancel`](crate::dispatcher::CommandFuture::cancel) 主动取消。
    Caller,
    /// 目标节点回复了 not-found 哨兵：分发器已关闭或从未注册。
    TargetNotFound {
        address: TransportAddress,
        id: DispatcherId,
    },
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancellationReason::Caller => f.write_str("cancelled by caller"),
            CancellationReason::TargetNotFound { address, id } => {
                write!(f, "no dispatcher `{id}` registered on {address}")
            }
        }
    }
}

/// 配置解析与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid dispatcher configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },

    #[error("response timeout {0:?} is too small")]
    Timeout(Duration),
}
