//! # spark-cluster
//!
//! ## 定位与职责（Why）
//! - 让动态集群中的任意进程在单个成员、协调者或全体存活成员上同步/异步执行命令；
//! - 多个互不相关的消费者共享同一条组通信通道，按分发器标识解复用入站流量；
//! - 跟踪成员视图变化（离开、加入、分区合并）并异步通知监听者。
//!
//! ## 架构嵌入（Where）
//! - `transport` 声明组通信契约，`transport::local` 提供进程内实现；
//! - `dispatcher` 承载工厂、分发门面与引用计数共享包装；
//! - `tracker`/`membership`/`node` 负责视图与节点身份；
//! - `codec`/`command` 定义线上格式与命令契约；`pool` 执行入站命令；
//! - `config`/`error` 提供配置与统一错误分类。
//!
//! ## 交付语义（What）
//! - 每次调用至多尝试投递一次，超时由调用方配置；不提供恰好一次语义，也不实现共识。
//!
//! ```
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use spark_cluster::command::{Command, CommandResponse};
//! use spark_cluster::config::DispatcherConfig;
//! use spark_cluster::dispatcher::{
//!     ChannelDispatcherFactory, CommandDispatcher, DispatcherFactory, DispatcherOptions,
//! };
//! use spark_cluster::transport::local::LocalGroup;
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Greet(String);
//!
//! impl Command for Greet {
//!     type Context = String;
//!     type Output = String;
//!
//!     fn execute(&self, node: &String) -> CommandResponse<String> {
//!         Ok(format!("{} greets {}", node, self.0))
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let group = LocalGroup::new("demo");
//! let a = ChannelDispatcherFactory::new(group.join("a"), DispatcherConfig::default()).unwrap();
//! let b = ChannelDispatcherFactory::new(group.join("b"), DispatcherConfig::default()).unwrap();
//! let da = a.create_dispatcher::<Greet>("greeter".into(), Arc::new("a".into()), DispatcherOptions::new()).unwrap();
//! let _db = b.create_dispatcher::<Greet>("greeter".into(), Arc::new("b".into()), DispatcherOptions::new()).unwrap();
//!
//! let reply = da.execute_on_node(Greet("you".into()), b.local_node()).await.unwrap();
//! assert_eq!(reply, "b greets you");
//! # a.close().await;
//! # b.close().await;
//! # });
//! ```

pub mod codec;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod membership;
pub mod node;
pub mod pool;
pub mod tracker;
pub mod transport;

pub use command::{Command, CommandError, CommandResponse};
pub use config::DispatcherConfig;
pub use dispatcher::{
    ChannelDispatcher, ChannelDispatcherFactory, ClusterResponses, CommandDispatcher,
    CommandFuture, DispatcherFactory, DispatcherId, DispatcherOptions, ManagedDispatcher,
    ManagedDispatcherFactory,
};
pub use error::{CancellationReason, ConfigError, DispatchError};
pub use membership::{Membership, MembershipChange};
pub use node::Node;
pub use tracker::{
    HistoryEntry, HistoryEvent, ListenerRegistration, MembershipListener, MembershipTracker,
    NotificationMode,
};
