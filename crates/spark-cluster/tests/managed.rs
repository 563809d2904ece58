//! 引用计数包装在真实通道工厂上的行为。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spark_cluster::command::{Command, CommandResponse};
use spark_cluster::config::DispatcherConfig;
use spark_cluster::dispatcher::{
    ChannelDispatcherFactory, CommandDispatcher, DispatcherFactory, DispatcherOptions,
    ManagedDispatcherFactory,
};
use spark_cluster::error::DispatchError;
use spark_cluster::transport::local::LocalGroup;

#[derive(Clone, Serialize, Deserialize)]
struct Hit;

impl Command for Hit {
    type Context = AtomicUsize;
    type Output = usize;

    fn execute(&self, hits: &AtomicUsize) -> CommandResponse<usize> {
        Ok(hits.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct Other;

impl Command for Other {
    type Context = AtomicUsize;
    type Output = ();

    fn execute(&self, _: &AtomicUsize) -> CommandResponse<()> {
        Ok(())
    }
}

fn managed(group: &LocalGroup, name: &str) -> ManagedDispatcherFactory<ChannelDispatcherFactory> {
    let config = DispatcherConfig::default().with_response_timeout(Duration::from_secs(5));
    let factory = ChannelDispatcherFactory::new(group.join(name), config).expect("factory");
    ManagedDispatcherFactory::new(factory)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn context_mismatch_leaves_first_dispatcher_usable() {
    let group = LocalGroup::new("svc1");
    let a = managed(&group, "a");
    let b = managed(&group, "b");

    let x = Arc::new(AtomicUsize::new(0));
    let first = a
        .create_dispatcher::<Hit>("svc1".into(), Arc::clone(&x), DispatcherOptions::new())
        .expect("first owner");
    let _remote = b
        .create_dispatcher::<Hit>("svc1".into(), Arc::new(AtomicUsize::new(10)), DispatcherOptions::new())
        .expect("remote owner");

    let y = Arc::new(AtomicUsize::new(0));
    assert!(matches!(
        a.create_dispatcher::<Hit>("svc1".into(), y, DispatcherOptions::new()),
        Err(DispatchError::ContextMismatch { .. })
    ));
    assert!(matches!(
        a.create_dispatcher::<Other>("svc1".into(), Arc::clone(&x), DispatcherOptions::new()),
        Err(DispatchError::ContextMismatch { .. })
    ));

    let remote_node = b.inner().local_node().clone();
    assert_eq!(first.execute_on_node(Hit, &remote_node).await.expect("remote"), 11);
    let local_node = a.inner().local_node().clone();
    assert_eq!(first.execute_on_node(Hit, &local_node).await.expect("local"), 1);
    assert_eq!(first.reference_count(), 1);

    a.inner().close().await;
    b.inner().close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn last_owner_deregisters_the_shared_dispatcher() {
    let group = LocalGroup::new("owners");
    let a = managed(&group, "a");
    let b = managed(&group, "b");
    let context = Arc::new(AtomicUsize::new(0));

    let owners: Vec<_> = (0..3)
        .map(|_| {
            a.create_dispatcher::<Hit>("shared".into(), Arc::clone(&context), DispatcherOptions::new())
                .expect("owner")
        })
        .collect();
    assert!(owners[0].shares_instance_with(&owners[2]));
    assert_eq!(a.inner().registered(), 1);

    let caller = b
        .create_dispatcher::<Hit>("shared".into(), Arc::new(AtomicUsize::new(0)), DispatcherOptions::new())
        .expect("caller");
    let target = a.inner().local_node().clone();

    for owner in &owners[..2] {
        owner.close().await;
        assert_eq!(a.inner().registered(), 1, "remaining owners keep it registered");
    }
    assert_eq!(caller.execute_on_node(Hit, &target).await.expect("still served"), 1);

    owners[2].close().await;
    assert_eq!(a.inner().registered(), 0);
    assert_eq!(a.shared_count(), 0);
    let error = caller
        .execute_on_node(Hit, &target)
        .await
        .expect_err("deregistered");
    assert!(error.is_target_not_found());

    a.inner().close().await;
    b.inner().close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn balanced_release_allows_immediate_recreation() {
    let group = LocalGroup::new("recreate");
    let a = managed(&group, "a");
    let context = Arc::new(AtomicUsize::new(0));

    let dropped = a
        .create_dispatcher::<Hit>("svc".into(), Arc::clone(&context), DispatcherOptions::new())
        .expect("first owner");
    drop(dropped);
    assert_eq!(a.shared_count(), 0);
    assert_eq!(a.inner().registered(), 0, "drop deregisters synchronously");

    let closed = a
        .create_dispatcher::<Hit>("svc".into(), Arc::clone(&context), DispatcherOptions::new())
        .expect("recreated after drop");
    closed.close().await;
    assert_eq!(a.inner().registered(), 0);

    let again = a
        .create_dispatcher::<Hit>("svc".into(), Arc::clone(&context), DispatcherOptions::new())
        .expect("recreated after close");
    let local = a.inner().local_node().clone();
    assert_eq!(again.execute_on_node(Hit, &local).await.expect("local"), 1);
    assert_eq!(a.inner().registered(), 1);

    again.close().await;
    a.inner().close().await;
}
