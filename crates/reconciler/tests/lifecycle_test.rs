//! End-to-end lifecycle tests against the in-memory source and store.
//!
//! All tests run on tokio's paused clock, so poll intervals and grace delays
//! elapse instantly once every task is idle.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use poolsync_reconciler::{
    BindingState, Endpoint, EndpointSet, Error, InMemoryPoolStore, InstanceSpec, InstanceState,
    LifecycleController, PollInterval, PoolConfig, PoolTarget, ReconcilerConfig, Registration,
    Result, ServiceRef, StaticEndpointSource, StoreCall, StoreOperation,
};

struct Harness {
    controller: LifecycleController,
    source: Arc<StaticEndpointSource>,
    store: Arc<InMemoryPoolStore>,
}

impl Harness {
    fn new() -> Self {
        let source = Arc::new(StaticEndpointSource::new());
        let store = Arc::new(InMemoryPoolStore::new());
        let controller =
            LifecycleController::new(source.clone(), store.clone(), ReconcilerConfig::default());
        Self {
            controller,
            source,
            store,
        }
    }

    async fn count(&self, operation: StoreOperation) -> usize {
        self.store
            .calls()
            .await
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }
}

fn spec(name: &str, service: &str, pool: &str) -> InstanceSpec {
    InstanceSpec::new(
        name,
        ServiceRef::new("https://10.1.1.1:6443", "default", service),
        PoolConfig::new(pool),
    )
}

fn set(items: &[&str]) -> Result<EndpointSet> {
    items.iter().map(|s| s.parse::<Endpoint>()).collect()
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn test_start_converges_pool_on_first_tick() -> Result<()> {
    let h = Harness::new();
    let endpoints = set(&["10.0.0.1:8080", "10.0.0.2:8080"])?;
    h.source.set("default", "web", endpoints.clone()).await;

    let result = h.controller.start(spec("web", "web", "/Common/web")).await;
    assert_eq!(BindingState::of(&result), BindingState::Bound);
    advance(1).await;

    let pool = PoolTarget::from("/Common/web");
    assert_eq!(h.store.members(&pool).await, Some(endpoints.clone()));
    assert_eq!(
        h.store.mutations().await,
        vec![
            StoreCall::Create {
                config: PoolConfig::new("/Common/web"),
                members: EndpointSet::new(),
            },
            StoreCall::AddMembers {
                pool,
                members: endpoints,
            },
        ]
    );
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_endpoint_changes_applied_incrementally() -> Result<()> {
    let h = Harness::new();
    let pool = PoolTarget::from("/Common/web");
    h.source
        .set("default", "web", set(&["10.0.0.1:8080", "10.0.0.3:8080"])?)
        .await;
    h.controller.start(spec("web", "web", "/Common/web")).await?;
    advance(1).await;
    h.store.clear_calls().await;

    h.source
        .set("default", "web", set(&["10.0.0.1:8080", "10.0.0.2:8080"])?)
        .await;
    advance(30).await;

    assert_eq!(
        h.store.mutations().await,
        vec![
            StoreCall::AddMembers {
                pool: pool.clone(),
                members: set(&["10.0.0.2:8080"])?,
            },
            StoreCall::RemoveMembers {
                pool: pool.clone(),
                members: set(&["10.0.0.3:8080"])?,
            },
        ]
    );

    h.source.set("default", "web", EndpointSet::new()).await;
    advance(30).await;

    assert_eq!(h.store.members(&pool).await, Some(EndpointSet::new()));
    assert_eq!(h.count(StoreOperation::Delete).await, 0);
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_converged_pool_sees_no_mutations() -> Result<()> {
    let h = Harness::new();
    h.source.set("default", "web", set(&["10.0.0.1:8080"])?).await;
    h.controller.start(spec("web", "web", "/Common/web")).await?;
    advance(1).await;
    h.store.clear_calls().await;

    advance(90).await;

    assert!(h.store.mutations().await.is_empty());
    assert_eq!(h.count(StoreOperation::ReadMembers).await, 3);
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_deletes_pool_once_within_interval_and_grace() -> Result<()> {
    let h = Harness::new();
    h.source.set("default", "web", set(&["10.0.0.1:8080"])?).await;
    h.controller.start(spec("web", "web", "/Common/web")).await?;
    advance(1).await;

    let report = h.controller.stop("web").await;
    assert!(report.existed);
    assert_eq!(report.state(), BindingState::Unbound);

    // One interval plus the grace delay.
    advance(32).await;

    assert_eq!(h.count(StoreOperation::Delete).await, 1);
    assert_eq!(h.store.pool_count().await, 0);
    assert_eq!(h.controller.active_loops().await, 0);
    assert!(h.controller.instances().await.is_empty());

    advance(120).await;
    assert_eq!(h.count(StoreOperation::Delete).await, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_delete_failure_is_contained() -> Result<()> {
    let h = Harness::new();
    h.controller.start(spec("web", "web", "/Common/web")).await?;
    advance(1).await;
    h.store.fail(StoreOperation::Delete).await;

    h.controller.stop("web").await;
    advance(40).await;

    assert_eq!(h.count(StoreOperation::Delete).await, 1);
    assert_eq!(h.controller.active_loops().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_pool_rejected_in_either_order() -> Result<()> {
    for (first, second) in [("alpha", "beta"), ("beta", "alpha")] {
        let h = Harness::new();
        h.controller
            .start(spec(first, first, "/Common/shared"))
            .await?;

        let result = h.controller.start(spec(second, second, "/Common/shared")).await;

        assert_eq!(BindingState::of(&result), BindingState::Error);
        assert_eq!(
            result.err(),
            Some(Error::conflict(second, "/Common/shared", first))
        );
        assert_eq!(h.controller.running().await, vec![first.to_string()]);
        h.controller.shutdown().await;
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rapid_updates_last_wins_single_loop() -> Result<()> {
    let h = Harness::new();
    h.controller.start(spec("web", "web", "/Common/web")).await?;

    for mode in ["least-connections-member", "ratio-member", "fastest-node"] {
        let updated = spec("web", "web", "/Common/web");
        let updated = InstanceSpec {
            pool: updated.pool.with_load_balancing_mode(mode),
            ..updated
        }
        .with_poll_interval(PollInterval::from_secs(Some(15)));

        let report = h.controller.update(updated).await?;

        assert_eq!(report.registration, Registration::Updated);
        assert!(!report.loop_spawned);
    }

    assert_eq!(h.controller.active_loops().await, 1);
    let record = h
        .controller
        .registry()
        .lookup("web")
        .await
        .ok_or_else(|| Error::instance_not_found("web"))?;
    assert_eq!(record.spec.pool.load_balancing_mode, "fastest-node");
    assert_eq!(record.revision, 3);

    advance(31).await;

    let record = h
        .controller
        .registry()
        .lookup("web")
        .await
        .ok_or_else(|| Error::instance_not_found("web"))?;
    assert_eq!(record.state, InstanceState::Polling);
    assert_eq!(h.controller.active_loops().await, 1);
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_update_of_unknown_name_starts_loop() -> Result<()> {
    let h = Harness::new();

    let report = h.controller.update(spec("web", "web", "/Common/web")).await?;

    assert_eq!(report.registration, Registration::Created);
    assert!(report.loop_spawned);
    assert_eq!(h.controller.active_loops().await, 1);
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_update_after_loop_exit_spawns_fresh_loop() -> Result<()> {
    let h = Harness::new();
    h.controller.start(spec("web", "web", "/Common/web")).await?;
    advance(1).await;
    h.controller.stop("web").await;
    advance(40).await;
    assert_eq!(h.controller.active_loops().await, 0);

    let report = h.controller.update(spec("web", "web", "/Common/web")).await?;

    assert!(report.loop_spawned);
    advance(1).await;
    assert_eq!(h.controller.active_loops().await, 1);
    assert_eq!(h.store.pool_count().await, 1);
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restart_same_name_supersedes_stopping_loop() -> Result<()> {
    let h = Harness::new();
    h.controller.start(spec("web", "web", "/Common/web")).await?;
    advance(1).await;

    h.controller.stop("web").await;
    let report = h.controller.start(spec("web", "web", "/Common/web")).await?;
    assert_eq!(report.registration, Registration::Created);
    assert!(report.loop_spawned);

    advance(40).await;

    assert_eq!(h.count(StoreOperation::Delete).await, 0);
    assert_eq!(h.store.pool_count().await, 1);
    assert_eq!(h.controller.active_loops().await, 1);
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pool_reclaimed_by_other_instance_is_not_deleted() -> Result<()> {
    let h = Harness::new();
    h.controller.start(spec("old", "web", "/Common/web")).await?;
    advance(1).await;

    h.controller.stop("old").await;
    h.controller.start(spec("new", "web", "/Common/web")).await?;

    advance(40).await;

    assert_eq!(h.count(StoreOperation::Delete).await, 0);
    assert_eq!(h.store.pool_count().await, 1);
    assert_eq!(h.controller.running().await, vec!["new".to_string()]);
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_moving_to_new_pool_deletes_previous_pool() -> Result<()> {
    let h = Harness::new();
    let members = set(&["10.0.0.1:8080"])?;
    h.source.set("default", "web", members.clone()).await;
    h.controller.start(spec("web", "web", "/Common/web")).await?;
    advance(1).await;

    h.controller
        .update(spec("web", "web", "/Common/web-v2"))
        .await?;
    // Next tick at 30s, then the grace delay.
    advance(35).await;

    assert_eq!(h.store.members(&"/Common/web".into()).await, None);
    assert_eq!(h.store.members(&"/Common/web-v2".into()).await, Some(members));

    h.controller.stop("web").await;
    advance(40).await;

    assert_eq!(
        h.store.calls().await.last(),
        Some(&StoreCall::Delete("/Common/web-v2".into()))
    );
    assert_eq!(h.count(StoreOperation::Delete).await, 2);
    assert_eq!(h.store.pool_count().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pool_move_keeps_previous_pool_if_reclaimed() -> Result<()> {
    let h = Harness::new();
    h.controller.start(spec("web", "web", "/Common/web")).await?;
    advance(1).await;

    h.controller
        .update(spec("web", "web", "/Common/web-v2"))
        .await?;
    h.controller.start(spec("api", "api", "/Common/web")).await?;
    advance(35).await;

    assert_eq!(h.count(StoreOperation::Delete).await, 0);
    assert_eq!(h.store.pool_count().await, 2);
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restart_on_other_pool_deletes_stopped_pool() -> Result<()> {
    let h = Harness::new();
    h.source.set("default", "web", set(&["10.0.0.1:8080"])?).await;
    h.controller.start(spec("web", "web", "/Common/a")).await?;
    advance(1).await;

    h.controller.stop("web").await;
    h.controller.start(spec("web", "web", "/Common/b")).await?;
    advance(40).await;

    assert_eq!(h.store.members(&"/Common/a".into()).await, None);
    assert_eq!(
        h.store.members(&"/Common/b".into()).await,
        Some(set(&["10.0.0.1:8080"])?)
    );
    assert_eq!(h.count(StoreOperation::Delete).await, 1);
    assert_eq!(h.controller.active_loops().await, 1);
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_source_failure_self_heals() -> Result<()> {
    let h = Harness::new();
    let pool = PoolTarget::from("/Common/web");
    h.source.fail_with("connection refused").await;
    h.controller.start(spec("web", "web", "/Common/web")).await?;
    advance(1).await;

    assert_eq!(h.store.members(&pool).await, Some(EndpointSet::new()));
    assert_eq!(h.count(StoreOperation::ReadMembers).await, 0);

    // Failure does not shorten the interval.
    advance(20).await;
    assert_eq!(h.source.calls(), 1);

    h.source.recover().await;
    let endpoints = set(&["10.0.0.1:8080"])?;
    h.source.set("default", "web", endpoints.clone()).await;
    advance(10).await;

    assert_eq!(h.source.calls(), 2);
    assert_eq!(h.store.members(&pool).await, Some(endpoints));
    assert_eq!(h.controller.active_loops().await, 1);
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_placeholder_failure_retried_by_first_pass() -> Result<()> {
    let h = Harness::new();
    h.store.fail(StoreOperation::Exists).await;
    h.source.set("default", "web", set(&["10.0.0.9:80"])?).await;

    let report = h.controller.start(spec("web", "web", "/Common/web")).await?;
    assert_eq!(report.registration, Registration::Created);
    advance(1).await;

    assert_eq!(
        h.store.members(&"/Common/web".into()).await,
        Some(set(&["10.0.0.9:80"])?)
    );
    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_independent_instances_do_not_interfere() -> Result<()> {
    let h = Harness::new();
    h.source.set("default", "api", set(&["10.0.1.1:80"])?).await;
    h.source.set("default", "web", set(&["10.0.2.1:80"])?).await;
    h.controller.start(spec("api", "api", "/Common/api")).await?;
    h.controller.start(spec("web", "web", "/Common/web")).await?;
    advance(1).await;

    h.controller.stop("api").await;
    advance(40).await;

    assert_eq!(h.store.members(&"/Common/api".into()).await, None);
    assert_eq!(
        h.store.members(&"/Common/web".into()).await,
        Some(set(&["10.0.2.1:80"])?)
    );
    assert_eq!(h.controller.running().await, vec!["web".to_string()]);
    h.controller.shutdown().await;
    Ok(())
}
