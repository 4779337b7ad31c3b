//! End-to-end scenarios against the wired control plane and the in-memory
//! runtime driver.

use std::{sync::Arc, time::Duration};

use orchestrator::{
    core::{BotAuth, BotConfig, InstanceId, PoolId, UserId},
    health::HealthEvent,
    mapper::Placement,
    HostMode,
    Orchestrator,
    Settings,
};
use runtime::{fake::FakeRuntime, ContainerStatus};

fn settings_at(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::with_root(dir);
    settings.host_mode = HostMode::Host;
    // keep the timer quiet during tests; sweeps run explicitly
    settings.health_interval = Duration::from_secs(3600);
    settings
}

fn config(instance: &str, user: &str) -> BotConfig {
    BotConfig {
        instance_id: InstanceId::from(instance),
        user_id: UserId::from(user),
        strategy: "momentum".into(),
        auth: Some(BotAuth {
            username: "bot".into(),
            password: "hunter2".into(),
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn lifecycle_through_the_mapper() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeRuntime::new());
    let orch = Orchestrator::init(settings_at(dir.path()), fake.clone());

    let instance = InstanceId::from("b1");
    let user = UserId::from("alice");

    let placement = orch
        .mapper
        .assign(&instance, &user, &config("b1", "alice"))
        .await
        .unwrap();
    assert!(matches!(placement, Placement::Pooled { .. }));

    orch.mapper
        .start(&instance, &config("b1", "alice"))
        .await
        .unwrap();
    let connection = orch.mapper.resolve(&instance).await.unwrap().unwrap();
    assert_eq!(connection.url, "http://localhost:9000");
    assert!(connection.auth.is_some());

    orch.mapper.stop(&instance).await.unwrap();
    orch.mapper
        .start(&instance, &config("b1", "alice"))
        .await
        .unwrap();
    orch.mapper.invalidate(&instance).await;
    let after = orch.mapper.resolve(&instance).await.unwrap().unwrap();
    assert_eq!(connection.url, after.url);

    orch.mapper.remove(&instance).await.unwrap();
    orch.mapper.invalidate(&instance).await;
    assert!(orch.mapper.resolve(&instance).await.unwrap().is_none());

    orch.shutdown().await;
}

#[tokio::test]
async fn overflow_reload_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeRuntime::new());
    let orch = Orchestrator::init(settings_at(dir.path()), fake.clone());
    let user = UserId::from("bob");

    for i in 1..=4 {
        orch.mapper
            .assign(
                &InstanceId::from(format!("b{}", i)),
                &user,
                &config(&format!("b{}", i), "bob"),
            )
            .await
            .unwrap();
    }
    assert_eq!(orch.manager.user_pools(&user).await.len(), 2);
    assert_eq!(fake.up_count(), 2);
    orch.shutdown().await;

    // a second process re-hydrates the same placement from disk
    let orch = Orchestrator::init(settings_at(dir.path()), fake.clone());
    let slot = orch
        .manager
        .slot_of(&InstanceId::from("b4"))
        .await
        .unwrap();
    assert_eq!(slot.pool_id, PoolId::from("bob-pool-2"));
    assert_eq!(slot.port, 9003);

    // empty the second pool; only it is torn down
    orch.manager.remove(&InstanceId::from("b4")).await.unwrap();
    assert_eq!(orch.manager.cleanup_empty_pools().await, 1);
    assert!(orch.manager.pool(&PoolId::from("bob-pool-2")).await.is_none());
    assert_eq!(fake.status("bob-pool-2"), ContainerStatus::Missing);
    assert_eq!(fake.status("bob-pool-1"), ContainerStatus::Running);
    orch.shutdown().await;
}

#[tokio::test]
async fn reconcile_then_health_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeRuntime::new());
    let orch = Orchestrator::init(settings_at(dir.path()), fake.clone());
    let user = UserId::from("carol");

    for i in 1..=3 {
        orch.mapper
            .assign(
                &InstanceId::from(format!("b{}", i)),
                &user,
                &config(&format!("b{}", i), "carol"),
            )
            .await
            .unwrap();
    }

    // supervisor only knows two of the three mapped bots, plus a stray
    fake.respond(
        None,
        "status",
        "bot-b1    RUNNING   pid 11, uptime 0:10:00\n\
         bot-b2    FATAL     Exited too quickly\n\
         bot-b9    RUNNING   pid 19, uptime 1:00:00\n",
    );

    let report = orch.manager.reconcile().await;
    assert_eq!(report.removed_stale_slots, 1);
    assert_eq!(report.orphans_found, 1);
    assert!(!orch.manager.contains(&InstanceId::from("b3")).await);
    assert!(!orch.manager.contains(&InstanceId::from("b9")).await);

    // the sweep then recovers the FATAL bot
    let mut events = orch.monitor.subscribe();
    let health = orch.monitor.check_once().await;
    assert_eq!(health.bots.len(), 2);
    assert_eq!(fake.execs_matching("restart bot-b2").len(), 1);
    let mut saw_attempt = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, HealthEvent::BotRecoveryAttempted { .. }) {
            saw_attempt = true;
        }
    }
    assert!(saw_attempt);
    orch.shutdown().await;
}
