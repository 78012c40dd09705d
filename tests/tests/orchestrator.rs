//! Tests of the host side: installing plugin sets, handler subscription and
//! guild command sync

use glacier_kernel::config::PluginHostConfig;
use glacier_kernel::{DuplicatePolicy, ModuleSubsystem, ServiceKey, ServiceResolverExt};
use glacier_plugins::hot_reload::{
    HostServices, HotReloadConfig, HotReloadManager, ModuleRegistrar, PluginPattern,
    PluginSetUpdated, WatchConfig,
};
use glacier_runtime::{
    ApplyOutcome, Gateway, GuildSyncError, HostError, HostOrchestrator, HostParts,
    IncomingMessage, Interaction, MessageListener, PluginHost, SlashCommand,
};
use glacier_testing::{
    FAKE_EXTENSION, FakeBinaryLoader, Manifest, MockCommandDispatcher, MockGateway,
    MockInteractionDispatcher, MockSubsystem, PluginDir, TypeSpec, assert_registered,
    init_test_logging,
};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    dir: PluginDir,
    manager: HotReloadManager,
    gateway: Arc<MockGateway>,
    commands: Arc<MockCommandDispatcher>,
    interactions: Arc<MockInteractionDispatcher>,
    orchestrator: HostOrchestrator,
}

fn fixture(guilds: &[u64]) -> Fixture {
    init_test_logging();
    let dir = PluginDir::new().unwrap();
    let manager = HotReloadManager::new(
        HotReloadConfig::new()
            .with_plugin_dir(dir.path())
            .with_watch_config(WatchConfig::new(PluginPattern::new(FAKE_EXTENSION))),
        Arc::new(FakeBinaryLoader::new()),
        HostServices::new(),
        ModuleRegistrar::new().with_subsystem(MockSubsystem::commands()),
    );

    let gateway = MockGateway::with_guilds(guilds);
    let commands = MockCommandDispatcher::probing("Clock");
    let interactions = MockInteractionDispatcher::new();
    let orchestrator = HostOrchestrator::new(
        gateway.clone(),
        commands.clone(),
        interactions.clone(),
        HostServices::new(),
        "`",
    );

    Fixture {
        dir,
        manager,
        gateway,
        commands,
        interactions,
        orchestrator,
    }
}

fn clock() -> Manifest {
    Manifest::new("clock")
        .with_type(TypeSpec::shared_service("Clock"))
        .with_type(TypeSpec::command_module("Time"))
}

async fn next_update(manager: &HotReloadManager) -> PluginSetUpdated {
    manager.reload_once().await.unwrap();
    manager.latest().unwrap()
}

#[tokio::test]
async fn test_handlers_subscribed_on_first_update_only() {
    let f = fixture(&[1]);
    f.dir.write("clock", &clock()).unwrap();
    assert!(!f.orchestrator.is_subscribed());

    let first = f.orchestrator.apply(next_update(&f.manager).await).await;
    let second = f.orchestrator.apply(next_update(&f.manager).await).await;

    assert!(matches!(first, ApplyOutcome::Applied { subscribed: true, generation: 1, .. }));
    assert!(matches!(second, ApplyOutcome::Applied { subscribed: false, generation: 2, .. }));
    assert_eq!(f.gateway.message_listener_count(), 1);
    assert_eq!(f.gateway.interaction_listener_count(), 1);
    assert_eq!(f.orchestrator.applied_generation(), 2);

    // Every update republishes the command definitions.
    assert_eq!(f.interactions.sync_count(1), 2);
}

#[tokio::test]
async fn test_guild_sync_failure_is_isolated() {
    let f = fixture(&[3, 1, 2]);
    f.interactions.fail_guild(2);
    f.dir.write("clock", &clock()).unwrap();

    let outcome = f.orchestrator.apply(next_update(&f.manager).await).await;
    let ApplyOutcome::Applied { guilds, .. } = outcome else {
        panic!("update should apply");
    };

    assert_eq!(guilds.synced, vec![1, 3]);
    assert_eq!(
        guilds.failed,
        vec![GuildSyncError {
            guild: 2,
            reason: "missing access".to_string(),
        }]
    );
    assert!(!guilds.is_clean());
    assert!(f.orchestrator.is_subscribed());

    // A guild joined later is picked up by the next update.
    f.gateway.join_guild(4);
    let report = f.orchestrator.sync_guilds().await;
    assert_eq!(report.synced, vec![1, 3, 4]);
}

#[tokio::test]
async fn test_stale_update_is_ignored() {
    let f = fixture(&[]);
    f.dir.write("clock", &clock()).unwrap();

    let older = next_update(&f.manager).await;
    let newer = next_update(&f.manager).await;

    f.orchestrator.apply(newer.clone()).await;
    let outcome = f.orchestrator.apply(older).await;

    assert_eq!(
        outcome,
        ApplyOutcome::Stale {
            generation: 1,
            current: 2
        }
    );
    assert!(Arc::ptr_eq(&f.orchestrator.current_container(), &newer.container));
}

#[tokio::test]
async fn test_handlers_use_latest_container() {
    let f = fixture(&[1]);
    let handler = f.orchestrator.message_handler().clone();

    // Before any plugin set the handler runs against host services only.
    handler
        .on_message(IncomingMessage::from_user(10, "frost", "`time"))
        .await;
    assert!(!f.commands.calls()[0].resolved);

    f.dir.write("clock", &clock()).unwrap();
    f.orchestrator.apply(next_update(&f.manager).await).await;
    f.gateway
        .deliver_message(IncomingMessage::from_user(10, "frost", "`time").in_guild(1))
        .await;
    assert!(f.commands.calls()[1].resolved);

    f.dir.remove("clock").unwrap();
    f.orchestrator.apply(next_update(&f.manager).await).await;
    f.gateway
        .deliver_message(IncomingMessage::from_user(10, "frost", "`time"))
        .await;

    let calls = f.commands.calls();
    assert_eq!(calls.len(), 3);
    assert!(!calls[2].resolved);
    assert!(calls.iter().all(|c| c.command == "time"));
}

#[tokio::test]
async fn test_only_slash_commands_reach_dispatcher() {
    let f = fixture(&[1]);
    f.orchestrator.apply(next_update(&f.manager).await).await;

    f.gateway
        .deliver_interaction(Interaction::Autocomplete {
            command: "weather".to_string(),
            focused: "city".to_string(),
        })
        .await;
    f.gateway
        .deliver_interaction(Interaction::SlashCommand(SlashCommand {
            name: "weather".to_string(),
            guild_id: Some(1),
            user: "frost".to_string(),
            options: Vec::new(),
        }))
        .await;

    assert_eq!(f.interactions.executed(), vec!["weather".to_string()]);
    assert_eq!(f.orchestrator.interaction_handler().dispatched(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_host_end_to_end() {
    init_test_logging();
    let dir = PluginDir::new().unwrap();
    dir.write("clock", &clock()).unwrap();

    let mut config = PluginHostConfig::new()
        .with_plugin_dir(dir.path())
        .with_extension(FAKE_EXTENSION)
        .with_debounce(Duration::from_millis(50))
        .with_duplicate_policy(DuplicatePolicy::FirstWins);
    config.command_prefix = "!".to_string();

    let gateway = MockGateway::with_guilds(&[7]);
    let commands = MockCommandDispatcher::probing("Clock");
    let interactions = MockInteractionDispatcher::new();
    let subsystem = MockSubsystem::commands();

    let host = PluginHost::with_backend(
        &config,
        HostParts {
            gateway: gateway.clone(),
            commands: commands.clone(),
            interactions: interactions.clone(),
            subsystems: vec![subsystem.clone() as Arc<dyn ModuleSubsystem>],
            services: HostServices::new().with(Arc::new(42u32)),
        },
        Arc::new(FakeBinaryLoader::new()),
    );

    host.start().await.unwrap();
    assert!(matches!(host.start().await, Err(HostError::UpdatesTaken)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while host.orchestrator().applied_generation() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_registered!(subsystem, ["Time"]);
    assert_eq!(gateway.message_listener_count(), 1);
    assert_eq!(interactions.sync_count(7), 1);

    gateway
        .deliver_message(IncomingMessage::from_user(1, "frost", "!time"))
        .await;
    assert_eq!(commands.calls().len(), 1);
    assert!(commands.calls()[0].resolved);

    let container = host.orchestrator().current_container();
    assert_eq!(*container.resolve_host::<u32>().unwrap(), 42);
    let seen = container
        .resolve::<Arc<dyn Gateway>>(&ServiceKey::of::<dyn Gateway>())
        .unwrap();
    assert_eq!(seen.guilds().await, vec![7]);

    let outcomes = host.stop().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(subsystem.live_count(), 0);
}
