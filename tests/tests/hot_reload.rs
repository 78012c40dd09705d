//! End-to-end tests of the reload pipeline, driven through fake binaries

use glacier_kernel::{
    DuplicatePolicy, ServiceError, ServiceKey, ServiceResolverExt, SubsystemKind,
};
use glacier_plugins::hot_reload::{
    HostServices, HotReloadConfig, HotReloadManager, ModuleRegistrar, PluginPattern,
    ReloadError, ReloadEvent, WatchConfig,
};
use glacier_testing::{
    FAKE_EXTENSION, FakeBinaryLoader, FakeService, Manifest, MockSubsystem, PluginDir, TypeSpec,
    assert_registered, init_test_logging,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

struct Harness {
    dir: PluginDir,
    loader: FakeBinaryLoader,
    commands: Arc<MockSubsystem>,
    interactions: Arc<MockSubsystem>,
    manager: HotReloadManager,
}

fn config(dir: &PluginDir) -> HotReloadConfig {
    HotReloadConfig::new()
        .with_plugin_dir(dir.path())
        .with_watch_config(
            WatchConfig::new(PluginPattern::new(FAKE_EXTENSION))
                .with_debounce(Duration::from_millis(50)),
        )
}

fn harness_with(
    loader: FakeBinaryLoader,
    commands: Arc<MockSubsystem>,
    host: HostServices,
    policy: DuplicatePolicy,
) -> Harness {
    init_test_logging();
    let dir = PluginDir::new().unwrap();
    let interactions = MockSubsystem::interactions();
    let registrar = ModuleRegistrar::new()
        .with_subsystem(commands.clone())
        .with_subsystem(interactions.clone());
    let manager = HotReloadManager::new(
        config(&dir).with_duplicate_policy(policy),
        Arc::new(loader.clone()),
        host,
        registrar,
    );
    Harness {
        dir,
        loader,
        commands,
        interactions,
        manager,
    }
}

fn harness() -> Harness {
    harness_with(
        FakeBinaryLoader::new(),
        MockSubsystem::commands(),
        HostServices::new(),
        DuplicatePolicy::FirstWins,
    )
}

fn utility() -> Manifest {
    Manifest::new("utility")
        .with_type(TypeSpec::command_module("Ping"))
        .with_type(TypeSpec::interaction_module("Roll"))
        .with_type(TypeSpec::shared_service("Clock"))
}

fn sorted_services(services: &[ServiceKey]) -> Vec<ServiceKey> {
    let mut services = services.to_vec();
    services.sort();
    services
}

#[tokio::test]
async fn test_rescan_without_changes_is_idempotent() {
    let h = harness();
    h.dir.write("utility", &utility()).unwrap();

    let first = h.manager.reload_once().await.unwrap();
    assert_eq!(first.loaded.len(), 1);
    assert_eq!(first.modules_registered, 2);

    let second = h.manager.reload_once().await.unwrap();
    assert!(second.loaded.is_empty());
    assert_eq!(second.unchanged.len(), 1);
    assert!(second.failures.is_empty());
    assert!(second.removal_failures.is_empty());

    // Same binary, same module set, no extra load.
    assert_eq!(h.loader.loads(), 1);
    assert_registered!(h.commands, ["Ping"]);
    assert_registered!(h.interactions, ["Roll"]);

    let latest = h.manager.latest().unwrap();
    assert_eq!(latest.generation, 2);
    assert_eq!(latest.services, vec![ServiceKey::new("Clock")]);
    assert_eq!(latest.registry.module_names(SubsystemKind::Command), vec!["Ping"]);
    assert_eq!(latest.binaries[0].epoch, 1);
}

#[tokio::test]
async fn test_deleted_binary_retires_its_modules() {
    let h = harness();
    h.dir.write("utility", &utility()).unwrap();
    h.dir
        .write(
            "weather",
            &Manifest::new("weather")
                .with_type(TypeSpec::command_module("Forecast"))
                .with_type(TypeSpec::shared_service("Forecaster")),
        )
        .unwrap();

    h.manager.reload_once().await.unwrap();
    assert_registered!(h.commands, ["Forecast", "Ping"]);
    let before = h.manager.latest().unwrap();
    assert_eq!(
        sorted_services(&before.services),
        vec![ServiceKey::new("Clock"), ServiceKey::new("Forecaster")]
    );

    h.dir.remove("weather").unwrap();
    let report = h.manager.reload_once().await.unwrap();

    assert_eq!(report.removed, vec!["weather".to_string()]);
    assert_registered!(h.commands, ["Ping"]);
    assert_eq!(h.loader.releases(), 1);
    assert!(h.commands.removed_after_unload().is_empty());

    let latest = h.manager.latest().unwrap();
    assert_eq!(latest.registry.assemblies(SubsystemKind::Command), vec!["utility"]);
    assert!(latest.binaries.iter().all(|b| b.assembly != "weather"));
    assert_eq!(latest.services, vec![ServiceKey::new("Clock")]);
    assert!(matches!(
        latest.container.resolve::<FakeService>(&ServiceKey::new("Forecaster")),
        Err(ServiceError::NotRegistered(_))
    ));
}

#[tokio::test]
async fn test_upgraded_binary_replaces_module_set() {
    let h = harness();
    h.dir
        .write(
            "utility",
            &Manifest::new("utility")
                .with_type(TypeSpec::command_module("Ping"))
                .with_type(TypeSpec::shared_service("Clock")),
        )
        .unwrap();
    h.manager.reload_once().await.unwrap();
    assert_eq!(h.manager.latest().unwrap().services, vec![ServiceKey::new("Clock")]);

    h.dir
        .write(
            "utility",
            &Manifest::new("utility")
                .with_version("2.0.0")
                .with_type(TypeSpec::command_module("Ping"))
                .with_type(TypeSpec::command_module("Pong"))
                .with_type(TypeSpec::shared_service("Clock"))
                .with_type(TypeSpec::shared_service("Calendar")),
        )
        .unwrap();
    let report = h.manager.reload_once().await.unwrap();

    assert_eq!(report.loaded.len(), 1);
    assert_registered!(h.commands, ["Ping", "Pong"]);
    assert!(h.commands.handles_of("utility").iter().all(|handle| handle.epoch == 2));

    // Old context retired once its modules were gone.
    assert_eq!(h.loader.loads(), 2);
    assert_eq!(h.loader.releases(), 1);
    assert!(h.commands.all_live());
    assert!(h.commands.removed_after_unload().is_empty());

    let latest = h.manager.latest().unwrap();
    assert_eq!(latest.binaries[0].version, "2.0.0");
    assert_eq!(latest.binaries[0].epoch, 2);
    assert_eq!(
        sorted_services(&latest.services),
        vec![ServiceKey::new("Calendar"), ServiceKey::new("Clock")]
    );
    let clock = latest
        .container
        .resolve::<FakeService>(&ServiceKey::new("Clock"))
        .unwrap();
    assert_eq!(clock.version, "2.0.0");
}

#[tokio::test]
async fn test_assembly_moving_to_new_file_unregisters_before_unload() {
    let h = harness();
    h.dir
        .write(
            "b_util",
            &Manifest::new("alpha").with_type(TypeSpec::command_module("Ping")),
        )
        .unwrap();
    h.manager.reload_once().await.unwrap();
    assert_registered!(h.commands, ["Ping"]);

    // a_util sorts first and claims the assembly name from b_util.
    h.dir
        .write(
            "a_util",
            &Manifest::new("alpha").with_type(TypeSpec::command_module("Pong")),
        )
        .unwrap();
    let report = h.manager.reload_once().await.unwrap();

    assert_eq!(report.loaded.len(), 1);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].path.ends_with("b_util.plug"));
    assert_registered!(h.commands, ["Pong"]);
    assert_eq!(h.commands.removed_after_unload(), Vec::<String>::new());
    assert!(h.commands.all_live());
    assert_eq!(h.loader.live_images(), 1);

    let latest = h.manager.latest().unwrap();
    assert_eq!(latest.binaries.len(), 1);
    assert!(latest.binaries[0].path.ends_with("a_util.plug"));
}

#[tokio::test]
async fn test_duplicate_contract_first_binary_wins() {
    let h = harness();
    h.dir
        .write(
            "a_clock",
            &Manifest::new("alpha").with_type(TypeSpec::shared_service("SystemClock").with_contract("IClock")),
        )
        .unwrap();
    h.dir
        .write(
            "b_clock",
            &Manifest::new("beta").with_type(TypeSpec::shared_service("NtpClock").with_contract("IClock")),
        )
        .unwrap();

    h.manager.reload_once().await.unwrap();
    let latest = h.manager.latest().unwrap();
    assert_eq!(latest.services, vec![ServiceKey::new("IClock")]);

    let clock = latest
        .container
        .resolve::<FakeService>(&ServiceKey::new("IClock"))
        .unwrap();
    assert_eq!(clock.assembly, "alpha");
    assert_eq!(clock.type_name, "SystemClock");
}

#[tokio::test]
async fn test_duplicate_contract_rejected_keeps_previous_set() {
    let h = harness_with(
        FakeBinaryLoader::new(),
        MockSubsystem::commands(),
        HostServices::new(),
        DuplicatePolicy::Reject,
    );
    let mut events = h.manager.subscribe();

    h.dir
        .write(
            "a_clock",
            &Manifest::new("alpha")
                .with_type(TypeSpec::shared_service("SystemClock").with_contract("IClock"))
                .with_type(TypeSpec::command_module("Time")),
        )
        .unwrap();
    h.manager.reload_once().await.unwrap();

    h.dir
        .write(
            "b_clock",
            &Manifest::new("beta")
                .with_type(TypeSpec::shared_service("NtpClock").with_contract("IClock"))
                .with_type(TypeSpec::command_module("Sync")),
        )
        .unwrap();
    let err = h.manager.reload_once().await.unwrap_err();
    assert!(matches!(err, ReloadError::Scan(_)));

    // Nothing from the aborted rescan leaked into the live state.
    assert_eq!(h.manager.generation(), 1);
    assert_registered!(h.commands, ["Time"]);
    assert_eq!(h.loader.loads(), 2);
    assert_eq!(h.loader.releases(), 1);

    let mut aborted = false;
    while let Ok(event) = events.try_recv() {
        if let ReloadEvent::RescanAborted { generation, .. } = event {
            assert_eq!(generation, 2);
            aborted = true;
        }
    }
    assert!(aborted);

    h.dir.remove("b_clock").unwrap();
    let report = h.manager.reload_once().await.unwrap();
    assert_eq!(report.generation, 2);
    assert_eq!(report.unchanged.len(), 1);
}

#[tokio::test]
async fn test_rejected_rescan_restores_displaced_binary() {
    let h = harness_with(
        FakeBinaryLoader::new(),
        MockSubsystem::commands(),
        HostServices::new(),
        DuplicatePolicy::Reject,
    );
    h.dir
        .write(
            "b_util",
            &Manifest::new("alpha").with_type(TypeSpec::command_module("Ping")),
        )
        .unwrap();
    h.manager.reload_once().await.unwrap();

    // a_util takes the assembly name from b_util, then the contract clash aborts the rescan.
    h.dir
        .write(
            "a_util",
            &Manifest::new("alpha")
                .with_type(TypeSpec::shared_service("SystemClock").with_contract("IClock")),
        )
        .unwrap();
    h.dir
        .write(
            "c_clock",
            &Manifest::new("gamma")
                .with_type(TypeSpec::shared_service("NtpClock").with_contract("IClock")),
        )
        .unwrap();
    let err = h.manager.reload_once().await.unwrap_err();
    assert!(matches!(err, ReloadError::Scan(_)));

    assert_eq!(h.manager.generation(), 1);
    assert_registered!(h.commands, ["Ping"]);
    assert!(h.commands.all_live());
    assert_eq!(h.loader.live_images(), 1);
    assert!(h.commands.activate("Ping").is_ok());

    h.dir.remove("a_util").unwrap();
    h.dir.remove("c_clock").unwrap();
    let report = h.manager.reload_once().await.unwrap();
    assert!(report.loaded.is_empty());
    assert_eq!(report.unchanged.len(), 1);
    assert_registered!(h.commands, ["Ping"]);
    assert!(h.commands.all_live());
}

#[tokio::test]
async fn test_broken_binary_does_not_block_others() {
    let h = harness();
    let mut events = h.manager.subscribe();
    h.dir.write("a_utility", &utility()).unwrap();
    let broken = h.dir.write_raw("b_broken", b"\x7fELF\x02\x01").unwrap();
    h.dir
        .write(
            "c_weather",
            &Manifest::new("weather").with_type(TypeSpec::command_module("Forecast")),
        )
        .unwrap();

    let report = h.manager.reload_once().await.unwrap();
    assert_eq!(report.loaded.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].path.ends_with("b_broken.plug"));
    assert_registered!(h.commands, ["Forecast", "Ping"]);

    let failed: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            ReloadEvent::BinaryFailed { path, .. } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].file_name(), broken.file_name());
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_version() {
    let h = harness();
    h.dir.write("utility", &utility()).unwrap();
    h.manager.reload_once().await.unwrap();

    h.dir
        .write("utility", &utility().with_version("2.0.0").failing("truncated image"))
        .unwrap();
    let report = h.manager.reload_once().await.unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.contains("truncated image"));
    assert_registered!(h.commands, ["Ping"]);

    let latest = h.manager.latest().unwrap();
    assert_eq!(latest.binaries.len(), 1);
    assert_eq!(latest.binaries[0].version, "1.0.0");
    assert_eq!(latest.services, vec![ServiceKey::new("Clock")]);
    assert_eq!(h.loader.releases(), 0);
}

#[tokio::test]
async fn test_cross_plugin_dependencies_resolve() {
    let host = HostServices::new().with_keyed("host.region", Arc::new("eu-north".to_string()));
    let h = harness_with(
        FakeBinaryLoader::new(),
        MockSubsystem::commands(),
        host,
        DuplicatePolicy::FirstWins,
    );
    h.dir
        .write(
            "notes",
            &Manifest::new("notes")
                .with_type(TypeSpec::custom_service("NoteIndex").depends_on("IStore"))
                .with_type(
                    TypeSpec::command_module("Notes")
                        .depends_on("NoteIndex")
                        .depends_on("host.region"),
                ),
        )
        .unwrap();
    h.dir
        .write(
            "storage",
            &Manifest::new("storage")
                .with_type(TypeSpec::shared_service("FileStore").with_contract("IStore")),
        )
        .unwrap();

    h.manager.reload_once().await.unwrap();
    let latest = h.manager.latest().unwrap();

    let index = latest
        .container
        .resolve::<FakeService>(&ServiceKey::new("NoteIndex"))
        .unwrap();
    let store = index.dependency(0).unwrap();
    assert_eq!(store.assembly, "storage");

    // Singletons: the module sees the very same index instance.
    let module = h.commands.activate("Notes").unwrap();
    let module = module.downcast_ref::<FakeService>().unwrap();
    let seen = module.dependencies[0].clone().downcast::<FakeService>().unwrap();
    assert!(Arc::ptr_eq(&seen, &index));
    let region = module.dependencies[1].downcast_ref::<String>().unwrap();
    assert_eq!(region, "eu-north");
}

#[tokio::test]
async fn test_running_module_keeps_its_binary_mapped() {
    let h = harness();
    h.dir.write("utility", &utility()).unwrap();
    h.manager.reload_once().await.unwrap();

    // A command still executing while its binary is deleted.
    let running = h.commands.activate("Ping").unwrap();
    assert!(running.is_guarded());

    h.dir.remove("utility").unwrap();
    let report = h.manager.reload_once().await.unwrap();
    assert_eq!(report.removed, vec!["utility".to_string()]);
    assert_eq!(h.commands.live_count(), 0);

    assert_eq!(h.loader.live_images(), 1);
    assert_eq!(running.downcast_ref::<FakeService>().unwrap().type_name, "Ping");

    drop(running);
    assert_eq!(h.loader.live_images(), 0);
}

#[tokio::test]
async fn test_circular_plugin_dependencies_detected() {
    let h = harness();
    h.dir
        .write(
            "cycle",
            &Manifest::new("cycle")
                .with_type(TypeSpec::custom_service("Left").depends_on("Right"))
                .with_type(TypeSpec::custom_service("Right").depends_on("Left")),
        )
        .unwrap();

    h.manager.reload_once().await.unwrap();
    let latest = h.manager.latest().unwrap();

    let err = latest
        .container
        .resolve::<FakeService>(&ServiceKey::new("Left"))
        .unwrap_err();
    match err {
        ServiceError::CircularDependency(chain) => {
            assert_eq!(chain.first(), Some(&ServiceKey::new("Left")));
            assert_eq!(chain.last(), Some(&ServiceKey::new("Left")));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_refused_removal_does_not_stop_reload() {
    let h = harness();
    let mut events = h.manager.subscribe();
    h.dir
        .write(
            "utility",
            &Manifest::new("utility")
                .with_type(TypeSpec::command_module("Ping"))
                .with_type(TypeSpec::command_module("Pong")),
        )
        .unwrap();
    h.dir
        .write(
            "weather",
            &Manifest::new("weather").with_type(TypeSpec::command_module("Forecast")),
        )
        .unwrap();
    h.manager.reload_once().await.unwrap();

    h.commands.refuse_removal_of("Ping");
    h.dir.remove("utility").unwrap();
    let report = h.manager.reload_once().await.unwrap();

    assert_eq!(report.removal_failures.len(), 1);
    assert_eq!(report.removal_failures[0].handle.name, "Ping");
    assert!(report.removal_failures[0].error.is_none());
    assert_eq!(report.removed, vec!["utility".to_string()]);
    assert_registered!(h.commands, ["Forecast"]);

    let latest = h.manager.latest().unwrap();
    assert_eq!(latest.registry.assemblies(SubsystemKind::Command), vec!["weather"]);

    let refused: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            ReloadEvent::ModuleRemovalFailed { module, error, .. } => Some((module, error)),
            _ => None,
        })
        .collect();
    assert_eq!(refused, vec![("Ping".to_string(), None)]);
}

#[tokio::test]
async fn test_rejected_registration_is_reported() {
    let commands = MockSubsystem::commands();
    commands.fail_additions_for("weather");
    let h = harness_with(
        FakeBinaryLoader::new(),
        commands,
        HostServices::new(),
        DuplicatePolicy::FirstWins,
    );
    h.dir.write("utility", &utility()).unwrap();
    h.dir
        .write(
            "weather",
            &Manifest::new("weather").with_type(TypeSpec::command_module("Forecast")),
        )
        .unwrap();

    let report = h.manager.reload_once().await.unwrap();
    assert_eq!(report.registration_errors.len(), 1);
    assert_registered!(h.commands, ["Ping"]);
    assert_eq!(report.generation, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reloads_never_overlap() {
    let commands = Arc::new(MockSubsystem::new(SubsystemKind::Command).with_delay(Duration::from_millis(20)));
    let h = harness_with(
        FakeBinaryLoader::new().with_delay(Duration::from_millis(50)),
        commands,
        HostServices::new(),
        DuplicatePolicy::FirstWins,
    );
    h.dir.write("utility", &utility()).unwrap();
    h.dir
        .write(
            "weather",
            &Manifest::new("weather").with_type(TypeSpec::command_module("Forecast")),
        )
        .unwrap();

    let manager = &h.manager;
    let (a, b, c) = tokio::join!(
        manager.reload_once(),
        manager.reload_once(),
        manager.reload_once()
    );

    let mut generations = vec![
        a.unwrap().generation,
        b.unwrap().generation,
        c.unwrap().generation,
    ];
    generations.sort_unstable();
    assert_eq!(generations, vec![1, 2, 3]);

    assert_eq!(h.loader.max_concurrent_loads(), 1);
    assert_eq!(h.commands.max_concurrent_calls(), 1);
    assert_eq!(h.loader.loads(), 2);
    assert_registered!(h.commands, ["Forecast", "Ping"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_triggers_during_rescan_collapse_into_one() {
    let h = harness_with(
        FakeBinaryLoader::new().with_delay(Duration::from_millis(300)),
        MockSubsystem::commands(),
        HostServices::new(),
        DuplicatePolicy::FirstWins,
    );
    h.dir.write("utility", &utility()).unwrap();
    let mut events = h.manager.subscribe();

    h.manager.start().await.unwrap();
    assert!(matches!(h.manager.start().await, Err(ReloadError::AlreadyStarted)));

    // Wait until the initial rescan is in flight, then pile up requests.
    let started = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(started, ReloadEvent::RescanStarted { generation: 1 });
    for _ in 0..5 {
        h.manager.trigger_rescan();
    }

    let mut completed = Vec::new();
    while completed.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let ReloadEvent::RescanCompleted { generation, .. } = event {
            completed.push(generation);
        }
    }
    assert_eq!(completed, vec![1, 2]);

    tokio::time::sleep(Duration::from_millis(400)).await;
    loop {
        match events.try_recv() {
            Ok(ReloadEvent::RescanStarted { generation }) => {
                panic!("unexpected rescan {generation}")
            }
            Ok(_) => continue,
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("event stream broken: {e}"),
        }
    }
    assert_eq!(h.manager.generation(), 2);
    assert_eq!(h.loader.max_concurrent_loads(), 1);

    h.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_binary_picked_up_by_watcher() {
    let h = harness();
    let mut updates = h.manager.take_update_receiver().unwrap();
    h.manager.start().await.unwrap();

    let initial = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(initial.binaries.is_empty());

    h.dir.write("utility", &utility()).unwrap();

    let update = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let update = updates.recv().await.unwrap();
            if !update.binaries.is_empty() {
                return update;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(update.binaries[0].assembly, "utility");
    assert_eq!(update.registry.modules(SubsystemKind::Command, "utility").unwrap(), ["Ping"]);
    assert_registered!(h.commands, ["Ping"]);

    h.manager.stop().await;
}

#[tokio::test]
async fn test_stop_unregisters_and_unloads_everything() {
    let h = harness();
    h.dir.write("utility", &utility()).unwrap();
    h.dir
        .write(
            "weather",
            &Manifest::new("weather").with_type(TypeSpec::command_module("Forecast")),
        )
        .unwrap();
    h.manager.reload_once().await.unwrap();
    assert_eq!(h.loader.live_images(), 2);

    let outcomes = h.manager.stop().await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.removed));
    assert_eq!(h.commands.live_count(), 0);
    assert_eq!(h.interactions.live_count(), 0);
    assert_eq!(h.loader.live_images(), 0);

    // A second stop is a no-op.
    assert!(h.manager.stop().await.is_empty());
    assert!(matches!(h.manager.reload_once().await, Err(ReloadError::Shutdown)));
}
