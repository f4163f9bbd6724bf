//! Registry lifecycle: create, lookup, delete, reload, bulk load, shutdown.

mod common;

use std::time::{Duration, Instant};

use berth::program::ProgramError;
use berth::registry::{Registry, RegistryError, RegistrySettings};
use berth::store::{ConfigStore, PersistedProgram};

use common::{
    echo_definition, shell_definition, stubborn_definition, test_registry, wait_for_output,
    wait_until,
};

#[tokio::test]
async fn create_then_get_returns_same_server() {
    let fixture = test_registry();
    let created = fixture
        .registry
        .create(Some("alpha".to_string()), echo_definition("hello"))
        .await
        .unwrap();

    let fetched = fixture.registry.get("alpha").unwrap();
    assert!(std::sync::Arc::ptr_eq(&created, &fetched));
    assert_eq!(fetched.id(), "alpha");
    assert_eq!(fetched.definition().await.run.command, "sh");
}

#[tokio::test]
async fn create_generates_id_when_unspecified() {
    let fixture = test_registry();
    let program = fixture
        .registry
        .create(None, echo_definition("hello"))
        .await
        .unwrap();

    assert!(!program.id().is_empty());
    assert_eq!(program.id(), program.id().to_lowercase());
    assert!(fixture.registry.get(program.id()).is_some());
}

#[tokio::test]
async fn create_persists_definition() {
    let fixture = test_registry();
    fixture
        .registry
        .create(Some("alpha".to_string()), echo_definition("hello"))
        .await
        .unwrap();

    let persisted = fixture.store.load("alpha").await.unwrap();
    assert_eq!(persisted.definition.run.command, "sh");
}

#[tokio::test]
async fn create_rejects_duplicate_id() {
    let fixture = test_registry();
    fixture
        .registry
        .create(Some("alpha".to_string()), echo_definition("one"))
        .await
        .unwrap();

    let result = fixture
        .registry
        .create(Some("alpha".to_string()), echo_definition("two"))
        .await;
    assert!(matches!(result, Err(RegistryError::AlreadyExists(_))));
}

#[tokio::test]
async fn create_rejects_unsatisfied_requirements() {
    let fixture = test_registry();
    let mut definition = echo_definition("hello");
    definition.requirements.binaries = vec!["definitely-not-a-real-binary-name".to_string()];

    let result = fixture.registry.create(None, definition).await;
    assert!(matches!(
        result,
        Err(RegistryError::Program(ProgramError::InvalidInput(_)))
    ));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let fixture = test_registry();
    fixture
        .registry
        .create(Some("alpha".to_string()), echo_definition("hello"))
        .await
        .unwrap();

    fixture.registry.delete("alpha").await.unwrap();
    assert!(fixture.registry.get("alpha").is_none());
    assert!(fixture.store.load("alpha").await.is_err());

    // Second delete of the same id, and delete of a never-created id.
    fixture.registry.delete("alpha").await.unwrap();
    fixture.registry.delete("ghost").await.unwrap();
}

#[tokio::test]
async fn delete_stops_running_server() {
    let fixture = test_registry();
    let program = fixture
        .registry
        .create(Some("alpha".to_string()), echo_definition("hello"))
        .await
        .unwrap();

    program.start().await.unwrap();
    assert!(wait_until(|| program.is_running()).await);

    fixture.registry.delete("alpha").await.unwrap();
    assert!(!program.is_running());
    assert!(!program.data_dir().exists());
}

#[tokio::test]
async fn draining_registry_refuses_new_servers() {
    let fixture = test_registry();
    fixture
        .registry
        .create(Some("alpha".to_string()), echo_definition("hello"))
        .await
        .unwrap();

    fixture.registry.shutdown_service();

    let result = fixture.registry.create(None, echo_definition("late")).await;
    assert!(matches!(result, Err(RegistryError::ShuttingDown)));
    // Existing servers stay reachable while draining.
    assert!(fixture.registry.get("alpha").is_some());
}

#[tokio::test]
async fn reload_keeps_program_identity() {
    let fixture = test_registry();
    let before = fixture
        .registry
        .create(Some("alpha".to_string()), echo_definition("hello"))
        .await
        .unwrap();

    let mut persisted = fixture.store.load("alpha").await.unwrap();
    persisted.definition.display = "renamed".to_string();
    fixture.store.save("alpha", &persisted).await.unwrap();

    fixture.registry.reload("alpha").await.unwrap();

    let after = fixture.registry.get("alpha").unwrap();
    assert!(std::sync::Arc::ptr_eq(&before, &after));
    assert_eq!(after.definition().await.display, "renamed");
}

#[tokio::test]
async fn reload_unknown_server_is_not_found() {
    let fixture = test_registry();
    assert!(matches!(
        fixture.registry.reload("ghost").await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn load_all_restores_persisted_servers() {
    let fixture = test_registry();
    for id in ["alpha", "beta"] {
        let persisted = PersistedProgram {
            definition: echo_definition(id),
            tasks: Default::default(),
        };
        fixture.store.save(id, &persisted).await.unwrap();
    }

    let registry = Registry::new(
        fixture.store.clone(),
        RegistrySettings::new(fixture.tmp.path().join("servers")),
    );
    let loaded = registry.load_all().await.unwrap();
    assert_eq!(loaded, 2);
    assert!(registry.get("alpha").is_some());
    assert!(registry.get("beta").is_some());
    // Nothing autostarts.
    assert!(!registry.get("alpha").unwrap().is_running());
    registry.stop_all(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn load_all_surfaces_corrupt_state() {
    let fixture = test_registry();
    let dir = fixture.tmp.path().join("definitions");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("broken.json"), "{ not json").unwrap();

    assert!(fixture.registry.load_all().await.is_err());
}

#[tokio::test]
async fn stop_all_is_bounded_by_grace_across_the_fleet() {
    let fixture = test_registry();
    let mut programs = Vec::new();
    for i in 0..3 {
        let program = fixture
            .registry
            .create(Some(format!("stubborn-{i}")), stubborn_definition())
            .await
            .unwrap();
        program.start().await.unwrap();
        programs.push(program);
    }
    for program in &programs {
        assert!(wait_for_output(program, "armed").await);
    }

    let grace = Duration::from_secs(2);
    let started = Instant::now();
    fixture.registry.stop_all(grace).await;
    let elapsed = started.elapsed();

    for program in &programs {
        assert!(!program.is_running());
    }
    // Parallel grace: three stragglers cost one grace period, not three.
    assert!(
        elapsed < grace * 3,
        "shutdown took {elapsed:?}, expected well under {:?}",
        grace * 3
    );
}

#[tokio::test]
async fn stop_all_tolerates_stopped_servers() {
    let fixture = test_registry();
    fixture
        .registry
        .create(Some("idle".to_string()), shell_definition("true"))
        .await
        .unwrap();

    // Never started; shutdown must not hang or error.
    fixture.registry.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn save_round_trips_in_memory_edits() {
    let fixture = test_registry();
    let program = fixture
        .registry
        .create(Some("alpha".to_string()), echo_definition("hello"))
        .await
        .unwrap();

    let mut definition = program.definition().await;
    definition.display = "edited".to_string();
    program.edit_definition(definition).await.unwrap();

    fixture.registry.save("alpha").await.unwrap();
    let persisted = fixture.store.load("alpha").await.unwrap();
    assert_eq!(persisted.definition.display, "edited");
}
