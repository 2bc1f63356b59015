//! Backup and restore through the scripted dump tool.

use bistro_core::{
    BackupFormat, BackupOutcome, BackupPhase, Config, CoreError, HandleState, RestoreRequest,
};
use bistro_store::Restaurant;
use bistro_testkit::prelude::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Name to (location, rating, review count), from the caches.
fn state(t: &TestContext) -> BTreeMap<String, (String, f64, usize)> {
    t.restaurants()
        .list()
        .into_iter()
        .map(|r| {
            let reviews = t.reviews().for_restaurant(r.name()).len();
            (
                r.name().to_string(),
                (r.location().to_string(), r.rating(), reviews),
            )
        })
        .collect()
}

fn phase_of(err: &CoreError) -> Option<BackupPhase> {
    err.phase()
}

#[test]
fn custom_backup_round_trip() {
    let t = TestContext::new();
    t.seed(3, 2);
    let before = state(&t);

    let report = t
        .backup()
        .create_backup("nightly run", Some(BackupFormat::Custom))
        .unwrap();
    assert!(report.file_name.starts_with("nightly_run_"));
    assert!(report.file_name.ends_with(".backup"));
    assert_eq!(report.outcome, BackupOutcome::Success);
    assert_eq!(fs::metadata(&report.path).unwrap().len(), report.size);

    t.restaurants().delete("Restaurant 1").unwrap();
    t.add_restaurant("Intruder", "Back Door");
    t.add_review("Intruder", 1, "");
    let generation = t.handle().generation();

    let restored = t
        .backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap();
    assert_eq!(restored.outcome, BackupOutcome::Success);
    assert_eq!(restored.loaded.restaurants, 3);
    assert_eq!(restored.loaded.reviews, 6);
    assert!(restored.expected.is_none());

    assert_eq!(state(&t), before);
    assert_eq!(t.handle().state(), HandleState::Open);
    assert!(t.handle().generation() > generation);
    assert_eq!(t.backup().phase(), BackupPhase::Idle);

    // Sequences were repaired, so new rows do not collide with restored ids.
    let tables = t.backend.snapshot();
    let max_id = tables.restaurants.keys().next_back().unwrap().get();
    assert_eq!(tables.restaurant_seq, max_id);
    t.add_restaurant("After Restore", "Street");
    assert_eq!(t.restaurants().len(), 4);
}

#[test]
fn plain_backup_round_trip_verifies_counts() {
    let t = TestContext::new();
    t.seed(2, 3);
    let before = state(&t);

    let report = t
        .backup()
        .create_backup("plain", Some(BackupFormat::Plain))
        .unwrap();
    assert!(report.file_name.ends_with(".sql"));

    t.restaurants().delete("Restaurant 0").unwrap();
    let restored = t
        .backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap();
    let expected = restored.expected.as_ref().unwrap();
    assert_eq!(expected.restaurant_rows, 2);
    assert_eq!(expected.review_rows, 6);
    assert_eq!(restored.outcome, BackupOutcome::Success);
    assert_eq!(state(&t), before);
    assert!(t.runner.steps().contains(&Step::Schema));
}

#[test]
fn restore_phases_are_published_in_order() {
    let t = TestContext::new();
    t.seed(1, 1);
    let report = t.backup().create_backup("phases", None).unwrap();

    let events = t.backup().subscribe();
    t.backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap();
    let phases: Vec<BackupPhase> = events.try_iter().map(|e| e.phase).collect();
    assert_eq!(
        phases,
        [
            BackupPhase::Validating,
            BackupPhase::ConnectionChecking,
            BackupPhase::SessionClosing,
            BackupPhase::ConnectionDraining,
            BackupPhase::SchemaPreparing,
            BackupPhase::ExternalProcessRunning,
            BackupPhase::OutputVerifying,
            BackupPhase::SessionReopening,
            BackupPhase::CacheReloading,
            BackupPhase::Idle,
        ]
    );
}

#[test]
fn hollow_dump_is_rejected_before_truncate() {
    let t = TestContext::new();
    t.seed(2, 2);
    let before = t.backend.snapshot();

    let name = "hollow_2024-01-01_00-00.sql";
    fs::write(
        t.backup_dir().join(name),
        "-- Data for Name: restaurants\nCOPY restaurants (id, name, location, rating) FROM stdin;\n\\.\n",
    )
    .unwrap();

    let err = t
        .backup()
        .restore(RestoreRequest::new(name).confirm())
        .unwrap_err();
    assert_eq!(phase_of(&err), Some(BackupPhase::Validating));
    assert!(matches!(err.root(), CoreError::InvalidBackup { .. }));
    assert_eq!(t.backend.snapshot(), before);
    assert!(t.runner.invocations().is_empty());
    assert_eq!(t.handle().state(), HandleState::Open);
    assert_eq!(t.backup().phase(), BackupPhase::Failed);
}

#[test]
fn file_without_data_statements_is_rejected() {
    let t = TestContext::new();
    t.seed(1, 0);
    let name = "schema_only.sql";
    fs::write(
        t.backup_dir().join(name),
        "CREATE TABLE restaurants (id integer);\n",
    )
    .unwrap();

    let err = t
        .backup()
        .restore(RestoreRequest::new(name).confirm())
        .unwrap_err();
    assert!(err.is_user_correctable());
    assert_eq!(t.restaurants().len(), 1);
}

#[test]
fn custom_file_without_magic_is_rejected() {
    let t = TestContext::new();
    t.seed(1, 0);
    let name = "forged.backup";
    fs::write(t.backup_dir().join(name), "INSERT INTO restaurants VALUES (1);").unwrap();

    let err = t
        .backup()
        .restore(RestoreRequest::new(name).confirm())
        .unwrap_err();
    assert!(matches!(err.root(), CoreError::InvalidBackup { .. }));
    assert!(t.runner.invocations().is_empty());
}

#[test]
fn restore_requires_confirmation() {
    let t = TestContext::new();
    t.seed(1, 0);
    let report = t.backup().create_backup("confirm", None).unwrap();
    t.runner.clear_log();

    let err = t
        .backup()
        .restore(RestoreRequest::new(&report.file_name))
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    assert!(t.runner.invocations().is_empty());
    assert_eq!(t.backup().phase(), BackupPhase::Idle);
}

#[test]
fn traversal_names_are_rejected() {
    let t = TestContext::new();
    for name in ["../outside.sql", "a/b.sql", "..\\x.backup", "notes.txt", ""] {
        let err = t
            .backup()
            .restore(RestoreRequest::new(name).confirm())
            .unwrap_err();
        assert!(
            matches!(err.root(), CoreError::InvalidBackup { .. }),
            "{name}: {err}"
        );
        assert!(t.backup().delete_backup(name).is_err());
    }
}

#[test]
fn failed_load_still_reopens_and_reloads() {
    let t = TestContext::new();
    t.seed(2, 1);
    let report = t.backup().create_backup("fail", None).unwrap();
    t.runner
        .fail(Step::Load, 1, &["pg_restore: error: could not execute query"]);

    let err = t
        .backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap_err();
    assert_eq!(phase_of(&err), Some(BackupPhase::ExternalProcessRunning));
    assert!(err
        .tool_output()
        .iter()
        .any(|l| l.contains("could not execute query")));

    // Truncate already ran; the caches show the store as it really is.
    assert_eq!(t.handle().state(), HandleState::Open);
    assert!(t.restaurants().is_empty());
    assert!(t.restaurants().sync_status().is_synced());
    assert_eq!(t.backup().phase(), BackupPhase::Failed);

    t.runner.reset();
    t.backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap();
    assert_eq!(t.restaurants().len(), 2);
}

#[test]
fn load_that_restores_nothing_is_invalid() {
    let t = TestContext::new();
    t.seed(3, 0);
    let report = t
        .backup()
        .create_backup("empty-load", Some(BackupFormat::Plain))
        .unwrap();
    t.runner.hollow_loads(true);

    let err = t
        .backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap_err();
    assert_eq!(phase_of(&err), Some(BackupPhase::CacheReloading));
    assert!(matches!(err.root(), CoreError::InvalidBackup { .. }));
    assert_eq!(t.handle().state(), HandleState::Open);
}

#[test]
fn handle_is_suspended_while_the_tool_loads() {
    let t = TestContext::new();
    t.seed(1, 1);
    let report = t.backup().create_backup("suspend", None).unwrap();

    let seen = Arc::new(Mutex::new(None));
    let handle = Arc::clone(t.handle());
    let record = Arc::clone(&seen);
    t.runner.on(Step::Load, move |_| {
        *record.lock() = Some(handle.state());
    });
    t.backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap();
    assert_eq!(*seen.lock(), Some(HandleState::Suspended));
}

#[test]
fn cancel_before_truncate_leaves_store_untouched() {
    let t = TestContext::new();
    t.seed(2, 2);
    let report = t.backup().create_backup("cancel", None).unwrap();
    t.add_restaurant("Since Backup", "Street");
    let before = t.backend.snapshot();

    let orchestrator = Arc::downgrade(t.backup());
    t.runner.on(Step::Terminate, move |_| {
        if let Some(o) = orchestrator.upgrade() {
            o.cancel();
        }
    });
    let err = t
        .backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap_err();
    assert!(matches!(err.root(), CoreError::Cancelled));
    assert_eq!(phase_of(&err), Some(BackupPhase::ConnectionDraining));
    assert!(!t.runner.steps().contains(&Step::Truncate));
    assert_eq!(t.backend.snapshot(), before);
    assert_eq!(t.restaurants().len(), 3);
    assert_eq!(t.handle().state(), HandleState::Open);
}

#[test]
fn cancel_after_truncate_is_ignored() {
    let t = TestContext::new();
    t.seed(2, 0);
    let report = t.backup().create_backup("late-cancel", None).unwrap();

    let orchestrator = Arc::downgrade(t.backup());
    t.runner.on(Step::Load, move |_| {
        if let Some(o) = orchestrator.upgrade() {
            o.cancel();
        }
    });
    t.backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap();
    assert_eq!(t.restaurants().len(), 2);
}

#[test]
fn missing_tool_fails_the_connection_check() {
    let t = TestContext::new();
    t.seed(1, 0);
    t.runner.remove_program(DUMP_PROGRAM);

    let err = t.backup().create_backup("no-tool", None).unwrap_err();
    assert_eq!(phase_of(&err), Some(BackupPhase::ConnectionChecking));
    assert!(matches!(err.root(), CoreError::ToolMissing { .. }));
    assert!(t.backup().list_backups().unwrap().is_empty());
}

#[test]
fn missing_restore_tool_never_suspends_the_handle() {
    let t = TestContext::new();
    t.seed(1, 0);
    let report = t.backup().create_backup("probe", None).unwrap();
    t.runner.remove_program(RESTORE_PROGRAM);
    let generation = t.handle().generation();

    let err = t
        .backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap_err();
    assert!(matches!(err.root(), CoreError::ToolMissing { .. }));
    assert_eq!(t.handle().generation(), generation);
    assert_eq!(t.restaurants().len(), 1);
}

#[test]
fn undersized_dump_is_a_warning() {
    let t = TestContext::new();
    t.runner.hollow_dumps(true);
    let report = t
        .backup()
        .create_backup("tiny", Some(BackupFormat::Plain))
        .unwrap();
    assert!(report.outcome.is_warning());
    assert!(report.size < 100);
    assert!(report.path.exists());
}

#[test]
fn dump_timeout_removes_partial_file() {
    let t = TestContext::new();
    t.seed(1, 0);
    let written = Arc::new(Mutex::new(None::<PathBuf>));
    let record = Arc::clone(&written);
    t.runner.on(Step::Dump, move |inv| {
        let path = PathBuf::from(&inv.args[2]);
        fs::write(&path, "partial").unwrap();
        *record.lock() = Some(path);
    });
    t.runner.time_out(Step::Dump);

    let err = t.backup().create_backup("slow", None).unwrap_err();
    assert_eq!(phase_of(&err), Some(BackupPhase::ExternalProcessRunning));
    assert!(matches!(err.root(), CoreError::ToolTimeout { .. }));
    let path = written.lock().clone().unwrap();
    assert!(!path.exists());
    assert!(t.backup().list_backups().unwrap().is_empty());
}

#[test]
fn tool_warnings_downgrade_restore_outcome() {
    let t = TestContext::new();
    t.seed(1, 1);
    let report = t.backup().create_backup("warn", None).unwrap();
    t.runner
        .warn(Step::Load, "pg_restore: warning: errors ignored on restore: 1");

    let restored = t
        .backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap();
    match restored.outcome {
        BackupOutcome::Warning(message) => assert!(message.contains("errors ignored")),
        BackupOutcome::Success => panic!("expected a warning"),
    }
}

#[test]
fn second_operation_is_refused_while_busy() {
    let t = TestContext::new();
    t.seed(1, 0);
    let nested = Arc::new(Mutex::new(None));
    let orchestrator = Arc::downgrade(t.backup());
    let record = Arc::clone(&nested);
    t.runner.on(Step::Dump, move |_| {
        if let Some(o) = orchestrator.upgrade() {
            *record.lock() = Some((o.is_busy(), o.create_backup("nested", None).is_err()));
        }
    });

    t.backup().create_backup("outer", None).unwrap();
    assert_eq!(*nested.lock(), Some((true, true)));
    assert!(!t.backup().is_busy());
}

#[test]
fn same_minute_backups_get_distinct_names() {
    let t = TestContext::new();
    t.seed(1, 0);
    let a = t.backup().create_backup("dup", None).unwrap();
    let b = t.backup().create_backup("dup", None).unwrap();
    assert_ne!(a.file_name, b.file_name);
    assert_eq!(t.backup().list_backups().unwrap().len(), 2);

    t.backup().delete_backup(&a.file_name).unwrap();
    let left = t.backup().list_backups().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].name, b.file_name);
}

#[test]
fn quiesced_backup_suspends_and_resumes() {
    let t = TestContext::with_config(Config::fast(), |b| b.quiesce_for_backup(true));
    t.seed(1, 0);
    let seen = Arc::new(Mutex::new(None));
    let handle = Arc::clone(t.handle());
    let record = Arc::clone(&seen);
    t.runner.on(Step::Dump, move |_| {
        *record.lock() = Some(handle.state());
    });

    t.backup().create_backup("quiet", None).unwrap();
    assert_eq!(*seen.lock(), Some(HandleState::Suspended));
    assert_eq!(t.handle().state(), HandleState::Open);
    t.add_restaurant("Afterwards", "Street");
}

#[test]
fn restore_runs_on_the_io_pool() {
    let t = TestContext::new();
    t.seed(2, 1);
    let report = t.backup().create_backup("async", None).unwrap();
    t.restaurants().delete("Restaurant 0").unwrap();

    let task = t
        .backup()
        .restore_async(RestoreRequest::new(&report.file_name).confirm())
        .unwrap();
    let restored = task.join().unwrap();
    assert_eq!(restored.loaded.restaurants, 2);
    assert!(t.restaurants().contains("Restaurant 0"));
}

#[test]
fn restore_survives_concurrent_writers() {
    let t = TestContext::new();
    t.seed(3, 1);
    let report = t.backup().create_backup("busy", None).unwrap();

    let ctx = Arc::clone(&t.ctx);
    let writer = std::thread::spawn(move || {
        for i in 0..50 {
            let _ = ctx
                .restaurants()
                .add(Restaurant::new(&format!("Writer {i}"), "Street").unwrap());
        }
    });
    t.backup()
        .restore(RestoreRequest::new(&report.file_name).confirm())
        .unwrap();
    writer.join().unwrap();

    // Whatever the writer managed, caches and store agree afterwards.
    assert_eq!(
        t.restaurants().len(),
        t.backend.snapshot().restaurants.len()
    );
    assert!(ratings_consistent(&t));
}

#[test]
fn restore_finishes_while_a_reload_waits_for_io() {
    let t = TestContext::with_config(Config::fast().io_threads(1), |b| b);
    assert_eq!(t.config().io_threads, 2);
    t.seed(2, 1);
    let report = t.backup().create_backup("pool", None).unwrap();
    t.add_restaurant("Since Backup", "Street");

    // A reload starts while the load tool runs and has to queue its fetch.
    let reloader = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&reloader);
    let ctx = Arc::downgrade(&t.ctx);
    t.runner.on(Step::Load, move |_| {
        if let Some(ctx) = ctx.upgrade() {
            *slot.lock() = Some(std::thread::spawn(move || ctx.restaurants().reload()));
            std::thread::sleep(Duration::from_millis(100));
        }
    });

    let (release, gate) = mpsc::channel::<()>();
    t.executors()
        .io()
        .execute("occupy", move || {
            let _ = gate.recv();
        })
        .unwrap();
    let task = t
        .backup()
        .restore_async(RestoreRequest::new(&report.file_name).confirm())
        .unwrap();
    let restored = task
        .join_timeout(Duration::from_secs(10))
        .map_err(|_| "restore blocked behind a pending reload")
        .unwrap()
        .unwrap();
    drop(release);

    assert_eq!(restored.loaded.restaurants, 2);
    let reloaded = reloader.lock().take().expect("load hook ran");
    assert_eq!(reloaded.join().unwrap().unwrap(), 2);
    assert!(!t.restaurants().contains("Since Backup"));
    assert_eq!(t.handle().state(), HandleState::Open);
}
