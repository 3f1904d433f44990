use std::time::Duration;

use undodb::{
    change::ChangeKind,
    core::{
        manager::{UndoError, UndoManager},
        signals::Signal,
    },
    runtime::handle::{RuntimeConfig, RuntimeError, SessionHandle, spawn_session},
    store::memory::{MemoryReader, MemoryStore},
    types::ObjectType,
};

fn session() -> (SessionHandle, MemoryReader) {
    let store = MemoryStore::new();
    let reader = store.reader();
    let handle = spawn_session(UndoManager::new(Box::new(store)), RuntimeConfig::default());
    (handle, reader)
}

async fn next_signal(sub: &mut tokio::sync::broadcast::Receiver<Signal>) -> Signal {
    tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("signal")
        .expect("recv")
}

#[tokio::test]
async fn runtime_commit_undo_redo_and_signals_ordered() {
    let (handle, reader) = session();
    let mut sub = handle.subscribe();

    handle.open("Add person").await.expect("open");
    let kind = handle
        .commit_object(ObjectType::Person, "H1", b"Smith:Ann".to_vec())
        .await
        .expect("commit object");
    assert_eq!(kind, ChangeKind::Add);
    handle.commit(None).await.expect("commit");

    assert_eq!(
        next_signal(&mut sub).await,
        Signal::Objects {
            object_type: ObjectType::Person,
            action: ChangeKind::Add,
            handles: vec!["H1".to_string()],
        }
    );
    assert_eq!(
        next_signal(&mut sub).await,
        Signal::UndoLabel(Some("Undo Add person".to_string()))
    );
    assert_eq!(next_signal(&mut sub).await, Signal::RedoLabel(None));
    assert_eq!(
        next_signal(&mut sub).await,
        Signal::HistoryChanged { undo_count: 1, redo_count: 0 }
    );
    assert_eq!(reader.get(ObjectType::Person, "H1"), Some(b"Smith:Ann".to_vec()));

    assert!(handle.undo(true).await.expect("undo"));
    assert_eq!(
        handle.get(ObjectType::Person, "H1").await.expect("get"),
        None
    );
    let status = handle.status().await.expect("status");
    assert_eq!((status.undo_count, status.redo_count), (0, 1));
    assert_eq!(status.redo_label.as_deref(), Some("Redo Add person"));
    assert!(!status.recording);

    assert!(handle.redo(true).await.expect("redo"));
    assert_eq!(
        handle.get(ObjectType::Person, "H1").await.expect("get"),
        Some(b"Smith:Ann".to_vec())
    );

    let manager = handle.shutdown().await.expect("shutdown");
    assert_eq!(manager.undo_count(), 1);
}

#[tokio::test]
async fn runtime_surfaces_state_machine_errors() {
    let (handle, _) = session();
    let err = handle
        .record(ObjectType::Note, "N1", None, Some(b"n".to_vec()))
        .await
        .expect_err("no txn");
    assert!(matches!(err, RuntimeError::Undo(UndoError::NoActiveTransaction)));

    handle.open("first").await.expect("open");
    let err = handle.open("second").await.expect_err("in progress");
    assert!(matches!(err, RuntimeError::Undo(UndoError::TransactionInProgress(_))));

    let err = handle
        .record(ObjectType::Note, "N1", None, None)
        .await
        .expect_err("invalid change");
    assert!(matches!(err, RuntimeError::Undo(UndoError::InvalidChange(_))));
    handle.abort().await.expect("abort");
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shutdown_aborts_open_transaction_and_closes_channel() {
    let (handle, reader) = session();
    let mut sub = handle.subscribe();

    handle.open("unfinished").await.expect("open");
    handle
        .record(ObjectType::Person, "H1", None, Some(b"x".to_vec()))
        .await
        .expect("record");
    let manager = handle.shutdown().await.expect("shutdown");

    assert!(!manager.is_recording());
    assert_eq!(manager.undo_count(), 0);
    assert_eq!(reader.get(ObjectType::Person, "H1"), None);
    assert_eq!(
        next_signal(&mut sub).await,
        Signal::Rebuild { object_type: ObjectType::Person }
    );

    let err = handle.undo(true).await.expect_err("closed");
    assert!(matches!(err, RuntimeError::ChannelClosed));
}

#[tokio::test]
async fn cloned_handles_share_one_writer() {
    let (handle, reader) = session();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle.open_batch(format!("import {i}")).await?;
            handle
                .commit_object(ObjectType::Person, format!("I{i}"), b"Imported:x".to_vec())
                .await?;
            handle.commit(None).await?;
            Ok::<(), RuntimeError>(())
        }));
    }
    let mut refused = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(()) => {}
            Err(RuntimeError::Undo(UndoError::TransactionInProgress(_))) => refused += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    let status = handle.status().await.expect("status");
    assert!(!status.recording);
    assert_eq!(status.undo_count, 0);

    let stored = (0..8)
        .filter(|i| reader.get(ObjectType::Person, &format!("I{i}")).is_some())
        .count();
    assert_eq!(stored + refused, 8);
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn zero_channel_sizes_are_clamped() {
    let config: RuntimeConfig =
        serde_json::from_str(r#"{"command_queue_bound":0,"signal_buffer":0}"#).expect("config");
    let handle = spawn_session(UndoManager::new(Box::new(MemoryStore::new())), config);
    let mut sub = handle.subscribe();

    handle.open("tiny").await.expect("open");
    handle
        .commit_object(ObjectType::Note, "N1", b"n".to_vec())
        .await
        .expect("commit object");
    handle.commit(None).await.expect("commit");
    assert!(matches!(
        sub.recv().await,
        Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_))
    ));
    assert_eq!(handle.status().await.expect("status").undo_count, 1);
    handle.shutdown().await.expect("shutdown");
}
