use std::collections::BTreeMap;

use proptest::prelude::*;

use undodb::{
    core::manager::UndoManager,
    store::{
        ObjectStore, SecondaryIndex, StoreCursor,
        memory::MemoryStore,
        sqlite::{SqliteOptions, SqliteStore},
    },
    types::ObjectType,
};

#[derive(Debug, Clone)]
enum Edit {
    Put { target: u8, surname: u8 },
    Remove { target: u8 },
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (0u8..6, 0u8..3).prop_map(|(target, surname)| Edit::Put { target, surname }),
        1 => (0u8..6).prop_map(|target| Edit::Remove { target }),
    ]
}

fn txns_strategy() -> impl Strategy<Value = Vec<Vec<Edit>>> {
    prop::collection::vec(prop::collection::vec(edit_strategy(), 0..6), 1..8)
}

fn surname(value: &[u8]) -> Vec<String> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.split(':').next())
        .map(|s| vec![s.to_string()])
        .unwrap_or_default()
}

const SURNAME: SecondaryIndex = SecondaryIndex {
    name: "surname",
    object_type: ObjectType::Person,
    extract: surname,
};

type State = BTreeMap<String, Vec<u8>>;

fn memory() -> Box<dyn ObjectStore> {
    Box::new(MemoryStore::new().with_index(SURNAME))
}

fn sqlite() -> Box<dyn ObjectStore> {
    let options = SqliteOptions {
        wal: false,
        ..SqliteOptions::default()
    };
    Box::new(
        SqliteStore::open_in_memory(options)
            .expect("sqlite")
            .with_index(SURNAME),
    )
}

fn apply(manager: &mut UndoManager, idx: usize, edits: &[Edit]) {
    manager.open(&format!("T{idx}")).expect("open");
    write_edits(manager, idx, edits);
    manager.commit(None).expect("commit");
}

fn write_edits(manager: &mut UndoManager, idx: usize, edits: &[Edit]) {
    for edit in edits {
        match edit {
            Edit::Put { target, surname } => {
                manager
                    .commit_object(
                        ObjectType::Person,
                        &format!("H{target}"),
                        format!("S{surname}:{idx}").into_bytes(),
                    )
                    .expect("put");
            }
            Edit::Remove { target } => {
                manager
                    .remove_object(ObjectType::Person, &format!("H{target}"))
                    .expect("remove");
            }
        }
    }
}

fn snapshot(manager: &UndoManager) -> State {
    let mut cursor = manager.cursor(ObjectType::Person).expect("cursor");
    let mut out = State::new();
    while let Some((handle, value)) = cursor.next_entry().expect("next") {
        out.insert(handle, value);
    }
    cursor.close().expect("close");
    out
}

fn full_scan_by_surname(state: &State, key: &str) -> Vec<String> {
    state
        .iter()
        .filter(|(_, value)| surname(value).iter().any(|k| k == key))
        .map(|(handle, _)| handle.clone())
        .collect()
}

fn check_lifo(store: Box<dyn ObjectStore>, txns: &[Vec<Edit>]) -> Result<(), TestCaseError> {
    let mut manager = UndoManager::new(store);
    let mut states = vec![snapshot(&manager)];
    for (idx, edits) in txns.iter().enumerate() {
        apply(&mut manager, idx, edits);
        states.push(snapshot(&manager));
    }
    prop_assert_eq!(manager.undo_count(), txns.len());

    // Walk back one step at a time, then forward again.
    for expected in states.iter().rev().skip(1) {
        prop_assert!(manager.undo(true).expect("undo"));
        prop_assert_eq!(&snapshot(&manager), expected);
    }
    prop_assert!(!manager.undo(true).expect("undo"));

    for expected in states.iter().skip(1) {
        prop_assert!(manager.redo(true).expect("redo"));
        prop_assert_eq!(&snapshot(&manager), expected);
    }
    prop_assert!(!manager.redo(true).expect("redo"));
    Ok(())
}

fn check_cursor_isolation(
    store: Box<dyn ObjectStore>,
    txns: &[Vec<Edit>],
    pending: &[Edit],
) -> Result<(), TestCaseError> {
    let mut manager = UndoManager::new(store);
    for (idx, edits) in txns.iter().enumerate() {
        apply(&mut manager, idx, edits);
    }
    let committed = snapshot(&manager);

    manager.open("pending").expect("open");
    write_edits(&mut manager, txns.len(), pending);
    prop_assert_eq!(&snapshot(&manager), &committed);

    manager.abort().expect("abort");
    prop_assert_eq!(snapshot(&manager), committed);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn undo_walks_back_through_every_commit_memory(txns in txns_strategy()) {
        check_lifo(memory(), &txns)?;
    }

    #[test]
    fn undo_walks_back_through_every_commit_sqlite(txns in txns_strategy()) {
        check_lifo(sqlite(), &txns)?;
    }

    #[test]
    fn undo_then_redo_restores_post_commit_state(
        txns in txns_strategy(),
        last in prop::collection::vec(edit_strategy(), 1..6),
    ) {
        let mut manager = UndoManager::new(memory());
        for (idx, edits) in txns.iter().enumerate() {
            apply(&mut manager, idx, edits);
        }
        apply(&mut manager, txns.len(), &last);
        let after = snapshot(&manager);

        prop_assert!(manager.undo(true).expect("undo"));
        prop_assert!(manager.redo(true).expect("redo"));
        prop_assert_eq!(snapshot(&manager), after);
    }

    #[test]
    fn secondary_index_matches_full_scan(
        txns in txns_strategy(),
        undos in 0usize..8,
    ) {
        for store in [memory(), sqlite()] {
            let mut manager = UndoManager::new(store);
            for (idx, edits) in txns.iter().enumerate() {
                apply(&mut manager, idx, edits);
            }
            for _ in 0..undos {
                manager.undo(true).expect("undo");
            }
            let state = snapshot(&manager);
            for key in ["S0", "S1", "S2"] {
                let indexed = manager.lookup("surname", key).expect("lookup");
                prop_assert_eq!(indexed, full_scan_by_surname(&state, key));
            }
        }
    }

    #[test]
    fn new_commit_after_undo_invalidates_redo(
        txns in txns_strategy(),
        extra in prop::collection::vec(edit_strategy(), 0..4),
    ) {
        let mut manager = UndoManager::new(memory());
        for (idx, edits) in txns.iter().enumerate() {
            apply(&mut manager, idx, edits);
        }
        prop_assert!(manager.undo(true).expect("undo"));
        prop_assert!(manager.redo_count() >= 1);
        apply(&mut manager, txns.len(), &extra);
        prop_assert_eq!(manager.redo_count(), 0);
        prop_assert!(!manager.redo(true).expect("redo"));
    }

    #[test]
    fn cursor_during_recording_sees_only_committed_rows(
        txns in txns_strategy(),
        pending in prop::collection::vec(edit_strategy(), 1..6),
    ) {
        check_cursor_isolation(memory(), &txns, &pending)?;
        check_cursor_isolation(sqlite(), &txns, &pending)?;
    }
}
