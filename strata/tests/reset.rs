use strata::{
    Hierarchy, HierarchyConfig, LayerError, MemStoreProvider, ResetError, SaveError, SaveStats,
};

const PATH: &str = "mem/reset.db";

/// Log through the test harness; `RUST_LOG=strata=debug` shows the cascade
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open() -> (MemStoreProvider, Hierarchy<MemStoreProvider>) {
    init_tracing();
    let provider = MemStoreProvider::new();
    let config = HierarchyConfig::new().with_store_path(PATH);
    let hierarchy = Hierarchy::open(config, provider.clone()).unwrap();
    (provider, hierarchy)
}

async fn write(hierarchy: &Hierarchy<MemStoreProvider>, key: &str, value: &str) {
    let writer = hierarchy.new_disposable_writer();
    writer.insert(key, value).await.unwrap();
    assert!(writer.save().await.unwrap().is_durable());
}

#[tokio::test]
async fn test_reset_recreates_empty_store() {
    let (provider, hierarchy) = open();
    write(&hierarchy, "a", "1").await;
    assert_eq!(provider.rows(PATH).unwrap().len(), 1);

    hierarchy.reset().await.unwrap();

    assert!(provider.file_exists(PATH));
    assert!(provider.rows(PATH).unwrap().is_empty());
    assert_eq!(provider.commit_count(PATH), 0);
    assert_eq!(hierarchy.read_layer().fetch("a").await.unwrap(), None);
    assert_eq!(hierarchy.stats(), SaveStats::default());
}

#[tokio::test]
async fn test_reset_builds_fresh_layers() {
    let (_provider, hierarchy) = open();
    let old_ids = [
        hierarchy.root().id(),
        hierarchy.read_layer().id(),
        hierarchy.bulk_write_layer().id(),
    ];
    let old_writer = hierarchy.new_disposable_writer().id();

    hierarchy.reset().await.unwrap();

    let root = hierarchy.root();
    let read = hierarchy.read_layer();
    let bulk = hierarchy.bulk_write_layer();
    for id in [root.id(), read.id(), bulk.id()] {
        assert!(!old_ids.contains(&id));
        assert!(id > old_writer);
    }
    assert_eq!(read.parent(), Some(root.id()));
    assert_eq!(bulk.parent(), Some(root.id()));
    assert_eq!(hierarchy.new_disposable_writer().parent(), Some(read.id()));

    assert!(!root.has_changes().await.unwrap());
    assert!(!read.has_changes().await.unwrap());
    assert!(!bulk.has_changes().await.unwrap());
}

#[tokio::test]
async fn test_reset_discards_unsaved_changes() {
    let (provider, hierarchy) = open();

    let bulk = hierarchy.bulk_write_layer();
    bulk.insert("unsaved", "x").await.unwrap();

    hierarchy.reset().await.unwrap();

    assert!(!hierarchy.bulk_write_layer().has_changes().await.unwrap());
    hierarchy.save().await.unwrap();
    assert!(provider.rows(PATH).unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_handles_are_detached() {
    let (provider, hierarchy) = open();

    let old_root = hierarchy.root();
    let old_read = hierarchy.read_layer();
    let old_bulk = hierarchy.bulk_write_layer();
    let old_writer = hierarchy.new_disposable_writer();
    old_writer.insert("late", "x").await.unwrap();

    hierarchy.reset().await.unwrap();

    assert_eq!(
        old_root.fetch("late").await,
        Err(LayerError::Detached {
            layer: old_root.id()
        })
    );
    assert_eq!(
        old_read.list("").await,
        Err(LayerError::Detached {
            layer: old_read.id()
        })
    );
    assert_eq!(
        old_bulk.insert("late", "x").await,
        Err(LayerError::Detached {
            layer: old_bulk.id()
        })
    );

    // The writer itself still runs, but its parent is gone
    assert_eq!(
        old_writer.save().await,
        Err(SaveError::Detached {
            layer: old_writer.id()
        })
    );
    assert!(old_writer.has_changes().await.unwrap());

    assert!(provider.rows(PATH).unwrap().is_empty());
    assert_eq!(hierarchy.stats(), SaveStats::default());
}

#[tokio::test]
async fn test_teardown_failure_keeps_hierarchy_usable() {
    let (provider, hierarchy) = open();
    write(&hierarchy, "keep", "1").await;
    let old_root = hierarchy.root().id();

    provider.fail_delete(true);
    let result = hierarchy.reset().await;
    assert!(matches!(result, Err(ResetError::Teardown(_))));

    // Rebuilt over the file that could not be deleted
    assert_ne!(hierarchy.root().id(), old_root);
    let value = hierarchy.read_layer().fetch("keep").await.unwrap();
    assert_eq!(value.as_deref(), Some(&b"1"[..]));

    write(&hierarchy, "more", "2").await;
    assert_eq!(provider.rows(PATH).unwrap().len(), 2);

    provider.fail_delete(false);
    hierarchy.reset().await.unwrap();
    assert!(provider.rows(PATH).unwrap().is_empty());
}

#[tokio::test]
async fn test_reopen_failure_then_recovery() {
    let (provider, hierarchy) = open();
    write(&hierarchy, "gone", "1").await;

    provider.fail_open(true);
    let result = hierarchy.reset().await;
    assert!(matches!(result, Err(ResetError::Reopen(_))));
    assert!(!provider.file_exists(PATH));

    let root = hierarchy.root();
    assert_eq!(
        root.fetch("gone").await,
        Err(LayerError::Detached { layer: root.id() })
    );

    provider.fail_open(false);
    hierarchy.reset().await.unwrap();
    write(&hierarchy, "back", "1").await;
    assert_eq!(provider.rows(PATH).unwrap().len(), 1);
}

#[tokio::test]
async fn test_shutdown_keeps_store_file() {
    let (provider, hierarchy) = open();
    write(&hierarchy, "persisted", "yes").await;

    hierarchy.shutdown().await.unwrap();
    assert!(provider.file_exists(PATH));

    let config = HierarchyConfig::new().with_store_path(PATH);
    let reopened = Hierarchy::open(config, provider.clone()).unwrap();
    let value = reopened.read_layer().fetch("persisted").await.unwrap();
    assert_eq!(value.as_deref(), Some(&b"yes"[..]));
}
