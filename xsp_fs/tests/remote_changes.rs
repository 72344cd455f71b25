mod common;

use common::{new_fs, next_event, reopen};
use xsp_core::{Storage, StorageType, SyncedStorage};
use xsp_fs::{EventSource, FsError, NodeEventKind, NodeKind};

#[tokio::test(flavor = "multi_thread")]
async fn absorbing_without_news_changes_nothing() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/f.txt", "same").await?;
    let other = reopen(&storage).await?;
    assert!(!other.absorb_external_change("/").await?);
    assert!(!other.absorb_external_change("/f.txt").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_additions_show_up_as_remote_events() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    let other = reopen(&storage).await?;
    let mut rx = other.watch_folder("/").await?;

    fs.make_folder("/photos", false).await?;
    assert!(!other.check_folder_presence("/photos").await?);
    assert!(other.absorb_external_change("/").await?);

    let event = next_event(&mut rx).await?;
    assert_eq!(event.source, EventSource::Remote);
    assert_eq!(event.version, fs.root_version());
    match event.kind {
        NodeEventKind::EntryAddition { entry } => {
            assert_eq!(entry.name, "photos");
            assert_eq!(entry.kind, NodeKind::Folder);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(other.check_folder_presence("/photos").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn remotely_moved_file_can_be_deleted_under_its_new_name() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/a.txt", "a").await?;
    assert_eq!(fs.read_txt_file("/a.txt").await?, "a");

    let other = reopen(&storage).await?;
    other.mv("/a.txt", "/b.txt").await?;
    other.write_txt_file("/c.txt", "c").await?;

    assert!(fs.absorb_external_change("/").await?);
    assert_eq!(fs.readonly_file("/b.txt").await?.name(), "b.txt");
    fs.delete_file("/b.txt").await?;
    assert!(!fs.check_file_presence("/b.txt").await?);
    assert!(fs.check_file_presence("/c.txt").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn file_first_reached_through_a_link_takes_its_listed_name() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/f.txt", "f").await?;
    let params = fs.readonly_file("/f.txt").await?.link_params()?;
    fs.link("/l", &params).await?;
    fs.mv("/f.txt", "/g.txt").await?;

    let other = reopen(&storage).await?;
    assert!(matches!(other.read_link("/l").await?, xsp_fs::ResolvedLink::File(_)));
    assert_eq!(other.readonly_file("/g.txt").await?.name(), "g.txt");
    other.delete_file("/g.txt").await?;
    assert!(!other.check_file_presence("/g.txt").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_rename_is_reported_as_one_event() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/draft.txt", "text").await?;
    let other = reopen(&storage).await?;
    let mut rx = other.watch_folder("/").await?;

    fs.mv("/draft.txt", "/final.txt").await?;
    assert!(other.absorb_external_change("/").await?);

    match next_event(&mut rx).await?.kind {
        NodeEventKind::EntryRenaming { old_name, new_name } => {
            assert_eq!(old_name, "draft.txt");
            assert_eq!(new_name, "final.txt");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(other.read_txt_file("/final.txt").await?, "text");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_file_change_is_absorbed() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/notes.txt", "one").await?;
    let other = reopen(&storage).await?;
    let mut rx = other.watch_file("/notes.txt").await?;

    let version = fs.write_txt_file("/notes.txt", "two").await?;
    assert!(other.absorb_external_change("/notes.txt").await?);

    let event = next_event(&mut rx).await?;
    assert_eq!(event.source, EventSource::Remote);
    assert_eq!(event.version, version);
    assert!(matches!(event.kind, NodeEventKind::FileChange));
    assert_eq!(other.read_txt_file("/notes.txt").await?, "two");
    assert_eq!(other.stat("/notes.txt").await?.size, Some(3));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_writer_must_absorb_before_saving() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/f.txt", "one").await?;
    let other = reopen(&storage).await?;
    other.read_txt_file("/f.txt").await?;

    fs.write_txt_file("/f.txt", "two").await?;
    assert!(matches!(
        other.write_txt_file("/f.txt", "three").await,
        Err(FsError::ConcurrentUpdate { .. })
    ));
    assert_eq!(fs.read_txt_file("/f.txt").await?, "two");

    assert!(other.absorb_external_change("/f.txt").await?);
    assert_eq!(other.write_txt_file("/f.txt", "three").await?, 4);
    assert_eq!(fs.read_txt_file("/f.txt").await?, "three");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicts_resolve_to_a_server_version() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Synced).await?;
    assert_eq!(fs.write_txt_file("/f.txt", "mine").await?, 2);
    let obj_id = fs.readonly_file("/f.txt").await?.obj_id().clone();

    let other = reopen(&storage).await?;
    assert_eq!(other.write_txt_file("/f.txt", "theirs").await?, 3);
    storage.set_current_synced_version(&obj_id, 2).await?;

    let mut rx = fs.watch_file("/f.txt").await?;
    assert!(fs.resolve_conflict("/f.txt", 3).await?);
    let event = next_event(&mut rx).await?;
    assert_eq!(event.source, EventSource::Remote);
    assert_eq!(event.version, 3);
    assert_eq!(fs.read_txt_file("/f.txt").await?, "theirs");
    assert_eq!(storage.get_obj(&obj_id).await?.version, 3);

    assert!(!fs.resolve_conflict("/f.txt", 3).await?);
    assert!(!fs.resolve_conflict("/f.txt", 1).await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_resolution_needs_synced_storage() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/f.txt", "x").await?;
    assert!(matches!(
        fs.resolve_conflict("/f.txt", 5).await,
        Err(FsError::Storage(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dangling_entries_are_dropped_on_access() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/lost.txt", "gone soon").await?;
    fs.write_txt_file("/kept.txt", "stays").await?;
    let obj_id = fs.readonly_file("/lost.txt").await?.obj_id().clone();

    let other = reopen(&storage).await?;
    storage.remove_obj(&obj_id).await?;

    let err = other.read_txt_file("/lost.txt").await.unwrap_err();
    assert!(
        matches!(err, FsError::InconsistentStateOfFS { .. }),
        "{err:?}"
    );
    assert!(!other.check_file_presence("/lost.txt").await?);
    assert_eq!(other.read_txt_file("/kept.txt").await?, "stays");
    Ok(())
}
