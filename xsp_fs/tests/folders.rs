mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{init_tracing, new_fs, next_event, reopen, root_key, wait_until};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use xsp_core::{Cryptor, EncryptedObj, ObjId, Storage, StorageResult, StorageType};
use xsp_fs::{EventSource, FsError, ListingEntry, NodeEventKind, NodeKind, XspFs};
use xsp_store_memory::MemoryStorage;

const TAKEN: &str = "taken";

/// Memory storage whose next generated id, once armed, is one already stored.
#[derive(Debug)]
struct CollidingStorage {
    inner: MemoryStorage,
    collide: AtomicBool,
}

#[async_trait]
impl Storage for CollidingStorage {
    fn storage_type(&self) -> StorageType {
        self.inner.storage_type()
    }

    fn versioned(&self) -> bool {
        self.inner.versioned()
    }

    fn cryptor(&self) -> Arc<dyn Cryptor> {
        self.inner.cryptor()
    }

    async fn generate_new_obj_id(&self) -> StorageResult<ObjId> {
        if self.collide.swap(false, Ordering::SeqCst) {
            return Ok(ObjId::new(TAKEN));
        }
        self.inner.generate_new_obj_id().await
    }

    async fn get_obj(&self, obj_id: &ObjId) -> StorageResult<EncryptedObj> {
        self.inner.get_obj(obj_id).await
    }

    async fn save_obj(&self, obj_id: &ObjId, obj: EncryptedObj) -> StorageResult<()> {
        self.inner.save_obj(obj_id, obj).await
    }

    async fn remove_obj(&self, obj_id: &ObjId) -> StorageResult<()> {
        self.inner.remove_obj(obj_id).await
    }

    async fn storage_for_linking(
        &self,
        storage_type: StorageType,
        location: Option<&str>,
    ) -> StorageResult<Arc<dyn Storage>> {
        self.inner.storage_for_linking(storage_type, location).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn make_folder_bumps_version_and_announces_entry() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    assert_eq!(fs.root_version(), 1);
    let mut events = fs.watch_folder("/").await?;

    fs.make_folder("/docs", false).await?;

    assert_eq!(fs.root_version(), 2);
    let event = next_event(&mut events).await?;
    assert_eq!(event.version, 2);
    assert_eq!(event.source, EventSource::Local);
    assert_eq!(
        event.kind,
        NodeEventKind::EntryAddition {
            entry: ListingEntry {
                name: "docs".into(),
                kind: NodeKind::Folder,
            }
        }
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn every_folder_change_is_one_version() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.make_folder("/a", false).await?;
    let sub = fs.writable_sub_root("/a", false).await?;
    let start = sub.root_version();

    sub.write_txt_file("/x.txt", "x").await?;
    assert_eq!(sub.root_version(), start + 1);
    sub.mv("/x.txt", "/y.txt").await?;
    assert_eq!(sub.root_version(), start + 2);
    sub.delete_file("/y.txt").await?;
    assert_eq!(sub.root_version(), start + 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn non_exclusive_creation_returns_existing_folder() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.make_folder("/a/b", false).await?;
    let version = fs.root_version();
    fs.make_folder("/a/b", false).await?;
    assert_eq!(fs.root_version(), version);

    let err = fs.make_folder("/a/b", true).await.unwrap_err();
    assert!(matches!(&err, FsError::AlreadyExists { path } if path == "/a/b"), "{err:?}");

    assert_eq!(
        fs.list_folder("/a").await?,
        vec![ListingEntry {
            name: "b".into(),
            kind: NodeKind::Folder,
        }]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn folders_and_files_do_not_mix() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/f.txt", "text").await?;

    assert!(matches!(
        fs.make_folder("/f.txt", false).await,
        Err(FsError::NotDirectory { .. })
    ));
    assert!(matches!(
        fs.list_folder("/f.txt").await,
        Err(FsError::NotDirectory { .. })
    ));
    assert!(matches!(
        fs.check_folder_presence("/f.txt").await,
        Err(FsError::NotDirectory { .. })
    ));
    fs.make_folder("/dir", false).await?;
    assert!(matches!(
        fs.check_file_presence("/dir").await,
        Err(FsError::NotFile { .. })
    ));
    assert!(!fs.check_folder_presence("/missing").await?);
    assert!(!fs.check_file_presence("/missing/f.txt").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_non_empty_folder_needs_remove_content() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/a/b/x.txt", "x").await?;
    assert_eq!(storage.obj_count(), 4);

    let err = fs.delete_folder("/a", false).await.unwrap_err();
    assert!(matches!(&err, FsError::NotEmpty { path } if path == "/a"), "{err:?}");
    assert!(fs.check_folder_presence("/a").await?);

    fs.delete_folder("/a", true).await?;
    assert!(!fs.check_folder_presence("/a").await?);
    // children go in the background
    assert!(wait_until(|| storage.obj_count() == 1).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_folder_deletes_without_remove_content() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    fs.make_folder("/empty", false).await?;
    let mut root_events = fs.watch_folder("/").await?;
    let mut folder_events = fs.watch_folder("/empty").await?;

    fs.delete_folder("/empty", false).await?;

    let event = next_event(&mut root_events).await?;
    assert!(matches!(
        event.kind,
        NodeEventKind::EntryRemoval { ref entry } if entry.name == "empty"
    ));
    assert_eq!(next_event(&mut folder_events).await?.kind, NodeEventKind::Removed);
    assert!(wait_until(|| storage.obj_count() == 1).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_within_folder_is_one_event() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/a/b.txt", "content").await?;
    let mut events = fs.watch_folder("/a").await?;

    fs.mv("/a/b.txt", "/a/c.txt").await?;

    assert_eq!(
        next_event(&mut events).await?.kind,
        NodeEventKind::EntryRenaming {
            old_name: "b.txt".into(),
            new_name: "c.txt".into(),
        }
    );
    assert!(!fs.check_file_presence("/a/b.txt").await?);
    assert_eq!(fs.read_txt_file("/a/c.txt").await?, "content");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn move_across_folders_updates_both_sides() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/src/f.txt", "moving").await?;
    fs.make_folder("/dst", false).await?;
    let mut src_events = fs.watch_folder("/src").await?;
    let mut dst_events = fs.watch_folder("/dst").await?;

    fs.mv("/src/f.txt", "/dst/g.txt").await?;

    assert!(matches!(
        next_event(&mut src_events).await?.kind,
        NodeEventKind::EntryRemoval { ref entry } if entry.name == "f.txt"
    ));
    assert!(matches!(
        next_event(&mut dst_events).await?.kind,
        NodeEventKind::EntryAddition { ref entry }
            if entry.name == "g.txt" && entry.kind == NodeKind::File
    ));
    assert!(fs.list_folder("/src").await?.is_empty());
    assert_eq!(fs.read_txt_file("/dst/g.txt").await?, "moving");
    assert_eq!(fs.readonly_file("/dst/g.txt").await?.name(), "g.txt");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn move_refuses_existing_target_and_own_subtree() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/a/one.txt", "1").await?;
    fs.write_txt_file("/a/two.txt", "2").await?;

    let err = fs.mv("/a/one.txt", "/a/two.txt").await.unwrap_err();
    assert!(matches!(&err, FsError::AlreadyExists { path } if path == "/a/two.txt"), "{err:?}");
    assert!(matches!(
        fs.mv("/a", "/a/inner").await,
        Err(FsError::InvalidPath { .. })
    ));
    assert!(matches!(
        fs.mv("/a/none.txt", "/b.txt").await,
        Err(FsError::NotFound { .. })
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn paths_are_normalized() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("a/./b/../c.txt", "c").await?;
    assert!(fs.check_file_presence("/a/c.txt").await?);
    assert!(fs.check_file_presence("//a//c.txt/").await?);
    assert!(!fs.check_folder_presence("/a/b").await?);
    assert!(matches!(
        fs.delete_file("/").await,
        Err(FsError::InvalidPath { .. })
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn tree_survives_reopening() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/a/b/c.txt", "deep").await?;
    fs.make_folder("/a/empty", false).await?;

    let reopened = reopen(&storage).await?;
    assert_eq!(reopened.read_txt_file("/a/b/c.txt").await?, "deep");
    let names: Vec<String> = reopened
        .list_folder("/a")
        .await?
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["b", "empty"]);
    assert_eq!(reopened.root_version(), fs.root_version());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn root_needs_its_key_and_exists_once() -> anyhow::Result<()> {
    let (_fs, storage) = new_fs(StorageType::Local).await?;
    let err = XspFs::make_new_root(storage.clone(), &root_key())
        .await
        .unwrap_err();
    assert!(err.is_already_exists(), "{err:?}");

    let wrong = xsp_fs::derive_root_key(b"wrong secret");
    assert!(matches!(
        XspFs::from_existing_root(storage.clone(), &wrong).await,
        Err(FsError::Crypto(_))
    ));
    assert!(matches!(
        XspFs::from_existing_root(storage, &[0u8; 5]).await,
        Err(FsError::Crypto(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stat_reports_kind_and_version() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.make_folder("/d", false).await?;
    let root = fs.stat("/").await?;
    assert!(root.is_folder);
    assert_eq!(root.version, 2);
    let folder = fs.stat("/d").await?;
    assert!(folder.is_folder && !folder.is_file);
    assert_eq!(folder.version, 1);
    assert!(matches!(fs.stat("/nope").await, Err(FsError::NotFound { .. })));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn creation_retries_when_the_generated_id_is_stored() -> anyhow::Result<()> {
    init_tracing();
    let storage = Arc::new(CollidingStorage {
        inner: MemoryStorage::new(StorageType::Local),
        collide: AtomicBool::new(false),
    });
    let taken = ObjId::new(TAKEN);
    let squatter = EncryptedObj::new(1, Bytes::from_static(b"header"), Bytes::new());
    storage.save_obj(&taken, squatter).await?;
    let fs = XspFs::make_new_root(storage.clone(), &root_key()).await?;

    storage.collide.store(true, Ordering::SeqCst);
    fs.write_txt_file("/new.txt", "fresh").await?;

    assert!(!storage.collide.load(Ordering::SeqCst));
    let file = fs.readonly_file("/new.txt").await?;
    assert_ne!(file.obj_id(), &taken);
    assert_eq!(file.read_txt().await?, "fresh");
    assert_eq!(storage.get_obj(&taken).await?.header, Bytes::from_static(b"header"));
    assert_eq!(storage.inner.obj_count(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_make_folder_creates_one_folder() -> anyhow::Result<()> {
    let (fs, storage) = new_fs(StorageType::Local).await?;
    let (first, second) = tokio::join!(
        fs.make_folder("/x/y", false),
        fs.make_folder("/x/y", false)
    );
    first?;
    second?;

    let root = fs.list_folder("/").await?;
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].name, "x");
    let x = fs.list_folder("/x").await?;
    assert_eq!(x.len(), 1);
    assert_eq!(x[0].name, "y");
    assert_eq!(storage.obj_count(), 3);
    Ok(())
}
