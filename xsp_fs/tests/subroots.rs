mod common;

use common::{new_fs, next_event};
use xsp_core::StorageType;
use xsp_fs::{FsError, NodeEventKind};

#[tokio::test(flavor = "multi_thread")]
async fn writable_sub_root_writes_into_the_parent_tree() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    let sub = fs.writable_sub_root("/work/project", true).await?;
    assert!(sub.is_writable());
    assert!(sub.stat("/").await?.is_folder);

    sub.write_txt_file("/src/main.txt", "entry").await?;
    assert_eq!(fs.read_txt_file("/work/project/src/main.txt").await?, "entry");
    assert_eq!(sub.list_folder("/").await?.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn readonly_sub_root_refuses_writes() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/archive/2020.txt", "old").await?;
    let ro = fs.readonly_sub_root("/archive").await?;
    assert!(!ro.is_writable());
    assert_eq!(ro.read_txt_file("/2020.txt").await?, "old");

    assert!(matches!(
        ro.make_folder("/new", false).await,
        Err(FsError::NotWritable { .. })
    ));
    assert!(matches!(
        ro.writable_sub_root("/", false).await,
        Err(FsError::NotWritable { .. })
    ));
    assert!(matches!(
        ro.delete_file("/2020.txt").await,
        Err(FsError::NotWritable { .. })
    ));
    assert!(fs.check_file_presence("/archive/2020.txt").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn sub_root_of_missing_folder_is_not_found() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    assert!(matches!(
        fs.readonly_sub_root("/nowhere").await,
        Err(FsError::NotFound { .. })
    ));
    assert!(matches!(
        fs.writable_sub_root("/nowhere", false).await,
        Err(FsError::NotFound { .. })
    ));
    assert!(!fs.check_folder_presence("/nowhere").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn parent_segments_stay_inside_the_sub_root() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    fs.write_txt_file("/secret.txt", "top").await?;
    let jail = fs.writable_sub_root("/jail", true).await?;

    assert!(!jail.check_file_presence("/../secret.txt").await?);
    assert!(matches!(
        jail.read_txt_file("../../secret.txt").await,
        Err(FsError::NotFound { .. })
    ));
    jail.write_txt_file("/../secret.txt", "inside").await?;
    assert_eq!(fs.read_txt_file("/jail/secret.txt").await?, "inside");
    assert_eq!(fs.read_txt_file("/secret.txt").await?, "top");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn events_reach_every_view_of_a_folder() -> anyhow::Result<()> {
    let (fs, _storage) = new_fs(StorageType::Local).await?;
    let sub = fs.writable_sub_root("/shared", true).await?;
    let mut from_root = fs.watch_folder("/shared").await?;
    let mut from_sub = sub.watch_folder("/").await?;

    sub.make_folder("/inner", true).await?;
    for rx in [&mut from_root, &mut from_sub] {
        match next_event(rx).await?.kind {
            NodeEventKind::EntryAddition { entry } => assert_eq!(entry.name, "inner"),
            other => panic!("unexpected {other:?}"),
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn folders_can_be_saved_across_trees() -> anyhow::Result<()> {
    let (source_fs, _a) = new_fs(StorageType::Local).await?;
    let (target_fs, _b) = new_fs(StorageType::Local).await?;
    source_fs.write_txt_file("/album/cover.txt", "cover").await?;
    source_fs.write_bytes("/album/tracks/01.bin", &[1, 2, 3]).await?;
    source_fs.make_folder("/album/empty", false).await?;

    let album = source_fs.readonly_sub_root("/album").await?;
    target_fs.save_folder(&album, "/imported", false).await?;

    assert_eq!(target_fs.read_txt_file("/imported/cover.txt").await?, "cover");
    assert_eq!(
        target_fs.read_bytes("/imported/tracks/01.bin", None, None).await?,
        vec![1u8, 2, 3]
    );
    assert!(target_fs.check_folder_presence("/imported/empty").await?);
    assert!(matches!(
        target_fs.save_folder(&album, "/imported", false).await,
        Err(FsError::AlreadyExists { .. })
    ));
    Ok(())
}
