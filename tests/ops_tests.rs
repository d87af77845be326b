#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::os::unix::fs::PermissionsExt as _;

use common::{FaultyStore, Op, cached_bytes, is_cached, mount, p};

use blob_fs::error::FsError;
use blob_fs::fs::{EntryKind, OpenFlags};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn created_file_reaches_remote_on_release() {
    let (fs, _tmp) = mount(FaultyStore::flat()).await;

    let (handle, attr) = fs.create(&p("/reports/q3.txt"), 0o644).await.unwrap();
    assert_eq!(attr.kind, EntryKind::RegularFile);
    assert_eq!(fs.write(handle, 0, b"hello").await.unwrap(), 5);
    assert!(!fs.store().inner.contains("reports/q3.txt"));
    fs.release(handle).await.unwrap();

    assert_eq!(
        fs.store().inner.object_data("reports/q3.txt").unwrap(),
        "hello"
    );
    assert!(!fs.usage().is_dirty(&p("/reports/q3.txt")));
    assert_eq!(fs.usage().total_bytes(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_uploads_only_pending_changes() {
    let (fs, _tmp) = mount(FaultyStore::flat()).await;
    let (handle, _) = fs.create(&p("/f"), 0o644).await.unwrap();
    fs.write(handle, 0, b"abc").await.unwrap();

    fs.flush(handle).await.unwrap();
    fs.flush(handle).await.unwrap();
    fs.release(handle).await.unwrap();

    assert_eq!(fs.store().calls(Op::Upload), 1);
    assert_eq!(fs.store().inner.object_data("f").unwrap(), "abc");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_handle_never_uploads() {
    let store = FaultyStore::flat();
    store.inner.put_object("data.bin", "0123456789");
    let (fs, _tmp) = mount(store).await;

    let handle = fs.open(&p("/data.bin"), OpenFlags::RDONLY).await.unwrap();
    assert_eq!(fs.read(handle, 2, 3).await.unwrap(), "234");
    assert_eq!(fs.read(handle, 8, 100).await.unwrap(), "89");
    let err = fs.write(handle, 0, b"x").await.unwrap_err();
    assert_eq!(err.errno(), libc::EBADF);
    fs.release(handle).await.unwrap();

    assert_eq!(fs.store().calls(Op::Upload), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_with_truncate_empties_the_object() {
    let store = FaultyStore::flat();
    store.inner.put_object("log", "old contents");
    let (fs, _tmp) = mount(store).await;

    let handle = fs
        .open(&p("/log"), OpenFlags::WRONLY | OpenFlags::TRUNC)
        .await
        .unwrap();
    fs.release(handle).await.unwrap();

    assert!(fs.store().inner.object_data("log").unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn released_handle_is_gone() {
    let store = FaultyStore::flat();
    store.inner.put_object("x", "x");
    let (fs, _tmp) = mount(store).await;
    let handle = fs.open(&p("/x"), OpenFlags::RDONLY).await.unwrap();
    fs.release(handle).await.unwrap();

    assert!(matches!(fs.read(handle, 0, 1).await, Err(FsError::BadHandle(_))));
    assert!(matches!(fs.fsync(handle), Err(FsError::BadHandle(_))));
    assert!(fs.handles().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_uploads_immediately_without_writers() {
    let store = FaultyStore::flat();
    store.inner.put_object("f", "hello world");
    let (fs, _tmp) = mount(store).await;

    fs.truncate(&p("/f"), 5).await.unwrap();

    assert_eq!(fs.store().inner.object_data("f").unwrap(), "hello");
    assert_eq!(fs.stat(&p("/f")).await.unwrap().size, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_defers_upload_to_open_writer() {
    let store = FaultyStore::flat();
    store.inner.put_object("f", "hello world");
    let (fs, _tmp) = mount(store).await;
    let handle = fs.open(&p("/f"), OpenFlags::WRONLY).await.unwrap();

    fs.truncate(&p("/f"), 2).await.unwrap();
    assert_eq!(fs.store().calls(Op::Upload), 0);
    fs.release(handle).await.unwrap();

    assert_eq!(fs.store().inner.object_data("f").unwrap(), "he");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlink_removes_both_copies() {
    let store = FaultyStore::flat();
    store.inner.put_object("f", "data");
    let (fs, _tmp) = mount(store).await;
    fs.ensure_local(&p("/f")).await.unwrap();

    fs.unlink(&p("/f")).await.unwrap();

    assert!(!fs.store().inner.contains("f"));
    assert!(!is_cached(&fs, &p("/f")));
    assert_eq!(fs.usage().file_count(), 0);
    assert!(fs.stat(&p("/f")).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlinked_open_file_stays_readable_and_is_not_resurrected() {
    let store = FaultyStore::flat();
    store.inner.put_object("f", "data");
    let (fs, _tmp) = mount(store).await;
    let reader = fs.open(&p("/f"), OpenFlags::RDONLY).await.unwrap();
    let (writer, _) = fs.create(&p("/scratch"), 0o644).await.unwrap();
    fs.write(writer, 0, b"tmp").await.unwrap();

    fs.unlink(&p("/f")).await.unwrap();
    fs.unlink(&p("/scratch")).await.unwrap();

    assert_eq!(fs.read(reader, 0, 16).await.unwrap(), "data");
    fs.write(writer, 3, b"more").await.unwrap();
    fs.release(reader).await.unwrap();
    fs.release(writer).await.unwrap();
    assert_eq!(fs.store().calls(Op::Upload), 0);
    assert!(!fs.store().inner.contains("scratch"));
    assert!(!fs.usage().is_dirty(&p("/scratch")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlink_refuses_directories() {
    let store = FaultyStore::flat();
    store.inner.put_directory("d");
    let (fs, _tmp) = mount(store).await;

    assert!(matches!(
        fs.unlink(&p("/d")).await,
        Err(FsError::IsADirectory)
    ));
    assert!(fs.unlink(&p("/missing")).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mkdir_creates_marker_and_placeholder() {
    let (fs, _tmp) = mount(FaultyStore::flat()).await;

    let attr = fs.mkdir(&p("/projects"), 0o755).await.unwrap();

    assert!(attr.is_dir());
    assert!(fs.store().inner.entry("projects").unwrap().is_directory_blob());
    assert!(fs.cache().local_path(&p("/projects")).is_dir());
    assert!(matches!(
        fs.mkdir(&p("/projects"), 0o755).await,
        Err(FsError::AlreadyExists)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mkdir_applies_mode_on_hierarchical_backends() {
    let (fs, _tmp) = mount(FaultyStore::hierarchical()).await;

    fs.mkdir(&p("/shared"), 0o755).await.unwrap();

    let entry = fs.store().inner.entry("shared").unwrap();
    assert_eq!(entry.permissions.as_deref(), Some("rwxr-xr-x"));
    assert_eq!(fs.store().calls(Op::SetAccessControl), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mkdir_over_implicit_directory_fails() {
    let store = FaultyStore::flat();
    store.inner.put_object("implied/child", "c");
    let (fs, _tmp) = mount(store).await;

    assert!(matches!(
        fs.mkdir(&p("/implied"), 0o755).await,
        Err(FsError::AlreadyExists)
    ));
    assert_eq!(fs.store().calls(Op::CreateMarker), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rmdir_removes_empty_marker_directory() {
    let store = FaultyStore::flat();
    store.inner.put_directory("empty");
    let (fs, _tmp) = mount(store).await;

    fs.rmdir(&p("/empty")).await.unwrap();

    assert!(!fs.store().inner.contains("empty"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rmdir_removes_former_directory_sentinel() {
    let store = FaultyStore::flat();
    store.inner.put_object("legacy/.directory", "");
    let (fs, _tmp) = mount(store).await;

    fs.rmdir(&p("/legacy")).await.unwrap();

    assert!(fs.store().inner.names().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rmdir_removes_empty_native_directory() {
    let store = FaultyStore::hierarchical();
    store.inner.put_directory("empty");
    let (fs, _tmp) = mount(store).await;

    fs.rmdir(&p("/empty")).await.unwrap();

    assert!(!fs.store().inner.contains("empty"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rmdir_refuses_non_empty_directories() {
    let store = FaultyStore::flat();
    store.inner.put_object("full/child", "c");
    let (fs, _tmp) = mount(store).await;
    fs.mkdir(&p("/busy"), 0o755).await.unwrap();
    let (handle, _) = fs.create(&p("/busy/unsaved"), 0o644).await.unwrap();

    assert!(matches!(
        fs.rmdir(&p("/full")).await,
        Err(FsError::NotEmpty)
    ));
    assert!(matches!(
        fs.rmdir(&p("/busy")).await,
        Err(FsError::NotEmpty)
    ));
    assert!(fs.store().inner.contains("full/child"));
    fs.release(handle).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rmdir_rejects_files_and_missing_paths() {
    let store = FaultyStore::flat();
    store.inner.put_object("plain", "p");
    let (fs, _tmp) = mount(store).await;

    assert!(matches!(
        fs.rmdir(&p("/plain")).await,
        Err(FsError::NotADirectory)
    ));
    assert!(fs.rmdir(&p("/missing")).await.unwrap_err().is_not_found());
    assert!(matches!(
        fs.rmdir(&blob_fs::path::FsPath::root()).await,
        Err(FsError::InvalidArgument)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chmod_updates_remote_and_cached_copy() {
    let store = FaultyStore::hierarchical();
    store.inner.put_object("f", "data");
    let (fs, _tmp) = mount(store).await;
    let local = fs.ensure_local(&p("/f")).await.unwrap();

    fs.chmod(&p("/f"), 0o600).await.unwrap();

    let entry = fs.store().inner.entry("f").unwrap();
    assert_eq!(entry.permissions.as_deref(), Some("rw-------"));
    let mode = std::fs::metadata(local).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chmod_on_missing_path_is_not_found() {
    let (fs, _tmp) = mount(FaultyStore::flat()).await;

    assert!(fs.chmod(&p("/nope"), 0o644).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_surface_reports_errnos() {
    let (fs, _tmp) = mount(FaultyStore::flat()).await;
    let path = p("/x");

    assert_eq!(fs.symlink(&path, "/y").unwrap_err().errno(), libc::ENOSYS);
    assert_eq!(fs.link(&path, &p("/y")).unwrap_err().errno(), libc::ENOSYS);
    assert_eq!(fs.mknod(&path, 0o644).unwrap_err().errno(), libc::ENOSYS);
    assert_eq!(fs.xattr(&path).unwrap_err().errno(), libc::ENOSYS);
    assert_eq!(fs.readlink(&path).unwrap_err().errno(), libc::EINVAL);
    assert!(fs.chown(&path, Some(0), None).is_ok());
    assert!(fs.utimens(&path).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statfs_describes_cache_filesystem() {
    let (fs, _tmp) = mount(FaultyStore::flat()).await;

    let stats = fs.statfs().unwrap();

    assert!(stats.block_size > 0);
    assert!(stats.total_blocks >= stats.free_blocks);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_wipes_the_mirror_only() {
    let store = FaultyStore::flat();
    store.inner.put_object("dir/f", "data");
    let (fs, _tmp) = mount(store).await;
    fs.ensure_local(&p("/dir/f")).await.unwrap();

    fs.destroy().await;

    assert!(cached_bytes(&fs, &p("/dir/f")).is_none());
    assert!(fs.cache().mirror().is_dir());
    assert!(fs.store().inner.contains("dir/f"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nonblocking_open_reports_contention() {
    use nix::fcntl::{Flock, FlockArg};

    let store = FaultyStore::flat();
    store.inner.put_object("busy", "data");
    let (fs, _tmp) = mount(store).await;
    let local = fs.ensure_local(&p("/busy")).await.unwrap();
    let held = Flock::lock(std::fs::File::open(&local).unwrap(), FlockArg::LockExclusive).unwrap();

    let err = fs
        .open(&p("/busy"), OpenFlags::RDONLY | OpenFlags::NONBLOCK)
        .await
        .unwrap_err();

    assert!(matches!(err, FsError::Contention));
    assert_eq!(err.errno(), libc::EWOULDBLOCK);
    assert!(fs.handles().is_empty());

    drop(held);
    let handle = fs
        .open(&p("/busy"), OpenFlags::RDONLY | OpenFlags::NONBLOCK)
        .await
        .unwrap();
    fs.release(handle).await.unwrap();
}
