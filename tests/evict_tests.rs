#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::time::{Duration, SystemTime};

use bytesize::ByteSize;
use filetime::FileTime;

use blob_fs::fs::{BlobFs, OpenFlags};
use blob_fs::path::FsPath;
use common::{FaultyStore, Op, is_cached, mount_with, p};

/// Pretend `path` was last touched `age` ago.
fn age_local(fs: &BlobFs<FaultyStore>, path: &FsPath, age: Duration) {
    let when = FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_times(fs.cache().local_path(path), when, when).unwrap();
}

fn seeded(names: &[&str], size: usize) -> FaultyStore {
    let store = FaultyStore::flat();
    for name in names {
        store.inner.put_object(name, vec![1u8; size]);
    }
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn evicts_oldest_until_low_water() {
    let (fs, _tmp) = mount_with(seeded(&["a", "b", "c"], 60), |cfg| {
        cfg.cache_capacity = Some(ByteSize::b(100));
    })
    .await;
    for (name, age) in [("/a", 30), ("/b", 20), ("/c", 10)] {
        fs.ensure_local(&p(name)).await.unwrap();
        age_local(&fs, &p(name), Duration::from_secs(age));
    }

    let report = fs.evictor().run_once().await.unwrap();

    assert_eq!(report.evicted, 2);
    assert_eq!(report.bytes, 120);
    assert!(!is_cached(&fs, &p("/a")));
    assert!(!is_cached(&fs, &p("/b")));
    assert!(is_cached(&fs, &p("/c")));
    assert_eq!(fs.usage().total_bytes(), 60);
    for name in ["a", "b", "c"] {
        assert!(fs.store().inner.contains(name), "{name} must stay remote");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nothing_happens_below_high_water() {
    let (fs, _tmp) = mount_with(seeded(&["a"], 50), |cfg| {
        cfg.cache_capacity = Some(ByteSize::b(100));
    })
    .await;
    fs.ensure_local(&p("/a")).await.unwrap();

    let report = fs.evictor().run_once().await.unwrap();

    assert_eq!(report.evicted, 0);
    assert!(is_cached(&fs, &p("/a")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_file_is_skipped_until_released() {
    let (fs, _tmp) = mount_with(seeded(&["a", "b"], 60), |cfg| {
        cfg.cache_capacity = Some(ByteSize::b(100));
    })
    .await;
    let held = fs.open(&p("/a"), OpenFlags::RDONLY).await.unwrap();
    fs.ensure_local(&p("/b")).await.unwrap();
    age_local(&fs, &p("/a"), Duration::from_secs(60));
    age_local(&fs, &p("/b"), Duration::from_secs(30));

    let report = fs.evictor().run_once().await.unwrap();

    assert_eq!(report.evicted, 1);
    assert!(is_cached(&fs, &p("/a")));
    assert!(!is_cached(&fs, &p("/b")));
    assert_eq!(fs.read(held, 0, 100).await.unwrap().len(), 60);

    fs.release(held).await.unwrap();
    fs.ensure_local(&p("/b")).await.unwrap();
    // The read above refreshed the access time.
    age_local(&fs, &p("/a"), Duration::from_secs(60));
    let report = fs.evictor().run_once().await.unwrap();

    assert_eq!(report.evicted, 1);
    assert!(!is_cached(&fs, &p("/a")));
    assert!(is_cached(&fs, &p("/b")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dirty_file_is_never_evicted() {
    let (fs, _tmp) = mount_with(FaultyStore::flat(), |cfg| {
        cfg.cache_capacity = Some(ByteSize::b(100));
    })
    .await;
    fs.store().fail(Op::Upload, 500);
    let (handle, _) = fs.create(&p("/unsaved"), 0o644).await.unwrap();
    fs.write(handle, 0, &[9u8; 200]).await.unwrap();
    assert!(fs.release(handle).await.is_err());

    let report = fs.evictor().run_once().await.unwrap();

    assert_eq!(report.evicted, 0);
    assert!(is_cached(&fs, &p("/unsaved")));
    assert!(fs.usage().is_dirty(&p("/unsaved")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_files_go_without_pressure() {
    let (fs, _tmp) = mount_with(seeded(&["old", "new"], 10), |cfg| {
        cfg.cache_capacity = Some(ByteSize::gib(1));
        cfg.stale_after = Some(Duration::from_secs(3600));
    })
    .await;
    fs.ensure_local(&p("/old")).await.unwrap();
    fs.ensure_local(&p("/new")).await.unwrap();
    age_local(&fs, &p("/old"), Duration::from_secs(7200));

    let report = fs.evictor().run_once().await.unwrap();

    assert_eq!(report.evicted, 1);
    assert!(!is_cached(&fs, &p("/old")));
    assert!(is_cached(&fs, &p("/new")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn evicted_file_is_downloaded_again() {
    let (fs, _tmp) = mount_with(seeded(&["a"], 200), |cfg| {
        cfg.cache_capacity = Some(ByteSize::b(100));
    })
    .await;
    fs.ensure_local(&p("/a")).await.unwrap();
    fs.evictor().run_once().await.unwrap();
    assert!(!is_cached(&fs, &p("/a")));

    let handle = fs.open(&p("/a"), OpenFlags::RDONLY).await.unwrap();

    assert_eq!(fs.store().calls(Op::Download), 2);
    assert_eq!(fs.read(handle, 0, 1024).await.unwrap().len(), 200);
    fs.release(handle).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_loop_evicts_and_stops() {
    let (fs, _tmp) = mount_with(seeded(&["a"], 200), |cfg| {
        cfg.cache_capacity = Some(ByteSize::b(100));
        cfg.evict_interval = Duration::from_millis(10);
    })
    .await;
    fs.ensure_local(&p("/a")).await.unwrap();

    let evictor = fs.evictor().spawn();
    for _ in 0..200 {
        if !is_cached(&fs, &p("/a")) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    evictor.stop().await;

    assert!(!is_cached(&fs, &p("/a")));
    assert_eq!(fs.usage().total_bytes(), 0);
}
