use fsstore::{FsStore, ObjectLayer, StorageConfig, StorageError};
use std::collections::HashMap;

async fn mount(root: &std::path::Path) -> FsStore {
    let config = StorageConfig {
        root: root.to_string_lossy().into_owned(),
        min_free_space: 0,
        min_free_inodes: 0,
        ..StorageConfig::default()
    };
    FsStore::new(&config).await.unwrap()
}

async fn put_bytes(store: &FsStore, bucket: &str, key: &str, body: &[u8]) {
    let mut reader = body;
    store
        .put_object(bucket, key, body.len() as i64, &mut reader, HashMap::new(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn put_then_get_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = mount(dir.path()).await;

    store.make_bucket("photos").await.unwrap();
    let mut body: &[u8] = b"hello";
    let info = store
        .put_object("photos", "a.txt", 5, &mut body, HashMap::new(), None)
        .await
        .unwrap();
    assert_eq!(info.size, 5);
    assert_eq!(info.md5_sum, "5d41402abc4b2a76b9719d911017c592");

    let mut sink = Vec::new();
    store
        .get_object("photos", "a.txt", 0, -1, &mut sink)
        .await
        .unwrap();
    assert_eq!(sink, b"hello");
}

#[tokio::test]
async fn directory_object_appears_as_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let store = mount(dir.path()).await;
    store.make_bucket("photos").await.unwrap();

    let mut empty: &[u8] = b"";
    store
        .put_object("photos", "dir/", 0, &mut empty, HashMap::new(), None)
        .await
        .unwrap();

    let out = store.list_objects("photos", "", "", "/", 100).await.unwrap();
    assert!(out.objects.is_empty());
    assert_eq!(out.prefixes, vec!["dir/"]);
}

#[tokio::test]
async fn delimiter_listing_groups_subkeys() {
    let dir = tempfile::tempdir().unwrap();
    let store = mount(dir.path()).await;
    store.make_bucket("photos").await.unwrap();
    for key in ["a", "b/1", "b/2", "c"] {
        put_bytes(&store, "photos", key, b"data").await;
    }

    let out = store.list_objects("photos", "", "", "/", 100).await.unwrap();
    let objects: Vec<&str> = out.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(objects, vec!["a", "c"]);
    assert_eq!(out.prefixes, vec!["b/"]);
}

#[tokio::test]
async fn paged_listing_advances_by_marker() {
    let dir = tempfile::tempdir().unwrap();
    let store = mount(dir.path()).await;
    store.make_bucket("photos").await.unwrap();
    for key in ["a", "b/1", "b/2", "c"] {
        put_bytes(&store, "photos", key, b"data").await;
    }

    let first = store.list_objects("photos", "", "", "/", 2).await.unwrap();
    assert!(first.is_truncated);
    assert_eq!(first.next_marker, "b/");
    assert_eq!(
        first.objects.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
        vec!["a"]
    );
    assert_eq!(first.prefixes, vec!["b/"]);

    let second = store.list_objects("photos", "", "b/", "/", 2).await.unwrap();
    assert!(!second.is_truncated);
    assert_eq!(
        second.objects.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
        vec!["c"]
    );
    assert!(second.prefixes.is_empty());
}

#[tokio::test]
async fn metadata_only_copy_updates_meta_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let store = mount(dir.path()).await;
    store.make_bucket("photos").await.unwrap();
    put_bytes(&store, "photos", "a.txt", b"hello").await;
    let before = store.get_object_info("photos", "a.txt").await.unwrap();

    let mut metadata = HashMap::new();
    metadata.insert("x-amz-meta-lang".to_string(), "en".to_string());
    store
        .copy_object("photos", "a.txt", "photos", "a.txt", metadata)
        .await
        .unwrap();

    let after = store.get_object_info("photos", "a.txt").await.unwrap();
    assert_eq!(after.user_defined.get("x-amz-meta-lang").unwrap(), "en");
    assert_eq!(after.md5_sum, before.md5_sum);
    assert_eq!(after.mod_time, before.mod_time);

    let mut sink = Vec::new();
    store
        .get_object("photos", "a.txt", 0, -1, &mut sink)
        .await
        .unwrap();
    assert_eq!(sink, b"hello");
}

#[tokio::test]
async fn reader_is_not_queued_behind_an_in_flight_put() {
    use std::time::{Duration, Instant};
    use tokio::io::AsyncWriteExt;

    let dir = tempfile::tempdir().unwrap();
    let store = mount(dir.path()).await;
    store.make_bucket("photos").await.unwrap();
    put_bytes(&store, "photos", "hot.bin", b"before").await;

    // A put fed through a pipe parks mid-stream with the exclusive
    // sidecar lock held.
    let (mut feed, mut body) = tokio::io::duplex(64);
    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .put_object("photos", "hot.bin", 5, &mut body, HashMap::new(), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let attempt = Instant::now();
    let mut sink = Vec::new();
    let result = store.get_object("photos", "hot.bin", 0, -1, &mut sink).await;
    assert!(
        attempt.elapsed() < Duration::from_secs(2),
        "reader blocked for the writer's duration"
    );
    match result {
        Err(StorageError::LockContention(_)) => {}
        other => panic!("expected lock contention, got {other:?}"),
    }

    feed.write_all(b"after").await.unwrap();
    feed.shutdown().await.unwrap();
    writer.await.unwrap().unwrap();

    let mut sink = Vec::new();
    store
        .get_object("photos", "hot.bin", 0, -1, &mut sink)
        .await
        .unwrap();
    assert_eq!(sink, b"after");
}

#[tokio::test]
async fn competing_puts_leave_one_complete_body() {
    let dir = tempfile::tempdir().unwrap();
    let store = mount(dir.path()).await;
    store.make_bucket("photos").await.unwrap();

    const N: usize = 256 * 1024;
    let tasks: Vec<_> = [b'a', b'b']
        .into_iter()
        .map(|fill| {
            let store = store.clone();
            tokio::spawn(async move {
                let body = vec![fill; N];
                let mut reader: &[u8] = &body;
                store
                    .put_object("photos", "big", N as i64, &mut reader, HashMap::new(), None)
                    .await
            })
        })
        .collect();

    let mut successes = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => successes += 1,
            Err(StorageError::LockContention(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(successes >= 1);

    let mut sink = Vec::new();
    store
        .get_object("photos", "big", 0, -1, &mut sink)
        .await
        .unwrap();
    assert_eq!(sink.len(), N);
    assert!(sink.iter().all(|&b| b == sink[0]), "body must not interleave");
}

#[tokio::test]
async fn cross_bucket_copy_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let store = mount(dir.path()).await;
    store.make_bucket("src-bucket").await.unwrap();
    store.make_bucket("dst-bucket").await.unwrap();
    let body: Vec<u8> = (0..2_000_000u32).map(|i| (i % 251) as u8).collect();
    put_bytes(&store, "src-bucket", "payload.bin", &body).await;

    let info = store
        .copy_object(
            "src-bucket",
            "payload.bin",
            "dst-bucket",
            "copied/payload.bin",
            HashMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(info.size as usize, body.len());

    let mut sink = Vec::new();
    store
        .get_object("dst-bucket", "copied/payload.bin", 0, -1, &mut sink)
        .await
        .unwrap();
    assert_eq!(sink, body);

    store
        .delete_object("dst-bucket", "copied/payload.bin")
        .await
        .unwrap();
    store.delete_object("src-bucket", "payload.bin").await.unwrap();
    store.delete_bucket("dst-bucket").await.unwrap();
    store.delete_bucket("src-bucket").await.unwrap();

    let buckets = store.list_buckets().await.unwrap();
    assert!(buckets.is_empty());

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn listing_pages_are_strictly_ascending_without_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let store = mount(dir.path()).await;
    store.make_bucket("photos").await.unwrap();

    let mut expected = Vec::new();
    for a in ["alpha", "beta", "gamma"] {
        for i in 0..7 {
            let key = format!("{a}/{i}");
            put_bytes(&store, "photos", &key, b"x").await;
            expected.push(key);
        }
    }
    expected.sort();

    let mut seen = Vec::new();
    let mut marker = String::new();
    loop {
        let page = store
            .list_objects("photos", "", &marker, "", 4)
            .await
            .unwrap();
        seen.extend(page.objects.iter().map(|o| o.name.clone()));
        if !page.is_truncated {
            break;
        }
        marker = page.next_marker.clone();
    }
    assert_eq!(seen, expected);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}
