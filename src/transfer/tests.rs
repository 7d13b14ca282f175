//! Transfer Module Tests
//!
//! ## Test Scopes
//! - **Manifest**: wire layout, failure reports and validation of incoming manifests.
//! - **Tracker**: completion fires exactly once, failure reports per node, remote batches
//!   are buffered until complete.
//! - **Loopback Transfers**: byte identity of streamed files, routing by descriptor,
//!   refused tasks, and rejection of phase-2 connections from foreign peers.

#[cfg(test)]
mod tests {
    use crate::config::Settings;
    use crate::error::BatchError;
    use crate::transfer::protocol::*;
    use crate::transfer::receiver::TransferReceiver;
    use crate::transfer::sender::TransferClient;
    use crate::transfer::tracker::DispatchTracker;
    use crate::transfer::types::*;
    use crate::worker::types::ExportOverrides;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn magic() -> Magic {
        Magic::from_settings(&Settings::default().network)
    }

    fn task(asset: &str, batch_size: usize, batch_id: Uuid) -> RemoteTask {
        RemoteTask {
            magic: magic().task,
            master: LOCALHOST,
            asset: asset.to_string(),
            overrides: ExportOverrides::default(),
            batch_size,
            batch_id,
        }
    }

    fn result(file: &str, subdir: &str) -> Descriptor {
        Descriptor::Result(ResultDescriptor {
            magic: magic().result,
            file: file.to_string(),
            subdir: subdir.to_string(),
        })
    }

    fn settings(dir: &Path) -> Settings {
        let settings = Settings {
            staging_dir: dir.join("staging"),
            export_path: dir.join("export"),
            share_cpus: true,
            ..Settings::default()
        };
        std::fs::create_dir_all(&settings.export_path).unwrap();
        settings
    }

    fn client() -> TransferClient {
        TransferClient::new(&Settings::default().network).with_budget(Duration::from_secs(2))
    }

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn noise(len: usize) -> Vec<u8> {
        (0..len).map(|_| rand::random::<u8>()).collect()
    }

    // ============================================================
    // MANIFEST TESTS
    // ============================================================

    #[test]
    fn test_manifest_wire_layout() {
        let manifest = Manifest {
            files: vec![FileEntry("crate.fbx".into(), 1234)],
            descriptors: vec![result("crate.fbx", "props")],
            ..Manifest::default()
        };

        let encoded = encode_manifest(&manifest).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(value[0], serde_json::json!([["crate.fbx", 1234]]));
        assert_eq!(value[1]["magic"], "ankdf89d");
        assert_eq!(value[1]["subdir"], "props");
        assert_eq!(decode_manifest(&encoded, &magic()).unwrap(), manifest);
    }

    #[test]
    fn test_task_manifest_is_classified() {
        let id = Uuid::new_v4();
        let manifest = Manifest {
            files: vec![FileEntry("a.blend".into(), 1), FileEntry("b.blend".into(), 2)],
            descriptors: vec![
                Descriptor::Task(task("a.blend", 2, id)),
                Descriptor::Task(task("b.blend", 2, id)),
            ],
            ..Manifest::default()
        };

        let decoded = decode_manifest(&encode_manifest(&manifest).unwrap(), &magic()).unwrap();

        assert_eq!(decoded.kind(), ManifestKind::Tasks);
        assert_eq!(decoded.total_bytes(), 3);
    }

    #[test]
    fn test_empty_manifest_is_a_results_report() {
        let encoded = encode_manifest(&Manifest::default()).unwrap();

        let decoded = decode_manifest(&encoded, &magic()).unwrap();

        assert_eq!(encoded, b"[[]]");
        assert_eq!(decoded.kind(), ManifestKind::Results);
    }

    #[test]
    fn test_failure_report_closes_results_manifest() {
        let manifest = Manifest {
            files: vec![FileEntry("a.fbx".into(), 3)],
            descriptors: vec![result("a.fbx", "props")],
            failures: Some(FailureReport {
                magic: magic().result,
                failed: vec!["b.blend".into()],
            }),
        };

        let encoded = encode_manifest(&manifest).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        let decoded = decode_manifest(&encoded, &magic()).unwrap();

        assert_eq!(value[2]["failed"], serde_json::json!(["b.blend"]));
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.kind(), ManifestKind::Results);
    }

    #[test]
    fn test_failure_report_must_come_last_and_only_with_results() {
        let after = br#"[[["a.fbx", 1]], {"magic": "ankdf89d", "failed": []},
                         {"magic": "ankdf89d", "file": "a.fbx", "subdir": ""}]"#;
        let tasks = Manifest {
            files: vec![FileEntry("a.blend".into(), 1)],
            descriptors: vec![Descriptor::Task(task("a.blend", 1, Uuid::new_v4()))],
            failures: Some(FailureReport {
                magic: magic().result,
                failed: Vec::new(),
            }),
        };

        assert!(matches!(decode_manifest(after, &magic()), Err(BatchError::Protocol(_))));
        assert!(matches!(encode_manifest(&tasks), Err(BatchError::Protocol(_))));
    }

    #[test]
    fn test_unknown_magic_is_rejected() {
        let raw = br#"[[["a.fbx", 1]], {"magic": "nope", "file": "a.fbx", "subdir": ""}]"#;

        let err = decode_manifest(raw, &magic()).unwrap_err();

        assert!(matches!(err, BatchError::Protocol(_)));
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        let raw = br#"[[["a.fbx", 1], ["b.fbx", 2]], {"magic": "ankdf89d", "file": "a.fbx", "subdir": ""}]"#;

        assert!(matches!(decode_manifest(raw, &magic()), Err(BatchError::Protocol(_))));
    }

    #[test]
    fn test_path_in_file_name_is_rejected() {
        let raw = br#"[[["../evil.fbx", 1]], {"magic": "ankdf89d", "file": "../evil.fbx", "subdir": ""}]"#;

        assert!(matches!(decode_manifest(raw, &magic()), Err(BatchError::Protocol(_))));
        assert!(check_file_name("crate.fbx").is_ok());
        assert!(check_file_name("dir/crate.fbx").is_err());
        assert!(check_file_name("").is_err());
    }

    #[test]
    fn test_mixed_manifest_is_rejected() {
        let manifest = Manifest {
            files: vec![FileEntry("a.blend".into(), 1), FileEntry("a.fbx".into(), 1)],
            descriptors: vec![
                Descriptor::Task(task("a.blend", 1, Uuid::new_v4())),
                result("a.fbx", ""),
            ],
            ..Manifest::default()
        };
        let encoded = encode_manifest(&manifest).unwrap();

        assert!(matches!(decode_manifest(&encoded, &magic()), Err(BatchError::Protocol(_))));
    }

    #[test]
    fn test_task_with_unknown_field_is_rejected() {
        let raw = format!(
            r#"[[["a.blend", 1]], {{"magic": "snaf68yh", "master": "10.0.0.1", "asset": "a.blend",
                 "batch_size": 1, "batch_id": "{}", "surprise": true}}]"#,
            Uuid::new_v4()
        );

        assert!(decode_manifest(raw.as_bytes(), &magic()).is_err());
    }

    #[test]
    fn test_subdir_cannot_escape_export_root() {
        assert_eq!(sanitize_subdir("props"), PathBuf::from("props"));
        assert_eq!(sanitize_subdir("../../etc"), PathBuf::from("etc"));
        assert_eq!(sanitize_subdir("/abs/path"), Path::new("abs").join("path"));
        assert_eq!(sanitize_subdir(""), PathBuf::new());
    }

    // ============================================================
    // TRACKER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_completion_fires_exactly_once() {
        // ARRANGE
        let (tracker, _batches) = DispatchTracker::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let stranger: IpAddr = "10.0.0.9".parse().unwrap();
        tracker.arm([a, b]).await;

        // ACT / ASSERT
        assert!(!tracker.record_results(a).await);
        assert!(!tracker.record_results(a).await, "duplicate report must not count");
        assert!(!tracker.record_results(stranger).await);
        assert!(!tracker.is_complete().await);
        assert_eq!(tracker.pending().await, vec![b]);

        assert!(tracker.record_results(b).await);
        assert!(!tracker.record_results(b).await);
        assert!(tracker.is_complete().await);
    }

    #[tokio::test]
    async fn test_abandoned_leg_still_completes_dispatch() {
        let (tracker, _batches) = DispatchTracker::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        tracker.arm([a, b]).await;

        assert!(!tracker.abandon(a).await);
        assert!(tracker.record_results(b).await);
    }

    #[tokio::test]
    async fn test_failures_kept_only_for_tasked_nodes() {
        let (tracker, _batches) = DispatchTracker::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let stranger: IpAddr = "10.0.0.9".parse().unwrap();
        tracker.arm([a]).await;

        tracker.record_failures(a, vec!["b.blend".into()]).await;
        tracker.record_failures(stranger, vec!["x.blend".into()]).await;
        assert!(tracker.record_results(a).await);

        let failures = tracker.take_failures().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[&a], vec!["b.blend".to_string()]);
        assert!(tracker.take_failures().await.is_empty());
    }

    #[tokio::test]
    async fn test_completion_wakes_waiter() {
        let (tracker, _batches) = DispatchTracker::new();
        tracker.arm([LOCALHOST]).await;

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.completed().await })
        };
        tracker.record_results(LOCALHOST).await;

        assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_tasks_wait_for_full_batch() {
        let (tracker, mut batches) = DispatchTracker::new();
        let id = Uuid::new_v4();

        tracker
            .record_tasks(LOCALHOST, vec![task("a.blend", 3, id), task("b.blend", 3, id)])
            .await;
        assert!(batches.try_recv().is_err());
        assert_eq!(tracker.buffered_tasks().await, 2);

        tracker.record_tasks(LOCALHOST, vec![task("c.blend", 3, id)]).await;

        let batch = batches.try_recv().expect("batch should be complete");
        assert_eq!(batch.batch_id, id);
        assert_eq!(batch.tasks.len(), 3);
        assert_eq!(tracker.buffered_tasks().await, 0);
    }

    #[tokio::test]
    async fn test_new_batch_discards_stale_partial_batch() {
        let (tracker, mut batches) = DispatchTracker::new();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();

        tracker.record_tasks(LOCALHOST, vec![task("a.blend", 2, old)]).await;
        tracker.record_tasks(LOCALHOST, vec![task("b.blend", 1, new)]).await;

        let batch = batches.try_recv().unwrap();
        assert_eq!(batch.batch_id, new);
        assert_eq!(batch.tasks.len(), 1);
    }

    // ============================================================
    // LOOPBACK TRANSFER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_results_round_trip_is_byte_identical() {
        // ARRANGE: master receiver waiting for one node
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let (tracker, _batches) = DispatchTracker::new();
        tracker.arm([LOCALHOST]).await;

        let receiver = TransferReceiver::bind("127.0.0.1:0".parse().unwrap(), &settings, tracker.clone())
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = receiver.start(cancel.clone());

        let outbox = dir.path().join("outbox");
        let big = noise(300_000);
        let small = b"tiny".to_vec();
        let files = vec![
            OutgoingFile {
                path: write_file(&outbox.join("props"), "barrel.fbx", &big),
                descriptor: result("barrel.fbx", "props"),
            },
            OutgoingFile {
                path: write_file(&outbox.join("vehicles"), "cart.fbx", &small),
                descriptor: result("cart.fbx", "vehicles"),
            },
            OutgoingFile {
                path: write_file(&outbox, "empty.fbx", b""),
                descriptor: result("empty.fbx", ""),
            },
        ];

        // ACT
        client().send(addr, files).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), tracker.completed())
            .await
            .expect("completion should be signalled");
        cancel.cancel();
        let _ = handle.await;

        // ASSERT
        let export = &settings.export_path;
        assert_eq!(std::fs::read(export.join("props").join("barrel.fbx")).unwrap(), big);
        assert_eq!(std::fs::read(export.join("vehicles").join("cart.fbx")).unwrap(), small);
        assert_eq!(std::fs::read(export.join("empty.fbx")).unwrap(), Vec::<u8>::new());
        assert!(tracker.is_complete().await);
    }

    #[tokio::test]
    async fn test_tasks_are_staged_and_batched() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let (tracker, mut batches) = DispatchTracker::new();
        let receiver = TransferReceiver::bind("127.0.0.1:0".parse().unwrap(), &settings, tracker)
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = receiver.start(cancel.clone());

        let id = Uuid::new_v4();
        let source = dir.path().join("assets");
        let files = vec![
            OutgoingFile {
                path: write_file(&source, "crate.blend", b"BLENDER-crate"),
                descriptor: Descriptor::Task(task("crate.blend", 2, id)),
            },
            OutgoingFile {
                path: write_file(&source, "barrel.blend", b"BLENDER-barrel"),
                descriptor: Descriptor::Task(task("barrel.blend", 2, id)),
            },
        ];

        client().send(addr, files).await.unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(5), batches.recv())
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();
        let _ = handle.await;

        assert_eq!(batch.master, LOCALHOST);
        assert_eq!(batch.tasks.len(), 2);
        assert_eq!(
            std::fs::read(settings.staging_dir.join("crate.blend")).unwrap(),
            b"BLENDER-crate"
        );
        assert!(settings.staging_dir.join("barrel.blend").is_file());
    }

    #[tokio::test]
    async fn test_empty_report_completes_master() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let (tracker, _batches) = DispatchTracker::new();
        tracker.arm([LOCALHOST]).await;
        let receiver = TransferReceiver::bind("127.0.0.1:0".parse().unwrap(), &settings, tracker.clone())
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = receiver.start(cancel.clone());

        client().send(addr, Vec::new()).await.unwrap();
        let completed = tokio::time::timeout(Duration::from_secs(5), tracker.completed()).await;
        cancel.cancel();
        let _ = handle.await;

        assert!(completed.is_ok());
    }

    #[tokio::test]
    async fn test_tasks_refused_when_not_sharing() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let (tracker, _batches) = DispatchTracker::new();
        let receiver = TransferReceiver::bind("127.0.0.1:0".parse().unwrap(), &settings, tracker)
            .await
            .unwrap()
            .with_accept_tasks(false);
        let addr = receiver.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = receiver.start(cancel.clone());

        let files = vec![OutgoingFile {
            path: write_file(&dir.path().join("assets"), "a.blend", b"x"),
            descriptor: Descriptor::Task(task("a.blend", 1, Uuid::new_v4())),
        }];
        let outcome = TransferClient::new(&settings.network)
            .with_budget(Duration::from_millis(500))
            .send(addr, files)
            .await;
        cancel.cancel();
        let _ = handle.await;

        assert!(matches!(outcome, Err(BatchError::Transfer { .. })));
        assert!(!settings.staging_dir.join("a.blend").exists());
    }

    #[tokio::test]
    async fn test_unreachable_peer_resets_leg_within_budget() {
        // Nothing listens on the port of a dropped listener.
        let addr: SocketAddr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let started = std::time::Instant::now();
        let outcome = TransferClient::new(&Settings::default().network)
            .with_budget(Duration::from_millis(400))
            .send(addr, Vec::new())
            .await;

        assert!(matches!(outcome, Err(BatchError::Transfer { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_phase_two_from_foreign_peer_is_dropped() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpSocket, TcpStream};

        // ARRANGE
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let (tracker, _batches) = DispatchTracker::new();
        let receiver = TransferReceiver::bind("127.0.0.1:0".parse().unwrap(), &settings, tracker)
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = receiver.start(cancel.clone());

        let manifest = Manifest {
            files: vec![FileEntry("a.fbx".into(), 5)],
            descriptors: vec![result("a.fbx", "")],
            ..Manifest::default()
        };

        // Phase 1 from 127.0.0.1.
        let mut phase_one = TcpStream::connect(addr).await.unwrap();
        phase_one.write_all(&encode_manifest(&manifest).unwrap()).await.unwrap();
        phase_one.shutdown().await.unwrap();
        let mut ack = [0u8; 1];
        assert_eq!(phase_one.read(&mut ack).await.unwrap(), 1);

        // ACT: a stranger from 127.0.0.2 tries to deliver the bytes
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.2:0".parse().unwrap()).unwrap();
        let mut stranger = socket.connect(addr).await.unwrap();
        let _ = stranger.write_all(b"EVIL!").await;
        let _ = stranger.shutdown().await;
        let mut reply = Vec::new();
        let _ = stranger.read_to_end(&mut reply).await;

        // Then the real sender does.
        let mut phase_two = TcpStream::connect(addr).await.unwrap();
        phase_two.write_all(b"HELLO").await.unwrap();
        phase_two.shutdown().await.unwrap();
        let mut ack = [0u8; 1];
        assert_eq!(phase_two.read(&mut ack).await.unwrap(), 1);
        cancel.cancel();
        let _ = handle.await;

        // ASSERT
        assert!(reply.is_empty(), "stranger must not be acknowledged");
        assert_eq!(std::fs::read(settings.export_path.join("a.fbx")).unwrap(), b"HELLO");
    }
}
