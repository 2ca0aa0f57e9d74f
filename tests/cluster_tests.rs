//! Cluster Coordination Integration Tests
//!
//! Workers talking to a coordinator-owned buffer pool over in-process and
//! unix socket channels.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use assetcache::cache::{
    CacheBackend, CacheKey, CacheOptions, MembufBackend, OptionsBuilder, PartTag,
    UnimplementedCache,
};
use assetcache::cluster::protocol::{self, Envelope, Request, Response};
use assetcache::cluster::{self, ClusterWorker, Role};
use assetcache::Error;

fn make_key(n: u8) -> CacheKey {
    CacheKey::new(&[n; 16], &[0x42; 16]).unwrap()
}

fn cluster_options(capacity: u64) -> CacheOptions {
    OptionsBuilder::new()
        .set("cache_membuf.capacity", capacity)
        .set("cache_membuf.page_size", capacity)
        .set("cache_membuf.cluster", true)
        .build()
        .unwrap()
}

async fn coordinator(capacity: u64) -> MembufBackend {
    let backend = MembufBackend::new();
    backend.init(&cluster_options(capacity)).await.unwrap();
    backend
}

async fn worker(backend: &MembufBackend) -> ClusterWorker {
    let worker = cluster::local_pair(backend).unwrap();
    worker.init(&CacheOptions::defaults()).await.unwrap();
    worker
}

async fn put(backend: &dyn CacheBackend, key: CacheKey, parts: &[(PartTag, &[u8])]) -> assetcache::Result<()> {
    let trx = backend.create_transaction(key).await?;
    for (tag, data) in parts {
        let mut writer = trx.get_write_stream(*tag, data.len() as u64)?;
        writer.write(data)?;
        writer.close()?;
    }
    backend.end_transaction(&trx).await
}

async fn read(backend: &dyn CacheBackend, key: &CacheKey, tag: PartTag) -> assetcache::Result<Bytes> {
    backend.get_read_stream(key, tag).await?.read_all().await
}

// =============================================================================
// Registration
// =============================================================================

mod registration_tests {
    use super::*;

    #[tokio::test]
    async fn test_base_backend_rejects_workers() {
        let base = UnimplementedCache::new();
        let (handle, _worker_end) = cluster::channel_pair();
        assert_matches!(
            base.register_worker(handle),
            Err(Error::NotImplemented {
                backend: "cache_base",
                operation: "register_worker"
            })
        );
    }

    #[tokio::test]
    async fn test_membuf_without_cluster_rejects_workers() {
        let backend = MembufBackend::new();
        backend.init(&OptionsBuilder::new().build().unwrap()).await.unwrap();
        assert_matches!(cluster::local_pair(&backend), Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_membuf_with_cluster_routes_through_coordinator() {
        let backend = coordinator(4096).await;
        let worker = worker(&backend).await;
        let key = make_key(1);

        put(&worker, key, &[(PartTag::INFO, b"meta"), (PartTag::BINARY, b"artifact")])
            .await
            .unwrap();

        // Committed into the coordinator's pool, not the worker
        let info = backend.get_info(&key).await.unwrap().unwrap();
        assert_eq!(info.size(), 12);
        assert_eq!(read(&worker, &key, PartTag::BINARY).await.unwrap().as_ref(), b"artifact");
        assert_eq!(backend.metrics_snapshot().commits, 1);
    }

    #[tokio::test]
    async fn test_worker_requires_runtime() {
        let (_handle, worker_end) = cluster::channel_pair();
        let result = std::thread::spawn(move || ClusterWorker::connect(worker_end).map(|_| ()))
            .join()
            .unwrap();
        assert_matches!(result, Err(Error::InitError(_)));
    }
}

// =============================================================================
// Routing
// =============================================================================

mod routing_tests {
    use super::*;

    #[tokio::test]
    async fn test_workers_share_one_pool() {
        let backend = coordinator(1000).await;
        let first = worker(&backend).await;
        let second = worker(&backend).await;

        put(&first, make_key(1), &[(PartTag::BINARY, &[1u8; 600])]).await.unwrap();
        assert!(second.get_info(&make_key(1)).await.unwrap().is_some());

        // One eviction index: the second worker's commit evicts the first's entry
        put(&second, make_key(2), &[(PartTag::BINARY, &[2u8; 600])]).await.unwrap();
        assert!(first.get_info(&make_key(1)).await.unwrap().is_none());
        assert_eq!(backend.stats().unwrap().used_bytes, 600);
    }

    #[tokio::test]
    async fn test_errors_keep_their_variant() {
        let backend = coordinator(100).await;
        let worker = worker(&backend).await;

        assert!(worker.get_info(&make_key(9)).await.unwrap().is_none());
        assert_matches!(
            read(&worker, &make_key(9), PartTag::INFO).await,
            Err(Error::NotFound(_))
        );
        assert_matches!(
            put(&worker, make_key(9), &[(PartTag::BINARY, &[0u8; 101])]).await,
            Err(Error::EntryTooLarge {
                size: 101,
                capacity: 100
            })
        );
    }

    #[tokio::test]
    async fn test_incomplete_write_never_leaves_the_worker() {
        let backend = coordinator(1024).await;
        let worker = worker(&backend).await;
        let key = make_key(3);

        let trx = worker.create_transaction(key).await.unwrap();
        let _unclosed = trx.get_write_stream(PartTag::INFO, 8).unwrap();
        assert_matches!(
            worker.end_transaction(&trx).await,
            Err(Error::IncompleteWrite { part: 'i', .. })
        );
        assert!(backend.get_info(&key).await.unwrap().is_none());
        assert_eq!(backend.metrics_snapshot().aborts, 0);
    }

    #[tokio::test]
    async fn test_per_channel_fifo() {
        let backend = coordinator(1 << 20).await;
        let (handle, worker_end) = cluster::channel_pair();
        backend.register_worker(handle).unwrap();

        // Pipeline a commit and a read without waiting in between
        let mut framed = Framed::new(worker_end, protocol::codec());
        let key = make_key(4);
        let commit = Envelope {
            id: 1,
            body: Request::Commit {
                key,
                parts: vec![assetcache::cache::PartInfo {
                    tag: PartTag::BINARY,
                    size: 5,
                }],
            },
        };
        let get = Envelope {
            id: 2,
            body: Request::GetPart {
                key,
                tag: PartTag::BINARY,
            },
        };
        framed
            .send(protocol::encode_frame(&commit, &[Bytes::from_static(b"hello")]).unwrap())
            .await
            .unwrap();
        framed
            .send(protocol::encode_frame(&get, &[]).unwrap())
            .await
            .unwrap();

        let (first, _) =
            protocol::decode_frame::<Response>(framed.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.body, Response::Committed);

        let (second, payload) =
            protocol::decode_frame::<Response>(framed.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.body, Response::Part { size: 5 });
        assert_eq!(payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_concurrent_workers() {
        let backend = coordinator(1 << 20).await;
        let mut tasks = Vec::new();
        for n in 0..4u8 {
            let worker = Arc::new(worker(&backend).await);
            tasks.push(tokio::spawn(async move {
                for i in 0..10u8 {
                    let key = CacheKey::new(&[n; 16], &[i; 16]).unwrap();
                    put(worker.as_ref(), key, &[(PartTag::BINARY, &[n, i])]).await.unwrap();
                    assert_eq!(read(worker.as_ref(), &key, PartTag::BINARY).await.unwrap().as_ref(), &[n, i]);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(backend.stats().unwrap().entries, 40);
    }
}

// =============================================================================
// Large Payloads
// =============================================================================

mod large_payload_tests {
    use super::*;

    /// Several times the in-process channel buffer
    const PART: usize = 4 * 1024 * 1024;

    async fn stored_part(backend: &MembufBackend, key: CacheKey, byte: u8) {
        put(backend, key, &[(PartTag::BINARY, &vec![byte; PART][..])])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_large_read_and_commit_in_flight_together() {
        let backend = coordinator(64 * 1024 * 1024).await;
        let worker = worker(&backend).await;
        let stored = make_key(10);
        stored_part(&backend, stored, 0xA5).await;

        for round in 0..5u8 {
            let key = CacheKey::new(&[round; 16], &[0x77; 16]).unwrap();
            let incoming = vec![round; PART];
            let parts = [(PartTag::BINARY, &incoming[..])];
            let (read_back, committed) = tokio::time::timeout(Duration::from_secs(10), async {
                tokio::join!(
                    read(&worker, &stored, PartTag::BINARY),
                    put(&worker, key, &parts),
                )
            })
            .await
            .expect("worker channel stalled");

            let read_back = read_back.unwrap();
            assert_eq!(read_back.len(), PART);
            assert!(read_back.iter().all(|b| *b == 0xA5));
            committed.unwrap();
            assert_eq!(
                backend.get_info(&key).await.unwrap().unwrap().size(),
                PART as u64
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_large_calls_share_one_channel() {
        let backend = coordinator(128 * 1024 * 1024).await;
        let worker = Arc::new(worker(&backend).await);
        for n in 0..4u8 {
            stored_part(&backend, make_key(n), n).await;
        }

        let mut calls = Vec::new();
        for n in 0..4u8 {
            let reader = Arc::clone(&worker);
            calls.push(tokio::spawn(async move {
                let data = read(reader.as_ref(), &make_key(n), PartTag::BINARY).await.unwrap();
                assert_eq!(data.len(), PART);
                assert!(data.iter().all(|b| *b == n));
            }));

            let writer = Arc::clone(&worker);
            calls.push(tokio::spawn(async move {
                let key = CacheKey::new(&[0xF0 + n; 16], &[n; 16]).unwrap();
                put(writer.as_ref(), key, &[(PartTag::BINARY, &vec![n; PART][..])])
                    .await
                    .unwrap();
            }));
        }

        let results = tokio::time::timeout(Duration::from_secs(30), join_all(calls))
            .await
            .expect("worker channel stalled");
        for result in results {
            result.unwrap();
        }
        assert_eq!(backend.stats().unwrap().entries, 8);
    }
}

// =============================================================================
// Coordinator Loss
// =============================================================================

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_coordinator_gone_is_unavailable() {
        let (handle, worker_end) = cluster::channel_pair();
        let worker = ClusterWorker::connect(worker_end).unwrap();

        // The coordinator side goes away without serving anything
        drop(handle);

        assert_matches!(
            worker.get_info(&make_key(1)).await,
            Err(Error::CoordinatorUnavailable(_))
        );
        // No re-election: later calls keep failing
        assert_matches!(
            put(&worker, make_key(1), &[(PartTag::INFO, b"x")]).await,
            Err(Error::CoordinatorUnavailable(_))
        );
        assert!(worker.is_closed());
    }

    #[tokio::test]
    async fn test_in_flight_call_fails_when_coordinator_drops() {
        let (coordinator_end, worker_end) = tokio::io::duplex(64 * 1024);
        let worker = ClusterWorker::connect(worker_end).unwrap();

        // A coordinator that reads one request and exits without answering
        let coordinator = tokio::spawn(async move {
            let mut framed = Framed::new(coordinator_end, protocol::codec());
            let frame = framed.next().await.unwrap().unwrap();
            let (request, _) = protocol::decode_frame::<Request>(frame).unwrap();
            assert_eq!(request.body.operation(), "get_info");
        });

        let result = tokio::time::timeout(Duration::from_secs(5), worker.get_info(&make_key(2)))
            .await
            .unwrap();
        assert_matches!(result, Err(Error::CoordinatorUnavailable(_)));
        coordinator.await.unwrap();
    }

    #[tokio::test]
    async fn test_unix_socket_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sock");

        let Role::Coordinator(listener) = cluster::elect(&path).await.unwrap() else {
            panic!("first process must coordinate");
        };
        let backend = Arc::new(coordinator(4096).await);
        let shutdown = tokio_util::sync::CancellationToken::new();
        let acceptor = {
            let backend = Arc::clone(&backend);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                cluster::accept_workers(&listener, backend.as_ref(), shutdown).await
            })
        };

        let Role::Worker(stream) = cluster::elect(&path).await.unwrap() else {
            panic!("second process must be a worker");
        };
        let worker = ClusterWorker::connect(stream).unwrap();
        worker.init(&CacheOptions::defaults()).await.unwrap();

        put(&worker, make_key(5), &[(PartTag::RESOURCE, b"over the socket")])
            .await
            .unwrap();
        assert_eq!(
            read(backend.as_ref(), &make_key(5), PartTag::RESOURCE).await.unwrap().as_ref(),
            b"over the socket"
        );

        shutdown.cancel();
        acceptor.await.unwrap().unwrap();
    }
}
