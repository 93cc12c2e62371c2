//! End-to-end tests over an in-process gRPC server
//!
//! Boots the BuildCache service on a loopback listener with the
//! in-memory store and drives it with the generated client: round
//! trips, misses, batch probes, large chunked transfers, and digest
//! enforcement.

use forgecache_cache::CacheService;
use forgecache_core::{Config, MetricsCollector};
use forgecache_server::handler::BuildCacheHandler;
use forgecache_server::proto::build_cache_client::BuildCacheClient;
use forgecache_server::proto::build_cache_server::BuildCacheServer;
use forgecache_server::proto::{
    put_request, ContainsRequest, Digest, GetActionResultRequest, GetRequest, PutMetadata,
    PutRequest, UpdateActionResultRequest,
};
use rand::RngCore;
use sha2::{Digest as Sha2Digest, Sha256};
use std::sync::Arc;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Server};
use tonic::Code;

const CHUNK_SIZE: usize = 64 * 1024;

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn digest_of(data: &[u8]) -> Digest {
    Digest {
        hash: sha256_hex(data),
        size_bytes: data.len() as i64,
    }
}

/// Start a server over a fresh MemoryStore; returns a connected client
async fn start_server(config: Config) -> BuildCacheClient<Channel> {
    let store = Arc::new(forgecache_storage::MemoryStore::new());
    let metrics = MetricsCollector::new();
    let service = Arc::new(CacheService::new(store, metrics.clone()));
    let handler = BuildCacheHandler::new(service, Arc::new(config), metrics);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(
        Server::builder()
            .add_service(BuildCacheServer::new(handler))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    BuildCacheClient::connect(format!("http://{addr}"))
        .await
        .expect("connect to in-process server")
}

fn test_config() -> Config {
    Config {
        bucket: "test-bucket".into(),
        ..Config::default()
    }
}

fn put_frames(digest: Digest, instance: &str, data: &[u8]) -> Vec<PutRequest> {
    let mut frames = vec![PutRequest {
        payload: Some(put_request::Payload::Metadata(PutMetadata {
            digest: Some(digest),
            instance_name: instance.to_string(),
            content_type: "application/octet-stream".to_string(),
        })),
    }];
    for chunk in data.chunks(CHUNK_SIZE) {
        frames.push(PutRequest {
            payload: Some(put_request::Payload::Data(chunk.to_vec())),
        });
    }
    frames
}

async fn get_all(
    client: &mut BuildCacheClient<Channel>,
    digest: Digest,
    instance: &str,
) -> Result<Vec<u8>, tonic::Status> {
    let mut stream = client
        .get(GetRequest {
            digest: Some(digest),
            instance_name: instance.to_string(),
        })
        .await?
        .into_inner();

    let mut data = Vec::new();
    while let Some(frame) = stream.message().await? {
        assert!(
            frame.data.len() <= CHUNK_SIZE,
            "frame exceeded the chunk size"
        );
        data.extend_from_slice(&frame.data);
    }
    Ok(data)
}

#[tokio::test]
async fn test_put_then_get_round_trip() {
    let mut client = start_server(test_config()).await;
    let payload = b"Hello, Cache!";
    let digest = digest_of(payload);

    let response = client
        .put(tokio_stream::iter(put_frames(
            digest.clone(),
            "teamA",
            payload,
        )))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.size, payload.len() as i64);
    assert_eq!(response.digest.unwrap().hash, digest.hash);

    let data = get_all(&mut client, digest, "teamA").await.unwrap();
    assert_eq!(data, payload);
}

#[tokio::test]
async fn test_get_miss_is_not_found() {
    let mut client = start_server(test_config()).await;
    let digest = Digest {
        hash: "0".repeat(64),
        size_bytes: 13,
    };

    let err = get_all(&mut client, digest, "teamA").await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_get_without_digest_is_invalid() {
    let mut client = start_server(test_config()).await;
    let err = client
        .get(GetRequest {
            digest: None,
            instance_name: "teamA".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_contains_batch_preserves_order() {
    let mut client = start_server(test_config()).await;
    let present = b"here".as_slice();
    let d1 = digest_of(present);
    let d2 = digest_of(b"not here");

    client
        .put(tokio_stream::iter(put_frames(d1.clone(), "teamA", present)))
        .await
        .unwrap();

    let response = client
        .contains(ContainsRequest {
            digests: vec![d1.clone(), d2.clone()],
            instance_name: "teamA".into(),
        })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.results.len(), 2);
    assert!(response.results[0].exists);
    assert_eq!(response.results[0].digest.as_ref().unwrap().hash, d1.hash);
    assert!(!response.results[1].exists);
    assert_eq!(response.results[1].digest.as_ref().unwrap().hash, d2.hash);
}

#[tokio::test]
async fn test_contains_empty_list_is_invalid() {
    let mut client = start_server(test_config()).await;
    let err = client
        .contains(ContainsRequest {
            digests: vec![],
            instance_name: "teamA".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_large_object_streams_in_chunks() {
    let mut client = start_server(test_config()).await;

    let mut payload = vec![0u8; 10 * 1024 * 1024];
    rand::rng().fill_bytes(&mut payload);
    let digest = digest_of(&payload);

    let response = client
        .put(tokio_stream::iter(put_frames(
            digest.clone(),
            "teamA",
            &payload,
        )))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.size, payload.len() as i64);

    let data = get_all(&mut client, digest, "teamA").await.unwrap();
    assert_eq!(data.len(), payload.len());
    assert_eq!(data, payload);
}

#[tokio::test]
async fn test_digest_mismatch_rejected_and_absent() {
    let mut client = start_server(test_config()).await;

    // Declare the digest of "A" but stream "B"
    let declared = digest_of(b"A");
    let err = client
        .put(tokio_stream::iter(put_frames(declared.clone(), "teamA", b"B")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = get_all(&mut client, declared, "teamA").await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_put_without_metadata_is_invalid() {
    let mut client = start_server(test_config()).await;

    let frames = vec![PutRequest {
        payload: Some(put_request::Payload::Data(b"data first".to_vec())),
    }];
    let err = client.put(tokio_stream::iter(frames)).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_malformed_digest_is_invalid() {
    let mut client = start_server(test_config()).await;
    let digest = Digest {
        hash: "sha256:not-hex".into(),
        size_bytes: 4,
    };

    let err = client
        .put(tokio_stream::iter(put_frames(digest, "teamA", b"data")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_action_result_round_trip() {
    let mut client = start_server(test_config()).await;
    let action_digest = digest_of(b"the action");
    let payload = b"serialized result".to_vec();

    let response = client
        .update_action_result(UpdateActionResultRequest {
            action_digest: Some(action_digest.clone()),
            instance_name: "teamA".into(),
            payload: payload.clone(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(response.success);

    let result = client
        .get_action_result(GetActionResultRequest {
            action_digest: Some(action_digest),
            instance_name: "teamA".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(result.payload, payload);
}

#[tokio::test]
async fn test_absent_action_result_is_not_found() {
    let mut client = start_server(test_config()).await;

    let err = client
        .get_action_result(GetActionResultRequest {
            action_digest: Some(digest_of(b"never ran")),
            instance_name: "teamA".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_allowlist_rejects_unknown_instance() {
    let config = Config {
        allowed_instances: Some(vec!["teamA".into()]),
        ..test_config()
    };
    let mut client = start_server(config).await;
    let payload = b"scoped";
    let digest = digest_of(payload);

    client
        .put(tokio_stream::iter(put_frames(digest.clone(), "teamA", payload)))
        .await
        .unwrap();

    let err = get_all(&mut client, digest, "teamB").await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
}
