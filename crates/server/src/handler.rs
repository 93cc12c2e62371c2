//! BuildCache gRPC handlers
//!
//! Transport framing and error-code translation only; all cache
//! semantics live in the service. This is the single point where
//! internal error kinds become `tonic::Status` codes.

use crate::proto::build_cache_server::BuildCache;
use crate::proto::{
    put_request, ActionResult, ContainsRequest, ContainsResponse, Digest as ProtoDigest,
    GetActionResultRequest, GetRequest, GetResponse, PutRequest, PutResponse,
    Status as EntryStatus, UpdateActionResultRequest, UpdateActionResultResponse,
};
use bytes::Bytes;
use forgecache_cache::CacheService;
use forgecache_core::metrics::{RpcMethod, RpcOutcome};
use forgecache_core::{Config, Digest, Error, MetricsCollector};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error};

/// Bytes per streamed `Get` chunk
const CHUNK_SIZE: usize = 64 * 1024;

/// gRPC adapter over the cache service
pub struct BuildCacheHandler {
    service: Arc<CacheService>,
    config: Arc<Config>,
    metrics: MetricsCollector,
}

impl BuildCacheHandler {
    /// Create a handler over the given service
    #[must_use]
    pub fn new(service: Arc<CacheService>, config: Arc<Config>, metrics: MetricsCollector) -> Self {
        Self {
            service,
            config,
            metrics,
        }
    }

    /// Record the terminal outcome and duration of an RPC
    fn finish(&self, method: RpcMethod, outcome: RpcOutcome, start: Instant) {
        self.metrics.record_grpc(method, outcome);
        self.metrics.observe_grpc(method, start.elapsed());
    }

    /// Enforce the instance allowlist when one is configured
    fn check_instance(&self, instance: &str) -> Result<(), Status> {
        if self.config.instance_allowed(instance) {
            Ok(())
        } else {
            debug!(instance, "Instance not in allowlist");
            Err(Status::permission_denied("instance is not permitted"))
        }
    }

    /// Translate an internal error into a transport status
    ///
    /// Backend failures are logged exactly once, here, with the method
    /// and underlying category; no store detail reaches the client.
    fn map_error(&self, method: RpcMethod, err: &Error) -> Status {
        match err {
            Error::InvalidDigest { .. }
            | Error::InvalidInstance { .. }
            | Error::InvalidRequest { .. }
            | Error::DigestMismatch { .. } => {
                debug!(method = method.as_str(), error = %err, "Rejected invalid request");
                Status::invalid_argument(err.to_string())
            }
            Error::NotFound { .. } => Status::not_found("cache miss"),
            Error::Stream { .. } => {
                error!(method = method.as_str(), error = %err, "Stream failed");
                Status::internal("failed to stream data")
            }
            Error::BackendTransient { operation, .. }
            | Error::BackendPermanent { operation, .. } => {
                error!(
                    method = method.as_str(),
                    operation = %operation,
                    error = %err,
                    "Storage backend error"
                );
                Status::internal("storage backend error")
            }
            Error::Configuration { .. } => {
                error!(method = method.as_str(), error = %err, "Configuration error");
                Status::internal("server misconfigured")
            }
        }
    }
}

fn outcome_for(err: &Error) -> RpcOutcome {
    if err.is_invalid() {
        RpcOutcome::InvalidRequest
    } else if err.is_not_found() {
        RpcOutcome::NotFound
    } else if matches!(err, Error::Stream { .. }) {
        RpcOutcome::StreamError
    } else {
        RpcOutcome::StorageError
    }
}

fn to_core_digest(digest: &ProtoDigest) -> Digest {
    Digest {
        hash: digest.hash.clone(),
        size_bytes: digest.size_bytes,
    }
}

#[tonic::async_trait]
impl BuildCache for BuildCacheHandler {
    type GetStream = ReceiverStream<Result<GetResponse, Status>>;

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<Self::GetStream>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let Some(proto_digest) = req.digest else {
            self.finish(RpcMethod::Get, RpcOutcome::InvalidRequest, start);
            return Err(Status::invalid_argument("digest is required"));
        };
        if let Err(status) = self.check_instance(&req.instance_name) {
            self.finish(RpcMethod::Get, RpcOutcome::InvalidRequest, start);
            return Err(status);
        }

        debug!(
            hash = %proto_digest.hash,
            instance = %req.instance_name,
            "Get request"
        );

        let digest = to_core_digest(&proto_digest);
        let (mut reader, entry) = match self.service.get(&req.instance_name, &digest).await {
            Ok(found) => found,
            Err(err) => {
                self.finish(RpcMethod::Get, outcome_for(&err), start);
                return Err(self.map_error(RpcMethod::Get, &err));
            }
        };

        let (tx, rx) = mpsc::channel::<Result<GetResponse, Status>>(4);
        let metrics = self.metrics.clone();
        let response_digest = ProtoDigest {
            hash: proto_digest.hash,
            size_bytes: entry.size as i64,
        };

        // Drain the backend reader into fixed-size frames; the channel
        // bound keeps the transfer paced by the client's receive rate
        tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        metrics.record_grpc(RpcMethod::Get, RpcOutcome::Success);
                        metrics.observe_grpc(RpcMethod::Get, start.elapsed());
                        break;
                    }
                    Ok(n) => {
                        metrics.add_bytes_served(n as u64);
                        let frame = GetResponse {
                            data: buf[..n].to_vec(),
                            digest: Some(response_digest.clone()),
                        };
                        if tx.send(Ok(frame)).await.is_err() {
                            // Client went away mid-transfer
                            metrics.record_grpc(RpcMethod::Get, RpcOutcome::StreamError);
                            metrics.observe_grpc(RpcMethod::Get, start.elapsed());
                            break;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to read cache data mid-stream");
                        let _ = tx
                            .send(Err(Status::internal("failed to read cache data")))
                            .await;
                        metrics.record_grpc(RpcMethod::Get, RpcOutcome::StorageError);
                        metrics.observe_grpc(RpcMethod::Get, start.elapsed());
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn put(
        &self,
        request: Request<Streaming<PutRequest>>,
    ) -> Result<Response<PutResponse>, Status> {
        let start = Instant::now();
        let mut stream = request.into_inner();

        let first = stream.message().await.map_err(|_| {
            self.finish(RpcMethod::Put, RpcOutcome::StreamError, start);
            Status::invalid_argument("failed to receive metadata")
        })?;

        let metadata = match first.and_then(|frame| frame.payload) {
            Some(put_request::Payload::Metadata(metadata)) => metadata,
            _ => {
                self.finish(RpcMethod::Put, RpcOutcome::InvalidRequest, start);
                return Err(Status::invalid_argument(
                    "first message must carry metadata",
                ));
            }
        };
        let Some(proto_digest) = metadata.digest else {
            self.finish(RpcMethod::Put, RpcOutcome::InvalidRequest, start);
            return Err(Status::invalid_argument("digest is required"));
        };
        if let Err(status) = self.check_instance(&metadata.instance_name) {
            self.finish(RpcMethod::Put, RpcOutcome::InvalidRequest, start);
            return Err(status);
        }

        debug!(
            hash = %proto_digest.hash,
            instance = %metadata.instance_name,
            content_type = %metadata.content_type,
            "Put request"
        );

        let digest = to_core_digest(&proto_digest);
        let content_type = if metadata.content_type.is_empty() {
            "application/octet-stream".to_string()
        } else {
            metadata.content_type.clone()
        };

        // One-chunk pipe between the receive loop and the store writer;
        // closing the sender signals end-of-stream, an error on either
        // side aborts both
        let (tx, rx) = mpsc::channel::<forgecache_core::Result<Bytes>>(1);

        let service = self.service.clone();
        let instance = metadata.instance_name.clone();
        let write_digest = digest.clone();
        let writer_task = tokio::spawn(async move {
            service
                .put(&instance, &write_digest, ReceiverStream::new(rx), &content_type)
                .await
        });

        loop {
            match stream.message().await {
                Ok(Some(frame)) => match frame.payload {
                    Some(put_request::Payload::Data(data)) => {
                        if tx.send(Ok(Bytes::from(data))).await.is_err() {
                            // Writer bailed; its error is picked up below
                            break;
                        }
                    }
                    _ => {
                        let _ = tx
                            .send(Err(Error::invalid_request(
                                "only data frames may follow metadata",
                            )))
                            .await;
                        break;
                    }
                },
                Ok(None) => break,
                Err(status) => {
                    let _ = tx.send(Err(Error::stream(status.to_string()))).await;
                    break;
                }
            }
        }
        drop(tx);

        let result = writer_task.await.map_err(|join_err| {
            error!(error = %join_err, "Put writer task panicked");
            self.finish(RpcMethod::Put, RpcOutcome::StorageError, start);
            Status::internal("failed to store cache entry")
        })?;

        match result {
            Ok(size) => {
                self.finish(RpcMethod::Put, RpcOutcome::Success, start);
                Ok(Response::new(PutResponse {
                    digest: Some(proto_digest),
                    size: size as i64,
                }))
            }
            Err(err) => {
                self.finish(RpcMethod::Put, outcome_for(&err), start);
                Err(self.map_error(RpcMethod::Put, &err))
            }
        }
    }

    async fn contains(
        &self,
        request: Request<ContainsRequest>,
    ) -> Result<Response<ContainsResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        if req.digests.is_empty() {
            self.finish(RpcMethod::Contains, RpcOutcome::InvalidRequest, start);
            return Err(Status::invalid_argument("at least one digest is required"));
        }
        if let Err(status) = self.check_instance(&req.instance_name) {
            self.finish(RpcMethod::Contains, RpcOutcome::InvalidRequest, start);
            return Err(status);
        }

        debug!(
            digest_count = req.digests.len(),
            instance = %req.instance_name,
            "Contains request"
        );

        let digests: Vec<Digest> = req.digests.iter().map(to_core_digest).collect();
        match self.service.contains(&req.instance_name, &digests).await {
            Ok(exists) => {
                let results = req
                    .digests
                    .into_iter()
                    .zip(exists)
                    .map(|(digest, exists)| EntryStatus {
                        digest: Some(digest),
                        exists,
                    })
                    .collect();
                self.finish(RpcMethod::Contains, RpcOutcome::Success, start);
                Ok(Response::new(ContainsResponse { results }))
            }
            Err(err) => {
                self.finish(RpcMethod::Contains, outcome_for(&err), start);
                Err(self.map_error(RpcMethod::Contains, &err))
            }
        }
    }

    async fn get_action_result(
        &self,
        request: Request<GetActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let Some(proto_digest) = req.action_digest else {
            self.finish(
                RpcMethod::GetActionResult,
                RpcOutcome::InvalidRequest,
                start,
            );
            return Err(Status::invalid_argument("action digest is required"));
        };
        if let Err(status) = self.check_instance(&req.instance_name) {
            self.finish(
                RpcMethod::GetActionResult,
                RpcOutcome::InvalidRequest,
                start,
            );
            return Err(status);
        }

        let digest = to_core_digest(&proto_digest);
        match self
            .service
            .get_action_result(&req.instance_name, &digest)
            .await
        {
            Ok(payload) => {
                self.finish(RpcMethod::GetActionResult, RpcOutcome::Success, start);
                Ok(Response::new(ActionResult { payload }))
            }
            Err(err) => {
                self.finish(RpcMethod::GetActionResult, outcome_for(&err), start);
                Err(self.map_error(RpcMethod::GetActionResult, &err))
            }
        }
    }

    async fn update_action_result(
        &self,
        request: Request<UpdateActionResultRequest>,
    ) -> Result<Response<UpdateActionResultResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let Some(proto_digest) = req.action_digest else {
            self.finish(
                RpcMethod::UpdateActionResult,
                RpcOutcome::InvalidRequest,
                start,
            );
            return Err(Status::invalid_argument("action digest is required"));
        };
        if let Err(status) = self.check_instance(&req.instance_name) {
            self.finish(
                RpcMethod::UpdateActionResult,
                RpcOutcome::InvalidRequest,
                start,
            );
            return Err(status);
        }

        let digest = to_core_digest(&proto_digest);
        match self
            .service
            .update_action_result(&req.instance_name, &digest, Bytes::from(req.payload))
            .await
        {
            Ok(_) => {
                self.finish(RpcMethod::UpdateActionResult, RpcOutcome::Success, start);
                Ok(Response::new(UpdateActionResultResponse { success: true }))
            }
            Err(err) => {
                self.finish(RpcMethod::UpdateActionResult, outcome_for(&err), start);
                Err(self.map_error(RpcMethod::UpdateActionResult, &err))
            }
        }
    }
}

/// Interceptor that rejects unauthenticated requests when the config
/// demands credentials
///
/// The harness installs this on the BuildCache service only; health and
/// reflection stay open.
pub fn auth_interceptor(
    require_auth: bool,
) -> impl Fn(Request<()>) -> Result<Request<()>, Status> + Clone {
    move |request: Request<()>| {
        if require_auth && request.metadata().get("authorization").is_none() {
            return Err(Status::unauthenticated("missing credentials"));
        }
        Ok(request)
    }
}
