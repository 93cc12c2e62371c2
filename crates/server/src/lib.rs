//! gRPC surface and process harness for forgecache
//!
//! The handler adapts the `BuildCache` service onto the cache data plane;
//! the harness in `main.rs` wires storage, cache, pruner, health, and
//! metrics together and owns graceful shutdown.

pub mod handler;
pub mod metrics_http;
pub mod shutdown;
pub mod telemetry;

/// Generated protobuf types for the BuildCache service
pub mod proto {
    tonic::include_proto!("forgecache.v1");

    /// Descriptor set for gRPC reflection
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("forgecache_descriptor");
}
