fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let descriptor_path =
        std::path::PathBuf::from(std::env::var("OUT_DIR")?).join("forgecache_descriptor.bin");

    // Compile the BuildCache protos with tonic-build; the client is used
    // by the integration tests, the descriptor set feeds reflection
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(descriptor_path)
        .compile_protos(&["proto/forgecache/v1/forgecache.proto"], &["proto"])?;

    Ok(())
}
