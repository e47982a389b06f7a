fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/peerswap/v1/peerswap.proto"], &["proto"])?;

    Ok(())
}
