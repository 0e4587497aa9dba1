fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Message types only; the duplex call is issued by transport::grpc.
    tonic_build::configure()
        .build_server(false)
        .build_client(false)
        .compile_protos(&["proto/creature.proto"], &["proto"])?;
    Ok(())
}
