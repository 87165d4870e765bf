fn main() -> std::io::Result<()> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/config.proto", "proto/gossip.proto"], &["proto/"])?;
    Ok(())
}
