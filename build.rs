fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Compiling protos...");
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/raft/v1beta1/log.proto", "proto/raft/v1beta1/raft.proto"],
                 &["proto"])?;
    println!("Finished compiling protos");
    Ok(())
}
