fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_file = "../../proto/meshgate.proto";
    let proto_dir = "../../proto";

    println!("cargo:rerun-if-changed={}", proto_file);
    if !std::path::Path::new(proto_file).exists() {
        return Ok(());
    }

    std::fs::create_dir_all("src/generated")?;

    // Keep the checked-in output when protoc is not installed
    if let Err(e) = tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .out_dir("src/generated")
        .compile(&[proto_file], &[proto_dir])
    {
        println!("cargo:warning=using checked-in gRPC bindings: {}", e);
    }

    Ok(())
}
