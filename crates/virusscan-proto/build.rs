fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_client(false)
        .build_server(true)
        .compile(&["proto/ext_proc.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/ext_proc.proto");
    Ok(())
}
