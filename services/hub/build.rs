use std::io::Result;

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=proto/workloads.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .bytes(["."])
        .compile(&["proto/workloads.proto"], &["proto/"])?;
    Ok(())
}
