//! Build script for podlx-cri
//!
//! Compiles the CRI protobuf definitions.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Compile the CRI proto to OUT_DIR (standard location for generated code)
    tonic_build::configure()
        .build_server(true)  // We're the runtime
        .build_client(false) // Kubelet is the only client
        .compile(&["proto/runtime/v1alpha2/api.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/runtime/v1alpha2/api.proto");

    Ok(())
}
