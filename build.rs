fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=proto/");

    // Use the vendored protoc binary so the build does not depend on a
    // system-installed protoc.
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }

    // Compile the proto files from the local proto/ directory
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["proto/waterline/v1/quota.proto"], &["proto"])?;

    Ok(())
}
