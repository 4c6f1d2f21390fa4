fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_build::configure()
        .build_client(false)
        .compile_protos(
            &["proto/runtime_v1.proto", "proto/runtime_v1alpha2.proto"],
            &["proto"],
        )?;
    Ok(())
}
