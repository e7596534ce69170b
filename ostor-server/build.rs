fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 使用内置的 protoc，构建机无需安装
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    // edition 2024 中 set_var 是 unsafe 的，构建脚本是单线程的
    unsafe {
        std::env::set_var("PROTOC", &protoc);
    }

    tonic_prost_build::configure().compile_protos(&["proto/ostor.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/ostor.proto");
    Ok(())
}
