fn main() {
    println!("cargo:rerun-if-changed=./jobworker.proto");
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }
    tonic_build::compile_protos("./jobworker.proto")
        .unwrap_or_else(|err| panic!("Failed to compile protos {:?}", err));
}
