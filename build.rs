fn main() {
    protobuf_codegen::Codegen::new()
        .protoc_path(&protoc_bin_vendored::protoc_bin_path().unwrap())
        .cargo_out_dir("protos")
        .include("src")
        .input("src/protos/SophonManifest.proto")
        .run_from_script();
}
