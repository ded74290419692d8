//! Generates the `Tunnel` gRPC client and server.
//!
//! Frame messages are plain prost derives in `src/tunnel/v1/frames.rs`, so
//! the service is described in Rust and no `protoc` is needed at build time.

fn main() {
    let proxy = tonic_build::manual::Method::builder()
        .name("proxy")
        .route_name("Proxy")
        .input_type("crate::tunnel::v1::ClientFrame")
        .output_type("crate::tunnel::v1::ServerFrame")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let tunnel = tonic_build::manual::Service::builder()
        .name("Tunnel")
        .package("burrow.tunnel.v1")
        .comment("Bidirectional byte streams between a burrow client and server.")
        .method(proxy)
        .build();

    tonic_build::manual::Builder::new()
        .build_server(true)
        .build_client(true)
        .compile(&[tunnel]);

    println!("cargo:rerun-if-changed=build.rs");
}
