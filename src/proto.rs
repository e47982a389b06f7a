pub mod v1 {
    tonic::include_proto!("peerswap.v1");
}
