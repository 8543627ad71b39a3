//! Generated gRPC service stubs for the sampling control plane. Kept as a
//! thin crate so `as-manager`/`as-server` never need `tonic-build` themselves.

tonic::include_proto!("sampler");
