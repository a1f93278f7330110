//! Generated gRPC bindings for the jobworker wire API.

tonic::include_proto!("jobworker.v1");
