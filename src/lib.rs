pub mod comms {
    tonic::include_proto!("resiliency");
}

pub mod adapter;
pub mod breaker;
pub mod deadline;
pub mod error;
pub mod metadata;
pub mod port;
