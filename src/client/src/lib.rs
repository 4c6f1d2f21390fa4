//! Client for the porto container daemon.
//!
//! The daemon exposes a length-prefixed protobuf RPC on a local stream
//! socket. This crate provides the wire messages ([`rpc`]), the framing
//! ([`framing`]) and a typed per-connection client ([`PortoClient`]).

pub mod client;
pub mod error;
pub mod framing;
pub mod rpc;

pub use client::{PortoClient, PropertyValue, VolumeDescription};
pub use error::{PortoError, Result};
pub use rpc::EError;
