//! Concrete [`crate::comm::Communicator`] transports.
//!
//! [`loopback`] is an in-process implementation used by this crate's own
//! tests and the `sandglass-demo` binary to exercise multi-rank exchange
//! without a real network. [`tcp`] is a pure-Rust TCP transport. [`zmq_host`]
//! is the zmq-backed REQ/REP transport, for deployments that prefer zmq's
//! connection handling over raw TCP framing.

pub mod loopback;
pub mod tcp;
pub mod zmq_host;
