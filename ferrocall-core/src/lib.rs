//! # Ferrocall Core
//!
//! `ferrocall-core` is an asynchronous gRPC call engine. It manages the lifecycle of individual
//! calls, client and server side, on top of a pluggable wire [`Transport`](transport::Transport).
//!
//! ## Key Components
//!
//! * **[`CallState`](call::CallState):** The per-call state machine. It enforces the ordering
//!   rules of a call (one pending read, one pending write), tracks headers, status and trailers,
//!   and decides when the transport-level call can be released.
//! * **[`CompletionQueue`](completion::CompletionQueue):** Where batches of operations are
//!   registered and where transports report their completion.
//! * **[`Channel`](client::Channel) & [`Server`](server::Server):** The client and server drivers,
//!   mapping the four RPC shapes (unary, client streaming, server streaming, duplex streaming)
//!   onto call operations.
//! * **[`Environment`](environment::Environment):** The explicit owner of everything calls share.
//!
//! ## Transports
//!
//! The engine never touches the network. [`LoopbackTransport`](transport::loopback::LoopbackTransport)
//! connects clients and servers of the same process and is what the tests and the `ferrocall`
//! demo run on.
//!
//! ## Marshalling
//!
//! Messages are turned into bytes by [`Marshaller`](marshal::Marshaller)s: raw bytes, UTF-8
//! strings, `prost` messages, or `serde_json::Value`s transcoded to protobuf through a
//! `prost-reflect` descriptor.
//!
//! ## Re-exports
//!
//! This crate re-exports `bytes`, `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod batch;
pub mod call;
pub mod client;
pub mod completion;
pub mod environment;
pub mod marshal;
pub mod metadata;
pub mod method;
pub mod server;
pub mod transport;

// Re-exports
pub use bytes;
pub use prost;
pub use prost_reflect;
pub use tonic;
