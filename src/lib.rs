//! # rsocket
//!
//! An RSocket protocol engine: a binary, multiplexed, asynchronous
//! application protocol running symmetrically over any duplex frame
//! transport (TCP, WebSocket, in-process).
//!
//! Four interaction models are multiplexed over one connection -
//! fire-and-forget, request-response, request-stream, request-channel -
//! plus connection-level metadata push, keepalive, and graceful/abrupt
//! termination, all with reactive-streams-style credit flow control and
//! optional fragmentation of large payloads.
//!
//! ## Architecture
//!
//! ```text
//! transport ─► frame codec ─► reassembly ─► stream registry ─► operations
//!                                │ (stream 0)
//!                                └► connection engine (keepalive, errors)
//!
//! operations ─► flow control / fragmentation ─► prioritized queue ─► writer
//! ```
//!
//! Concrete transports are external collaborators: anything implementing
//! [`transport::Transport`] works, and [`transport::local_pair`] wires
//! two endpoints together in process.
//!
//! ## Example
//!
//! ```ignore
//! use rsocket::{Payload, RequestHandler, RSocketConnector, RSocketServer};
//!
//! let (client_transport, server_transport) = rsocket::transport::local_pair(64);
//!
//! tokio::spawn(async move {
//!     let connection = RSocketServer::new()
//!         .acceptor(|_setup, _requester| async move {
//!             Ok(RequestHandler::builder()
//!                 .request_response(|_ping| async move { Ok(Payload::from_data("pong")) })
//!                 .build_arc())
//!         })
//!         .accept(server_transport)
//!         .await?;
//!     connection.closed().await;
//!     Ok::<_, rsocket::RSocketError>(())
//! });
//!
//! let connection = RSocketConnector::new().connect(client_transport).await?;
//! let pong = connection.requester()
//!     .request_response(Payload::from_data("ping"))
//!     .await?;
//! ```

pub mod connection;
pub mod error;
pub mod flow_control;
pub mod fragmentation;
pub mod frame;
pub mod handler;
pub mod operation;
pub mod payload;
pub mod stream_id;
pub mod transport;

mod registry;
mod requester;
mod responder;

pub use connection::{
    Connection, ConnectionState, KeepAliveConfig, RSocketConnector, RSocketServer,
};
pub use error::{ErrorCode, RSocketError, Result};
pub use flow_control::{ManualStrategy, PrefetchStrategy, RequestStrategy};
pub use handler::{PayloadSink, PayloadStream, RequestHandler, RequestHandlerBuilder, Responder};
pub use payload::Payload;
pub use requester::RSocketRequester;
pub use stream_id::ConnectionSide;
