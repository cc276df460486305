//! # framewire
//!
//! A message-oriented, multiplexing request/response protocol over a single
//! ordered, reliable, full-duplex byte stream.
//!
//! Either peer may originate requests at any time; a request may carry an
//! optional response identified by the request's sequence number. Large
//! messages are split into small wire frames so several messages are in
//! flight concurrently without head-of-line blocking, and an urgent
//! priority lane claims a larger share of bandwidth.
//!
//! ## Architecture
//!
//! ```text
//! send() ──► Connection ──► Writer task ──► frames ──► stream
//!                │                                       │
//!            dispatcher ◄── handler workers ◄── Reader task
//! ```
//!
//! One connection owns exactly one reader task and one writer task. The
//! writer interleaves frames from all currently-sending messages (urgent
//! lane first, normal lane never starved); the reader reassembles frames by
//! message number, matches responses against the pending-response table,
//! and hands finished requests to the [`Dispatcher`] off its critical path.
//!
//! The stream is any `tokio::io::AsyncRead + AsyncWrite`; establishing it
//! (TCP, TLS, Unix sockets) is the caller's concern.
//!
//! ## Example
//!
//! ```ignore
//! use framewire::{Connection, Request, Response};
//! use framewire::dispatcher::Outcome;
//!
//! let conn = Connection::builder()
//!     .default_handler(|request, ctx| async move {
//!         ctx.respond(Response::with_body(request.body().to_vec())).await?;
//!         Ok(Outcome::Responded)
//!     })
//!     .open(tcp_stream);
//!
//! let handle = conn.send(Request::with_body(b"ping".to_vec())).await?;
//! let response = handle.expect("reply expected").response().await?;
//! ```

pub mod compress;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod properties;
pub mod protocol;

mod connection;
mod reader;
mod writer;

pub use connection::{Connection, ConnectionBuilder, ConnectionConfig, ConnectionState};
pub use dispatcher::Dispatcher;
pub use error::{FramewireError, Result};
pub use message::{
    IncomingRequest, IncomingResponse, ReplyContext, Request, Response, ResponseError,
    ResponseHandle,
};
pub use properties::Properties;
