//! # xipc
//!
//! A local inter-process communication runtime: typed structured messages
//! exchanged over stream sockets between a listener and its peers, with
//! asynchronous delivery, request/reply correlation, and a polymorphic
//! reference-counted value tree.
//!
//! The three load-bearing pieces are the value graph ([`Object`]), the
//! MessagePack-based wire codec ([`codec`]), and the connection state
//! machine ([`Connection`]), glued together by a pluggable stream-socket
//! transport ([`transport`]) and a serial-queue scheduling primitive
//! ([`SerialQueue`]).
//!
//! ```no_run
//! use xipc::{Connection, Endpoint, Event};
//!
//! # async fn demo() -> Result<(), xipc::IpcError> {
//! let server = Connection::listener(Endpoint::unix("/tmp/demo.sock"), None).await?;
//! server.set_event_handler(|event| {
//!     if let Event::Connection(peer) = event {
//!         let responder = peer.clone();
//!         peer.set_event_handler(move |event| {
//!             if let Event::Message(request) = event {
//!                 if let Some(reply) = request.dictionary_create_reply() {
//!                     reply.dictionary_set_bool("ok", true);
//!                     let _ = responder.send_message(&reply);
//!                 }
//!             }
//!         });
//!         peer.resume();
//!     }
//! });
//! server.resume();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod object;
pub mod queue;
pub mod transport;

pub use connection::{Connection, Event};
pub use error::{ErrorCode, IpcError};
pub use object::{Kind, Object, ARRAY_APPEND};
pub use queue::SerialQueue;
pub use transport::{Endpoint, Transport, TransportFactory};

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire and scheduling constants.
pub mod defaults {
    /// Protocol version stamped into every frame header.
    pub const PROTOCOL_VERSION: u64 = 1;

    /// Size in bytes of the fixed frame header (seven little-endian u64
    /// words: version, id, length, four spare).
    pub const FRAME_HEADER_SIZE: usize = 56;

    /// Upper bound on a whole frame, header included.
    pub const MAX_FRAME_SIZE: usize = 64 * 1024;

    /// Listen backlog used by both stream transports.
    pub const LISTEN_BACKLOG: i32 = 5;

    /// Dictionary key that pins an outgoing message's correlation id.
    pub const SEQUENCE_NUMBER_KEY: &str = "IPC sequence number";

    /// Older spelling of [`SEQUENCE_NUMBER_KEY`], still honored on send.
    pub const LEGACY_SEQUENCE_NUMBER_KEY: &str = "XPC sequence number";
}
