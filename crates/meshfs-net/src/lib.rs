//! # meshfs Net
//!
//! Everything between a TCP socket and the replication logic.
//!
//! ## Overview
//!
//! A connection is framed ([`marshall`]), authenticated and encrypted
//! ([`handshake`]), then driven by three tasks ([`connection`]): one reads
//! frames into an inbound queue, one drains a two-level outbound queue onto
//! the socket, and one dispatches inbound messages to a [`SessionHandler`].
//! Connections live in a fixed-size [`ConnectionPool`].
//!
//! ## Key Types
//!
//! - [`Message`] - Every wire message, tagged by [`MessageKind`]
//! - [`FrameReader`] / [`FrameWriter`] - Length-prefixed, optionally sealed frames
//! - [`PriorityQueue`] / [`BoundedQueue`] - Blocking bounded FIFOs
//! - [`ConnectionPool`] - Slots with precomputed Diffie-Hellman keys
//! - [`ConnectionHandle`] - Send to, or close, a live connection
//! - [`HandlerFactory`] / [`SessionHandler`] - The seam replication plugs into
//!
//! ## Handshake
//!
//! ```text
//! Node A                              Node B
//!   |-------- LeaderElect ------------>|   (repeated on ties)
//!   |<------- LeaderElect -------------|
//!   |-------- KeyExchange ------------>|
//!   |<------- KeyExchange -------------|
//!   |-------- ContentKey ------------->|   (leader only)
//!   |========= encrypted from here ====|
//!   |-------- AuthRequest ------------>|
//!   |<------- AuthRequest -------------|
//!   |-------- AuthChallenge ---------->|
//!   |<------- AuthChallenge -----------|
//!   |-------- AuthSolution ----------->|
//!   |<------- AuthSolution ------------|
//!   |-------- AuthResult ------------->|
//!   |<------- AuthResult --------------|
//! ```
//!
//! ## Design Notes
//!
//! - **Non-blocking accept**: a saturated pool refuses the socket instead of
//!   queueing it
//! - **Bulk last**: file data rides the low-priority outbound level so control
//!   traffic is never stuck behind a transfer
//! - **One handler per connection**: the worker task owns its handler, so
//!   handlers need no internal locking

pub mod connection;
pub mod error;
pub mod handshake;
pub mod marshall;
pub mod messages;
pub mod pool;
pub mod queue;

pub use connection::{
    serve, ConnectionConfig, ConnectionContext, ConnectionHandle, Envelope, HandlerFactory,
    SessionHandler,
};
pub use error::{NetError, Result};
pub use handshake::{perform_local, Handshake, HandshakeParams, RemoteIdentity};
pub use marshall::{framed, FrameReader, FrameWriter, MAX_FRAME_LEN};
pub use messages::{Message, MessageKind, PRIORITY_BULK, PRIORITY_CONTROL, PRIORITY_LEVELS};
pub use pool::{ConnectionPool, ConnectionState, SlotGuard};
pub use queue::{BoundedQueue, Closed, PriorityQueue};
