//! NetTask is a reliable, message-oriented transport protocol on top of UDP datagrams. It
//!  carries task assignments and measurement results between monitoring agents and a central
//!  server across lossy networks, providing the guarantees usually delegated to a streaming
//!  transport while staying datagram shaped:
//!
//! * in-order, exactly-once delivery of messages per peer
//! * loss detection and retransmission (timer driven plus a fast path on duplicate ACKs)
//! * adaptive retransmission timeouts from an RTT estimator (EWMA average + deviation)
//! * flow control through explicitly advertised receive windows
//! * liveness detection via keep-alives, with a symmetric close handshake
//! * many independent peer connections multiplexed over a single UDP socket
//!
//! Peers are addressed by a stable, self-declared host identity rather than by their socket
//!  address - the address is learned and refreshed from inbound datagrams, so a peer may move
//!  between addresses without losing its connection.
//!
//! ## Wire format
//!
//! Each UDP datagram carries exactly one *segment*. All numbers are in network byte order (BE):
//!
//! ```ascii
//! 0:  sequence (u32) - per-connection counter starting at 1 for ackable bodies;
//!      0 for ACK segments, which do not consume sequence numbers
//! 4:  send timestamp (f64, IEEE-754) - echoed back in the corresponding ACK so the
//!      original sender can take an RTT sample; only meaningful to its own sender
//! 12: host (NUL-terminated UTF-8) - the sender's self-declared identity
//! *:  body tag (u8) followed by the body encoding:
//!      0 DATA       opaque application payload (rest of the datagram)
//!      1 ACK        cumulative acknowledgment (u32): everything <= ack was received
//!      2 WINDOW     receive window advertisement (u32): highest admissible sequence
//!      3 KEEP_ALIVE empty; refreshes the peer's liveness timer when no data flows
//!      4 CLOSE      empty; one half of the symmetric close handshake
//! ```
//!
//! `DATA`, `WINDOW`, `KEEP_ALIVE` and `CLOSE` are *ackable*: they consume a sequence number,
//!  stay in the sender's retransmission queue until covered by a cumulative ACK, and pass
//!  through the receiver's reorder buffer. `CLOSE` is deliberately data-like - it is acked
//!  and retransmitted until acknowledged, and a connection counts as fully closed only once
//!  the peer's CLOSE was received *and* the own CLOSE was acknowledged.
//!
//! A message too large for one UDP datagram is an application-level error; this layer does
//!  not fragment.
//!
//! ## Structure
//!
//! * [segment] - the wire codec, stateless
//! * [rtt] - the retransmission timeout estimator
//! * [connection] - the per-peer protocol state machine, free of I/O
//! * [end_point] - the socket-owning driver task multiplexing all connections, with the
//!   async `connect` / `send` / `receive` / `close` API
//!
//! Exactly one task per endpoint touches the socket and the connection state; callers talk
//!  to it through a command channel and suspend on per-request reply channels until their
//!  predicate holds (connected, message available, queue has room, fully closed). If the
//!  driver task dies, every current and future call fails immediately instead of hanging.

pub mod config;
pub mod connection;
pub mod end_point;
pub mod rtt;
pub mod segment;
pub mod socket;
