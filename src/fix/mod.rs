// =============================================================================
// FIX 4.4 session layer
// =============================================================================
//
// One long-lived session per liquidity provider:
//   - message:  tag=value codec (framing, checksum, builders)
//   - store:    persistent sequence numbers + append-only message log
//   - session:  the session actor (logon, heartbeats, resend, reconnect)
// =============================================================================

pub mod message;
pub mod session;
pub mod store;
