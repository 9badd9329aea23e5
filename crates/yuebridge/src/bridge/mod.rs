//! Wire protocol and framing for talking to the checker worker.
//!
//! - **protocol**: payload types ([`protocol::CheckRequest`],
//!   [`protocol::CheckReply`])
//! - **codec**: framing codec over AsyncRead/AsyncWrite, newline-delimited
//!   or `Content-Length`-prefixed

pub mod codec;
pub mod protocol;
