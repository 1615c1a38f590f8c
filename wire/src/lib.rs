//! Frame block requests and responses over byte-stream transports.
//!
//! # Overview
//!
//! Cache nodes serve the bytes of memory-resident blocks to each other over plain stream
//! connections. Every message exchanged on such a connection is a single [Message] (a
//! [Request] for a block or a [Response] carrying it) that is serialized into a frame:
//!
//! ```text
//! +------+-----------------+-----------------+-----------------+=================+
//! | kind |  block_id (i64) |  offset (u64)   |  length (u32)   |  payload bytes  |
//! +------+-----------------+-----------------+-----------------+=================+
//! |  0   |  1 ...       8  |  9 ...      16  | 17 ...      20  | 21 ...          |
//! ```
//!
//! All integers are big-endian. This is a protocol constant: it is never negotiated.
//!
//! Requests never carry a payload (`length` is the number of bytes wanted starting at `offset`,
//! `0` meaning "through the end of the block"). Responses carry exactly `length` payload bytes.
//!
//! # Not Found
//!
//! A node that does not hold the requested block replies with a [Response] whose `block_id` is
//! the bitwise negation (`!id`) of the requested id and whose payload is empty. Valid block ids
//! are never negative, so every "not found" echo (including the one for block `0`) is negative
//! and can be told apart from a found response without any additional field.
//!
//! # Partial I/O
//!
//! [Outgoing] and [Incoming] wrap a single frame and track how much of it has been transferred.
//! Each call to [Outgoing::send] or [Incoming::recv] performs at most one partial write or read
//! against the transport and advances the frame's cursor, so the same state machines can be
//! driven by blocking and non-blocking transports alike. [send_frame] and [recv_frame] drive
//! a frame to completion over a blocking transport.
//!
//! Headers and messages implement the `commonware-codec` traits: decoding takes the largest
//! acceptable payload as its configuration, so an oversized announcement is rejected before any
//! payload buffer is allocated.
//!
//! A transport that reaches end-of-stream before a frame is complete yields
//! [Error::TruncatedFrame], never a partially filled frame.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

mod frame;
mod message;

pub use frame::{recv_frame, send_frame, Incoming, Outgoing, Progress, State};
pub use message::{
    encode_request, encode_response, encode_response_not_found, Header, Kind, Message, Request,
    Response,
};
use thiserror::Error;

/// Default upper bound on the payload a receiver accepts in a single response.
pub const DEFAULT_MAX_PAYLOAD: u32 = 1 << 30;

/// Errors that can occur when encoding, decoding, or transferring frames.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unexpected frame kind: {0:?}")]
    UnexpectedKind(Kind),
    #[error("invalid block id: {0}")]
    InvalidBlockId(i64),
    #[error("payload too large: {length} > {max}")]
    PayloadTooLarge { length: usize, max: u32 },
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("truncated frame: received {received} of {expected:?} bytes")]
    TruncatedFrame {
        received: usize,
        expected: Option<usize>,
    },
    #[error("timeout")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the error was caused by a malformed frame (as opposed to the transport).
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::UnexpectedKind(_)
                | Error::InvalidBlockId(_)
                | Error::PayloadTooLarge { .. }
                | Error::Codec(_)
        )
    }
}
