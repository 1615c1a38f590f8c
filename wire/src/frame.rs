use crate::{Error, Header, Kind, Message};
use bytes::{Bytes, BytesMut};
use commonware_codec::{Encode, Read as _};
use std::io::{ErrorKind, Read, Write};

/// Transfer state of a single frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// `cursor` bytes of the frame have been transferred.
    Pending { cursor: usize },
    /// The whole frame has been transferred.
    Complete,
}

/// Outcome of a single partial transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Bytes moved by the call.
    Transferred(usize),
    /// The transport could not make progress without blocking (or its timeout elapsed).
    Blocked,
    /// The transport reached end-of-stream.
    Eof,
}

fn is_blocked(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// A frame being written to a transport.
pub struct Outgoing {
    frame: Bytes,
    state: State,
}

impl Outgoing {
    pub fn new(message: &Message) -> Self {
        Self::from_encoded(message.encode().freeze())
    }

    /// Wraps an already encoded frame.
    pub fn from_encoded(frame: Bytes) -> Self {
        let state = if frame.is_empty() {
            State::Complete
        } else {
            State::Pending { cursor: 0 }
        };
        Self { frame, state }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Total length of the frame.
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// Returns true once every byte of the frame has been written.
    pub fn is_finished(&self) -> bool {
        self.state == State::Complete
    }

    /// Performs at most one write of the unsent remainder of the frame.
    pub fn send<W: Write + ?Sized>(&mut self, transport: &mut W) -> Result<Progress, Error> {
        let State::Pending { cursor } = self.state else {
            return Ok(Progress::Transferred(0));
        };
        let written = loop {
            match transport.write(&self.frame[cursor..]) {
                Ok(0) => return Err(Error::Io(ErrorKind::WriteZero.into())),
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_blocked(err.kind()) => return Ok(Progress::Blocked),
                Err(err) => return Err(Error::Io(err)),
            }
        };
        let cursor = cursor + written;
        self.state = if cursor == self.frame.len() {
            State::Complete
        } else {
            State::Pending { cursor }
        };
        Ok(Progress::Transferred(written))
    }
}

/// A frame being read from a transport.
///
/// The header is accumulated first. Once it is complete (and valid), a buffer for exactly the
/// announced payload is allocated and filled.
pub struct Incoming {
    max_payload: u32,
    head: [u8; Header::LEN],
    header: Option<Header>,
    payload: BytesMut,
    state: State,
}

impl Incoming {
    /// Creates an empty frame that accepts responses with up to `max_payload` bytes.
    pub fn new(max_payload: u32) -> Self {
        Self {
            max_payload,
            head: [0; Header::LEN],
            header: None,
            payload: BytesMut::new(),
            state: State::Pending { cursor: 0 },
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Returns true once the frame has been fully received.
    pub fn is_ready(&self) -> bool {
        self.state == State::Complete
    }

    /// The header, if it has been fully received.
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Total frame length, known once the header has been received.
    pub fn expected(&self) -> Option<usize> {
        self.header.map(|header| Header::LEN + header.payload_len())
    }

    /// Number of bytes received so far.
    pub fn received(&self) -> usize {
        match self.state {
            State::Pending { cursor } => cursor,
            State::Complete => self.expected().unwrap_or(Header::LEN),
        }
    }

    /// Performs at most one read into the unfilled remainder of the frame.
    pub fn recv<R: Read + ?Sized>(&mut self, transport: &mut R) -> Result<Progress, Error> {
        let State::Pending { cursor } = self.state else {
            return Ok(Progress::Transferred(0));
        };
        let target = if cursor < Header::LEN {
            &mut self.head[cursor..]
        } else {
            &mut self.payload[cursor - Header::LEN..]
        };
        let read = loop {
            match transport.read(target) {
                Ok(0) => return Ok(Progress::Eof),
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_blocked(err.kind()) => return Ok(Progress::Blocked),
                Err(err) => return Err(Error::Io(err)),
            }
        };
        let cursor = cursor + read;

        // Parse the header as soon as it is complete
        if cursor == Header::LEN && self.header.is_none() {
            let header = Header::read_cfg(&mut &self.head[..], &self.max_payload)?;
            self.payload = BytesMut::zeroed(header.payload_len());
            self.header = Some(header);
        }

        self.state = match self.expected() {
            Some(expected) if cursor == expected => State::Complete,
            _ => State::Pending { cursor },
        };
        Ok(Progress::Transferred(read))
    }

    /// The error reported when the transport ends before the frame is complete.
    pub fn truncated(&self) -> Error {
        Error::TruncatedFrame {
            received: self.received(),
            expected: self.expected(),
        }
    }

    /// Consumes a complete frame.
    pub fn into_message(self) -> Result<Message, Error> {
        if !self.is_ready() {
            return Err(self.truncated());
        }
        let Some(header) = self.header else {
            return Err(self.truncated());
        };
        Ok(Message::from_parts(header, self.payload.freeze()))
    }
}

/// Writes an entire frame to a blocking transport.
///
/// A blocking transport only reports [Progress::Blocked] once its write timeout has elapsed,
/// so that is surfaced as [Error::Timeout].
pub fn send_frame<W: Write + ?Sized>(transport: &mut W, frame: &mut Outgoing) -> Result<(), Error> {
    while !frame.is_finished() {
        if frame.send(transport)? == Progress::Blocked {
            return Err(Error::Timeout);
        }
    }
    transport.flush()?;
    Ok(())
}

/// Reads an entire frame of the expected `kind` from a blocking transport.
pub fn recv_frame<R: Read + ?Sized>(
    transport: &mut R,
    kind: Kind,
    max_payload: u32,
) -> Result<Message, Error> {
    let mut frame = Incoming::new(max_payload);
    while !frame.is_ready() {
        match frame.recv(transport)? {
            Progress::Transferred(_) => {}
            Progress::Blocked => return Err(Error::Timeout),
            Progress::Eof => return Err(frame.truncated()),
        }
    }
    let message = frame.into_message()?;
    if message.kind() != kind {
        return Err(Error::UnexpectedKind(message.kind()));
    }
    Ok(message)
}
