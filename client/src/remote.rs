//! Fetch blocks from the data port of a remote cache node.
//!
//! Every fetch uses a fresh connection that carries exactly one request and one response and is
//! shut down before [RemoteClient::fetch] returns, whatever the outcome.

use crate::{BlockLocator, Config, Error};
use bytes::Bytes;
use std::{
    io,
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};
use tiercache_wire::{recv_frame, send_frame, Kind, Message, Outgoing, Request};
use tracing::{debug, warn};

/// Dials remote nodes and requests blocks from them.
#[derive(Clone, Debug)]
pub struct RemoteClient {
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    max_payload: u32,
}

impl RemoteClient {
    pub fn new(cfg: &Config) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout,
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
            max_payload: cfg.max_payload,
        }
    }

    /// Requests the block described by `locator` from `host:port`.
    ///
    /// Returns `Ok(None)` if the node answered that it does not hold the block.
    pub fn fetch(
        &self,
        host: &str,
        port: u16,
        locator: &BlockLocator,
    ) -> Result<Option<Bytes>, Error> {
        let address = format!("{host}:{port}");
        let mut stream = self
            .connect(host, port)
            .map_err(|err| Error::RemoteUnreachable(address.clone(), err))?;
        let result = self.exchange(&mut stream, &address, locator);

        // The peer may already have closed its end
        if let Err(err) = stream.shutdown(Shutdown::Both) {
            debug!(?err, %address, "failed to shut down connection");
        }
        result
    }

    fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    stream.set_write_timeout(Some(self.write_timeout))?;
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(?err, %addr, "failed to set nodelay");
                    }
                    return Ok(stream);
                }
                Err(err) => last = Some(err),
            }
        }
        Err(last.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved")
        }))
    }

    fn exchange(
        &self,
        stream: &mut TcpStream,
        address: &str,
        locator: &BlockLocator,
    ) -> Result<Option<Bytes>, Error> {
        let request = Request::block(locator.block_id)?;
        let mut outgoing = Outgoing::new(&Message::Request(request));
        send_frame(stream, &mut outgoing).map_err(|err| transport(address, err))?;

        // Never accept more than the block can hold
        let limit = u32::try_from(locator.length)
            .unwrap_or(u32::MAX)
            .min(self.max_payload);
        let message =
            recv_frame(stream, Kind::Response, limit).map_err(|err| transport(address, err))?;
        let response = match message {
            Message::Response(response) => response,
            other => {
                return Err(Error::Wire(tiercache_wire::Error::UnexpectedKind(
                    other.kind(),
                )))
            }
        };
        if response.requested() != locator.block_id {
            return Err(Error::MismatchedResponse {
                requested: locator.block_id,
                received: response.requested(),
            });
        }
        if !response.is_found() {
            debug!(block = locator.block_id, %address, "remote does not hold block");
            return Ok(None);
        }
        let received = response.payload().len() as u64;
        if received != locator.length {
            return Err(Error::LengthMismatch {
                block: locator.block_id,
                expected: locator.length,
                received,
            });
        }
        debug!(
            block = locator.block_id,
            %address,
            len = response.payload().len(),
            "fetched block"
        );
        Ok(Some(response.into_payload()))
    }
}

/// Maps transport-level wire errors to [Error::RemoteUnreachable], leaving protocol errors intact.
fn transport(address: &str, err: tiercache_wire::Error) -> Error {
    match err {
        tiercache_wire::Error::Io(err) => Error::RemoteUnreachable(address.to_string(), err),
        tiercache_wire::Error::Timeout => Error::RemoteUnreachable(
            address.to_string(),
            io::Error::new(io::ErrorKind::TimedOut, "timed out"),
        ),
        err => Error::Wire(err),
    }
}
