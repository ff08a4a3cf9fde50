//! Transport abstraction
//!
//! Connections run over anything that is `Read + Write + Send` and can be
//! split into independently-owned halves: the reader task owns the inbound
//! half while writers share the outbound half under the send lock. TLS is
//! not implemented here; it arrives through a [`TlsUpgrader`] supplied by
//! the application.

use crate::error::Error;
use crate::options::ConnectionOptions;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// A full-duplex client transport
pub trait ConnectionStream: Read + Write + Send {
    /// Split into read and write halves plus a shutdown hook that unblocks
    /// a reader parked in `read`
    fn into_halves(self: Box<Self>) -> io::Result<StreamHalves>;

    /// Bound the next blocking reads, where the transport supports it.
    /// Used by synchronous-mode connections and the pre-bind exchange.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

/// The two halves of a split transport
pub struct StreamHalves {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub shutdown: Box<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for StreamHalves {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamHalves { .. }")
    }
}

impl ConnectionStream for TcpStream {
    fn into_halves(self: Box<Self>) -> io::Result<StreamHalves> {
        let reader = self.try_clone()?;
        let shutdown_handle = self.try_clone()?;
        Ok(StreamHalves {
            reader: Box::new(reader),
            writer: self,
            shutdown: Box::new(move || {
                let _ = shutdown_handle.shutdown(Shutdown::Both);
            }),
        })
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// Produces connected transports: the abstract stream factory consumed by
/// connections and server sets
pub trait StreamConnector: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: u16,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn ConnectionStream>, Error>;
}

/// Plain TCP connector
///
/// Applies the socket options std exposes portably (`TCP_NODELAY`, read
/// timeouts). Keepalive, linger and address reuse from
/// [`ConnectionOptions`] are honored by connectors with richer socket
/// control.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl StreamConnector for TcpConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn ConnectionStream>, Error> {
        let addrs = (host, port).to_socket_addrs()?;
        let mut last_err: Option<io::Error> = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, options.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(options.use_tcp_no_delay)?;
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no addresses resolved for {}:{}", host, port),
                )
            })
            .into())
    }
}

/// Wraps an established transport with TLS. Implemented by the application
/// against its TLS stack of choice; used by the StartTLS post-connect
/// processor and by LDAPS connectors.
pub trait TlsUpgrader: Send + Sync {
    fn upgrade(
        &self,
        stream: Box<dyn ConnectionStream>,
        host: &str,
    ) -> Result<Box<dyn ConnectionStream>, Error>;
}
