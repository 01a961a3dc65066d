// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind};

/// Errors of a transport operation.
#[derive(Debug)]
pub enum TransportError {
    /// The deadline elapsed before the requested bytes arrived.
    Timeout,

    /// The peer closed the connection.
    Closed,

    /// Any other I/O failure.
    Io(io::Error),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::new(ErrorKind::Timeout, "Transport read timed out"),
            TransportError::Closed => {
                Self::new(ErrorKind::IoError, "Connection closed by peer")
            }
            TransportError::Io(err) => Self::from(err),
        }
    }
}

/// Opaque byte-stream the connection runs over.
///
/// The client owns exactly one transport per connection and drives it
/// from a single execution context; implementations need not be thread
/// safe. TLS, if any, lives entirely inside the implementation.
pub trait Transport {
    /// Fill `buf` completely, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the deadline elapses and `Closed` when
    /// the peer hangs up.
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError>;

    /// Write all of `buf`, giving up after `timeout`.
    ///
    /// Packet bytes are handed over in one call so that a timeout never
    /// leaves half a packet on the wire.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or the underlying I/O failure.
    fn write_all(&mut self, buf: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Shut the connection down.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O failure, if any.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// TLS trust configuration.
#[derive(Debug, Clone)]
pub enum TlsType {
    /// Server certificate signed by a public root CA, like
    /// `Let's Encrypt`.
    CASigned,

    /// Server certificate signed by a private CA; the CA file is loaded
    /// from disk.
    SelfSigned(SelfSignedTls),
}

#[derive(Debug, Clone)]
pub struct SelfSignedTls {
    /// PEM file containing the root certificate chain.
    pub root_ca: PathBuf,
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Production transport: plain TCP or TLS over TCP.
pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream>),
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(..) => f.write_str("Tcp"),
            Self::Tls(..) => f.write_str("Tls"),
        }
    }
}

impl Stream {
    /// Open a connection to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns error if the address does not resolve, the TCP connect
    /// fails within `connect_timeout` or the TLS setup is rejected.
    pub fn connect(
        host: &str,
        port: u16,
        tls: Option<&TlsType>,
        connect_timeout: Duration,
    ) -> Result<Self, Error> {
        let address = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::from_string(
                ErrorKind::IoError,
                format!("Failed to resolve address {host}:{port}"),
            ))?;
        let tcp_stream = TcpStream::connect_timeout(&address, connect_timeout)?;
        tcp_stream.set_nodelay(true)?;

        match tls {
            None => Ok(Self::Tcp(tcp_stream)),
            Some(tls_type) => {
                let config = tls_client_config(tls_type)?;
                let server_name = rustls::ServerName::try_from(host).map_err(|err| {
                    Error::from_string(
                        ErrorKind::IoError,
                        format!("Invalid TLS server name {host}: {err}"),
                    )
                })?;
                let conn =
                    rustls::ClientConnection::new(Arc::new(config), server_name).map_err(
                        |err| {
                            Error::from_string(
                                ErrorKind::IoError,
                                format!("Failed to create TLS session: {err}"),
                            )
                        },
                    )?;
                Ok(Self::Tls(Box::new(rustls::StreamOwned::new(
                    conn, tcp_stream,
                ))))
            }
        }
    }

    fn socket(&self) -> &TcpStream {
        match self {
            Self::Tcp(stream) => stream,
            Self::Tls(stream) => stream.get_ref(),
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

fn tls_client_config(tls_type: &TlsType) -> Result<rustls::ClientConfig, Error> {
    let mut root_store = rustls::RootCertStore::empty();
    match tls_type {
        TlsType::CASigned => {
            root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
        }
        TlsType::SelfSigned(self_signed) => {
            let file = File::open(&self_signed.root_ca).map_err(|err| {
                Error::from_string(
                    ErrorKind::IoError,
                    format!("Failed to open CA file {:?}: {err}", self_signed.root_ca),
                )
            })?;
            let mut reader = BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader)? {
                root_store
                    .add(&rustls::Certificate(cert))
                    .map_err(|err| {
                        Error::from_string(
                            ErrorKind::IoError,
                            format!("Invalid CA certificate: {err}"),
                        )
                    })?;
            }
        }
    }

    Ok(rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

impl Transport for Stream {
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            self.socket().set_read_timeout(Some(deadline - now))?;
            match self.read_some(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => filled += n,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    // Fall through to the deadline check.
                }
                Err(err) => return Err(TransportError::from(err)),
            }
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.socket().set_write_timeout(Some(timeout))?;
        match self {
            Self::Tcp(stream) => {
                stream.write_all(buf)?;
                stream.flush()?;
            }
            Self::Tls(stream) => {
                stream.write_all(buf)?;
                stream.flush()?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Tcp(stream) => stream.shutdown(std::net::Shutdown::Both)?,
            Self::Tls(stream) => {
                stream.conn.send_close_notify();
                let _ = stream.flush();
                stream.get_ref().shutdown(std::net::Shutdown::Both)?;
            }
        }
        Ok(())
    }
}
