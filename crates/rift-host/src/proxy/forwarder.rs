//! One-shot request forwarding to a downstream peer.
//!
//! Each forward opens its own connection, writes the request produced by the
//! protocol's wire format, half-closes the write side, and accumulates the
//! reply. A reply is complete when the peer closes, when the wire format
//! recognises a complete message, or when the peer goes quiet for
//! `idle_timeout` after sending at least one byte.

use super::tls::client_connector;
use super::types::{Endpoint, ProxyError, ProxyResponse};
use crate::protocol::{CapturedRequest, WireFormat};
use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, info};

const READ_CHUNK: usize = 8 * 1024;

/// Timeouts applied to every forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderConfig {
    /// Upper bound for establishing the outbound connection
    pub connect_timeout: Duration,
    /// Quiet period that ends a reply the peer does not close
    pub idle_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(1),
        }
    }
}

/// Forwards captured requests using the wire format `W`.
#[derive(Debug, Clone)]
pub struct Forwarder<W> {
    wire: W,
    config: ForwarderConfig,
}

impl<W: WireFormat> Forwarder<W> {
    pub fn new(wire: W, config: ForwarderConfig) -> Self {
        Self { wire, config }
    }

    /// Send `request` to `target` and collect the full reply.
    ///
    /// Never retries; the caller decides what a failure means.
    pub async fn forward(
        &self,
        target: &Endpoint,
        request: &CapturedRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        let payload = self.wire.format_request(request, target)?;

        info!(
            "Proxying {} => {} => {}",
            request.request_from,
            String::from_utf8_lossy(&payload),
            target
        );

        let start = Instant::now();
        let mut stream = connect(target, self.config.connect_timeout).await?;

        let data = if target.is_tls() {
            let connector = client_connector()
                .map_err(|e| ProxyError::transport(target, io::Error::other(e)))?;
            let server_name = ServerName::try_from(target.host.clone()).map_err(|e| {
                ProxyError::transport(target, io::Error::new(io::ErrorKind::InvalidInput, e))
            })?;
            let mut tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProxyError::transport(target, e))?;

            // close_notify would end the session before the reply arrives
            tls.write_all(&payload)
                .await
                .map_err(|e| ProxyError::transport(target, e))?;
            tls.flush()
                .await
                .map_err(|e| ProxyError::transport(target, e))?;
            self.read_reply(&mut tls, target).await?
        } else {
            stream
                .write_all(&payload)
                .await
                .map_err(|e| ProxyError::transport(target, e))?;
            stream
                .shutdown()
                .await
                .map_err(|e| ProxyError::transport(target, e))?;
            self.read_reply(&mut stream, target).await?
        };

        let elapsed = start.elapsed();
        info!("{} <= {}", String::from_utf8_lossy(&data), target);
        debug!("Reply from {} took {:?}", target, elapsed);

        Ok(ProxyResponse { data, elapsed })
    }

    async fn read_reply<S>(&self, stream: &mut S, target: &Endpoint) -> Result<Bytes, ProxyError>
    where
        S: AsyncRead + Unpin,
    {
        let mut received = BytesMut::with_capacity(READ_CHUNK);

        loop {
            if received.capacity() - received.len() < READ_CHUNK {
                received.reserve(READ_CHUNK);
            }

            match tokio::time::timeout(self.config.idle_timeout, stream.read_buf(&mut received))
                .await
            {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    debug!("Read {} bytes from {}", n, target);
                    if self.wire.response_complete(&received) {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(ProxyError::transport(target, e)),
                Err(_) if !received.is_empty() => {
                    debug!(
                        "{} idle for {:?}, treating reply as complete",
                        target, self.config.idle_timeout
                    );
                    break;
                }
                Err(_) => {
                    return Err(ProxyError::transport(
                        target,
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("no reply within {:?}", self.config.idle_timeout),
                        ),
                    ))
                }
            }
        }

        Ok(received.freeze())
    }
}

/// Resolve `target` and connect to the first address that accepts.
async fn connect(target: &Endpoint, connect_timeout: Duration) -> Result<TcpStream, ProxyError> {
    let addrs: Vec<SocketAddr> = match lookup_host((target.host.as_str(), target.port)).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            debug!("Failed to resolve {}: {}", target, e);
            return Err(ProxyError::UnresolvableTarget {
                target: target.clone(),
            });
        }
    };

    if addrs.is_empty() {
        return Err(ProxyError::UnresolvableTarget {
            target: target.clone(),
        });
    }

    let mut last_error = None;
    let mut all_refused = true;

    for addr in addrs {
        let error = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out after {connect_timeout:?}"),
            ),
        };
        debug!("Connect to {} failed: {}", addr, error);
        if error.kind() != io::ErrorKind::ConnectionRefused {
            all_refused = false;
            last_error = Some(error);
        } else if last_error.is_none() {
            last_error = Some(error);
        }
    }

    match last_error {
        Some(error) if !all_refused => Err(ProxyError::transport(target, error)),
        _ => Err(ProxyError::ConnectionRefused {
            target: target.clone(),
        }),
    }
}
