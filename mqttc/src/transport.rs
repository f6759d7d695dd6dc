//! Transport layer abstraction for MQTT connections.
//!
//! The connection only needs an ordered byte stream. [`Connector`] produces
//! one per connect attempt; [`TransportConnector`] is the default over TCP,
//! Unix sockets and (with the `tls` feature) TLS.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;

use crate::config::{Address, ClientConfig};

/// Any bidirectional byte stream the client can run MQTT over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// A boxed transport stream.
pub type BoxStream = Box<dyn Stream>;

/// Opens a fresh transport for each connect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<BoxStream>;
}

/// A unified transport that wraps different connection types.
pub enum Transport {
    /// Plain TCP stream.
    Tcp(TcpStream),
    /// Unix domain socket.
    #[cfg(unix)]
    Unix(UnixStream),
    /// TLS stream.
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            Transport::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Default connector: dials the configured [`Address`].
#[derive(Debug, Clone)]
pub struct TransportConnector {
    address: Address,
    #[cfg(feature = "tls")]
    tls: Option<tls::TlsConfig>,
}

impl TransportConnector {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            address: config.address.clone(),
            #[cfg(feature = "tls")]
            tls: config.tls.clone(),
        }
    }

    /// Dial and return the concrete transport.
    pub async fn dial(&self) -> io::Result<Transport> {
        match &self.address {
            Address::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;

                #[cfg(feature = "tls")]
                if let Some(tls) = &self.tls {
                    let stream = tls.connect(stream, host).await?;
                    return Ok(Transport::Tls(Box::new(stream)));
                }

                Ok(Transport::Tcp(stream))
            }
            #[cfg(unix)]
            Address::Unix { path } => Ok(Transport::Unix(UnixStream::connect(path).await?)),
        }
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self) -> io::Result<BoxStream> {
        Ok(Box::new(self.dial().await?))
    }
}

#[cfg(feature = "tls")]
pub mod tls {
    //! TLS configuration and utilities.

    use std::fmt;
    use std::io;
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    use crate::error::{Error, Result};

    /// TLS configuration for client connections.
    #[derive(Clone)]
    pub struct TlsConfig {
        connector: TlsConnector,
        server_name: Option<String>,
    }

    impl fmt::Debug for TlsConfig {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("TlsConfig")
                .field("server_name", &self.server_name)
                .finish_non_exhaustive()
        }
    }

    impl TlsConfig {
        /// Trust the webpki root set, no client certificate.
        pub fn new() -> Result<Self> {
            let root_store = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };

            let config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            Ok(Self::from_rustls(Arc::new(config)))
        }

        /// Trust the CA certificates in `ca_pem`, optionally presenting a
        /// client certificate chain and key (both PEM).
        pub fn from_pem(ca_pem: &[u8], identity: Option<(&[u8], &[u8])>) -> Result<Self> {
            let mut root_store = RootCertStore::empty();
            for cert in read_certs(ca_pem)? {
                root_store
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("invalid CA certificate: {e}")))?;
            }

            let builder = ClientConfig::builder().with_root_certificates(root_store);
            let config = match identity {
                Some((cert_pem, key_pem)) => {
                    let certs = read_certs(cert_pem)?;
                    let key = read_key(key_pem)?;
                    builder
                        .with_client_auth_cert(certs, key)
                        .map_err(|e| Error::Tls(format!("invalid client identity: {e}")))?
                }
                None => builder.with_no_client_auth(),
            };

            Ok(Self::from_rustls(Arc::new(config)))
        }

        /// Use a prepared rustls config.
        pub fn from_rustls(config: Arc<ClientConfig>) -> Self {
            Self {
                connector: TlsConnector::from(config),
                server_name: None,
            }
        }

        /// Verify the broker against this name instead of the dialed host.
        pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
            self.server_name = Some(name.into());
            self
        }

        /// Run the TLS handshake over a connected TCP stream.
        pub async fn connect(
            &self,
            stream: TcpStream,
            host: &str,
        ) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
            let name = self.server_name.as_deref().unwrap_or(host).to_string();
            let domain = ServerName::try_from(name)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid domain name"))?;

            self.connector.connect(domain, stream).await
        }
    }

    fn read_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
        let certs = rustls_pemfile::certs(&mut &pem[..])
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| Error::Tls(format!("invalid certificate pem: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Tls("no certificate in pem".into()));
        }
        Ok(certs)
    }

    fn read_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut &pem[..])
            .map_err(|e| Error::Tls(format!("invalid key pem: {e}")))?
            .ok_or_else(|| Error::Tls("no private key in pem".into()))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = TransportConnector::new(Address::tcp("127.0.0.1", port));
        let mut stream = connector.connect().await.unwrap();
        stream.write_all(&[0xC0, 0x00]).await.unwrap();

        assert_eq!(server.await.unwrap(), [0xC0, 0x00]);
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TransportConnector::new(Address::tcp("127.0.0.1", port));
        assert!(connector.connect().await.is_err());
    }
}
