//! TLS configuration and client handshakes
//!
//! The TCP connection is always opened first with the connect timeout, then
//! upgraded. During the handshake the connect timeout doubles as the socket
//! read timeout so a peer that accepts but never answers cannot stall the
//! worker.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// TLS settings for a TCP appender
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM file with the CA certificates to trust; the platform's native
    /// roots are used when unset
    pub ca_file: Option<PathBuf>,

    /// Name to verify the server certificate against instead of the
    /// destination host
    pub server_name: Option<String>,
}

#[cfg(feature = "tls")]
pub(crate) use connector::{TlsConnector, TlsStream};

#[cfg(feature = "tls")]
mod connector {
    use super::TlsConfig;
    use crate::core::{DeliveryError, Result};
    use crate::net::HostInfo;
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
    use std::io;
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::{debug, warn};

    pub(crate) type TlsStream = StreamOwned<ClientConnection, TcpStream>;

    /// Client configuration built once at startup and shared by every
    /// connection attempt
    #[derive(Clone)]
    pub(crate) struct TlsConnector {
        config: Arc<ClientConfig>,
        server_name: Option<String>,
    }

    impl TlsConnector {
        pub(crate) fn from_config(tls: &TlsConfig) -> Result<Self> {
            let mut roots = RootCertStore::empty();

            match &tls.ca_file {
                Some(path) => {
                    let certs = CertificateDer::pem_file_iter(path)
                        .map_err(|e| {
                            let path = path.display();
                            DeliveryError::tls(format!("cannot read '{}': {:?}", path, e))
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(|e| {
                            let path = path.display();
                            DeliveryError::tls(format!("invalid PEM in '{}': {:?}", path, e))
                        })?;

                    if certs.is_empty() {
                        return Err(DeliveryError::tls(format!(
                            "no certificates found in '{}'",
                            path.display()
                        )));
                    }
                    for cert in certs {
                        roots.add(cert).map_err(|e| {
                            DeliveryError::tls(format!("rejected CA certificate: {}", e))
                        })?;
                    }
                }
                None => {
                    let native = rustls_native_certs::load_native_certs();
                    for error in &native.errors {
                        warn!(%error, "failed to load a native root certificate");
                    }
                    let (added, ignored) = roots.add_parsable_certificates(native.certs);
                    debug!(added, ignored, "loaded native root certificates");
                    if added == 0 {
                        return Err(DeliveryError::tls("no usable native root certificates"));
                    }
                }
            }

            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let config = ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| DeliveryError::tls(format!("unsupported protocol versions: {}", e)))?
                .with_root_certificates(roots)
                .with_no_client_auth();

            Ok(Self {
                config: Arc::new(config),
                server_name: tls.server_name.clone(),
            })
        }

        /// Run the client handshake over an already connected socket
        pub(crate) fn handshake(
            &self,
            host: &HostInfo,
            socket: TcpStream,
            timeout: Duration,
        ) -> io::Result<TlsStream> {
            let name = self.server_name.as_deref().unwrap_or(host.host()).to_string();
            let server_name = ServerName::try_from(name)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let connection = ClientConnection::new(Arc::clone(&self.config), server_name)
                .map_err(io::Error::other)?;

            socket.set_read_timeout(Some(timeout))?;
            let mut stream = StreamOwned::new(connection, socket);
            while stream.conn.is_handshaking() {
                stream.conn.complete_io(&mut stream.sock)?;
            }
            Ok(stream)
        }
    }

}
