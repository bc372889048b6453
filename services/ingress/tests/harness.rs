//! Test harness for ingress integration tests.
//!
//! Provides helpers to build ClientHellos, spawn recording and TLS upstreams
//! that understand PROXY protocol v1, and run an ingress listener in-process.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use sni_ingress::proxy::{parse_proxy_v1, ProxyHeaderV1, PROXY_V1_MAX_LEN};
use sni_ingress::{Listener, ListenerConfig, SharedResolver};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a single-record TLS ClientHello, optionally carrying a server name.
pub fn client_hello(server_name: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    if let Some(name) = server_name {
        let mut entry = vec![0x00];
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name.as_bytes());

        let mut ext_data = (entry.len() as u16).to_be_bytes().to_vec();
        ext_data.extend_from_slice(&entry);

        extensions.extend_from_slice(&[0x00, 0x00]);
        extensions.extend_from_slice(&(ext_data.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&ext_data);
    }
    // supported_versions: TLS 1.3
    extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x5a; 32]);
    body.push(0x00); // session id
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // TLS_AES_128_GCM_SHA256
    body.extend_from_slice(&[0x01, 0x00]); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Both ends of a fresh loopback connection, as `(client, server)`.
pub async fn accepted_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let client = TcpStream::connect(listener.local_addr()?).await?;
    let (server, _) = listener.accept().await?;
    Ok((client, server))
}

/// An address nothing is listening on.
pub async fn closed_port_addr() -> io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    listener.local_addr()
}

/// Upstream that records every byte of its first connection until EOF.
pub struct RecordingUpstream {
    pub addr: SocketAddr,
    received: Option<oneshot::Receiver<Vec<u8>>>,
}

impl RecordingUpstream {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut received = Vec::new();
                let _ = stream.read_to_end(&mut received).await;
                let _ = tx.send(received);
            }
        });

        Ok(Self {
            addr,
            received: Some(rx),
        })
    }

    /// Wait until the upstream connection is closed and return what it saw.
    pub async fn received(&mut self) -> Vec<u8> {
        let rx = self.received.take().expect("received() called twice");
        tokio::time::timeout(TEST_TIMEOUT, rx)
            .await
            .expect("upstream never saw EOF")
            .expect("upstream task dropped")
    }
}

/// TLS upstream that expects a PROXY v1 header before the handshake.
///
/// Replies to the first application read with `marker`.
pub struct ProxyV1TlsBackend {
    pub addr: SocketAddr,
    pub cert_der: Vec<u8>,
    pub connections: Arc<AtomicU64>,
    pub last_header: Arc<Mutex<Option<ProxyHeaderV1>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProxyV1TlsBackend {
    pub async fn spawn(server_name: &str, marker: &str) -> io::Result<Self> {
        init_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(io::Error::other)?;

        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let certs = vec![CertificateDer::from(cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let last_header = Arc::new(Mutex::new(None));
        let conn_clone = Arc::clone(&connections);
        let header_clone = Arc::clone(&last_header);
        let marker_bytes = marker.as_bytes().to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let acceptor = acceptor.clone();
                                let response = marker_bytes.clone();
                                let header_store = Arc::clone(&header_clone);
                                tokio::spawn(async move {
                                    let header = match read_proxy_v1(&mut stream).await {
                                        Some(header) => header,
                                        None => return,
                                    };
                                    *header_store.lock().await = Some(header);

                                    if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                                        let mut buf = vec![0u8; 1024];
                                        if tls_stream.read(&mut buf).await.is_ok() {
                                            let _ = tls_stream.write_all(&response).await;
                                            let _ = tls_stream.flush().await;
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert_der,
            connections,
            last_header,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub async fn last_header(&self) -> Option<ProxyHeaderV1> {
        self.last_header.lock().await.clone()
    }
}

impl Drop for ProxyV1TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Read a PROXY v1 line byte by byte so no TLS bytes are consumed.
async fn read_proxy_v1(stream: &mut TcpStream) -> Option<ProxyHeaderV1> {
    let mut line = Vec::with_capacity(PROXY_V1_MAX_LEN);
    while !line.ends_with(b"\r\n") {
        if line.len() >= PROXY_V1_MAX_LEN {
            return None;
        }
        let byte = tokio::time::timeout(Duration::from_secs(1), stream.read_u8())
            .await
            .ok()?
            .ok()?;
        line.push(byte);
    }
    parse_proxy_v1(&line).map(|(header, _)| header)
}

/// Ingress listener running in the background on loopback.
pub struct IngressHandle {
    pub listen_addr: SocketAddr,
    pub listener: Arc<Listener>,
}

impl IngressHandle {
    pub async fn spawn(resolver: SharedResolver) -> io::Result<Self> {
        let config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        Self::spawn_with_config(config, resolver).await
    }

    pub async fn spawn_with_config(
        config: ListenerConfig,
        resolver: SharedResolver,
    ) -> io::Result<Self> {
        let listener = Listener::bind(config, resolver).await?;

        let listen_addr = listener.local_addr()?;
        let listener = Arc::new(listener);
        let running = Arc::clone(&listener);

        tokio::spawn(async move {
            let _ = running.run().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            listen_addr,
            listener,
        })
    }

    /// Wait until every accepted connection has been closed.
    pub async fn wait_idle(&self) {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let stats = self.listener.stats();
                let accepted = stats.connections_accepted.load(Ordering::Relaxed);
                let closed = stats.connections_closed.load(Ordering::Relaxed);
                if accepted > 0 && accepted == closed {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("ingress connections never closed");
    }
}

pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}
