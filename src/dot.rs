use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::engine::Engine;

/// Loads the DoT server certificate chain and private key from PEM files.
/// Any problem with the TLS material is a startup error.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>> {
    let cert_file =
        File::open(cert_path).with_context(|| format!("open certificate file: {cert_path}"))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("parse certificate file: {cert_path}"))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {cert_path}");
    }

    let key_file = File::open(key_path).with_context(|| format!("open key file: {key_path}"))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("parse private key: {key_path}"))?
        .with_context(|| format!("no private key found in {key_path}"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build tls config")?;
    Ok(Arc::new(config))
}

/// Accept loop for DNS over TLS (RFC 7858): TLS handshake, then the same
/// 2-byte length framing as plain TCP DNS.
pub async fn run_dot(
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
    engine: Engine,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);
    loop {
        let (stream, peer) = listener.accept().await.context("accept dot connection")?;
        let acceptor = acceptor.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => {
                    if let Err(err) = handle_dot_conn(tls, peer, engine).await {
                        debug!(client = %peer, error = %err, "dot connection error");
                    }
                }
                Err(err) => debug!(client = %peer, error = %err, "tls handshake failed"),
            }
        });
    }
}

async fn handle_dot_conn(
    mut stream: TlsStream<TcpStream>,
    peer: SocketAddr,
    engine: Engine,
) -> Result<()> {
    const MAX_DOT_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_DOT_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        // 请求失败不写任何东西，连接保留给后续查询
        let resp = match engine.handle_packet(&buf).await {
            Ok(resp) => resp,
            Err(err) => {
                debug!(client = %peer, error = %err, "query failed, nothing written");
                continue;
            }
        };

        if resp.len() <= u16::MAX as usize {
            let len_bytes = (resp.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                warn!(client = %peer, "write to client failed");
                return Ok(());
            }
            if stream.write_all(&resp).await.is_err() {
                warn!(client = %peer, "write to client failed");
                return Ok(());
            }
        }
    }
}
