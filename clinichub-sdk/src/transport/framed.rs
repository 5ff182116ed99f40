//! JSON hub framing over any byte stream, plus a TCP/TLS connector.
//!
//! Every frame is a JSON object terminated by the record separator `0x1E`.
//! The client opens with `{"protocol":"json","version":1,"accessToken":..}`
//! and the hub answers `{}` or `{"error": ..}`. After that:
//!
//! - type 1: invocation (`target`, `arguments`, optional `invocationId`);
//!   without an id it is a server push
//! - type 3: completion (`invocationId`, `result` or `error`)
//! - type 6: ping
//! - type 7: close (optional `error`)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

use super::{HubConnector, HubInvoker, HubLink, Inbound};
use crate::error::{HubError, Result};

pub const RECORD_SEPARATOR: u8 = 0x1e;

const INVOCATION: u8 = 1;
const COMPLETION: u8 = 3;
const PING: u8 = 6;
const CLOSE: u8 = 7;

/// Largest record accepted from the hub, separator included.
pub const MAX_RECORD_BYTES: usize = 1 << 20;

const PING_INTERVAL: Duration = Duration::from_secs(15);
const SERVER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Frame {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    arguments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
    access_token: &'a str,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, value: &impl Serialize) -> Result<()> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(RECORD_SEPARATOR);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Strip the trailing separator from a raw record.
fn record_body(buf: &[u8]) -> &[u8] {
    buf.strip_suffix(&[RECORD_SEPARATOR]).unwrap_or(buf)
}

/// Send the handshake request and wait for the hub's answer.
pub async fn handshake<R, W>(reader: &mut R, writer: &mut W, credential: &str) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = HandshakeRequest {
        protocol: "json",
        version: 1,
        access_token: credential,
    };
    write_record(writer, &request).await?;

    let mut buf = Vec::new();
    let n = read_record(reader, &mut buf)
        .await
        .map_err(|e| HubError::Handshake(format!("reading handshake response: {e}")))?;
    if n == 0 {
        return Err(HubError::Handshake("hub closed during handshake".to_string()));
    }
    let response: HandshakeResponse = serde_json::from_slice(record_body(&buf))
        .map_err(|e| HubError::Handshake(format!("malformed handshake response: {e}")))?;
    match response.error {
        Some(err) => Err(HubError::Handshake(err)),
        None => Ok(()),
    }
}

/// Append bytes up to and including the next separator to `buf`, never
/// letting `buf` grow past [`MAX_RECORD_BYTES`]. Cancel safe: bytes read
/// before cancellation stay in `buf`.
async fn read_record<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let room = MAX_RECORD_BYTES.saturating_sub(buf.len()) as u64;
    let n = (&mut *reader).take(room).read_until(RECORD_SEPARATOR, buf).await?;
    if buf.len() >= MAX_RECORD_BYTES && buf.last() != Some(&RECORD_SEPARATOR) {
        return Err(HubError::Transport(format!("hub record exceeds {MAX_RECORD_BYTES} bytes")));
    }
    Ok(n)
}

enum LinkCommand {
    Invoke {
        procedure: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Close,
}

/// Run the framing protocol over an already handshaken stream.
///
/// The protocol runs in a spawned task that lives until the stream ends,
/// the hub sends a close frame, or the link is closed locally.
pub fn spawn_link<R, W>(reader: R, writer: W) -> HubLink
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (inbound_tx, inbound_rx) = mpsc::channel(1024);

    tokio::spawn(async move {
        if let Err(e) = run_link(reader, writer, cmd_rx, inbound_tx.clone()).await {
            tracing::debug!(error = %e, "hub link ended with error");
            let _ = inbound_tx
                .send(Inbound::Closed {
                    reason: e.to_string(),
                })
                .await;
        }
    });

    HubLink {
        invoker: Arc::new(FramedInvoker { cmd_tx }),
        inbound: inbound_rx,
    }
}

async fn run_link<R, W>(
    mut reader: R,
    mut writer: W,
    mut cmd_rx: mpsc::Receiver<LinkCommand>,
    inbound_tx: mpsc::Sender<Inbound>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut pending: HashMap<String, (String, oneshot::Sender<Result<Value>>)> = HashMap::new();
    let mut next_id: u64 = 0;
    let mut buf = Vec::new();
    let mut last_activity = tokio::time::Instant::now();
    let mut ping = tokio::time::interval_at(last_activity + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = read_record(&mut reader, &mut buf) => {
                let n = result?;
                if n == 0 {
                    let _ = inbound_tx.send(Inbound::Closed { reason: "EOF".to_string() }).await;
                    return Ok(());
                }
                if buf.last() != Some(&RECORD_SEPARATOR) {
                    // EOF in the middle of a record
                    let _ = inbound_tx.send(Inbound::Closed { reason: "truncated frame".to_string() }).await;
                    return Ok(());
                }
                last_activity = tokio::time::Instant::now();
                let frame: Frame = match serde_json::from_slice(record_body(&buf)) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed hub frame");
                        buf.clear();
                        continue;
                    }
                };
                buf.clear();

                match frame.kind {
                    INVOCATION => {
                        let Some(name) = frame.target else {
                            tracing::warn!("hub push without target");
                            continue;
                        };
                        tracing::debug!(event = %name, "hub push");
                        if inbound_tx.send(Inbound::Event { name, args: frame.arguments }).await.is_err() {
                            return Ok(());
                        }
                    }
                    COMPLETION => {
                        let Some(id) = frame.invocation_id else { continue };
                        if let Some((procedure, reply)) = pending.remove(&id) {
                            let outcome = match frame.error {
                                Some(message) => Err(HubError::Remote { procedure, message }),
                                None => Ok(frame.result.unwrap_or(Value::Null)),
                            };
                            let _ = reply.send(outcome);
                        }
                    }
                    PING => {}
                    CLOSE => {
                        let reason = frame.error.unwrap_or_else(|| "closed by hub".to_string());
                        let _ = inbound_tx.send(Inbound::Closed { reason }).await;
                        return Ok(());
                    }
                    other => tracing::debug!(kind = other, "ignoring hub frame"),
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(LinkCommand::Invoke { procedure, args, reply }) => {
                        next_id += 1;
                        let id = next_id.to_string();
                        let frame = Frame {
                            kind: INVOCATION,
                            invocation_id: Some(id.clone()),
                            target: Some(procedure.clone()),
                            arguments: args,
                            ..Default::default()
                        };
                        tracing::debug!(%procedure, invocation_id = %id, "hub invoke");
                        if let Err(e) = write_record(&mut writer, &frame).await {
                            let _ = reply.send(Err(HubError::Transport(e.to_string())));
                            return Err(e);
                        }
                        pending.insert(id, (procedure, reply));
                    }
                    Some(LinkCommand::Close) | None => {
                        let close = Frame { kind: CLOSE, ..Default::default() };
                        let _ = write_record(&mut writer, &close).await;
                        let _ = writer.shutdown().await;
                        return Ok(());
                    }
                }
            }
            _ = ping.tick() => {
                if last_activity.elapsed() > SERVER_TIMEOUT {
                    let _ = inbound_tx.send(Inbound::Closed { reason: "hub timed out".to_string() }).await;
                    return Ok(());
                }
                write_record(&mut writer, &Frame { kind: PING, ..Default::default() }).await?;
            }
        }
    }
}

struct FramedInvoker {
    cmd_tx: mpsc::Sender<LinkCommand>,
}

impl HubInvoker for FramedInvoker {
    fn invoke(&self, procedure: String, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        let cmd_tx = self.cmd_tx.clone();
        async move {
            let (reply, rx) = oneshot::channel();
            cmd_tx
                .send(LinkCommand::Invoke { procedure, args, reply })
                .await
                .map_err(|_| HubError::Transport("link closed".to_string()))?;
            rx.await
                .map_err(|_| HubError::Transport("link closed before completion".to_string()))?
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let cmd_tx = self.cmd_tx.clone();
        async move {
            let _ = cmd_tx.send(LinkCommand::Close).await;
        }
        .boxed()
    }
}

/// Handshake over `stream` and start the link.
pub async fn start<S>(stream: S, credential: &str) -> Result<HubLink>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    handshake(&mut reader, &mut writer, credential).await?;
    Ok(spawn_link(reader, writer))
}

/// Connects to a hub over TCP, optionally wrapped in TLS.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// host:port
    pub addr: String,
    pub tls: bool,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, tls: bool) -> Self {
        Self {
            addr: addr.into(),
            tls,
        }
    }
}

impl HubConnector for TcpConnector {
    fn open(&self, credential: String) -> BoxFuture<'static, Result<HubLink>> {
        let addr = self.addr.clone();
        let tls = self.tls;
        async move {
            match establish_connection(&addr, tls).await? {
                EstablishedConnection::Plain(tcp) => start(tcp, &credential).await,
                EstablishedConnection::Tls(tls) => start(*tls, &credential).await,
            }
        }
        .boxed()
    }
}

/// A TCP (and optionally TLS) stream that has not done the hub handshake yet.
pub enum EstablishedConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Open the byte stream to `addr`. TLS is also used for port 443.
pub async fn establish_connection(addr: &str, tls: bool) -> Result<EstablishedConnection> {
    let use_tls = tls || addr.ends_with(":443");
    let mode = if use_tls { "TLS" } else { "plain" };

    tracing::debug!("Resolving {addr}...");
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| HubError::Transport(format!("TCP connect to {addr} failed: {e}")))?;
    tracing::debug!("TCP connected to {addr} ({mode})");

    if !use_tls {
        return Ok(EstablishedConnection::Plain(tcp));
    }

    let connector = TlsConnector::from(Arc::new(rustls_default_config()));
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    let dns_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| HubError::Transport(format!("invalid server name {host}: {e}")))?;
    let tls_stream = connector
        .connect(dns_name, tcp)
        .await
        .map_err(|e| HubError::Transport(format!("TLS handshake with {addr} failed: {e}")))?;
    tracing::debug!("TLS handshake complete");
    Ok(EstablishedConnection::Tls(Box::new(tls_stream)))
}

fn install_crypto_provider() {
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();
    let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}
