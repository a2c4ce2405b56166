//! Control-plane wire protocol and both halves of the RPC surface (C2, C4
//! control half).
//!
//! No example repo in the retrieval pack vendors `tonic`/`prost` (the
//! original used gRPC), so this follows `syfala_network`/`syfala_proto`'s
//! idiom instead: a flat `serde`-derived message enum, `postcard`-encoded,
//! prefixed with a 4-byte big-endian length — the same big-endian
//! convention as the audio packet header in `wire.rs`. Spec §6 explicitly
//! leaves the RPC fabric unnamed ("any ordered, framed RPC fabric
//! suffices"), so this satisfies the letter of the contract without
//! fabricating a gRPC-compatible wire format this corpus cannot produce.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use crate::error::AudiocastError;
use crate::session::{AddOutcome, SessionId, SessionRegistry, TouchOutcome};
use crate::wire::AudioFormat;
use crate::Result;

const MAX_MESSAGE_SIZE: u32 = 64 * 1024;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const FORMAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const KEEPALIVE_RETRY_ATTEMPTS: u32 = 3;
const KEEPALIVE_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Connect { client_address: IpAddr, client_port: u16 },
    Disconnect { uuid: SessionId },
    KeepAlive { uuid: SessionId },
    GetAudioFormat { uuid: SessionId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Connect(ConnectResult),
    Disconnect { success: bool },
    KeepAlive(KeepAliveResult),
    GetAudioFormat(GetAudioFormatResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectResult {
    Success { client_uuid: SessionId, server_address: IpAddr, server_udp_port: u16, server_format: AudioFormat },
    InvalidArgument { message: String },
    AlreadyExists { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeepAliveResult {
    Success,
    NotFound { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GetAudioFormatResult {
    Success { format: AudioFormat },
    NotFound { message: String },
}

async fn write_message<T: Serialize>(stream: &mut TcpStream, msg: &T) -> Result<()> {
    let bytes = postcard::to_allocvec(msg).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_message<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "message exceeds size limit").into());
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    postcard::from_bytes(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
}

/// Shared server-side context the RPC handler dispatches against.
#[derive(Clone)]
pub struct RpcServerState {
    pub registry: SessionRegistry,
    pub server_address: IpAddr,
    pub server_udp_port: u16,
    pub current_format: Arc<RwLock<AudioFormat>>,
}

/// Accepts TCP connections and dispatches each request against
/// [`RpcServerState`]. Each connection is handled on its own task drawn from
/// a `JoinSet` capped by a semaphore — spec §5's "separate pool of blocking
/// workers" modeled cooperatively since the rest of the runtime already is.
pub struct RpcServer {
    listener: TcpListener,
    state: RpcServerState,
    max_concurrent: usize,
}

impl RpcServer {
    pub async fn bind(addr: SocketAddr, state: RpcServerState, max_concurrent: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state, max_concurrent })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, running: Arc<AtomicBool>) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_concurrent));
        let mut tasks = tokio::task::JoinSet::new();

        while running.load(Ordering::Relaxed) {
            let accept = tokio::time::timeout(Duration::from_millis(200), self.listener.accept()).await;
            let (stream, peer) = match accept {
                Ok(Ok(pair)) => pair,
                Ok(Err(err)) => {
                    tracing::warn!(%err, "rpc accept failed");
                    continue;
                }
                Err(_elapsed) => continue,
            };

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let state = self.state.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(err) = handle_connection(stream, state).await {
                    tracing::debug!(%err, %peer, "rpc connection closed");
                }
            });

            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}
    }
}

async fn handle_connection(mut stream: TcpStream, state: RpcServerState) -> Result<()> {
    loop {
        let request: Request = match read_message(&mut stream).await {
            Ok(r) => r,
            Err(AudiocastError::NetworkTransient(io_err)) if io_err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(err) => return Err(err),
        };

        let response = dispatch(&state, request).await;
        write_message(&mut stream, &response).await?;
    }
}

async fn dispatch(state: &RpcServerState, request: Request) -> Response {
    match request {
        Request::Connect { client_address, client_port } => {
            Response::Connect(handle_connect(state, client_address, client_port).await)
        }
        Request::Disconnect { uuid } => {
            let success = state.registry.remove(uuid).await;
            Response::Disconnect { success }
        }
        Request::KeepAlive { uuid } => Response::KeepAlive(match state.registry.touch(uuid).await {
            TouchOutcome::Ok => KeepAliveResult::Success,
            TouchOutcome::Expired | TouchOutcome::Unknown => {
                KeepAliveResult::NotFound { message: "unknown or expired session".to_string() }
            }
        }),
        Request::GetAudioFormat { uuid } => Response::GetAudioFormat(match state.registry.touch(uuid).await {
            TouchOutcome::Ok => {
                GetAudioFormatResult::Success { format: *state.current_format.read().await }
            }
            TouchOutcome::Expired | TouchOutcome::Unknown => {
                GetAudioFormatResult::NotFound { message: "unknown or expired session".to_string() }
            }
        }),
    }
}

async fn handle_connect(state: &RpcServerState, client_address: IpAddr, client_port: u16) -> ConnectResult {
    if client_port == 0 {
        return ConnectResult::InvalidArgument { message: "client_port must be nonzero".to_string() };
    }
    let endpoint = SocketAddr::new(client_address, client_port);
    let uuid = SessionId::new();

    match state.registry.add(uuid, endpoint).await {
        AddOutcome::RejectedDuplicateEndpoint => {
            ConnectResult::AlreadyExists { message: "a live session already uses this endpoint".to_string() }
        }
        AddOutcome::Added | AddOutcome::Replaced => ConnectResult::Success {
            client_uuid: uuid,
            server_address: state.server_address,
            server_udp_port: state.server_udp_port,
            server_format: *state.current_format.read().await,
        },
    }
}

/// Callback invoked when the client's control loops give up and must tear
/// the session down.
pub type ShutdownCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked by the format-check loop when the server's format
/// descriptor differs from the cached one.
pub type ReconfigureCallback = Arc<dyn Fn(AudioFormat) + Send + Sync>;

/// Persistent client-side connection plus the keepalive and format-check
/// loops described in spec §4.2.
pub struct RpcClient {
    stream: tokio::sync::Mutex<TcpStream>,
}

impl RpcClient {
    pub async fn connect(server_addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(server_addr).await?;
        Ok(Self { stream: tokio::sync::Mutex::new(stream) })
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let mut stream = self.stream.lock().await;
        write_message(&mut stream, &request).await?;
        read_message(&mut stream).await
    }

    pub async fn connect_session(&self, client_address: IpAddr, client_port: u16) -> Result<ConnectResult> {
        match self.call(Request::Connect { client_address, client_port }).await? {
            Response::Connect(result) => Ok(result),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn disconnect(&self, uuid: SessionId) -> Result<bool> {
        match self.call(Request::Disconnect { uuid }).await? {
            Response::Disconnect { success } => Ok(success),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn keep_alive(&self, uuid: SessionId) -> Result<KeepAliveResult> {
        match self.call(Request::KeepAlive { uuid }).await? {
            Response::KeepAlive(result) => Ok(result),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn get_audio_format(&self, uuid: SessionId) -> Result<GetAudioFormatResult> {
        match self.call(Request::GetAudioFormat { uuid }).await? {
            Response::GetAudioFormat(result) => Ok(result),
            _ => Err(unexpected_response()),
        }
    }
}

/// The RPC peer answered with a response shape that didn't match the
/// request kind — the control plane itself is broken, not just this one
/// call, so this maps to `ControlPlaneFatal` rather than a retryable error.
fn unexpected_response() -> AudiocastError {
    let err = AudiocastError::ControlPlaneFatal;
    tracing::error!(%err, "rpc response did not match the request kind");
    err
}

/// Every 1s: keep the session alive, retrying up to
/// [`KEEPALIVE_RETRY_ATTEMPTS`] times before invoking `on_fatal` and exiting.
pub async fn run_keepalive_loop(
    client: Arc<RpcClient>,
    session: Arc<std::sync::Mutex<Option<SessionId>>>,
    on_fatal: ShutdownCallback,
    running: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
    while running.load(Ordering::Relaxed) {
        interval.tick().await;

        let uuid = *session.lock().unwrap();
        let Some(uuid) = uuid else { continue };

        let mut attempts_left = KEEPALIVE_RETRY_ATTEMPTS;
        loop {
            match client.keep_alive(uuid).await {
                Ok(KeepAliveResult::Success) => break,
                Ok(KeepAliveResult::NotFound { .. }) | Err(_) => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        let err = AudiocastError::ControlPlaneFatal;
                        tracing::error!(%err, "keepalive exhausted retries");
                        on_fatal();
                        running.store(false, Ordering::Relaxed);
                        return;
                    }
                    tokio::time::sleep(KEEPALIVE_RETRY_BACKOFF).await;
                }
            }
        }
    }
}

/// Every 1s: if the server's current format differs from the cached one in
/// encoding, channels, or rate, update the cache and invoke `on_reconfigure`.
pub async fn run_format_check_loop(
    client: Arc<RpcClient>,
    session: Arc<std::sync::Mutex<Option<SessionId>>>,
    cached_format: Arc<std::sync::Mutex<AudioFormat>>,
    on_reconfigure: ReconfigureCallback,
    running: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(FORMAT_CHECK_INTERVAL);
    while running.load(Ordering::Relaxed) {
        interval.tick().await;

        let uuid = *session.lock().unwrap();
        let Some(uuid) = uuid else { continue };

        let Ok(GetAudioFormatResult::Success { format }) = client.get_audio_format(uuid).await else {
            continue;
        };

        let differs = {
            let cached = *cached_format.lock().unwrap();
            cached.encoding != format.encoding || cached.channels != format.channels || cached.sample_rate != format.sample_rate
        };
        if differs {
            *cached_format.lock().unwrap() = format;
            on_reconfigure(format);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Encoding;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn format() -> AudioFormat {
        AudioFormat { encoding: Encoding::PcmF32Le, channels: 2, sample_rate: 48_000, bit_depth: 32 }
    }

    async fn spawn_test_server() -> (RpcServer, SocketAddr, SessionRegistry) {
        let registry = SessionRegistry::new();
        let state = RpcServerState {
            registry: registry.clone(),
            server_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_udp_port: 10120,
            current_format: Arc::new(RwLock::new(format())),
        };
        let server = RpcServer::bind("127.0.0.1:0".parse().unwrap(), state, 8).await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr, registry)
    }

    #[tokio::test]
    async fn connect_then_keepalive_then_disconnect_round_trip() {
        let (server, addr, registry) = spawn_test_server().await;
        let running = Arc::new(AtomicBool::new(true));
        let running_for_server = running.clone();
        let server_task = tokio::spawn(server.run(running_for_server));

        let client = RpcClient::connect(addr).await.unwrap();
        let connect = client.connect_session(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000).await.unwrap();
        let uuid = match connect {
            ConnectResult::Success { client_uuid, server_udp_port, .. } => {
                assert_eq!(server_udp_port, 10120);
                client_uuid
            }
            other => panic!("unexpected connect result: {other:?}"),
        };
        assert_eq!(registry.len().await, 1);

        let keepalive = client.keep_alive(uuid).await.unwrap();
        assert!(matches!(keepalive, KeepAliveResult::Success));

        let disconnected = client.disconnect(uuid).await.unwrap();
        assert!(disconnected);
        assert_eq!(registry.len().await, 0);

        running.store(false, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(1), server_task).await;
    }

    #[tokio::test]
    async fn connect_rejects_duplicate_endpoint() {
        let (server, addr, _registry) = spawn_test_server().await;
        let running = Arc::new(AtomicBool::new(true));
        let server_task = tokio::spawn(server.run(running.clone()));

        let client_a = RpcClient::connect(addr).await.unwrap();
        let client_b = RpcClient::connect(addr).await.unwrap();

        let first = client_a.connect_session(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000).await.unwrap();
        assert!(matches!(first, ConnectResult::Success { .. }));

        let second = client_b.connect_session(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000).await.unwrap();
        assert!(matches!(second, ConnectResult::AlreadyExists { .. }));

        running.store(false, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(1), server_task).await;
    }

    #[tokio::test]
    async fn keepalive_on_unknown_session_returns_not_found() {
        let (server, addr, _registry) = spawn_test_server().await;
        let running = Arc::new(AtomicBool::new(true));
        let server_task = tokio::spawn(server.run(running.clone()));

        let client = RpcClient::connect(addr).await.unwrap();
        let result = client.keep_alive(SessionId::new()).await.unwrap();
        assert!(matches!(result, KeepAliveResult::NotFound { .. }));

        running.store(false, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(1), server_task).await;
    }

    #[tokio::test]
    async fn keepalive_loop_exhausts_retries_then_invokes_shutdown() {
        // A client whose stream points at an address nothing listens on —
        // every keep_alive call fails at the transport layer, so the loop
        // must invoke on_fatal after KEEPALIVE_RETRY_ATTEMPTS failures.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener); // nothing accepts; connect then immediately close

        // Build a client against a socket pair we control the lifetime of.
        let server_task = tokio::spawn(async move {
            if let Ok((stream, _)) = TcpListener::bind(addr).await.unwrap().accept().await {
                drop(stream);
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = Arc::new(RpcClient::connect(addr).await.unwrap());
        let session = Arc::new(std::sync::Mutex::new(Some(SessionId::new())));
        let fatal_count = Arc::new(AtomicUsize::new(0));
        let fatal_count_cb = fatal_count.clone();
        let running = Arc::new(AtomicBool::new(true));

        run_keepalive_loop(
            client,
            session,
            Arc::new(move || {
                fatal_count_cb.fetch_add(1, Ordering::Relaxed);
            }),
            running.clone(),
        )
        .await;

        assert_eq!(fatal_count.load(Ordering::Relaxed), 1);
        assert!(!running.load(Ordering::Relaxed));
        let _ = server_task.await;
    }
}
