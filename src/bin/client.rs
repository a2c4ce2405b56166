use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;

use audiocast::audio::{list_devices, device_name, PlaybackConsumer};
use audiocast::buffer::AdaptiveBuffer;
use audiocast::cli::{auto_detect_bind_address, env_filter_for_verbosity, resolve_client_port, ClientArgs};
use audiocast::format_change::apply_format_change;
use audiocast::receiver::run_receive_loop;
use audiocast::rpc::{ConnectResult, RpcClient};
use audiocast::session::SessionId;
use audiocast::wire::AudioFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ClientArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter_for_verbosity(args.verbose))
        .with_target(false)
        .init();

    let client_address = args.client_address.unwrap_or_else(auto_detect_bind_address);
    let client_port = resolve_client_port(args.client_port);
    let server_control_addr = SocketAddr::new(args.server, args.server_port);

    tracing::info!(%client_address, client_port, server = %args.server, "starting audiocast-client");

    let running = Arc::new(AtomicBool::new(true));
    let rpc_client = Arc::new(RpcClient::connect(server_control_addr).await.context("connecting to server")?);

    let connect_result = rpc_client
        .connect_session(client_address, client_port)
        .await
        .context("sending Connect request")?;

    let (session_uuid, server_udp_port, initial_format) = match connect_result {
        ConnectResult::Success { client_uuid, server_udp_port, server_format, .. } => {
            (client_uuid, server_udp_port, server_format)
        }
        ConnectResult::InvalidArgument { message } => anyhow::bail!("server rejected Connect: {message}"),
        ConnectResult::AlreadyExists { message } => anyhow::bail!("server rejected Connect: {message}"),
    };
    tracing::info!(%session_uuid, "connected");

    let session: Arc<StdMutex<Option<SessionId>>> = Arc::new(StdMutex::new(Some(session_uuid)));
    let cached_format = Arc::new(StdMutex::new(initial_format));

    let playout_buffer = Arc::new(Mutex::new(AdaptiveBuffer::new()));
    let udp_socket = Arc::new(tokio::net::UdpSocket::bind(SocketAddr::new(client_address, client_port)).await.context("binding local UDP socket")?);
    udp_socket.connect(SocketAddr::new(args.server, server_udp_port)).await.context("connecting UDP socket to server")?;

    let total_bytes_received = Arc::new(AtomicU64::new(0));
    let receiver_running = running.clone();
    let receiver_buffer = playout_buffer.clone();
    let receiver_socket = udp_socket.clone();
    let receiver_bytes = total_bytes_received.clone();
    tokio::spawn(run_receive_loop(receiver_socket, receiver_buffer, receiver_running, receiver_bytes));

    let (_inputs, outputs) = list_devices().context("enumerating audio devices")?;
    let output_device = outputs.into_iter().next().context("no output device available")?;
    tracing::info!(device = device_name(&output_device), "selected playback device");

    let mut playback = PlaybackConsumer::new(output_device, playout_buffer.clone(), running.clone(), initial_format);
    {
        use audiocast::format_change::PlaybackController;
        playback.start().context("starting initial playback")?;
    }
    let playback = Arc::new(Mutex::new(playback));

    let keepalive_client = rpc_client.clone();
    let keepalive_session = session.clone();
    let keepalive_running = running.clone();
    let shutdown_playback = playback.clone();
    tokio::spawn(audiocast::rpc::run_keepalive_loop(
        keepalive_client,
        keepalive_session,
        Arc::new(move || {
            tracing::error!("keepalive exhausted retries, shutting down");
            use audiocast::format_change::PlaybackController;
            shutdown_playback.lock().stop().ok();
        }),
        keepalive_running,
    ));

    let format_client = rpc_client.clone();
    let format_session = session.clone();
    let format_cached = cached_format.clone();
    let format_running = running.clone();
    let reconfigure_playback = playback.clone();
    tokio::spawn(audiocast::rpc::run_format_check_loop(
        format_client,
        format_session,
        format_cached,
        Arc::new(move |new_format: AudioFormat| {
            tracing::info!(encoding = %new_format.encoding, channels = new_format.channels, rate = new_format.sample_rate, "format change detected");
            let mut guard = reconfigure_playback.lock();
            if let Err(err) = apply_format_change(&mut *guard, new_format) {
                tracing::error!(%err, "failed to apply format change");
            }
        }),
        format_running,
    ));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    running.store(false, Ordering::Relaxed);

    if let Some(uuid) = *session.lock().unwrap() {
        let _ = rpc_client.disconnect(uuid).await;
    }

    Ok(())
}
