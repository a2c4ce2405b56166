use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::RwLock;

use audiocast::cli::{auto_detect_bind_address, env_filter_for_verbosity, ServerArgs};
use audiocast::audio::{list_devices, device_name, CaptureProducer};
use audiocast::rpc::{RpcServer, RpcServerState};
use audiocast::sender::{run_fan_out, Packetizer, SendQueue};
use audiocast::session::SessionRegistry;
use audiocast::wire::AudioFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter_for_verbosity(args.verbose))
        .with_target(false)
        .init();

    let bind_ip = args.bind.unwrap_or_else(auto_detect_bind_address);
    let format = AudioFormat::new(args.encoding.into(), args.channels, args.rate)
        .context("requested audio format is invalid")?;

    tracing::info!(%bind_ip, port = args.port, encoding = %format.encoding, channels = format.channels, rate = format.sample_rate, "starting audiocast-server");

    let running = Arc::new(AtomicBool::new(true));
    let registry = SessionRegistry::new();
    let current_format = Arc::new(RwLock::new(format));

    let (inputs, _outputs) = list_devices().context("enumerating audio devices")?;
    let input_device = inputs.into_iter().next().context("no input device available")?;
    tracing::info!(device = device_name(&input_device), "selected capture device");

    let (capture, capture_rx) =
        CaptureProducer::start(&input_device, running.clone(), format).context("starting capture stream")?;
    *current_format.write().await = capture.format;

    let udp_socket = Arc::new(tokio::net::UdpSocket::bind(SocketAddr::new(bind_ip, args.port)).await.context("binding UDP socket")?);
    let rpc_addr = SocketAddr::new(bind_ip, args.port);

    let rpc_state = RpcServerState {
        registry: registry.clone(),
        server_address: bind_ip,
        server_udp_port: args.port,
        current_format: current_format.clone(),
    };
    let rpc_server = RpcServer::bind(rpc_addr, rpc_state, 16).await.context("binding RPC listener")?;

    let send_queue = Arc::new(SendQueue::new());
    let total_bytes_sent = Arc::new(AtomicU64::new(0));

    let sweeper_registry = registry.clone();
    let sweeper_running = running.clone();
    tokio::spawn(async move { sweeper_registry.run_sweeper(sweeper_running).await });

    let rpc_running = running.clone();
    tokio::spawn(rpc_server.run(rpc_running));

    let fan_out_queue = send_queue.clone();
    let fan_out_registry = registry.clone();
    let fan_out_socket = udp_socket.clone();
    let fan_out_running = running.clone();
    let fan_out_bytes = total_bytes_sent.clone();
    tokio::spawn(run_fan_out(fan_out_queue, fan_out_registry, fan_out_socket, fan_out_running, fan_out_bytes));

    let packetize_queue = send_queue.clone();
    let packetize_running = running.clone();
    let packetizer_format = current_format.read().await.clone();
    tokio::spawn(async move {
        let mut packetizer = Packetizer::new(packetizer_format);
        while packetize_running.load(std::sync::atomic::Ordering::Relaxed) {
            match capture_rx.recv_timeout(std::time::Duration::from_millis(200)) {
                Ok(chunk) => {
                    for packet in packetizer.packetize(&chunk) {
                        packetize_queue.push(packet);
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    running.store(false, std::sync::atomic::Ordering::Relaxed);
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    Ok(())
}
