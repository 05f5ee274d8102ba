mod chnroute;
mod config;
mod dns64;
mod dot;
mod engine;
mod proto_utils;
mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::engine::Engine;

#[derive(Parser, Debug)]
#[command(author, version, about = "Split-horizon DNS64 resolver racing domestic and overseas upstreams", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = config::load_config(&args.config).context("load config")?;
    init_tracing(cfg.debug);
    info!(
        path = %args.config.display(),
        domestic = cfg.domestic.len(),
        overseas = cfg.overseas.len(),
        timeout_ms = cfg.timeout_ms,
        grace_ms = cfg.china_timeout_offset_ms,
        "config loaded"
    );

    let chnroute =
        Arc::new(chnroute::ChnRoute::load(&cfg.ip_database).context("load ip database")?);
    info!(prefixes = chnroute.len(), path = %cfg.ip_database, "ip database loaded");

    // rustls 0.23 needs a process-level crypto provider before any config is built
    let _ = rustls::crypto::ring::default_provider().install_default();
    let tls_config =
        dot::load_tls_config(&cfg.tls_cert, &cfg.tls_key).context("load tls material")?;

    let bind_udp: SocketAddr = cfg.listen_udp.parse().context("parse listen_udp")?;
    let bind_tls: SocketAddr = cfg.listen_tls.parse().context("parse listen_tls")?;

    let engine = Engine::new(Arc::new(cfg), chnroute);

    // UDP worker 数量：每核一个，最少 1 个
    let udp_workers = num_cpus::get().max(1);
    info!(bind_udp = %bind_udp, bind_tls = %bind_tls, udp_workers, "dns64 server started");

    let mut handles = Vec::with_capacity(udp_workers + 1);

    #[cfg(unix)]
    {
        // On Unix create individual sockets with SO_REUSEPORT so the kernel
        // distributes packets across workers.
        for worker_id in 0..udp_workers {
            let engine = engine.clone();
            let std_socket = create_reuseport_udp_socket(bind_udp)
                .with_context(|| format!("create udp socket for worker {}", worker_id))?;
            let socket = UdpSocket::from_std(std_socket)?;
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(Arc::new(socket), engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    #[cfg(not(unix))]
    {
        // Non-Unix: one shared socket for all workers
        let socket = Arc::new(UdpSocket::bind(bind_udp).await.context("bind udp socket")?);
        for worker_id in 0..udp_workers {
            let engine = engine.clone();
            let socket = Arc::clone(&socket);
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(socket, engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    let tls_listener = TcpListener::bind(bind_tls)
        .await
        .context("bind dot listener")?;
    let dot_engine = engine.clone();
    handles.push(tokio::spawn(async move {
        if let Err(err) = dot::run_dot(tls_listener, tls_config, dot_engine).await {
            error!(error = %err, "dot server exited");
        }
    }));

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

// 在 Unix 上创建带 SO_REUSEPORT 的 UDP socket；非 Unix 使用标准绑定
#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // Set SO_REUSEPORT via libc to avoid depending on socket2 method availability
    use libc::{c_int, c_void, setsockopt, socklen_t, SOL_SOCKET, SO_REUSEPORT};
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // non-fatal: continue without reuseport
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// UDP worker：接收循环里只做收包，仲裁在独立任务中进行
async fn run_udp_worker(socket: Arc<UdpSocket>, engine: Engine) -> anyhow::Result<()> {
    let mut buf = [0u8; 4096];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let packet = buf[..len].to_vec();
                let engine = engine.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    match engine.handle_packet(&packet).await {
                        Ok(resp) => {
                            if let Err(err) = socket.send_to(&resp, peer).await {
                                warn!(client = %peer, error = %err, "write to client failed");
                            }
                        }
                        // 失败时不写任何东西，客户端会按 DNS 惯例重试
                        Err(err) => {
                            tracing::debug!(client = %peer, error = %err, "query failed, nothing written")
                        }
                    }
                });
            }
            Err(err) => {
                // 继续接收，不退出
                warn!(error = %err, "udp recv error");
            }
        }
    }
}
