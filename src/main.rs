
use std::net::IpAddr;
use std::sync::Arc;

use eyre::WrapErr;
use lexopt::prelude::*;
use tokio::sync::watch;

mod config;
mod frame;
mod resolver;
mod tcp;
mod udp;
mod upstream;

use config::Config;
use resolver::{CoordinatorResolver, FileResolver, DEFAULT_COORDINATOR_FILE};

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    // Initialize logging based on command-line flags before argument parsing
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--debug".to_string()) {
        std::env::set_var("RUST_LOG", "debug");
    } else if args.contains(&"-v".to_string()) || args.contains(&"--verbose".to_string()) {
        std::env::set_var("RUST_LOG", "info");
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let mut config = Config::default();
    let mut coordinator_file = String::from(DEFAULT_COORDINATOR_FILE);

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next().wrap_err("parse arguments")? {
        match arg {
            Short('4') | Long("listen-address") => {
                config.listen_addr = parser
                    .value()
                    .wrap_err("value missing")?
                    .to_string_lossy()
                    .parse::<IpAddr>()
                    .wrap_err("--listen-address")?;
            }
            Short('p') | Long("port") => {
                config.listen_port = parser
                    .value()
                    .wrap_err("value missing")?
                    .to_string_lossy()
                    .parse::<u16>()
                    .wrap_err("--port")?;
            }
            Short('i') | Long("interface") => {
                config.tunnel_interface = parser
                    .value()
                    .wrap_err("value missing")?
                    .to_string_lossy()
                    .into_owned();
            }
            Long("coordinator-file") => {
                coordinator_file = parser
                    .value()
                    .wrap_err("value missing")?
                    .to_string_lossy()
                    .into_owned();
            }
            Long("max-sessions") => {
                config.max_sessions = parser
                    .value()
                    .wrap_err("value missing")?
                    .to_string_lossy()
                    .parse::<usize>()
                    .wrap_err("--max-sessions")?;
            }
            Short('v') | Long("verbose") | Long("debug") => {
                // Already consumed by the logging setup above
            }
            Short('V') | Long("version") => {
                eprintln!(
                    "{} {} (r{})",
                    env!("CARGO_BIN_NAME"),
                    env!("CARGO_PKG_VERSION"),
                    env!("GIT_HASH")
                );
                std::process::exit(0);
            }
            Short('h') | Long("help") => {
                usage(0);
            }
            _ => return Err(arg.unexpected()).wrap_err("unexpected argument"),
        }
    }

    tracing::info!(
        "starting jipd - listening on {}:{} (TCP and UDP), device network port {}",
        config.listen_addr,
        config.listen_port,
        config.jip_port
    );

    let resolver: Arc<dyn CoordinatorResolver> = Arc::new(FileResolver::new(&coordinator_file));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let udp_tunnel = udp::UdpTunnel::bind(config.clone(), resolver.clone(), shutdown_rx.clone())
        .await
        .wrap_err("bind UDP listen socket")?;
    let tcp_tunnel = tcp::TcpTunnel::bind(config, resolver, shutdown_rx)
        .await
        .wrap_err("bind TCP listen socket")?;

    let mut udp_task = tokio::spawn(udp_tunnel.run());
    let mut tcp_task = tokio::spawn(tcp_tunnel.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
            let _ = shutdown_tx.send(true);
            let _ = udp_task.await;
            let _ = tcp_task.await;
            tracing::info!("daemon exiting");
            Ok(())
        }
        res = &mut udp_task => {
            let _ = shutdown_tx.send(true);
            let _ = tcp_task.await;
            res.wrap_err("UDP tunnel task panicked")?
                .wrap_err("UDP tunnel failed")?;
            eyre::bail!("UDP tunnel exited unexpectedly");
        }
        res = &mut tcp_task => {
            let _ = shutdown_tx.send(true);
            let _ = udp_task.await;
            res.wrap_err("TCP tunnel task panicked")?
                .wrap_err("TCP tunnel failed")?;
            eyre::bail!("TCP tunnel exited unexpectedly");
        }
    }
}

/// Prints usage information and exits with the given code.
fn usage(exit_with: i32) -> ! {
    let bin = std::env::args()
        .next()
        .unwrap_or_else(|| String::from(env!("CARGO_BIN_NAME")));

    eprintln!(
        "{} {} (r{})",
        env!("CARGO_BIN_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );
    eprintln!();
    eprintln!("DESCRIPTION:");
    eprintln!("    Gateway daemon that lets IPv4-only clients reach an IPv6 JIP device");
    eprintln!("    network. JIPv4-framed traffic arriving over TCP or UDP is unwrapped and");
    eprintln!("    forwarded as raw IPv6 UDP; device replies are framed and sent back.");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    {bin} [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -4, --listen-address <IP>      IPv4 address to listen on. Default 0.0.0.0 (all)");
    eprintln!("    -p, --port <PORT>              Port to listen on for TCP and UDP. Default 1873");
    eprintln!("    -i, --interface <NAME>         Multicast egress interface. Default tun0");
    eprintln!("        --coordinator-file <PATH>  Coordinator address record file.");
    eprintln!("                                   Default {DEFAULT_COORDINATOR_FILE}");
    eprintln!("        --max-sessions <N>         Concurrent TCP session limit. Default 64");
    eprintln!("    -v, --verbose                  Enable verbose logging");
    eprintln!("        --debug                    Enable debug logging with packet details");
    eprintln!("    -V, --version                  Print version and exit");
    eprintln!("    -h, --help                     Show this help message");
    eprintln!();
    eprintln!("FRAME FORMAT (IPv4 side, both transports):");
    eprintln!("    offset 0: version  (1 byte, must be 1)");
    eprintln!("    offset 1: length   (2 bytes big-endian, = 16 + payload length)");
    eprintln!("    offset 3: address  (16 byte IPv6 address; all-zero = coordinator)");
    eprintln!("    offset 19: payload");
    eprintln!();
    std::process::exit(exit_with);
}
