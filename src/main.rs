use std::io::Write;
use std::sync::Arc;

use log::{error, info};
use tokio::runtime::Builder;
use tokio::task::JoinHandle;

use netrelay::config::{load_configs, ServerConfig, ServerMode};
use netrelay::echo_server::EchoServer;
use netrelay::proxy_server::ProxyServer;
use netrelay::server::NetServer;
use netrelay::tls::{create_acceptor, TlsAcceptor};

async fn build_tls_acceptor(
    config: &ServerConfig,
) -> std::io::Result<Option<Arc<dyn TlsAcceptor>>> {
    let tls_config = match &config.tls {
        Some(c) => c,
        None => return Ok(None),
    };
    let cert_bytes = tokio::fs::read(&tls_config.cert).await?;
    let key_bytes = tokio::fs::read(&tls_config.key).await?;
    Ok(Some(create_acceptor(&cert_bytes, &key_bytes)?))
}

async fn start_server(
    config: ServerConfig,
) -> std::io::Result<(Arc<dyn NetServer>, Vec<JoinHandle<()>>)> {
    let tls_acceptor = build_tls_acceptor(&config).await?;

    let server: Arc<dyn NetServer> = match config.mode {
        ServerMode::Echo => Arc::new(EchoServer::new(
            config.address,
            tls_acceptor,
            config.udp_concurrency,
        )),
        ServerMode::Proxy => Arc::new(ProxyServer::new(
            config.address,
            config.destination.expect("validated proxy destination"),
            tls_acceptor,
        )),
    };

    // Bind both listeners before serving so a bind error aborts startup of
    // this one service.
    let listener = server.listen().await?;
    let packet_socket = server.listen_packet().await?;

    let stream_handle = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!("stream serve loop failed: {e}");
            }
        })
    };
    let packet_handle = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_packet(packet_socket).await {
                error!("packet serve loop failed: {e}");
            }
        })
    };

    server.on_startup_complete();

    Ok((server, vec![stream_handle, packet_handle]))
}

async fn run(config_paths: Vec<String>) -> std::io::Result<()> {
    let mut configs = Vec::new();
    for config_path in config_paths.iter() {
        let config_str = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            std::io::Error::new(e.kind(), format!("failed to read {config_path}: {e}"))
        })?;
        configs.extend(load_configs(&config_str)?);
    }

    let mut servers = Vec::new();
    let mut join_handles = Vec::new();
    for config in configs {
        let (server, handles) = start_server(config).await?;
        servers.push(server);
        join_handles.extend(handles);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for server in servers.iter() {
        let _ = server.stop();
    }
    // The accept/dispatch loops exit on the stop signal; in-flight relays
    // and sessions are left to drain.
    for join_handle in join_handles {
        let _ = join_handle.await;
    }
    Ok(())
}

fn print_usage_and_exit(arg0: String) -> ! {
    eprintln!("Usage: {arg0} [--threads/-t N] <config filename> [config filename] [..]");
    std::process::exit(1);
}

fn main() {
    env_logger::builder()
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            let level_style = buf.default_level_style(record.level());
            let sanitized_args = format!("{}", record.args())
                .chars()
                .map(|c| {
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '?'
                    }
                })
                .collect::<String>();

            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                sanitized_args
            )
        })
        .init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut num_threads = 0usize;
    let mut config_paths = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--threads" | "-t" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| print_usage_and_exit(arg0.clone()));
                num_threads = value
                    .parse()
                    .unwrap_or_else(|_| print_usage_and_exit(arg0.clone()));
            }
            "--help" | "-h" => print_usage_and_exit(arg0.clone()),
            _ => config_paths.push(arg),
        }
    }

    if config_paths.is_empty() {
        print_usage_and_exit(arg0);
    }

    let mut builder = Builder::new_multi_thread();
    if num_threads > 0 {
        builder.worker_threads(num_threads);
    }
    let runtime = builder
        .enable_all()
        .build()
        .expect("failed to build runtime");

    if let Err(e) = runtime.block_on(run(config_paths)) {
        error!("{e}");
        std::process::exit(1);
    }
}
