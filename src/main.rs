use anyhow::Result;
use clap::Parser;
use throttled_proxy::cli::Cli;
use throttled_proxy::config::ProxyConfig;
use throttled_proxy::server::run_proxy;
use throttled_proxy::stats::format_bytes;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG 优先，否则使用 --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Throttled Proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.resolve_config()?;

    if cli.check {
        print_config(&config);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    run_proxy(config, shutdown).await?;
    Ok(())
}

/// 等待 SIGINT / SIGTERM，然后触发优雅关闭
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }

    shutdown.cancel();
}

/// 打印解析后的配置
fn print_config(config: &ProxyConfig) {
    let bandwidth = config.bandwidth();
    println!("✓ Listen address: {}", config.listen_addr());
    println!(
        "✓ Rate: {}/s ({} bytes/s)",
        format_bytes(bandwidth.bytes_per_second as u64),
        bandwidth.bytes_per_second
    );
    println!(
        "✓ Burst: {} ({} bytes)",
        format_bytes(bandwidth.burst_bytes as u64),
        bandwidth.burst_bytes
    );
    println!(
        "✓ Tunnel connect timeout: {:?}",
        config.tunnel_dial().connect_timeout
    );
    println!(
        "✓ Forward connect timeout: {:?}",
        config.forward_dial().connect_timeout
    );
    println!("✓ TCP keepalive: {:?}", config.tunnel_dial().keepalive);
    println!("\n✓ Configuration is valid!");
}
