use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};
use futures_util::future::join_all;
use shardgate::{
    adapters::{
        HttpBackendClient, HttpCollector, HttpHandler, HttpNodeDiscovery, LogTxStatusSink,
        MaintenanceTasks, WsUpstreamConnector,
    },
    config::{ServerConfigValidator, load_config},
    core::GatewayService,
    metrics,
    ports::collector::Collector,
    tracing_setup::{self, LogFormat},
    utils::graceful_shutdown::{GracefulShutdown, ShutdownReason},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Human readable logs instead of JSON lines
    #[clap(long, global = true)]
    pretty: bool,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config, args.pretty).await,
        None => serve(&args.config, args.pretty).await,
    }
}

/// Log panics through tracing before the default report runs.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(%location, panic = %info, "Panic in gateway task");
        previous(info);
    }));
}

async fn serve(config_path: &str, pretty: bool) -> Result<()> {
    let format = if pretty {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    };
    tracing_setup::init_tracing(format, "info")?;
    install_panic_hook();
    metrics::init_metrics();

    let config = load_config(config_path)
        .await
        .wrap_err_with(|| format!("Failed to load configuration from {config_path}"))?;
    ServerConfigValidator::validate(&config).map_err(|e| eyre!("Invalid configuration:\n{e}"))?;
    let config = Arc::new(config);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .wrap_err_with(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let backend = Arc::new(HttpBackendClient::new(&config.backend)?);
    let collector: Option<Arc<dyn Collector>> = if config.collector.enabled {
        Some(Arc::new(HttpCollector::new(&config.collector)?))
    } else {
        None
    };
    let gateway = Arc::new(GatewayService::new(config.clone(), backend, collector)?);

    let discovery = Arc::new(HttpNodeDiscovery::new(&config.discovery)?);
    let maintenance = Arc::new(MaintenanceTasks::new(
        gateway.clone(),
        discovery,
        Arc::new(LogTxStatusSink),
    ));
    if let Err(e) = maintenance.refresh_nodes().await {
        tracing::warn!(error = %e, "Initial node list refresh failed, serving without nodes until the next refresh");
    }
    match gateway.nodes().snapshot().active() {
        Some(active) => tracing::info!(active = %active, "Active node selected"),
        None => tracing::warn!("No active node yet"),
    }

    let shutdown = Arc::new(GracefulShutdown::new());
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.run_signal_handler().await });

    let token = shutdown.shutdown_token();
    let mut background = maintenance.spawn_all(&token);
    background.push(
        gateway
            .relay()
            .spawn(Arc::new(WsUpstreamConnector::new(&config.upstream)), token.clone()),
    );

    let app = HttpHandler::new(gateway.clone()).router();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(
        %addr,
        chain_id = config.chain_id,
        websocket = config.websocket.enabled,
        "Shardgate JSON-RPC gateway listening"
    );

    let mut server_token = token.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            server_token.wait_for_shutdown().await;
        })
        .await
    });

    let mut waiter = token.clone();
    let exited = tokio::select! {
        joined = &mut server => Some(joined),
        _ = waiter.wait_for_shutdown() => None,
    };

    match exited {
        Some(joined) => {
            shutdown.trigger_shutdown(ShutdownReason::Force);
            joined
                .wrap_err("Server task failed")?
                .wrap_err("Server error")?;
        }
        None => {
            tracing::info!("Draining connections");
            let reason = shutdown
                .drain(async {
                    let _ = (&mut server).await;
                    join_all(background.iter_mut()).await;
                })
                .await;
            if reason == ShutdownReason::Force {
                server.abort();
                background.iter().for_each(|handle| handle.abort());
            }
        }
    }

    tracing::info!("Shardgate stopped");
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Configuration Summary:");
            println!("   - Listen Address: {}", config.listen_addr);
            println!("   - Chain Id: {}", config.chain_id);
            match &config.discovery.archiver_url {
                Some(url) => println!("   - Node Discovery: archiver {url}"),
                None => println!(
                    "   - Node Discovery: {} seed node(s)",
                    config.discovery.seed_nodes.len()
                ),
            }
            println!("   - Rate Limiting: {}", config.rate_limit.enabled);
            println!(
                "   - Subscriptions: {}",
                config.websocket.enabled && config.websocket.serve_subscriptions
            );
            println!("   - Collector Fallback: {}", config.collector.enabled);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("Common fixes:");
            println!("   - Set discovery.archiver_url or at least one discovery.seed_nodes entry");
            println!("   - Seed nodes use the host:port form");
            println!("   - The upstream url starts with ws:// or wss://");
            println!("   - rate_limit.window uses humantime units (30s, 1m, 1h)");
            std::process::exit(1);
        }
    }
}

const DEFAULT_CONFIG: &str = r#"# Shardgate configuration

listen_addr = "0.0.0.0:8080"
chain_id = 8082
# Identity sent to the upstream log server; defaults to the listen address.
# public_ip = "203.0.113.10"
# public_port = 8080

# Required by protected routes such as /api/subscribe
# admin_token = "change-me"

[discovery]
# archiver_url = "http://127.0.0.1:4000"
seed_nodes = ["127.0.0.1:9001"]
refresh_interval_secs = 10
request_timeout_secs = 2
probe_path = "/nodeinfo"
unhealthy_threshold = 3
active_node_policy = "first_discovered"

[maintenance]
health_check_interval_secs = 60
bad_node_prune_interval_secs = 60
tx_flush_interval_secs = 5
bad_node_threshold = 3

[backend]
rpc_path = "/"
request_timeout_secs = 10
record_tx_status = true

[rate_limit]
enabled = true
soft_reject = false
window = "1m"
threshold = 600
broad_query_multiplier = 2
block_list = []
spammer_list = []

[rate_limit.method_weights]
eth_getLogs = 10
eth_call = 2
eth_estimateGas = 2
eth_sendRawTransaction = 3

[websocket]
enabled = true
serve_subscriptions = true

[upstream]
enabled = true
url = "ws://127.0.0.1:4446/evm_log_subscription"
reconnect_delay_secs = 5

[collector]
enabled = false
base_url = "http://127.0.0.1:6001"
"#;

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG)
        .await
        .wrap_err("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'shardgate serve --config {config_path}' to start the gateway");
    Ok(())
}
