//! Janus gateway entry point.
//!
//! Loads the YAML gateway config, assembles the proxy (client factory,
//! middleware registry, discovery provider), serves every configured
//! address with h2c support and hot-reloads the routing table whenever the
//! config file changes.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use janus_client::{BuildContext, ClientFactory};
use janus_discovery::Discovery;
use janus_proxy::{debug, MiddlewareFactory, Proxy};
use janus_router::HandlerFuture;
use janus_server::ProxyServer;
use janus_telemetry::logging::{init_logging, LogConfig};
use janus_telemetry::metrics::init_metrics;

#[derive(Parser, Debug)]
#[command(name = "janus-gateway", about = "A reconfigurable API gateway", version)]
struct Args {
    /// Proxy listen address; repeatable.
    #[arg(long = "addr", default_value = "0.0.0.0:8080")]
    addrs: Vec<SocketAddr>,

    /// Gateway config file.
    #[arg(long = "conf", default_value = "config.yaml")]
    conf: PathBuf,

    /// Discovery DSN, e.g. `consul://127.0.0.1:8500?token=secret`.
    #[arg(long = "discovery-dsn")]
    discovery_dsn: Option<String>,

    /// Expose the debug handlers under /debug.
    #[arg(long)]
    debug: bool,

    /// Human-readable logs instead of JSON.
    #[arg(long)]
    pretty_logs: bool,
}

fn make_discovery(dsn: Option<&str>) -> Option<Arc<dyn Discovery>> {
    let dsn = dsn?;
    match janus_discovery::create(dsn) {
        Ok(provider) => Some(provider),
        Err(err) => {
            tracing::error!(error = %err, "failed to create discovery");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_config = if args.pretty_logs { LogConfig::development() } else { LogConfig::default() };
    if let Err(err) = init_logging(&log_config) {
        eprintln!("failed to init logging: {err}");
    }
    if let Err(err) = init_metrics() {
        tracing::warn!(error = %err, "failed to install metrics recorder");
    }

    janus_middleware::register_builtin();

    let client_factory: ClientFactory =
        janus_client::new_factory(make_discovery(args.discovery_dsn.as_deref()));
    let middleware_factory: MiddlewareFactory =
        Arc::new(|cfg| janus_middleware::registry::create(cfg));
    let proxy = Proxy::new(client_factory, middleware_factory);

    let gateway = match config::load(&args.conf) {
        Ok(gateway) => gateway,
        Err(err) => {
            tracing::error!(error = %err, "failed to load config");
            std::process::exit(1);
        }
    };
    if let Err(err) = proxy.update(BuildContext::new(&gateway), &gateway).await {
        tracing::error!(error = %err, "failed to build initial routing table");
        std::process::exit(1);
    }
    tracing::info!(name = %gateway.name, endpoints = gateway.endpoints.len(), "gateway started");

    // Hot reload: a failed reload keeps the previous routing table.
    match config::ConfigWatcher::new(&args.conf) {
        Ok(mut watcher) => {
            let proxy = proxy.clone();
            let conf = args.conf.clone();
            tokio::spawn(async move {
                while watcher.changed().await.is_some() {
                    match config::load(&conf) {
                        Ok(gateway) => {
                            match proxy.update(BuildContext::new(&gateway), &gateway).await {
                                Ok(()) => tracing::info!("config reloaded"),
                                Err(err) => {
                                    tracing::error!(error = %err, "failed to update service config");
                                }
                            }
                        }
                        Err(err) => tracing::error!(error = %err, "failed to load config"),
                    }
                }
            });
        }
        Err(err) => tracing::warn!(error = %err, "config watching disabled"),
    }

    if args.debug {
        debug::register("proxy", proxy.debug_handler());
        debug::register("watcher", debug::watcher_debug_handler());
    }

    let with_debug = args.debug;
    let service = {
        let proxy = proxy.clone();
        move |req: http::Request<hyper::body::Incoming>| -> HandlerFuture {
            if with_debug && debug::is_debug_path(req.uri().path()) {
                return debug::handle(req);
            }
            let proxy = proxy.clone();
            Box::pin(async move { proxy.handle(req).await })
        }
    };

    let mut servers = tokio::task::JoinSet::new();
    for addr in args.addrs {
        let service = service.clone();
        servers.spawn(async move {
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            if let Err(err) = ProxyServer::new(addr).run(service, shutdown).await {
                tracing::error!(addr = %addr, error = %err, "server failed");
            }
        });
    }
    while servers.join_next().await.is_some() {}
    tracing::info!("gateway stopped");
}
