mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use fcgx::client::{ClientConnInfo, LazyClientFactory};
use fcgx::conn::{Backend, SimpleConnFactory};
use fcgx::handler::{file_endpoint, php_fs, Gateway};
use fcgx::pool::ClientPool;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::config::RouteConfig;

#[derive(Parser)]
#[command(name = "fcgxd", about = "HTTP gateway for a FastCGI application")]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// HTTP listen address. Overrides the config file's `listen` field.
    #[arg(short, long)]
    listen: Option<String>,

    /// FastCGI backend address. Overrides the config file's `backend` field.
    #[arg(short, long)]
    backend: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = config::load_config(&cli.config)?;
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if let Some(backend) = cli.backend {
        cfg.backend = backend;
    }
    cfg.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let backend = Backend::parse(&cfg.backend)?;
    let conn_factory = Arc::new(SimpleConnFactory::new(backend));
    let client_factory = Arc::new(LazyClientFactory::new(conn_factory, cfg.max_requests));
    let pool = Arc::new(ClientPool::new(
        client_factory,
        cfg.pool_scale,
        Duration::from_millis(cfg.pool_ttl_ms),
    ));

    let middleware = match &cfg.route {
        RouteConfig::Php { doc_root } => php_fs(doc_root.clone()),
        RouteConfig::Endpoint { script } => file_endpoint(script.clone()),
    };
    let gateway = Arc::new(
        Gateway::new(pool, middleware)
            .with_timeout(Duration::from_millis(cfg.request_timeout_ms)),
    );

    let listener = TcpListener::bind(&cfg.listen).await?;
    info!(listen = %cfg.listen, backend = %cfg.backend, "fcgxd listening");

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = ?err, "accept failed");
                continue;
            }
        };
        let conn_info = ClientConnInfo {
            remote_addr: Some(remote_addr),
            local_port: stream.local_addr().ok().map(|addr| addr.port()),
            tls: false,
        };
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = Arc::clone(&gateway);
                async move {
                    Ok::<_, std::convert::Infallible>(gateway.serve(req, conn_info).await)
                }
            });
            if let Err(err) = Http::new().serve_connection(stream, service).await {
                warn!(error = %err, "connection error");
            }
        });
    }
}
