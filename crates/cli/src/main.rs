use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::signal;
use tracing::{info, warn};

use vigil_core::{Event, TrackedObject};
use vigil_informer::Informer;
use vigil_kubehub::{KubeObject, KubeSource};

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Watch a Kubernetes resource kind and print its event stream")]
struct Cli {
    /// GVK key, e.g. "v1/Pod" or "cert-manager.io/v1/Certificate"
    #[arg(default_value = "v1/Pod")]
    gvk: String,

    /// Path to kubeconfig (optional; leave empty to use KUBECONFIG/in-cluster)
    #[arg(long = "kubeconfig")]
    kubeconfig: Option<PathBuf>,

    /// Namespace to watch (empty means all namespaces)
    #[arg(long = "ns", default_value = "default")]
    namespace: String,
}

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid VIGIL_METRICS_ADDR; expected host:port");
        }
    }
}

async fn config_from_file(path: &Path) -> Result<Config> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("reading kubeconfig at {}", path.display()))?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("building config from {}", path.display()))
}

/// Resolve the client config in order: KUBECONFIG env, explicit flag,
/// in-cluster, default `~/.kube/config`. Returns the source used.
async fn build_client(kubeconfig: Option<&Path>) -> Result<(Client, String)> {
    if let Ok(env) = std::env::var("KUBECONFIG") {
        if !env.is_empty() {
            if !Path::new(&env).exists() {
                bail!("KUBECONFIG is set but file not found: {env}");
            }
            let cfg = config_from_file(Path::new(&env)).await?;
            return Ok((Client::try_from(cfg)?, env));
        }
    }
    if let Some(path) = kubeconfig {
        if !path.exists() {
            bail!("kubeconfig provided but not found: {}", path.display());
        }
        let cfg = config_from_file(path).await?;
        return Ok((Client::try_from(cfg)?, path.display().to_string()));
    }
    if let Ok(cfg) = Config::incluster() {
        return Ok((Client::try_from(cfg)?, "in-cluster".to_string()));
    }
    let home = std::env::var("HOME")
        .context("HOME not set; cannot find default kubeconfig; set KUBECONFIG or use --kubeconfig")?;
    let default_path = Path::new(&home).join(".kube").join("config");
    if default_path.exists() {
        let cfg = config_from_file(&default_path).await?;
        return Ok((Client::try_from(cfg)?, default_path.display().to_string()));
    }
    bail!(
        "no kubeconfig found (KUBECONFIG, --kubeconfig, in-cluster, or {})",
        default_path.display()
    )
}

fn phase(obj: &KubeObject) -> Option<&str> {
    obj.data.get("status")?.get("phase")?.as_str()
}

fn print_event(event: &Event<KubeObject>) {
    match event {
        Event::Added(o) => match phase(o) {
            Some(p) => println!("[ADDED]   {}  (phase={})", o.key(), p),
            None => println!("[ADDED]   {}", o.key()),
        },
        Event::Updated { new, .. } => match phase(new) {
            Some(p) => println!("[UPDATED] {}  (phase={})", new.key(), p),
            None => println!("[UPDATED] {}", new.key()),
        },
        Event::Deleted { object, .. } => println!("[DELETED] {}", object.key()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let (client, config_source) = build_client(cli.kubeconfig.as_deref()).await?;
    println!("Using config from: {config_source}");

    let namespace = if cli.namespace.is_empty() { None } else { Some(cli.namespace.as_str()) };
    let source = KubeSource::new(client, &cli.gvk, namespace)
        .await
        .with_context(|| format!("binding source for {}", cli.gvk))?;

    let handle = Informer::new(source).register(print_event).start();

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        println!("\nReceived shutdown signal, stopping...");
        cancel.cancel();
    });

    if !handle.wait_for_sync().await {
        handle.shutdown().await.context("failed to wait for caches to sync")?;
        bail!("failed to wait for caches to sync");
    }
    println!("Watcher started. Listening for events... (Ctrl+C to stop)");

    handle.join().await.context("watch terminated")?;

    // Small grace period for in-flight printing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("Exited.");
    Ok(())
}
