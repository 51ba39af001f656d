use clap::{Parser, Subcommand};
use face_puncher_supreme::ca::{CertAuthority, LeafCertCache};
use face_puncher_supreme::config::Config;
use face_puncher_supreme::config_reload::ConfigReloader;
use face_puncher_supreme::domain::{
    default_blocklist_sources, AllowEntry, BlocklistSource, BlocklistStore, BlocklistUpdater, DomainMatcher,
};
use face_puncher_supreme::management;
use face_puncher_supreme::metrics::Metrics;
use face_puncher_supreme::mitm::MitmEngine;
use face_puncher_supreme::plugins::PluginPipeline;
use face_puncher_supreme::proxy::dispatcher::Dispatcher;
use face_puncher_supreme::proxy::transparent::TransparentListeners;
use face_puncher_supreme::stats::{PrometheusStatsSink, StatsSink};
use face_puncher_supreme::transport::UpstreamConnector;
use face_puncher_supreme::graceful_shutdown::GracefulShutdown;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Face Puncher Supreme: a content-aware forward/transparent HTTP proxy.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy core.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "fps.toml")]
        config: PathBuf,
    },
    /// Generate a new root CA certificate and key pair.
    GenerateCa {
        /// Where to write the CA certificate (PEM).
        #[arg(long, default_value = "ca/fps-ca.pem")]
        cert_path: PathBuf,
        /// Where to write the CA private key (PEM).
        #[arg(long, default_value = "ca/fps-ca.key")]
        key_path: PathBuf,
        /// Common name embedded in the certificate.
        #[arg(long, default_value = "Face Puncher Supreme")]
        common_name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateCa {
            cert_path,
            key_path,
            common_name,
        } => generate_ca(&cert_path, &key_path, &common_name).await,
        Commands::Serve { config } => serve(&config).await,
    }
}

async fn generate_ca(cert_path: &PathBuf, key_path: &PathBuf, common_name: &str) {
    init_tracing("info");
    match CertAuthority::generate(common_name) {
        Ok(ca) => match ca.save(cert_path, key_path).await {
            Ok(()) => info!(
                cert = %cert_path.display(),
                key = %key_path.display(),
                fingerprint = %ca.sha256_fingerprint,
                "generated root CA"
            ),
            Err(e) => {
                error!(error = %e, "failed to save root CA");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!(error = %e, "failed to generate root CA");
            std::process::exit(1);
        }
    }
}

async fn serve(config_path: &PathBuf) {
    let config = match Config::load_from_file(config_path).await {
        Ok(c) => c,
        Err(e) => {
            // Verbosity isn't known yet; fall back to the default filter.
            init_tracing("info");
            error!(error = %e, path = %config_path.display(), "failed to load configuration");
            std::process::exit(1);
        }
    };
    init_tracing(&config.verbosity);

    info!(listen_addr = %config.listen_addr, "starting face-puncher-supreme");

    let matcher = Arc::new(DomainMatcher::new());
    matcher.set_allowlist(config.allowlist.iter().map(|s| AllowEntry::parse(s)).collect());
    matcher.add_inline_entries(config.inline_blocklist.iter().cloned());

    let sources: Vec<BlocklistSource> = if config.blocklist_urls.is_empty() {
        default_blocklist_sources()
    } else {
        config
            .blocklist_urls
            .iter()
            .map(|s| BlocklistSource::new(s.name.clone(), s.url.clone(), config.data_dir.join(format!("{}.txt", s.name))))
            .collect()
    };
    let updater = Arc::new(BlocklistUpdater::new(BlocklistStore::new(sources), matcher.clone()));
    if let Err(e) = updater.refresh_all().await {
        warn!(error = %e, "initial blocklist refresh failed, continuing with inline/allow lists only");
    }

    let metrics = Arc::new(match Metrics::new() {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to initialize metrics registry");
            std::process::exit(1);
        }
    });
    let stats: Arc<dyn StatsSink> = Arc::new(PrometheusStatsSink::new(metrics.clone()));

    let ca = if !config.mitm.domains.is_empty() {
        match CertAuthority::load(&config.mitm.ca_cert_path, &config.mitm.ca_key_path).await {
            Ok(ca) => Some(Arc::new(ca)),
            Err(e) => {
                error!(error = %e, "failed to load root CA; run `fps generate-ca` first");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let pipeline = match PluginPipeline::build(&config.plugins, &config.mitm.domains) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!(error = %e, "invalid plugin configuration");
            std::process::exit(1);
        }
    };

    let mut config_reloader = ConfigReloader::new(config.clone(), config_path.clone());
    config_reloader.start_watching();
    let config_reloader = Arc::new(config_reloader);

    let management_router = management::router(matcher.clone(), metrics.clone(), ca.clone(), Some(config_reloader.clone()));

    let shutdown = Arc::new(GracefulShutdown::new(config.shutdown_timeout()));

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %config.listen_addr, "failed to bind listen address");
            std::process::exit(1);
        }
    };

    if let Some(ca) = ca.clone() {
        let connector = match UpstreamConnector::new() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to initialize upstream TLS connector");
                std::process::exit(1);
            }
        };
        let leaf_cache = Arc::new(LeafCertCache::new());
        let mitm = match MitmEngine::new(
            ca,
            leaf_cache,
            connector,
            pipeline.clone(),
            stats.clone(),
            config.connect_timeout(),
            config.header_timeout(),
        ) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "failed to initialize MITM engine");
                std::process::exit(1);
            }
        };

        let dispatcher = Arc::new(Dispatcher::new(
            matcher.clone(),
            mitm.clone(),
            config.mitm.domains.clone(),
            config.management_prefix.clone(),
            management_router.clone(),
            stats.clone(),
            metrics.clone(),
            config.header_timeout(),
        ));

        if config.transparent.enabled {
            let transparent = Arc::new(TransparentListeners::new(
                matcher.clone(),
                mitm,
                config.mitm.domains.clone(),
                stats.clone(),
                metrics.clone(),
                config.header_timeout(),
            ));
            if let Some(addr) = config.transparent.http_addr {
                let t = transparent.clone();
                tokio::spawn(async move {
                    if let Err(e) = t.run_http(addr).await {
                        error!(error = %e, "transparent HTTP listener exited");
                    }
                });
            }
            if let Some(addr) = config.transparent.https_addr {
                let t = transparent.clone();
                tokio::spawn(async move {
                    if let Err(e) = t.run_https(addr).await {
                        error!(error = %e, "transparent HTTPS listener exited");
                    }
                });
            }
        }

        accept_loop(listener, dispatcher, shutdown).await;
    } else {
        // No MITM domains configured: still run the explicit dispatcher,
        // just never routed through the MITM engine.
        let connector = match UpstreamConnector::new() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to initialize upstream TLS connector");
                std::process::exit(1);
            }
        };
        let leaf_cache = Arc::new(LeafCertCache::new());
        // A MitmEngine is still constructed (CONNECT handling always
        // needs one to hand a TLS-capable engine to, even if no domain
        // ever resolves into its MITM set), signed by a throwaway CA.
        let throwaway_ca = match CertAuthority::generate("Face Puncher Supreme (unused)") {
            Ok(ca) => Arc::new(ca),
            Err(e) => {
                error!(error = %e, "failed to initialize placeholder CA");
                std::process::exit(1);
            }
        };
        let mitm = match MitmEngine::new(
            throwaway_ca,
            leaf_cache,
            connector,
            pipeline,
            stats.clone(),
            config.connect_timeout(),
            config.header_timeout(),
        ) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "failed to initialize MITM engine");
                std::process::exit(1);
            }
        };

        let dispatcher = Arc::new(Dispatcher::new(
            matcher.clone(),
            mitm,
            Vec::new(),
            config.management_prefix.clone(),
            management_router,
            stats,
            metrics,
            config.header_timeout(),
        ));

        accept_loop(listener, dispatcher, shutdown).await;
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>, shutdown: Arc<GracefulShutdown>) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let dispatcher = dispatcher.clone();
                        let client_ip = peer.ip().to_string();
                        tokio::spawn(async move { dispatcher.serve(stream, client_ip).await });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("explicit dispatcher accept loop stopping");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = shutdown.shutdown().await;
                break;
            }
        }
    }
}

fn init_tracing(verbosity: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
