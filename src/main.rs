//! SAML Service Provider server.
//!
//! Serves SP-initiated SSO, single logout and SP metadata for one trusted
//! IdP, with a cookie-bound application session.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use chrono::Utc;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use zentinel_saml_sp::crypto::format_certificate;
use zentinel_saml_sp::http::{router, AppState};
use zentinel_saml_sp::pending::{spawn_sweep_task, DEFAULT_SWEEP_INTERVAL_SECS};
use zentinel_saml_sp::session::{spawn_cleanup_task, SessionStore};
use zentinel_saml_sp::settings::{load_settings_file, with_idp_metadata, IdpMetadataCache, RawSettings, Settings};
use zentinel_saml_sp::{ConfigError, ServiceProvider};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "zentinel-saml-sp")]
#[command(about = "SAML 2.0 Service Provider")]
struct Args {
    /// Path to the JSON settings file
    #[arg(long, global = true, default_value = "settings.json", env = "SAML_SETTINGS")]
    settings: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true, env = "SAML_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the SSO/SLO endpoints (default)
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8000", env = "SAML_LISTEN")]
        listen: SocketAddr,
    },
    /// Validate the settings file and report every problem
    CheckConfig,
    /// Print the SP metadata document
    Metadata,
    /// Print a PEM certificate as a single base64 line
    FormatCert {
        /// PEM file to read
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    match args.command {
        Some(Command::Serve { listen }) => serve(&args.settings, listen).await,
        None => serve(&args.settings, default_listen()?).await,
        Some(Command::CheckConfig) => check_config(&args.settings).await,
        Some(Command::Metadata) => print_metadata(&args.settings).await,
        Some(Command::FormatCert { path }) => format_cert(&path),
    }
}

fn default_listen() -> Result<SocketAddr> {
    std::env::var("SAML_LISTEN")
        .unwrap_or_else(|_| "127.0.0.1:8000".to_string())
        .parse()
        .context("SAML_LISTEN is not a socket address")
}

async fn serve(settings_path: &Path, listen: SocketAddr) -> Result<()> {
    info!("Starting SAML Service Provider");

    let (raw, settings) = load_settings_file(settings_path).await?;
    info!(
        sp = %settings.sp.entity_id,
        idp = %settings.idp.entity_id,
        sso_binding = %settings.idp.sso_binding,
        slo = settings.idp.slo.is_some(),
        "Configuration loaded"
    );
    warn_on_expiring_certificates(&settings);

    let session_config = settings.session.clone();
    let sessions = Arc::new(
        SessionStore::open(&session_config.store_path, session_config.ttl_secs)
            .context("Failed to initialize session store")?,
    );
    info!(path = %session_config.store_path, "Session store initialized");

    let provider = Arc::new(ServiceProvider::new(settings));

    let _sweep_handle = spawn_sweep_task(
        provider.pending_requests(),
        provider.replay_cache(),
        DEFAULT_SWEEP_INTERVAL_SECS,
    );
    let _cleanup_handle = spawn_cleanup_task(Arc::clone(&sessions), session_config.cleanup_interval_secs);
    let _metadata_handle = spawn_metadata_refresh(&raw, Arc::clone(&provider)).await;

    let app = router(AppState { provider, sessions });

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    info!(address = %listen, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shut down");
    Ok(())
}

/// Keep the IdP metadata fresh when the settings point at a metadata URL.
async fn spawn_metadata_refresh(
    raw: &RawSettings,
    provider: Arc<ServiceProvider>,
) -> Option<tokio::task::JoinHandle<()>> {
    let url = raw.idp.metadata_url.clone()?;
    let refresh_secs = raw.idp.metadata_refresh_secs;
    let cache = match IdpMetadataCache::new(url, refresh_secs).await {
        Ok(cache) => cache,
        Err(e) => {
            warn!(error = %e, "IdP metadata refresh disabled");
            return None;
        }
    };
    let raw = raw.clone();

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(refresh_secs.max(1)));
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match cache.refresh_if_needed().await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!(error = %e, "IdP metadata refresh skipped");
                    continue;
                }
            }

            let applied = cache
                .xml()
                .and_then(|xml| with_idp_metadata(&raw, xml))
                .and_then(|settings| provider.reconfigure(settings).map_err(|e| anyhow!("{e}")));
            if let Err(e) = applied {
                warn!(url = %cache.url(), error = %e, "Refreshed IdP metadata rejected, keeping current settings");
            }
        }
    }))
}

async fn check_config(settings_path: &Path) -> Result<()> {
    match load_settings_file(settings_path).await {
        Ok((_, settings)) => {
            println!("Settings OK");
            println!("  SP entity ID:  {}", settings.sp.entity_id);
            println!("  IdP entity ID: {}", settings.idp.entity_id);
            for certificate in &settings.idp.certificates {
                println!(
                    "  IdP certificate: {} (expires {})",
                    certificate.subject(),
                    certificate.not_after().to_rfc3339()
                );
            }
            if let Some(credentials) = &settings.sp.credentials {
                let certificate = credentials.certificate();
                println!(
                    "  SP certificate:  {} (expires {})",
                    certificate.subject(),
                    certificate.not_after().to_rfc3339()
                );
            }
            Ok(())
        }
        Err(e) => {
            match e.downcast_ref::<ConfigError>() {
                Some(config) => {
                    eprintln!("Settings are invalid:");
                    for problem in &config.problems {
                        eprintln!("  - {problem}");
                    }
                }
                None => eprintln!("Settings could not be loaded: {e:#}"),
            }
            Err(anyhow!("configuration check failed"))
        }
    }
}

async fn print_metadata(settings_path: &Path) -> Result<()> {
    let (_, settings) = load_settings_file(settings_path).await?;
    let metadata = ServiceProvider::new(settings)
        .get_metadata_xml()
        .context("Failed to generate SP metadata")?;
    println!("{metadata}");
    Ok(())
}

fn format_cert(path: &Path) -> Result<()> {
    let pem = std::fs::read_to_string(path).with_context(|| format!("Failed to read certificate: {:?}", path))?;
    let formatted = format_certificate(&pem);
    if formatted.is_empty() {
        return Err(anyhow!("{:?} contains no certificate data", path));
    }
    println!("{formatted}");
    Ok(())
}

fn warn_on_expiring_certificates(settings: &Settings) {
    let soon = Utc::now() + chrono::Duration::days(30);
    let sp_certificate = settings.sp.credentials.as_ref().map(|c| c.certificate());
    for certificate in settings.idp.certificates.iter().chain(sp_certificate) {
        if certificate.not_after() < soon {
            warn!(
                subject = %certificate.subject(),
                not_after = %certificate.not_after(),
                "Certificate expires within 30 days"
            );
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
