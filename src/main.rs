use std::process::ExitCode;

use clap::Parser;
use hmacproxy::config::{Config, Role};
use hmacproxy::credential::StoreRegistry;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(
    name = "hmacproxy",
    about = "HTTP(S) proxy that signs outbound or verifies inbound requests with HMAC signatures"
)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long, required_unless_present = "generate_ca")]
    config: Option<String>,

    /// Log filter, e.g. "info" or "hmacproxy=debug". Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Generate a new CA cert+key pair and exit
    #[arg(long)]
    generate_ca: bool,

    /// Where --generate-ca writes the CA certificate
    #[arg(long = "cert", default_value = "ca-cert.pem")]
    cert: String,

    /// Where --generate-ca writes the CA private key
    #[arg(long = "key", default_value = "ca-key.pem")]
    key: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cli: &Cli) {
    let env_filter = match &cli.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hmacproxy=info")),
    };
    let span_events = tracing_subscriber::fmt::format::FmtSpan::CLOSE;
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_span_events(span_events)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_span_events(span_events)
            .init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    hmacproxy::install_crypto_provider();

    if cli.generate_ca {
        let ca = hmacproxy::CertificateAuthority::generate("hmacproxy CA")?;
        ca.to_pem_files(&cli.cert, &cli.key)?;
        tracing::info!(path = %cli.cert, "generated CA certificate");
        tracing::info!(path = %cli.key, "generated CA private key");
        return Ok(());
    }

    let path = cli
        .config
        .ok_or_else(|| anyhow::anyhow!("--config is required"))?;
    let config = Config::from_toml_file(&path)
        .map_err(|e| anyhow::anyhow!("loading {path}: {e}"))?;

    let (listen, builder, role) = match config.into_role()? {
        Role::Signer(signer) => {
            let listen = signer.listen.clone();
            (listen, signer.into_builder()?, "signer")
        }
        Role::Verifier(verifier) => {
            let listen = verifier.listen.clone();
            let registry = StoreRegistry::builtin();
            (listen, verifier.into_builder(&registry)?, "verifier")
        }
    };

    let proxy = builder
        .span(tracing::info_span!("hmacproxy", role))
        .build()?;
    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| anyhow::anyhow!("binding {listen}: {e}"))?;
    proxy
        .listen_with_shutdown(listener, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
}
