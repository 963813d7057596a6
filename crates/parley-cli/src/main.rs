use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use parley_core::config::{Config, LoggingConfig};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Voice conversation bridge: live audio in, recognized, answered, spoken back",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the voice gateway
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration and credential status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (secrets redacted)
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    init_logging(config.logging.as_ref(), cli.verbose)?;

    match cli.command {
        Commands::Serve { port, bind } => {
            if let Some(bind) = bind {
                config.gateway.get_or_insert_with(Default::default).bind = Some(bind);
            }
            let port = port.unwrap_or_else(|| config.gateway_port());
            serve(config, port).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&redacted(&config))?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("config has {} error(s)", errors.len());
                }
                println!("Config OK ({} warning(s))", warnings.len());
            }
        },
        Commands::Status => {
            let gateway = config.gateway();
            println!("Parley v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!(
                "Gateway: {}:{}{}",
                gateway.bind.as_deref().unwrap_or("0.0.0.0"),
                config.gateway_port(),
                gateway.path
            );
            println!("Recognition: deepgram ({})", config.recognition().model);
            let generation = config.generation();
            println!("Generation: {} ({})", generation.provider, generation.model);
            println!("Synthesis: sarvam ({})", config.synthesis().model);
            match config.resolve_credentials() {
                Ok(_) => println!("Credentials: all present"),
                Err(e) => println!("Credentials: {e}"),
            }
        }
    }

    Ok(())
}

/// Resolve credentials, build the backend adapters, and run the gateway.
async fn serve(config: Config, port: u16) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid config: {}", errors.join("; "));
    }

    let credentials = config.resolve_credentials()?;

    let recognizer = Arc::new(parley_media::DeepgramRecognizer::new(
        credentials.recognition.clone(),
    ));
    let generator = parley_providers::from_config(&config.generation(), &credentials.generation)?;
    let synthesizer = Arc::new(parley_media::SarvamSynthesizer::new(
        config.synthesis(),
        credentials.synthesis.clone(),
    )?);

    tracing::info!(
        generator = generator.id(),
        model = %config.generation().model,
        "Starting Parley gateway on port {port}"
    );

    let state = Arc::new(parley_gateway::GatewayState::new(
        Arc::new(config),
        recognizer,
        generator,
        synthesizer,
    ));
    parley_gateway::start_gateway(state, port).await
}

/// Install the tracing subscriber. `RUST_LOG` wins, then `--verbose`,
/// then the config file's level and per-crate filters.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<()> {
    let default_logging = LoggingConfig::default();
    let logging = logging.unwrap_or(&default_logging);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(logging, verbose))
            .context("invalid logging filter")?,
    };

    let to_stdout = logging.output == "stdout";
    let layer = match (logging.format.as_str(), to_stdout) {
        ("json", true) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .boxed(),
        ("json", false) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        (_, true) => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .boxed(),
        (_, false) => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry().with(filter).with(layer).try_init()?;
    Ok(())
}

fn filter_directives(logging: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level.to_string())
        .chain(logging.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

/// Copy of the config with credential values masked.
fn redacted(config: &Config) -> Config {
    let mask = |key: &mut Option<String>| {
        if key.is_some() {
            *key = Some("<redacted>".into());
        }
    };
    let mut config = config.clone();
    if let Some(r) = config.recognition.as_mut() {
        mask(&mut r.api_key);
    }
    if let Some(g) = config.generation.as_mut() {
        mask(&mut g.api_key);
    }
    if let Some(s) = config.synthesis.as_mut() {
        mask(&mut s.api_key);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_precedence() {
        let logging = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["parley_gateway=trace".into()],
            ..Default::default()
        };
        assert_eq!(filter_directives(&logging, false), "warn,parley_gateway=trace");
        assert_eq!(filter_directives(&logging, true), "debug,parley_gateway=trace");
        assert_eq!(filter_directives(&LoggingConfig::default(), false), "info");
    }

    #[test]
    fn test_redacted_masks_only_present_keys() {
        let config = Config::parse(
            r#"{ generation: { api_key: "gsk-secret" }, synthesis: { api_key_env: "MY_KEY" } }"#,
        )
        .unwrap();
        let shown = serde_json::to_string(&redacted(&config)).unwrap();
        assert!(!shown.contains("gsk-secret"));
        assert!(shown.contains("<redacted>"));
        assert!(shown.contains("MY_KEY"));
    }

    #[test]
    fn test_cli_parses_serve_flags() {
        let cli = Cli::try_parse_from(["parley", "serve", "--port", "9000", "--bind", "127.0.0.1"])
            .unwrap();
        match cli.command {
            Commands::Serve { port, bind } => {
                assert_eq!(port, Some(9000));
                assert_eq!(bind.as_deref(), Some("127.0.0.1"));
            }
            _ => panic!("expected serve"),
        }
    }
}
