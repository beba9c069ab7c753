//! # Atlas CLI (`atlas`)
//!
//! ## Usage
//!
//! ```bash
//! atlas --config-file /etc/config/config.yaml            # run the service
//! atlas --config-file ./config.yaml sources              # list configured discoveries
//! ```
//!
//! Every flag can also be set through its environment variable, e.g.
//! `K8S_REGION=eu-de-1 WRITE_TO=configmap PROM_CONFIGMAP_NAME=atlas-sd atlas`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use atlas_sd::config::{load_config, Config, Options, WriteTo};
use atlas_sd::registry::Registry;
use atlas_sd::service::Service;

#[derive(Parser)]
#[command(
    name = "atlas",
    about = "Prometheus service discovery for Ironic, NetBox and switch inventories",
    version
)]
struct Cli {
    /// YAML file with the `discoveries` map.
    #[arg(long, env = "CONFIG_FILE", default_value = "/etc/config/config.yaml", global = true)]
    config_file: PathBuf,

    /// Log level filter, overridden by RUST_LOG.
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Version reported in the `_sd_up` metric.
    #[arg(long, env = "OS_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    version_label: String,

    #[arg(long, env = "K8S_NAMESPACE", default_value = "kube-monitoring")]
    namespace: String,

    /// Substituted for `{{ .Region }}` in discovery configs.
    #[arg(long, env = "K8S_REGION", default_value = "qa-de-1")]
    region: String,

    #[arg(long, env = "WRITE_TO", value_enum, default_value = "file")]
    write_to: WriteTo,

    /// ConfigMap used with `--write-to configmap`.
    #[arg(long, env = "PROM_CONFIGMAP_NAME", default_value = "atlas-sd-targets")]
    configmap_name: String,

    /// Directory for file output.
    #[arg(long, env = "OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    #[arg(long, env = "METRICS_PREFIX", default_value = "atlas")]
    metrics_prefix: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery and the HTTP server (default).
    Run,
    /// Print the configured discoveries and the factory each one uses.
    Sources,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn options(&self) -> Options {
        Options {
            region: self.region.clone(),
            namespace: self.namespace.clone(),
            version: self.version_label.clone(),
            write_to: self.write_to,
            configmap_name: Some(self.configmap_name.clone()),
            output_dir: self.output_dir.clone(),
            metrics_prefix: self.metrics_prefix.clone(),
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_sources(config: &Config, registry: &Registry) {
    if config.discoveries.is_empty() {
        println!("No discoveries configured.");
        return;
    }
    println!("{:<24} {:<10} STATUS", "NAME", "TYPE");
    for (name, fragment) in &config.discoveries {
        let kind = Config::discovery_type(name, fragment);
        let status = if registry.contains(kind) { "ok" } else { "unknown type" };
        println!("{:<24} {:<10} {}", name, kind, status);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let config = load_config(&cli.config_file)?;
    let registry = Registry::with_builtins();

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Sources => {
            print_sources(&config, &registry);
            Ok(())
        }
        Commands::Run => {
            let listener = tokio::net::TcpListener::bind(&cli.listen_addr)
                .await
                .with_context(|| format!("Failed to bind {}", cli.listen_addr))?;
            Service::new(cli.options(), config, registry).run(listener).await
        }
    }
}
