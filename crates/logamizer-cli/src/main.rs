mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "logamizer",
    version = "0.1.0",
    about = "Access and error log analytics: aggregates, security findings, error groups"
)]
struct Cli {
    /// Path to logamizer.toml (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest an access log file and print aggregates and findings
    Ingest {
        /// Path to the log file (.gz is handled transparently)
        path: String,
        /// Site id from the config file; an ad-hoc site is used when omitted
        #[arg(short, long)]
        site: Option<String>,
        /// Log format: nginx_combined | apache_combined | auto
        #[arg(short, long)]
        format: Option<String>,
        /// IPs to hide from aggregation and rules (repeatable)
        #[arg(long = "hidden-ip")]
        hidden_ips: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Analyze an error log file and print the grouped errors
    Errors {
        /// Path to the error log file
        path: String,
        /// Site id from the config file
        #[arg(short, long)]
        site: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Ingest {
            path,
            site,
            format,
            hidden_ips,
            json,
        } => commands::ingest::run(cli.config.as_deref(), &path, site, format, hidden_ips, json).await,
        Commands::Errors { path, site, json } => {
            commands::errors::run(cli.config.as_deref(), &path, site, json).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
