use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use url::Url;

use loadrelay::server::{self, ChatUpstream, ServerConfig};
use loadrelay::utils::{format_size, get_writer, parse_headers};
use loadrelay::{AttackBuilder, EngineSettings, LoadTestConfig, Metrics, Target, report};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Bounds shared by every load test run
#[derive(Args, Clone)]
struct EngineArgs {
    /// Per-request timeout
    #[arg(long, default_value = "10s")]
    timeout: humantime::Duration,

    /// Time allowed for in-flight requests once issuance stops
    #[arg(long = "drain-grace", default_value = "10s")]
    drain_grace: humantime::Duration,

    /// Upper bound on concurrently outstanding requests
    #[arg(long = "max-workers", default_value = "1000")]
    max_workers: usize,

    /// Outstanding requests allowed per request/second of rate
    #[arg(long = "workers-per-rate", default_value = "10")]
    workers_per_rate: usize,
}

impl EngineArgs {
    fn settings(&self) -> EngineSettings {
        EngineSettings {
            request_timeout: self.timeout.into(),
            drain_grace: self.drain_grace.into(),
            max_workers_cap: self.max_workers,
            workers_per_rate: self.workers_per_rate,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat relay and load test API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, env = "DATABRICKS_APP_PORT", default_value = "8000")]
        port: u16,

        /// Host of the model serving workspace
        #[arg(long = "upstream-host", env = "DATABRICKS_HOST")]
        upstream_host: Option<String>,

        /// Name of the model serving endpoint
        #[arg(long = "serving-endpoint", env = "SERVING_ENDPOINT_NAME")]
        serving_endpoint: Option<String>,

        /// Bearer token for the serving endpoint
        #[arg(long, env = "DATABRICKS_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Timeout for chat relay requests
        #[arg(long = "upstream-timeout", default_value = "60s")]
        upstream_timeout: humantime::Duration,

        /// Frontend build directory served outside /api
        #[arg(long = "static-dir", env = "STATIC_DIR")]
        static_dir: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Run a single load test against a URL and print the report
    Attack {
        /// Target URL
        #[arg(long)]
        url: Url,

        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: String,

        /// Request header
        #[arg(long = "header", value_name = "value")]
        headers: Vec<String>,

        /// Requests body file
        #[arg(long)]
        body: Option<String>,

        /// Concurrency hint echoed in the report
        #[arg(long, default_value = "1")]
        users: u32,

        /// Requests per second
        #[arg(long, default_value = "50")]
        rate: u32,

        /// Issuance window in seconds
        #[arg(long, default_value = "10")]
        duration: u32,

        /// Max open idle connections per target host
        #[arg(long, default_value = "10000")]
        connections: usize,

        /// Use persistent connections
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        keepalive: bool,

        /// Ignore invalid server TLS certificates
        #[arg(long)]
        insecure: bool,

        /// Number of redirects to follow. -1 will not follow
        #[arg(long, default_value = "10", allow_hyphen_values = true)]
        redirects: i32,

        /// Report output file
        #[arg(long, default_value = "stdout")]
        output: String,

        /// Report type to generate [json, text]
        #[arg(long = "type", default_value = "json")]
        report_type: String,

        /// Also write every result as a JSON line to this file
        #[arg(long)]
        results: Option<String>,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            upstream_host,
            serving_endpoint,
            token,
            upstream_timeout,
            static_dir,
            engine,
        } => {
            let chat = match (upstream_host, serving_endpoint, token) {
                (Some(host), Some(endpoint), Some(token)) => {
                    Some(ChatUpstream::serving_endpoint(&host, &endpoint, token)?)
                }
                _ => {
                    tracing::warn!(
                        event = "chat_relay_disabled",
                        message = "Upstream host, serving endpoint or token missing; /api/chat will answer 503"
                    );
                    None
                }
            };

            server::serve(ServerConfig {
                host,
                port,
                chat,
                engine: engine.settings(),
                upstream_timeout: upstream_timeout.into(),
                static_dir,
            })
            .await?;
        }
        Commands::Attack {
            url,
            method,
            headers,
            body,
            users,
            rate,
            duration,
            connections,
            keepalive,
            insecure,
            redirects,
            output,
            report_type,
            results,
            engine,
        } => {
            if report_type != "json" && report_type != "text" {
                anyhow::bail!("Unsupported report type: {}", report_type);
            }

            let config = LoadTestConfig::new(users, rate, duration)?;

            let mut target = Target::new(&method, url);
            target.headers = parse_headers(&headers)?;
            if let Some(body_path) = &body {
                let content = std::fs::read(body_path)
                    .context(format!("Failed to read body file: {}", body_path))?;
                target.body = Some(content);
            }

            let mut rx = AttackBuilder::from_config(&config, &engine.settings())
                .connections(connections)
                .keepalive(keepalive)
                .insecure(insecure)
                .redirects(redirects)
                .start(target)?;

            let progress_style = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
                .context("Invalid progress bar template")?
                .progress_chars("##-");
            let progress_bar = ProgressBar::new(rate as u64 * duration as u64);
            progress_bar.set_style(progress_style);

            let mut results_writer = results.as_deref().map(get_writer).transpose()?;
            let metrics = Metrics::new();

            while let Some(result) = rx.recv().await {
                if let Some(writer) = results_writer.as_mut() {
                    writeln!(writer, "{}", serde_json::to_string(&result)?)?;
                }
                metrics.add(result)?;
                progress_bar.inc(1);
            }
            metrics.close();
            progress_bar.finish_with_message(format!(
                "in {} / out {}",
                format_size(metrics.bytes_in()),
                format_size(metrics.bytes_out())
            ));

            let report = report::build(&config, &metrics)?;
            let mut writer = get_writer(&output)?;
            if report_type == "json" {
                serde_json::to_writer_pretty(&mut writer, &report)?;
                writeln!(writer)?;
            } else {
                write!(writer, "{}", report)?;
                for error in metrics.errors() {
                    writeln!(writer, "  {}", error)?;
                }
            }
            writer.flush()?;

            if let Some(mut writer) = results_writer {
                writer.flush()?;
            }

            tracing::debug!(
                event = "attack_elapsed",
                elapsed_ms = metrics.elapsed().unwrap_or(Duration::ZERO).as_millis() as u64,
                message = "Attack finished"
            );
        }
    }

    Ok(())
}
