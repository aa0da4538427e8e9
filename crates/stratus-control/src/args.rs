use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "stratus")]
#[command(about = "Provision and run a load-balanced container service with a gated release pipeline", long_about = None)]
pub struct Args {
    /// Deployment config (JSON)
    #[arg(long, env = "STRATUS_CONFIG", default_value = "stratus.json")]
    pub config: PathBuf,

    /// Log output format: "text" or "json"
    #[arg(long, env = "STRATUS_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// OTLP/HTTP endpoint for span export (e.g. "http://127.0.0.1:4318/v1/traces").
    #[arg(long, env = "STRATUS_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP collector.
    #[arg(long, env = "STRATUS_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate the config and print the resources in creation order
    Plan,
    /// Provision the deployment and serve the admin API until interrupted
    Up {
        #[arg(long, env = "STRATUS_ADMIN_ADDR", default_value = "127.0.0.1:18090")]
        listen_addr: String,

        /// "round_robin" or "least_outstanding"
        #[arg(long, env = "STRATUS_ROUTING_STRATEGY", default_value = "round_robin")]
        routing_strategy: String,

        /// Value of the source credential named by the config's `secret://` reference
        #[arg(long, env = "STRATUS_SOURCE_TOKEN")]
        source_token: Option<String>,

        /// Utilization reported to the autoscaler until changed through the API
        #[arg(long, default_value_t = 0.0)]
        initial_utilization: f64,
    },
}
