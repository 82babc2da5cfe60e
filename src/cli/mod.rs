use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::models::dsl_model::PlanOverrides;

/// Virtual-user HTTP load generator
#[derive(Parser, Debug)]
#[command(name = "loadforge")]
#[command(about = "Ramp virtual users through scripted HTTP scenarios and check the results")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Mode {
    /// Run a plan file and print the report
    Run(RunArgs),

    /// Parse and validate a plan file without sending traffic
    Validate(PlanArgs),

    /// Accept plans over WebSocket and answer with run reports
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Path to a JSON plan
    pub plan: PathBuf,

    /// Base URL of the system under test, replaces the plan's target
    #[arg(long, env = "BASE_URL")]
    pub base_url: Option<String>,

    /// Size of the login user pool
    #[arg(long, env = "USER_COUNT")]
    pub user_count: Option<u64>,

    /// Password shared by every pooled user
    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl PlanArgs {
    pub fn overrides(&self) -> PlanOverrides {
        PlanOverrides {
            base_url: self.base_url.clone(),
            user_count: self.user_count,
            password: self.password.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// Write the JSON run report to this file
    #[arg(long)]
    pub summary_export: Option<PathBuf>,

    /// Progress log interval in seconds
    #[arg(long, default_value = "10")]
    pub report_interval: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address the WebSocket endpoint listens on
    #[arg(long, default_value = "127.0.0.1:8080", env = "LOADFORGE_BIND")]
    pub bind: String,
}
