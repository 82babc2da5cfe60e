use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use loadforge_vu::cli::{Cli, Mode, PlanArgs, RunArgs, ServeArgs};
use loadforge_vu::metrics::reporter;
use loadforge_vu::{ws, HyperTransport, Orchestrator, RunOptions, RunPlan, RunState};

/// Exit status when the run finished but a threshold was crossed.
const THRESHOLDS_FAILED_EXIT_CODE: i32 = 99;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.mode {
        Mode::Validate(args) => validate(&args),
        Mode::Run(args) => {
            let code = run_runtime()?.block_on(run(args))?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Mode::Serve(args) => {
            // actix arbiters are single-threaded, runs get their own runtime
            let runs = run_runtime()?;
            actix_web::rt::System::new().block_on(serve(args, runs.handle().clone()))
        }
    }
}

fn run_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("loadforge-run")
        .enable_all()
        .build()
        .context("failed to start tokio runtime")
}

fn load_plan(args: &PlanArgs) -> Result<RunPlan> {
    let mut plan = RunPlan::load(&args.plan).with_context(|| format!("loading {}", args.plan.display()))?;
    plan.apply_overrides(&args.overrides());
    Ok(plan)
}

fn validate(args: &PlanArgs) -> Result<()> {
    let plan = load_plan(args)?;
    let thresholds = plan.validate().context("plan is invalid")?;
    tracing::info!(
        plan = %plan.name,
        target = %plan.target,
        schedule = %plan.executor.description(),
        steps = plan.steps.len(),
        thresholds = thresholds.len(),
        "plan is valid"
    );
    Ok(())
}

async fn run(args: RunArgs) -> Result<i32> {
    let plan = load_plan(&args.plan)?;
    tracing::info!("Target: {}", plan.target);
    tracing::info!("Schedule: {}", plan.executor.description());

    let orchestrator = Orchestrator::new(Arc::new(HyperTransport::new(plan.timeout))).with_options(RunOptions {
        report_interval: Duration::from_secs(args.report_interval.max(1)),
        ..RunOptions::default()
    });

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl+C received, aborting run");
            cancel.cancel();
        }
    });

    let report = orchestrator.run(&plan).await?;
    reporter::print_report(&report);

    if let Some(path) = &args.summary_export {
        reporter::export_summary(&report, path).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!("summary written to {}", path.display());
    }

    if report.state == RunState::Aborted {
        anyhow::bail!("run aborted before completion");
    }
    if !report.thresholds_passed() {
        tracing::error!("some thresholds have failed");
        return Ok(THRESHOLDS_FAILED_EXIT_CODE);
    }
    Ok(0)
}

async fn serve(args: ServeArgs, runs: Handle) -> Result<()> {
    tracing::info!("worker listening on ws://{}/ws", args.bind);

    let runs = web::Data::new(runs);
    HttpServer::new(move || {
        App::new()
            .app_data(runs.clone())
            .route("/ws", web::get().to(ws::ws_handler))
    })
        .bind(&args.bind)
        .with_context(|| format!("binding {}", args.bind))?
        .run()
        .await
        .context("websocket server failed")
}
