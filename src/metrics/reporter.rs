use std::fmt::Write as _;
use std::path::Path;

use chrono::Local;
use colored::*;

use crate::executor::{RunReport, RunState};
use crate::metrics::collector::CHECKS;
use crate::scenario::HTTP_REQS;

/// Human readable end-of-run report.
pub fn render_report(report: &RunReport) -> String {
    let summary = &report.summary;
    let mut out = String::new();

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", " ======== TEST RESULTS ======== ".bold().white().on_blue());
    let _ = writeln!(out, "{} {}", "Run                  :".blue().bold(), report.name.bold());
    let _ = writeln!(
        out,
        "{} {}",
        "Timestamp            :".blue().bold(),
        Local::now().format("%Y/%m/%d %H:%M:%S").to_string().bold()
    );
    let state = match report.state {
        RunState::Completed => report.state.to_string().green().bold(),
        _ => report.state.to_string().red().bold(),
    };
    let _ = writeln!(out, "{} {}", "State                :".blue().bold(), state);
    let _ = writeln!(out, "{} {:.1}s", "Elapsed              :".blue().bold(), report.elapsed_secs);
    let _ = writeln!(out, "{} {}", "Peak VUs             :".blue().bold(), report.peak_vus);
    let _ = writeln!(
        out,
        "{} {} cores, {} / {} MB free",
        "Generator host       :".blue().bold(),
        report.host.cpu_cores,
        report.host.available_memory_mb,
        report.host.total_memory_mb
    );
    let _ = writeln!(
        out,
        "{} {:.2}",
        "Requests per second  :".blue().bold(),
        summary.throughput(HTTP_REQS)
    );

    if !summary.checks.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", " ======== CHECKS ======== ".bold().white().on_blue());
        for (name, check) in &summary.checks {
            let mark = if check.fails == 0 { "✓".green().bold() } else { "✗".red().bold() };
            let _ = writeln!(
                out,
                "{} {} {:.2}% ({} / {})",
                mark,
                name,
                check.pass_rate() * 100.0,
                check.passes,
                check.passes + check.fails
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", " ======== METRICS ======== ".bold().white().on_blue());
    for (name, trend) in &summary.trends {
        let _ = writeln!(
            out,
            "{:<28} avg={:.2}ms min={:.2}ms med={:.2}ms p(90)={:.2}ms p(95)={:.2}ms p(99)={:.2}ms max={:.2}ms count={}",
            name.bold(),
            trend.mean,
            trend.min,
            trend.med,
            trend.p90,
            trend.p95,
            trend.p99,
            trend.max,
            trend.count
        );
    }
    for (name, rate) in summary.rates.iter().filter(|(name, _)| name.as_str() != CHECKS) {
        let _ = writeln!(
            out,
            "{:<28} {:.2}% ({} / {})",
            name.bold(),
            rate.rate * 100.0,
            rate.trues,
            rate.total
        );
    }
    for (name, count) in &summary.counters {
        let _ = writeln!(out, "{:<28} {}", name.bold(), count);
    }

    if !report.thresholds.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", " ======== THRESHOLDS ======== ".bold().white().on_blue());
        for result in &report.thresholds {
            let mark = if result.passed { "✓".green().bold() } else { "✗".red().bold() };
            let _ = writeln!(out, "{} {}", mark, result);
        }
    }

    out
}

pub fn print_report(report: &RunReport) {
    println!("{}", render_report(report));
}

/// Writes the report as pretty JSON, for CI pipelines and dashboards.
pub fn export_summary(report: &RunReport, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)
}
