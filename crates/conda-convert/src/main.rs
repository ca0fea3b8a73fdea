use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

use env_convert::batch::{BatchOrchestrator, BatchSummary};
use env_convert::conda::CondaCli;
use env_convert::convert::{ConversionReport, Converter};
use env_convert::drift::{self, DriftReport};
use env_convert::inventory::Inventory;
use env_convert::progress::LogHandler;
use env_convert::report::{EnvironmentSummary, Report};
use env_convert::runner::ProcessRunner;
use env_convert::settings::{load_settings, save_settings, settings_path, Settings};
use env_convert::update::{UpdateOutcome, UpdateRequest, Updater};

#[derive(Tabled)]
struct EnvironmentRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PYTHON")]
    python: String,
    #[tabled(rename = "CONDA")]
    conda: usize,
    #[tabled(rename = "PIP")]
    pip: usize,
    #[tabled(rename = "PATH")]
    path: String,
}

impl From<&EnvironmentSummary> for EnvironmentRow {
    fn from(env: &EnvironmentSummary) -> Self {
        EnvironmentRow {
            name: env.name.clone(),
            python: env.python_version.clone().unwrap_or_else(|| "-".to_string()),
            conda: env.conda_packages,
            pip: env.pip_packages,
            path: shorten_path(&env.path),
        }
    }
}

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "TARGET")]
    target: String,
    #[tabled(rename = "OUTCOME")]
    outcome: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

#[derive(Tabled)]
struct DriftRow {
    #[tabled(rename = "PACKAGE")]
    package: String,
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "TARGET")]
    target: String,
    #[tabled(rename = "STATUS")]
    status: &'static str,
}

/// Shorten a path for display by replacing home directory with ~
fn shorten_path(path: &std::path::Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(relative) = path.strip_prefix(&home) {
            return format!("~/{}", relative.display());
        }
    }
    path.display().to_string()
}

/// Truncate a message for display, replacing newlines with spaces.
fn truncate_message(msg: &str, max_len: usize) -> String {
    let single_line = msg.replace('\n', " ");
    if single_line.chars().count() <= max_len {
        single_line
    } else {
        let kept: String = single_line.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[derive(Parser)]
#[command(name = "conda-convert")]
#[command(author, version, about = "Convert conda environments to another channel and track drift", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Package manager executable (default: mamba, then conda, on PATH)
    #[arg(long, global = true)]
    manager: Option<PathBuf>,

    /// Channel to install from (repeatable; default: settings, then conda-forge)
    #[arg(long = "channel", short = 'c', global = true)]
    channels: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered environments
    List {
        /// Extra directories to scan for unregistered environments
        #[arg(long = "search-path")]
        search_paths: Vec<PathBuf>,
        /// How deep to scan search paths
        #[arg(long)]
        max_depth: Option<usize>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Convert one environment
    Convert {
        /// Environment to convert
        source: String,
        /// Name of the new environment (default: <source><target_suffix>)
        target: Option<String>,
        /// Python version for the new environment
        #[arg(long)]
        python: Option<String>,
        /// Replace the environment under its own name, keeping a backup clone
        #[arg(long, conflicts_with = "target")]
        in_place: bool,
        /// Continue installing into an existing target
        #[arg(long)]
        resume: bool,
        /// Show what would be installed without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Packages per install command
        #[arg(long)]
        batch_size: Option<usize>,
        /// Check each package against the target channel first
        #[arg(long)]
        check_availability: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Convert every environment matching a pattern
    ConvertAll {
        /// Glob of environment names to convert
        #[arg(long)]
        pattern: Option<String>,
        /// Glob of environment names to skip
        #[arg(long)]
        exclude: Option<String>,
        /// Number of conversions to run at once
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Do not export environment specs before converting
        #[arg(long)]
        no_backup: bool,
        /// Where to write backup directories
        #[arg(long)]
        backup_dir: Option<PathBuf>,
        /// Extra directories to scan for unregistered environments
        #[arg(long = "search-path")]
        search_paths: Vec<PathBuf>,
        /// Show what would be converted without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Continue despite a low disk-space estimate
        #[arg(long, short)]
        yes: bool,
        /// Write a JSON report to this file
        #[arg(long)]
        report: Option<PathBuf>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Compare the conda packages of two environments
    Compare {
        env_a: String,
        env_b: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Compare a converted environment with its source
    Drift {
        target: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Bring a converted environment back in line with its source
    Update {
        target: String,
        /// Update every package whose version differs
        #[arg(long)]
        all: bool,
        /// Install packages only present in the source
        #[arg(long)]
        add_missing: bool,
        /// Update only this package (repeatable)
        #[arg(long = "package", short = 'p')]
        packages: Vec<String>,
        /// Show what would be installed without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Metadata cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Show the settings file, or write the current settings to it
    Settings {
        /// Write the effective settings (defaults included) to the file
        #[arg(long)]
        init: bool,
    },
    /// Write a report of every environment and its drift
    Report {
        /// Write the report to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        /// Include drift for every environment with a converted counterpart
        #[arg(long)]
        drift: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Remove cached entries
    Clear {
        /// Only remove entries older than this many hours
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

/// Shared handles built from settings and global flags.
struct Context {
    settings: Settings,
    conda: CondaCli,
}

impl Context {
    fn new(cli: &Cli) -> Result<Self> {
        let settings = load_settings();
        let manager = cli.manager.clone().or_else(|| settings.manager.clone());
        let runner = ProcessRunner::from_setting(manager.as_deref())?;
        info!("[cli] Using {}", runner.program().display());

        let channels = if cli.channels.is_empty() {
            settings.channels.clone()
        } else {
            cli.channels.clone()
        };
        let conda = CondaCli::new(Arc::new(runner)).with_channels(channels);
        Ok(Self { settings, conda })
    }

    fn inventory(&self) -> Inventory {
        Inventory::new(self.conda.clone())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    // Cache maintenance never touches the package manager
    if let Commands::Cache {
        command: CacheCommands::Clear { older_than_hours },
    } = &cli.command
    {
        let cache = load_settings().metadata_cache();
        let removed = cache.clear(older_than_hours.map(|h| Duration::from_secs(h * 3600)));
        println!("Removed {} cache entries from {}", removed, shorten_path(cache.root()));
        return Ok(());
    }

    if let Commands::Settings { init } = &cli.command {
        let settings = load_settings();
        let path = settings_path();
        if *init {
            save_settings(&settings)?;
            println!("Settings written to {}", shorten_path(&path));
        } else {
            println!("# {}", shorten_path(&path));
            print_json(&settings)?;
        }
        return Ok(());
    }

    let ctx = Context::new(&cli)?;

    match cli.command {
        Commands::List {
            search_paths,
            max_depth,
            json,
        } => list_environments(&ctx, search_paths, max_depth, json),
        Commands::Convert {
            source,
            target,
            python,
            in_place,
            resume,
            dry_run,
            batch_size,
            check_availability,
            json,
        } => {
            let mut options = ctx.settings.conversion_options();
            options.python_override = python;
            options.resume = resume;
            options.dry_run = dry_run;
            options.check_availability |= check_availability;
            if let Some(size) = batch_size {
                options.batch_size = size.max(1);
            }
            let converter = Converter::new(ctx.conda.clone(), options, Arc::new(LogHandler))
                .with_cache(ctx.settings.metadata_cache());

            let report = if in_place {
                converter.replace_in_place(&source)?
            } else {
                let target = target
                    .unwrap_or_else(|| format!("{}{}", source, ctx.settings.target_suffix));
                converter.convert(&source, &target)
            };
            print_conversion(&report, json)?;
            if !report.is_success() {
                bail!(
                    "conversion of {} failed: {}",
                    report.result.source,
                    report.result.reason.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(())
        }
        Commands::ConvertAll {
            pattern,
            exclude,
            max_parallel,
            no_backup,
            backup_dir,
            search_paths,
            dry_run,
            yes,
            report,
            json,
        } => {
            let mut conversion = ctx.settings.conversion_options();
            conversion.dry_run = dry_run;
            let converter = Converter::new(ctx.conda.clone(), conversion, Arc::new(LogHandler))
                .with_cache(ctx.settings.metadata_cache());

            let mut options = ctx.settings.batch_options();
            options.pattern = pattern;
            options.exclude = exclude;
            options.backup = !no_backup;
            options.assume_yes = yes;
            if let Some(n) = max_parallel {
                options.max_parallel = n.max(1);
            }
            if let Some(dir) = backup_dir {
                options.backup_root = dir;
            }
            options.search_paths.extend(search_paths);

            let orchestrator = BatchOrchestrator::new(converter, options);
            let rt = tokio::runtime::Runtime::new()?;
            let summary = rt.block_on(orchestrator.convert_many())?;

            if let Some(path) = report {
                Report::new().with_batch(summary.clone()).save(&path)?;
                info!("[cli] Report written to {}", path.display());
            }
            print_batch(&summary, json)?;
            match batch_failure(&summary) {
                Some(reason) => bail!(reason),
                None => Ok(()),
            }
        }
        Commands::Compare { env_a, env_b, json } => {
            let report = drift::compare(&ctx.inventory(), &env_a, &env_b)?;
            print_drift(&report, json)
        }
        Commands::Drift { target, json } => {
            let report = drift::detect_drift(
                &ctx.inventory(),
                &target,
                &ctx.settings.target_suffix,
                &ctx.settings.backup_suffix,
            )?;
            print_drift(&report, json)
        }
        Commands::Update {
            target,
            all,
            add_missing,
            packages,
            dry_run,
            json,
        } => {
            let updater = Updater::new(
                ctx.inventory(),
                &ctx.settings.target_suffix,
                &ctx.settings.backup_suffix,
            );
            let outcome = updater.update(&UpdateRequest {
                target_env: target,
                update_all: all,
                add_missing,
                specific_packages: packages,
                dry_run,
            })?;
            print_update(&outcome, json)?;
            if !outcome.is_clean() {
                bail!("{} package(s) could not be installed", outcome.failed.len());
            }
            Ok(())
        }
        Commands::Report {
            output,
            drift: include_drift,
            json,
        } => write_report(&ctx, output, include_drift, json),
        Commands::Cache { .. } | Commands::Settings { .. } => {
            Err(anyhow!("command is handled before setup"))
        }
    }
}

fn collect_environments(
    ctx: &Context,
    extra_paths: &[PathBuf],
    max_depth: usize,
) -> Vec<EnvironmentSummary> {
    let inventory = ctx.inventory();
    inventory
        .records(extra_paths, max_depth)
        .iter()
        .map(|record| EnvironmentSummary::collect(&inventory, &record.name, &record.path))
        .collect()
}

/// Why a batch run counts as failed. Nothing attempted is a failure too.
fn batch_failure(summary: &BatchSummary) -> Option<String> {
    if summary.succeeded() {
        return None;
    }
    Some(if summary.attempted() == 0 {
        format!(
            "no environments were converted ({} skipped)",
            summary.skipped()
        )
    } else {
        format!(
            "{} of {} conversions failed",
            summary.failed(),
            summary.attempted()
        )
    })
}

fn list_environments(
    ctx: &Context,
    mut search_paths: Vec<PathBuf>,
    max_depth: Option<usize>,
    json: bool,
) -> Result<()> {
    search_paths.extend(ctx.settings.search_paths.iter().cloned());
    let envs = collect_environments(
        ctx,
        &search_paths,
        max_depth.unwrap_or(ctx.settings.max_depth),
    );

    if json {
        return print_json(&envs);
    }
    if envs.is_empty() {
        println!("No environments found.");
        return Ok(());
    }
    let rows: Vec<EnvironmentRow> = envs.iter().map(EnvironmentRow::from).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

fn print_conversion(report: &ConversionReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    let result = &report.result;
    println!("{} -> {}: {}", result.source, result.target, result.outcome);
    if let Some(python) = &report.python_version {
        println!("  python:   {}", python);
    }
    println!(
        "  packages: {} conda, {} pip{}",
        report.conda_count,
        report.pip_count,
        if report.explicit_only {
            ""
        } else {
            " (full export)"
        }
    );
    if !report.dry_run {
        println!(
            "  installed: {} conda, {} pip",
            report.conda.installed.len(),
            report.pip.installed.len()
        );
    }
    for failed in report.conda.failed.iter().chain(report.pip.failed.iter()) {
        println!("  failed: {} ({})", failed.name, truncate_message(&failed.reason, 80));
    }
    if let Some(reason) = &result.reason {
        println!("  note: {}", reason);
    }
    Ok(())
}

fn print_batch(summary: &BatchSummary, json: bool) -> Result<()> {
    if json {
        return print_json(summary);
    }

    if summary.results.is_empty() {
        println!("No environments selected.");
        return Ok(());
    }
    let rows: Vec<ResultRow> = summary
        .results
        .iter()
        .map(|r| ResultRow {
            source: r.source.clone(),
            target: r.target.clone(),
            outcome: r.outcome.to_string(),
            reason: r
                .reason
                .as_deref()
                .map(|s| truncate_message(s, 60))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    println!(
        "{} succeeded, {} failed, {} skipped{}",
        summary.success(),
        summary.failed(),
        summary.skipped(),
        if summary.dry_run { " (dry run)" } else { "" }
    );
    if let Some(dir) = &summary.backup_dir {
        println!("Backups: {}", shorten_path(dir));
    }
    Ok(())
}

fn drift_rows(report: &DriftReport) -> Vec<DriftRow> {
    let mut rows: Vec<DriftRow> = report
        .changed_versions
        .iter()
        .map(|c| DriftRow {
            package: c.name.clone(),
            source: c.source_version.clone(),
            target: c.target_version.clone(),
            status: "changed",
        })
        .collect();
    rows.extend(report.source_only.iter().map(|p| DriftRow {
        package: p.name.clone(),
        source: p.version.clone(),
        target: "-".to_string(),
        status: "missing",
    }));
    rows.extend(report.target_only.iter().map(|p| DriftRow {
        package: p.name.clone(),
        source: "-".to_string(),
        target: p.version.clone(),
        status: "extra",
    }));
    rows
}

fn print_drift(report: &DriftReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    println!(
        "{} -> {}: {:.1}% similar ({} same, {} changed, {} missing, {} extra)",
        report.source_env,
        report.target_env,
        report.similarity_percent,
        report.same_versions.len(),
        report.changed_versions.len(),
        report.source_only.len(),
        report.target_only.len()
    );
    if report.is_in_sync() {
        return Ok(());
    }
    let table = Table::new(drift_rows(report))
        .with(Style::rounded())
        .to_string();
    println!("{}", table);
    Ok(())
}

fn print_update(outcome: &UpdateOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(outcome);
    }

    print_drift(&outcome.drift, false)?;
    if outcome.report_only {
        println!("Nothing selected. Use --all, --add-missing or --package to update.");
        return Ok(());
    }
    if outcome.dry_run {
        println!("Would install: {}", outcome.planned.join(" "));
        return Ok(());
    }
    if !outcome.updated.is_empty() {
        println!("Updated: {}", outcome.updated.join(", "));
    }
    if !outcome.added.is_empty() {
        println!("Added: {}", outcome.added.join(", "));
    }
    for failed in &outcome.failed {
        println!("Failed: {} ({})", failed.name, truncate_message(&failed.reason, 80));
    }
    Ok(())
}

fn write_report(
    ctx: &Context,
    output: Option<PathBuf>,
    include_drift: bool,
    json: bool,
) -> Result<()> {
    let environments = collect_environments(ctx, &ctx.settings.search_paths, ctx.settings.max_depth);

    let mut drift_reports = Vec::new();
    if include_drift {
        let inventory = ctx.inventory();
        let suffix = &ctx.settings.target_suffix;
        for env in environments.iter().filter(|e| e.name.ends_with(suffix.as_str())) {
            match drift::detect_drift(&inventory, &env.name, suffix, &ctx.settings.backup_suffix) {
                Ok(report) => drift_reports.push(report),
                Err(e) => log::warn!("[cli] Skipping drift for {}: {}", env.name, e),
            }
        }
    }

    let report = Report::new()
        .with_environments(environments)
        .with_drift(drift_reports);

    match output {
        Some(path) => {
            if json {
                report.save(&path)?;
            } else {
                std::fs::write(&path, report.to_text())?;
            }
            println!("Report written to {}", shorten_path(&path));
        }
        None if json => println!("{}", report.to_json()?),
        None => print!("{}", report.to_text()),
    }
    Ok(())
}
