//! `hydra` — the audit pipeline multitool.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hydra_core::config::{ConfigFile, EngineConfig};
use hydra_core::orchestrator::{DiffOptions, ScanOptions, ScanOrchestrator, ScanReport};
use hydra_core::reasoner::HttpReasoner;
use hydra_core::report::{self, ReportFormat};
use hydra_core::sandbox::SandboxSupervisor;
use hydra_core::target::ScanMode;

#[derive(Debug, Parser)]
#[clap(name = "hydra", version, about = "Automated security audits for code repositories")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a security scan over a repository.
    Scan(ScanArgs),

    /// Scan only the changed files between two refs.
    #[clap(visible_alias = "d")]
    Diff(ScanArgs),

    /// Re-render a stored scan report.
    Report(ReportArgs),

    /// Inspect or edit the repository configuration.
    Config(ConfigArgs),

    /// Run the HTTP trigger daemon.
    Daemon(DaemonArgs),
}

#[derive(Debug, clap::Args)]
struct ScanArgs {
    /// Repository root to audit.
    path: PathBuf,

    /// full (default) or diff.
    #[clap(long, default_value = "full")]
    mode: String,

    #[clap(long)]
    base_ref: Option<String>,

    #[clap(long)]
    head_ref: Option<String>,

    /// Print the full report as JSON instead of a summary.
    #[clap(long)]
    json: bool,

    /// Also write a SARIF report to this path.
    #[clap(long, value_name = "PATH")]
    sarif: Option<PathBuf>,

    /// Run the adversarial validation stage.
    #[clap(long)]
    adversarial: bool,

    /// Run the patch stage (implies --adversarial).
    #[clap(long)]
    patch: bool,
}

#[derive(Debug, clap::Args)]
struct ReportArgs {
    /// A report previously produced with `scan --json`.
    file: PathBuf,

    /// markdown (default), json, or sarif.
    #[clap(long, default_value = "markdown")]
    format: String,

    /// Write here instead of stdout.
    #[clap(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct ConfigArgs {
    /// Write a default config file if none exists.
    #[clap(long)]
    init: bool,

    /// Print the stored config.
    #[clap(long)]
    show: bool,

    /// Apply a KEY=VALUE assignment.
    #[clap(long, value_name = "KEY=VAL")]
    set: Option<String>,
}

#[derive(Debug, clap::Args)]
struct DaemonArgs {
    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    #[clap(long, default_value_t = 8911)]
    port: u16,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Scan(args) => run_scan(args, None).await,
        Command::Diff(args) => run_scan(args, Some(ScanMode::Diff)).await,
        Command::Report(args) => run_report(args),
        Command::Config(args) => run_config(args),
        Command::Daemon(args) => run_daemon(args).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run_scan(args: ScanArgs, forced_mode: Option<ScanMode>) -> anyhow::Result<()> {
    let mode = match forced_mode {
        Some(mode) => mode,
        None => ScanMode::parse(&args.mode)
            .with_context(|| format!("invalid mode {:?} (expected full or diff)", args.mode))?,
    };

    let config = EngineConfig::load(&args.path)?;
    let reasoner = HttpReasoner::from_env()?;
    let orchestrator =
        ScanOrchestrator::new(config, reasoner, Arc::new(SandboxSupervisor::default()));
    let options = ScanOptions {
        adversarial: args.adversarial || args.patch,
        patch: args.patch,
    };

    let scan_report = match mode {
        ScanMode::Full => orchestrator.run_full_scan(&args.path, options).await?,
        ScanMode::Diff => {
            let diff = DiffOptions {
                base_ref: args.base_ref,
                head_ref: args.head_ref,
                changed_files: None,
            };
            orchestrator.run_diff_scan(&args.path, diff, options).await?
        }
    };

    if let Some(sarif_path) = &args.sarif {
        std::fs::write(sarif_path, report::to_sarif(&scan_report)?)
            .with_context(|| format!("writing {}", sarif_path.display()))?;
    }

    if args.json {
        println!("{}", report::to_json(&scan_report)?);
    } else {
        print!("{}", report::to_markdown(&scan_report));
    }
    Ok(())
}

fn run_report(args: ReportArgs) -> anyhow::Result<()> {
    let format = ReportFormat::parse(&args.format)
        .with_context(|| format!("invalid format {:?}", args.format))?;
    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let scan_report: ScanReport =
        serde_json::from_str(&raw).context("report file is not a scan report")?;

    let rendered = report::render(&scan_report, format)?;
    match &args.output {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("writing {}", path.display()))?,
        None => print!("{rendered}"),
    }
    Ok(())
}

fn run_config(args: ConfigArgs) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;

    if args.init {
        if ConfigFile::load(&cwd)?.is_some() {
            bail!("config file already exists");
        }
        ConfigFile::default().save(&cwd)?;
        println!("wrote {}", ConfigFile::path(&cwd).display());
    }

    if let Some(assignment) = &args.set {
        let (key, value) = assignment
            .split_once('=')
            .context("--set expects KEY=VALUE")?;
        let mut file = ConfigFile::load(&cwd)?.unwrap_or_default();
        file.set(key, value)?;
        file.save(&cwd)?;
        println!("set {key}");
    }

    if args.show || (!args.init && args.set.is_none()) {
        let file = ConfigFile::load(&cwd)?.unwrap_or_default();
        println!("{}", serde_json::to_string_pretty(&file)?);
    }
    Ok(())
}

async fn run_daemon(args: DaemonArgs) -> anyhow::Result<()> {
    let config = hydra_daemon::DaemonConfig::from_env(args.host, args.port)?;
    hydra_daemon::serve(config).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_arguments_parse() {
        let cli = Cli::try_parse_from([
            "hydra",
            "scan",
            "/repo",
            "--mode",
            "diff",
            "--base-ref",
            "main",
            "--head-ref",
            "HEAD",
            "--json",
            "--adversarial",
        ])
        .unwrap();
        match cli.command {
            Command::Scan(args) => {
                assert_eq!(args.path, PathBuf::from("/repo"));
                assert_eq!(args.mode, "diff");
                assert!(args.json);
                assert!(args.adversarial);
                assert!(!args.patch);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn diff_is_an_alias_with_refs() {
        let cli = Cli::try_parse_from(["hydra", "diff", "/repo", "--base-ref", "main"]).unwrap();
        assert!(matches!(cli.command, Command::Diff(_)));
    }

    #[test]
    fn unknown_subcommands_fail_to_parse() {
        assert!(Cli::try_parse_from(["hydra", "explode"]).is_err());
    }
}
