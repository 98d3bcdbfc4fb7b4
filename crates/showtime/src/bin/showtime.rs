//! Showtime CLI - label-driven ephemeral PR environments.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm};
use tracing_subscriber::EnvFilter;

use showtime::aws::{Aws, AwsConfig, Credentials};
use showtime::ui;
use showtime::{
    decode, parse_age, run_lifecycle, CommandImageBuilder, ConfigCommand, DryRunEnvironments,
    DryRunStore, Environments, GitHubConfig, GitHubLabelClient, LabelStore, Orchestrator,
    OrchestratorConfig, PipelineConfig, Reconciler, ShowConfig, ShowStatus, StartOptions,
    SweepOptions, TriggerOutcome, TriggerReport, Ttl,
};

type AwsOrchestrator = Orchestrator<Aws, CommandImageBuilder>;
type DynReconciler = Reconciler<Box<dyn LabelStore>, Box<dyn Environments>>;

/// Which collaborators to replace with side-effect free stand-ins.
#[derive(Debug, Clone, Copy, Default)]
struct DryRun {
    aws: bool,
    github: bool,
    /// Simulated build time for mock deployments.
    aws_sleep: Duration,
}

/// Showtime - ephemeral environments for pull requests, driven by labels.
#[derive(Parser)]
#[command(name = "showtime")]
#[command(about = "Manage ephemeral PR environments through GitHub labels", version)]
struct Cli {
    /// GitHub token (or set `GITHUB_TOKEN` env var).
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, global = true)]
    github_token: Option<String>,

    /// Repository in owner/repo form.
    #[arg(long, env = "GITHUB_REPOSITORY", default_value = "apache/superset", global = true)]
    repository: String,

    /// User recorded as the environment requester.
    #[arg(long, env = "GITHUB_ACTOR", default_value = "unknown", global = true)]
    actor: String,

    /// AWS region.
    #[arg(long, env = "AWS_REGION", default_value = "us-west-2", global = true)]
    aws_region: String,

    /// AWS access key ID.
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true, global = true)]
    aws_access_key_id: Option<String>,

    /// AWS secret access key.
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true, global = true)]
    aws_secret_access_key: Option<String>,

    /// AWS session token for temporary credentials.
    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true, global = true)]
    aws_session_token: Option<String>,

    /// ECS cluster environments run in.
    #[arg(long, env = "ECS_CLUSTER", default_value = "superset-ci", global = true)]
    cluster: String,

    /// ECR repository images are pushed to.
    #[arg(long, env = "ECR_REPOSITORY", default_value = "superset-ci", global = true)]
    ecr_repository: String,

    /// Base task definition (defaults to the cluster name).
    #[arg(long, env = "SHOWTIME_TASK_DEFINITION", global = true)]
    task_definition: Option<String>,

    /// Subnets for environment tasks (comma-separated).
    #[arg(long, env = "SHOWTIME_SUBNETS", value_delimiter = ',', global = true)]
    subnets: Vec<String>,

    /// Security group for environment tasks.
    #[arg(long, env = "SHOWTIME_SECURITY_GROUP", global = true)]
    security_group: Option<String>,

    /// Image build timeout in minutes.
    #[arg(long, env = "SHOWTIME_BUILD_TIMEOUT_MINUTES", default_value = "45", global = true)]
    build_timeout_minutes: u64,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false", global = true)]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an environment for a PR.
    Start {
        /// Pull request number.
        pr: u64,

        /// Commit to deploy (defaults to the PR head).
        #[arg(long)]
        sha: Option<String>,

        /// Time to live (24h, 48h, 1w, close).
        #[arg(long)]
        ttl: Option<Ttl>,

        /// Environment size.
        #[arg(long)]
        size: Option<String>,

        /// Show the labels that would be written without doing anything.
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },

    /// Show the environment state of a PR.
    Status {
        /// Pull request number.
        pr: u64,
    },

    /// Destroy the environment of a PR.
    Stop {
        /// Pull request number.
        pr: u64,

        /// Skip the confirmation prompt.
        #[arg(long, default_value = "false")]
        force: bool,

        /// Show what would be removed without doing anything.
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },

    /// List environments across open PRs.
    List {
        /// Only environments with this status.
        #[arg(long)]
        status: Option<ShowStatus>,

        /// Only environments requested by this user.
        #[arg(long)]
        user: Option<String>,
    },

    /// Explain the showtime label vocabulary.
    Labels,

    /// Process pending trigger labels on a PR.
    HandleTrigger {
        /// Pull request number.
        pr: u64,

        /// Skip AWS operations and report mock deployments.
        #[arg(long, default_value = "false")]
        dry_run_aws: bool,

        /// Keep label writes in memory instead of changing the PR.
        #[arg(long, default_value = "false")]
        dry_run_github: bool,

        /// Seconds a mock deployment takes (with --dry-run-aws).
        #[arg(long, default_value = "0")]
        aws_sleep: u64,
    },

    /// Rehearse a full lifecycle: start, conf-enable-ALERTS, sync, stop.
    TestLifecycle {
        /// Pull request number.
        pr: u64,

        /// Deploy for real instead of mocking AWS.
        #[arg(long, default_value = "false")]
        real_aws: bool,

        /// Write labels to the PR instead of keeping them in memory.
        #[arg(long, default_value = "false")]
        real_github: bool,

        /// Seconds a mock deployment takes.
        #[arg(long, default_value = "10")]
        aws_sleep: u64,
    },

    /// Move a PR's environment to its latest commit.
    HandleSync {
        /// Pull request number.
        pr: u64,
    },

    /// Delete environments older than a given age.
    Cleanup {
        /// Maximum age (90m, 48h, 2d, 1w).
        #[arg(long, default_value = "48h")]
        older_than: String,

        /// Report eligible environments without deleting them.
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
}

impl Cli {
    fn label_store(&self) -> Result<GitHubLabelClient> {
        let token = self
            .github_token
            .clone()
            .filter(|t| !t.is_empty())
            .context("GitHub token required (set GITHUB_TOKEN or pass --github-token)")?;
        let config = GitHubConfig::new(token, &self.repository)?;
        Ok(GitHubLabelClient::new(config)?)
    }

    fn orchestrator(&self) -> Result<AwsOrchestrator> {
        let credentials = Credentials::new(
            self.aws_access_key_id.clone().unwrap_or_default(),
            self.aws_secret_access_key.clone().unwrap_or_default(),
            self.aws_session_token.clone(),
        );
        let aws = Aws::new(AwsConfig::new(&self.aws_region, credentials))?;

        let mut config = OrchestratorConfig::default()
            .with_cluster(&self.cluster)
            .with_repository(&self.ecr_repository)
            .with_task_definition(self.task_definition.as_deref().unwrap_or(&self.cluster));
        if !self.subnets.is_empty() {
            config = config.with_subnets(self.subnets.clone());
        }
        if let Some(group) = &self.security_group {
            config = config.with_security_group(group);
        }

        let builder = CommandImageBuilder::new()
            .with_timeout(Duration::from_secs(self.build_timeout_minutes * 60));

        Ok(Orchestrator::new(aws, builder, config))
    }

    /// Fail early when a command needs AWS and no credentials are configured.
    fn require_aws(&self) -> Result<()> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        if !present(&self.aws_access_key_id) || !present(&self.aws_secret_access_key) {
            bail!("AWS credentials required (set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY)");
        }
        Ok(())
    }

    fn reconciler(&self) -> Result<DynReconciler> {
        self.reconciler_with(DryRun::default())
    }

    fn reconciler_with(&self, dry_run: DryRun) -> Result<DynReconciler> {
        let store: Box<dyn LabelStore> = if dry_run.github {
            Box::new(DryRunStore::new(self.label_store()?))
        } else {
            Box::new(self.label_store()?)
        };
        let environments: Box<dyn Environments> = if dry_run.aws {
            Box::new(DryRunEnvironments::new().with_delay(dry_run.aws_sleep))
        } else {
            Box::new(self.orchestrator()?)
        };
        let config = PipelineConfig::default().with_actor(&self.actor);
        Ok(Reconciler::new(store, environments, config))
    }
}

/// Print one line per trigger and fail if any of them failed.
fn report_triggers(reports: &[TriggerReport], pr: u64) -> Result<()> {
    let mut failed = 0;
    for report in reports {
        match &report.result {
            Ok(outcome) => ui::print_success(&format!("{}: {outcome}", report.trigger)),
            Err(e) => {
                failed += 1;
                ui::print_error(&format!("{}: {e}", report.trigger));
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} triggers failed on PR #{pr}", reports.len());
    }
    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    match &cli.command {
        Commands::Start {
            pr,
            sha,
            ttl,
            size,
            dry_run,
        } => {
            let mut config = ShowConfig::standard();
            if let Some(size) = size {
                config = config.apply(&ConfigCommand::parse(&format!("size-{size}"))?);
            }
            let options = StartOptions {
                sha: sha.clone(),
                ttl: *ttl,
                config,
            };

            let reconciler = cli.reconciler()?;
            if *dry_run {
                let show = reconciler.plan_start(*pr, &options).await?;
                ui::print_section(&format!("🎪 Dry run: start PR #{pr}"));
                for label in showtime::encode(&show) {
                    println!("  + {}", label.green());
                }
                ui::print_info(&format!("Would create service {}", show.aws_service_name()));
                return Ok(());
            }

            cli.require_aws()?;
            let outcome = reconciler
                .start(*pr, options)
                .await
                .with_context(|| format!("Failed to start environment for PR #{pr}"))?;
            if let TriggerOutcome::Started(show) = outcome {
                ui::print_success(&format!(
                    "Environment for PR #{pr} is running at {}",
                    show.url().unwrap_or_default()
                ));
            }
        }

        Commands::Status { pr } => {
            let snapshot = cli.label_store()?.labels(*pr).await?;
            let state = decode(*pr, &snapshot.labels, None);
            ui::print_state(&state, cli.verbose);
        }

        Commands::Stop { pr, force, dry_run } => {
            let reconciler = cli.reconciler()?;
            let state = reconciler.state(*pr).await?;
            if !state.has_shows() {
                ui::print_info(&format!("No environment for PR #{pr}"));
                return Ok(());
            }

            if *dry_run {
                ui::print_section(&format!("🎪 Dry run: stop PR #{pr}"));
                for show in state.shows() {
                    println!("  - service {}", show.aws_service_name().red());
                }
                for label in state.circus_labels() {
                    println!("  - {}", label.red());
                }
                return Ok(());
            }

            if !*force {
                let proceed = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!("Destroy the environment for PR #{pr}?"))
                    .default(false)
                    .interact()?;
                if !proceed {
                    println!("{}", "Cancelled.".yellow());
                    return Ok(());
                }
            }

            cli.require_aws()?;
            match reconciler.stop(*pr).await? {
                TriggerOutcome::Stopped { clean: true } => {
                    ui::print_success(&format!("Environment for PR #{pr} stopped"));
                }
                TriggerOutcome::Stopped { clean: false } => {
                    ui::print_warning(&format!(
                        "Labels cleared for PR #{pr}, but some cloud resources could not be deleted"
                    ));
                }
                other => ui::print_info(&other.to_string()),
            }
        }

        Commands::List { status, user } => {
            let store = cli.label_store()?;
            let mut rows = Vec::new();
            for (pr_number, labels) in store.open_pull_requests().await? {
                let state = decode(pr_number, &labels, None);
                for show in state.shows() {
                    if status.is_some_and(|s| s != show.status) {
                        continue;
                    }
                    if user
                        .as_deref()
                        .is_some_and(|u| show.requested_by.as_deref() != Some(u))
                    {
                        continue;
                    }
                    rows.push(show.clone());
                }
            }

            if rows.is_empty() {
                ui::print_info("No environments");
                return Ok(());
            }

            println!(
                "{:<8} {:<12} {:<9} {:<26} {:<14} {}",
                "PR".bold(),
                "STATUS".bold(),
                "SHA".bold(),
                "URL".bold(),
                "TTL".bold(),
                "USER".bold()
            );
            let now = Utc::now();
            for show in rows {
                println!(
                    "{:<8} {:<12} {:<9} {:<26} {:<14} {}",
                    format!("#{}", show.pr_number),
                    show.status.to_string(),
                    show.sha,
                    show.url().unwrap_or_else(|| "-".to_string()),
                    ui::format_remaining(&show, now),
                    show.requested_by.as_deref().unwrap_or("-")
                );
            }
        }

        Commands::Labels => ui::print_label_reference(),

        Commands::HandleTrigger {
            pr,
            dry_run_aws,
            dry_run_github,
            aws_sleep,
        } => {
            if !*dry_run_aws {
                cli.require_aws()?;
            }
            let reconciler = cli.reconciler_with(DryRun {
                aws: *dry_run_aws,
                github: *dry_run_github,
                aws_sleep: Duration::from_secs(*aws_sleep),
            })?;
            let reports = reconciler.handle_triggers(*pr).await?;
            if reports.is_empty() {
                ui::print_info(&format!("No pending triggers on PR #{pr}"));
            }
            report_triggers(&reports, *pr)?;
        }

        Commands::TestLifecycle {
            pr,
            real_aws,
            real_github,
            aws_sleep,
        } => {
            if *real_aws {
                cli.require_aws()?;
            }
            ui::print_section(&format!("🎪 Lifecycle rehearsal for PR #{pr}"));
            ui::print_info(&format!(
                "AWS: {}, GitHub: {}",
                if *real_aws { "REAL" } else { "DRY-RUN" },
                if *real_github { "REAL" } else { "DRY-RUN" }
            ));
            let reconciler = cli.reconciler_with(DryRun {
                aws: !*real_aws,
                github: !*real_github,
                aws_sleep: Duration::from_secs(*aws_sleep),
            })?;
            let reports = run_lifecycle(&reconciler, *pr).await;
            report_triggers(&reports, *pr).context("Lifecycle rehearsal failed")?;
            ui::print_success("Full lifecycle complete");
        }

        Commands::HandleSync { pr } => {
            cli.require_aws()?;
            let outcome = cli
                .reconciler()?
                .sync(*pr)
                .await
                .with_context(|| format!("Failed to sync environment for PR #{pr}"))?;
            ui::print_success(&outcome.to_string());
        }

        Commands::Cleanup {
            older_than,
            dry_run,
        } => {
            let max_age = parse_age(older_than)?;
            cli.require_aws()?;
            let report = cli
                .orchestrator()?
                .cleanup_older_than(
                    max_age,
                    SweepOptions {
                        dry_run: *dry_run,
                        now: None,
                    },
                )
                .await?;

            let verb = if report.dry_run { "Would delete" } else { "Deleted" };
            for service in &report.deleted {
                ui::print_success(&format!("{verb} {service}"));
            }
            for (service, error) in &report.failed {
                ui::print_error(&format!("{service}: {error}"));
            }
            ui::print_info(&format!(
                "{verb} {} environment(s) older than {older_than}",
                report.deleted.len()
            ));
            if !report.is_clean() {
                bail!("{} environment(s) could not be deleted", report.failed.len());
            }
        }
    }

    Ok(())
}
