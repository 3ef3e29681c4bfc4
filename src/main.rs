//! Tiered CLI entrypoint.
//!
//! This is the main entrypoint for the tiered command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tiered_deploy::cli::{Cli, Commands, OutputFormatter, ProviderKind, StateCommands};
use tiered_deploy::config::{ConfigParser, ConfigValidator, DeployConfig, StateBackend, find_config_file};
use tiered_deploy::error::{Result, TieredError};
use tiered_deploy::graph::{Graph, NodeId, SecretValue};
use tiered_deploy::outputs::{DEFAULT_OUTPUT_NAMES, EndpointProber};
use tiered_deploy::provider::{CloudControlProvider, ProviderAdapter, ProviderOperation, SimulatedCloud};
use tiered_deploy::reconciler::Reconciler;
use tiered_deploy::state::{LocalStateStore, MemoryStateStore, S3StateStore, STATE_DIR, StackState, StateStore};
use tiered_deploy::topology::TwoTierTopology;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings),
        Commands::Graph => cmd_graph(config_path, &formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, cli.provider, detailed, &formatter).await,
        Commands::Apply { yes, parallel } => {
            cmd_apply(config_path, cli.provider, yes, parallel, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config_path, cli.provider, yes, &formatter).await,
        Commands::Drift => cmd_drift(config_path, cli.provider, &formatter).await,
        Commands::Outputs => cmd_outputs(config_path, cli.provider, &formatter).await,
        Commands::Probe { wait, path } => cmd_probe(config_path, cli.provider, wait, &path, &formatter).await,
        Commands::Rehearse { fail } => cmd_rehearse(config_path, &fail, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new project in: {}", path.display());

    let config_path = path.join("tiered.deploy.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/tiered.deploy.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# tiered")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set the database password");
    eprintln!("  2. Edit tiered.deploy.yaml with your addresses and sizes");
    eprintln!("  3. Run 'tiered validate' to check your configuration");
    eprintln!("  4. Run 'tiered plan' to see what will be created");
    eprintln!("  5. Run 'tiered apply' to create the stack");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(parent_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    eprintln!("Configuration is valid!");
    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    }

    if ConfigParser::database_password(&config).is_err() {
        eprintln!(
            "\nNote: {} is not set; plan and apply will need it.",
            config.database.password_env
        );
    }

    eprintln!("\nConfiguration summary:");
    eprintln!("  Project: {}", config.project.name);
    eprintln!("  Environment: {}", config.project.environment);
    eprintln!("  Region: {}", config.project.region.as_deref().unwrap_or("(SDK default)"));
    eprintln!("  VPC: {}", config.network.vpc_cidr);
    eprintln!("  Web: 2 x {} ({})", config.web.instance_type, config.web.image_id);
    eprintln!("  Database: {} {}", config.database.engine, config.database.instance_class);
    eprintln!(
        "  Outputs: {}",
        DEFAULT_OUTPUT_NAMES.len() + config.outputs.len()
    );

    Ok(())
}

/// Show the resource graph.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let password = ConfigParser::database_password(&config).unwrap_or_default();
    let graph = TwoTierTopology::new(&config, SecretValue::new(password)).build()?;
    emit(formatter, &formatter.format_graph(&graph))
}

/// Show the reconciliation plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    provider_kind: ProviderKind,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let graph = build_graph(&config)?;
    let store = create_state_store(&config, &config_file).await?;
    let provider = create_provider(provider_kind, &config).await;

    let plan = Reconciler::new(&config, &graph, &*provider, &*store)
        .plan_only()
        .await?;
    emit(formatter, &formatter.format_plan(&plan, detailed))
}

/// Apply the plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    provider_kind: ProviderKind,
    auto_approve: bool,
    parallel: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (mut config, config_file) = load_config(config_path)?;
    if let Some(parallel) = parallel {
        config.execution.max_parallel = parallel.max(1);
    }
    let graph = build_graph(&config)?;
    let store = create_state_store(&config, &config_file).await?;
    let provider = create_provider(provider_kind, &config).await;
    let token = cancel_on_ctrl_c();

    let reconciler = Reconciler::new(&config, &graph, &*provider, &*store).with_cancellation(token);

    let plan = reconciler.plan_only().await?;
    if plan.is_empty() {
        eprintln!("No changes to apply.");
    } else {
        eprintln!("{}", formatter.format_plan(&plan, false));
        if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    let report = reconciler.apply().await?;
    emit(formatter, &formatter.format_report(&report))?;
    report.ensure_converged()
}

/// Destroy the stack.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    provider_kind: ProviderKind,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let graph = Graph::empty();
    let store = create_state_store(&config, &config_file).await?;
    let provider = create_provider(provider_kind, &config).await;
    let token = cancel_on_ctrl_c();

    let reconciler = Reconciler::new(&config, &graph, &*provider, &*store).with_cancellation(token);

    let plan = reconciler.plan_destroy().await?;
    if plan.is_empty() {
        eprintln!("Nothing to destroy.");
        return Ok(());
    }

    eprintln!("The following resources will be destroyed:");
    for action in &plan.actions {
        eprintln!("  - {} ({})", action.node_id, action.provider_id.as_deref().unwrap_or("unknown"));
    }

    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
    {
        eprintln!("Destruction cancelled.");
        return Ok(());
    }

    let report = reconciler.destroy().await?;
    emit(formatter, &formatter.format_report(&report))?;
    report.ensure_converged()
}

/// Check for drift.
async fn cmd_drift(
    config_path: Option<&PathBuf>,
    provider_kind: ProviderKind,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let graph = build_graph(&config)?;
    let store = create_state_store(&config, &config_file).await?;
    let provider = create_provider(provider_kind, &config).await;

    let report = Reconciler::new(&config, &graph, &*provider, &*store)
        .check_drift()
        .await?;
    emit(formatter, &formatter.format_drift(&report))
}

/// Show stack outputs.
async fn cmd_outputs(
    config_path: Option<&PathBuf>,
    provider_kind: ProviderKind,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let graph = Graph::empty();
    let store = create_state_store(&config, &config_file).await?;
    let provider = create_provider(provider_kind, &config).await;

    let outputs = Reconciler::new(&config, &graph, &*provider, &*store)
        .outputs()
        .await?;
    emit(formatter, &formatter.format_outputs(&outputs))
}

/// Probe the load balancer.
async fn cmd_probe(
    config_path: Option<&PathBuf>,
    provider_kind: ProviderKind,
    wait_secs: u64,
    path: &str,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let graph = Graph::empty();
    let store = create_state_store(&config, &config_file).await?;
    let provider = create_provider(provider_kind, &config).await;

    let outputs = Reconciler::new(&config, &graph, &*provider, &*store)
        .outputs()
        .await?;
    let [lb_output, ..] = DEFAULT_OUTPUT_NAMES;
    let dns_name = outputs
        .get(lb_output)
        .and_then(|v| v.as_str())
        .ok_or_else(|| TieredError::internal("load balancer DNS name is not a string"))?;

    let prober = EndpointProber::new()?
        .with_path(path)
        .with_marker(config.web.page_title.as_str());
    let result = if wait_secs == 0 {
        prober.probe(dns_name).await
    } else {
        prober
            .wait_until_healthy(
                dns_name,
                std::time::Duration::from_secs(wait_secs),
                std::time::Duration::from_secs(10),
            )
            .await
    };

    emit(formatter, &formatter.format_probe(&result))?;
    if result.healthy {
        Ok(())
    } else {
        Err(TieredError::internal(format!("{} is not healthy", result.url)))
    }
}

/// Plan and apply against a simulated cloud seeded from recorded state.
async fn cmd_rehearse(
    config_path: Option<&PathBuf>,
    failures: &[String],
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let graph = build_graph(&config)?;
    let store = create_state_store(&config, &config_file).await?;

    let state = store
        .load()
        .await?
        .unwrap_or_else(|| StackState::new(&config.project.name, &config.project.environment));
    let cloud = SimulatedCloud::seeded_from(state.resources.values().filter(|r| r.is_live()));
    for node in failures {
        let node = NodeId::from(node.as_str());
        if !graph.contains(&node) {
            warn!(node = %node, "Not a declared node, ignoring failure injection");
            continue;
        }
        cloud.fail_fatal(node, ProviderOperation::Create);
    }
    let rehearsal = MemoryStateStore::with_state(state);

    eprintln!("Rehearsing against a simulated cloud; no real resources are touched.");
    let report = Reconciler::new(&config, &graph, &cloud, &rehearsal)
        .with_cancellation(cancel_on_ctrl_c())
        .apply()
        .await?;
    emit(formatter, &formatter.format_report(&report))?;
    debug!(peak = cloud.peak_concurrency(), calls = cloud.calls().len(), "Rehearsal finished");
    report.ensure_converged()
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;

    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => {
                emit(formatter, &formatter.format_state(&state))?;
                emit(formatter, &formatter.format_lock(store.get_lock_info().await?.as_ref()))?;
            }
            None => eprintln!("No state found."),
        },
        StateCommands::Lock { holder } => {
            let lock = store
                .acquire_lock(holder.as_deref().unwrap_or(""), "manual")
                .await?;
            eprintln!("State locked: {}", lock.lock_id);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output: JSON to stdout, text to stderr.
fn emit(formatter: &OutputFormatter, text: &str) -> Result<()> {
    if formatter.is_json() {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{text}")?;
    } else {
        eprint!("{text}");
    }
    Ok(())
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Returns a token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight actions");
            trigger.cancel();
        }
    });
    token
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads, overrides and validates the configuration.
fn load_config(config_path: Option<&PathBuf>) -> Result<(DeployConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(parent_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    Ok((config, config_file))
}

/// Builds the graph; the database password is required.
fn build_graph(config: &DeployConfig) -> Result<Graph> {
    let password = ConfigParser::database_password(config)?;
    Ok(TwoTierTopology::new(config, SecretValue::new(password)).build()?)
}

/// Creates the configured state store.
async fn create_state_store(config: &DeployConfig, config_file: &Path) -> Result<Box<dyn StateStore>> {
    let (stack, environment) = (&config.project.name, &config.project.environment);
    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| parent_dir(config_file).join(STATE_DIR), PathBuf::from);
            Box::new(LocalStateStore::with_base_dir(path).for_stack(stack, environment))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| TieredError::internal("S3 bucket not configured"))?;
            let region = config.state.region.as_deref().or(config.project.region.as_deref());
            Box::new(
                S3StateStore::new(bucket, config.state.prefix.as_deref(), region)
                    .await
                    .for_stack(stack, environment),
            )
        }
    };
    debug!(backend = store.backend_type(), "State store ready");
    Ok(store)
}

/// Creates the selected provider.
async fn create_provider(kind: ProviderKind, config: &DeployConfig) -> Box<dyn ProviderAdapter> {
    match kind {
        ProviderKind::Cloudcontrol => Box::new(
            CloudControlProvider::new(config.project.region.as_deref(), &config.execution).await,
        ),
        ProviderKind::Simulated => {
            warn!("Using the simulated provider; no real resources are touched");
            Box::new(SimulatedCloud::new())
        }
    }
}
