//! Topoform CLI entrypoint.
//!
//! This is the main entrypoint for the topoform command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use topoform::cli::{Cli, Commands, OutputFormat, OutputFormatter, PromptApprover, StateCommands};
use topoform::config::{
    ConfigParser, ConfigValidator, ProviderKind, StateBackend, TopologyConfig, VariableResolver,
    find_config_file,
};
use topoform::engine::{Approver, AutoApprove, Desired, Engine, Phase};
use topoform::error::{ApplyError, ConfigError, Result, TopoformError};
use topoform::outputs;
use topoform::planner::ChangeSet;
use topoform::provider::{ProviderAdapter, adapter_for, connect};
use topoform::state::{LocalStateStore, S3StateStore, StateScope, StateStore};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status of `plan` when changes are pending.
const EXIT_CHANGES_PENDING: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            error!(class = %e.class(), "{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system on stderr.
fn init_logging(verbose: bool, format: OutputFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let overrides = cli.variable_overrides();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init {
            path,
            template,
            force,
        } => cmd_init(&path, template, force).await,
        Commands::Validate { warnings } => cmd_validate(config_path, &overrides, warnings, &formatter),
        Commands::Plan { out, refresh, lock } => {
            let project = Project::load(config_path, &overrides)?;
            cmd_plan(&project, out.as_deref(), refresh, lock, &formatter).await
        }
        Commands::Apply {
            plan,
            auto_approve,
            parallelism,
        } => {
            let project = Project::load(config_path, &overrides)?;
            cmd_apply(&project, plan.as_deref(), auto_approve, parallelism, &formatter).await
        }
        Commands::Destroy {
            auto_approve,
            parallelism,
        } => {
            let project = Project::load(config_path, &overrides)?;
            cmd_destroy(&project, auto_approve, parallelism, &formatter).await
        }
        Commands::Output {
            name,
            non_sensitive,
        } => {
            let project = Project::load(config_path, &overrides)?;
            cmd_output(&project, name.as_deref(), non_sensitive, &formatter).await
        }
        Commands::Drift => {
            let project = Project::load(config_path, &overrides)?;
            cmd_drift(&project, &formatter).await
        }
        Commands::State { command } => {
            let project = Project::load(config_path, &overrides)?;
            cmd_state(&project, command, &formatter).await
        }
    }
}

/// Initialize a new project.
async fn cmd_init(path: &Path, template: ProviderKind, force: bool) -> Result<ExitCode> {
    info!("Initializing new topoform project in: {}", path.display());

    let config_path = path.join("topoform.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        verify_credentials(&config_path);
        prepare_backend(&config_path).await?;
        return Ok(ExitCode::SUCCESS);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, render_template(template))?;
    eprintln!("Created: {}", config_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ".topoform/"]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Topoform")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.topoform/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    verify_credentials(&config_path);
    prepare_backend(&config_path).await?;

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit topoform.yaml with your resources");
    eprintln!("  2. Run 'topoform validate' to check your configuration");
    eprintln!("  3. Run 'topoform plan' to see what will change");
    eprintln!("  4. Run 'topoform apply' to provision");

    Ok(ExitCode::SUCCESS)
}

/// Fills the configuration template for one provider.
fn render_template(provider: ProviderKind) -> String {
    let (region, placement) = match provider {
        ProviderKind::Aws => ("eu-west-1", "subnet: ${app_subnet.id}"),
        ProviderKind::Gcp => ("europe-west1", "network: ${net.id}"),
        ProviderKind::Azure => ("westeurope", "subnet: ${app_subnet.id}"),
    };
    include_str!("../templates/topoform.yaml")
        .replace("__PROVIDER__", &provider.to_string())
        .replace("__REGION__", region)
        .replace("__PLACEMENT__", placement)
}

/// Reports whether the credential source of a configuration resolves.
fn verify_credentials(config_path: &Path) {
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    let parser = ConfigParser::new().with_base_path(base);
    if let Err(e) = parser.load_dotenv() {
        warn!("Could not load .env: {e}");
    }

    let resolved = parser
        .load_file(config_path)
        .and_then(|config| ConfigParser::resolve_credentials(&config).map(|token| (config, token)));
    match resolved {
        Ok((config, Some(_))) => eprintln!(
            "Credentials: resolved from {}",
            config.provider.credentials_env().unwrap_or("environment")
        ),
        Ok((_, None)) => eprintln!("Credentials: none configured"),
        Err(e) => eprintln!("Credentials: {e}"),
    }
}

/// Prepares the state backend and checks the provider endpoint of a project.
async fn prepare_backend(config_path: &Path) -> Result<()> {
    let project = Project::load(Some(config_path), &std::collections::BTreeMap::new())?;

    let store = project.open_store().await?;
    store.init().await?;
    eprintln!("State backend: {} ready", store.backend_type());

    let adapter = project.adapter().await?;
    eprintln!("Provider: {} endpoint configured", adapter.kind());
    Ok(())
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&Path>,
    overrides: &std::collections::BTreeMap<String, String>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, _) = load_config(config_path, overrides)?;
    let result = ConfigValidator::new().check(&config);

    write_stdout(&formatter.format_validation(&config, &result, show_warnings))?;

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the change set.
async fn cmd_plan(
    project: &Project,
    out: Option<&Path>,
    refresh: bool,
    lock: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let engine = project.engine(None).await?.with_refresh(refresh);
    let desired = Desired::from_config(&project.config)?;

    let outcome = engine.plan(&desired, lock).await?;
    write_stdout(&formatter.format_plan(&outcome.changes, outcome.drift.as_ref()))?;

    if let Some(path) = out {
        outcome.changes.save(path)?;
        eprintln!("Saved change set to {}", path.display());
    }

    Ok(if outcome.changes.has_changes() {
        ExitCode::from(EXIT_CHANGES_PENDING)
    } else {
        ExitCode::SUCCESS
    })
}

/// Apply the configuration or a saved change set.
async fn cmd_apply(
    project: &Project,
    saved: Option<&Path>,
    auto_approve: bool,
    parallelism: usize,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let saved = saved.map(ChangeSet::load).transpose()?;
    let engine = project.engine(Some(parallelism)).await?;
    let desired = Desired::from_config(&project.config)?;

    // A saved plan was already reviewed.
    let approver: Box<dyn Approver> = if auto_approve || saved.is_some() {
        Box::new(AutoApprove)
    } else {
        Box::new(PromptApprover::new())
    };

    let outcome = engine
        .apply(&desired, saved.as_ref(), approver.as_ref())
        .await
        .map_err(|e| show_interrupted(formatter, e))?;
    write_stdout(&formatter.format_apply(&outcome))?;

    Ok(exit_for(outcome.phase))
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    project: &Project,
    auto_approve: bool,
    parallelism: usize,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let engine = project.engine(Some(parallelism)).await?;

    let approver: Box<dyn Approver> = if auto_approve {
        Box::new(AutoApprove)
    } else {
        Box::new(PromptApprover::for_destroy())
    };

    let outcome = engine
        .destroy(approver.as_ref())
        .await
        .map_err(|e| show_interrupted(formatter, e))?;
    write_stdout(&formatter.format_apply(&outcome))?;

    Ok(exit_for(outcome.phase))
}

/// Show outputs of the last successful apply.
async fn cmd_output(
    project: &Project,
    name: Option<&str>,
    non_sensitive: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let store = project.open_store().await?;
    let recorded = store.load().await?.outputs;

    if let Some(name) = name {
        let Some(output) = outputs::find(&recorded, name) else {
            eprintln!("No output named '{name}'.");
            return Ok(ExitCode::FAILURE);
        };
        if !output.is_visible(non_sensitive) {
            eprintln!("Output '{name}' is sensitive; drop --non-sensitive to show it.");
            return Ok(ExitCode::FAILURE);
        }
        write_stdout(&formatter.format_output_value(output))?;
        return Ok(ExitCode::SUCCESS);
    }

    let listed: Vec<_> = recorded
        .into_iter()
        .filter(|o| o.is_visible(non_sensitive))
        .collect();
    write_stdout(&formatter.format_outputs(&listed))?;
    Ok(ExitCode::SUCCESS)
}

/// Check for drift.
async fn cmd_drift(project: &Project, formatter: &OutputFormatter) -> Result<ExitCode> {
    let engine = project.engine(None).await?;
    let desired = Desired::from_config(&project.config)?;

    let report = engine.drift(&desired).await?;
    write_stdout(&formatter.format_drift(&report))?;

    Ok(if report.has_drift() {
        ExitCode::from(EXIT_CHANGES_PENDING)
    } else {
        ExitCode::SUCCESS
    })
}

/// State management commands.
async fn cmd_state(
    project: &Project,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let store = project.open_store().await?;

    match command {
        StateCommands::Show => {
            let state = store.load().await?;
            let lock = store.lock_info().await?;
            write_stdout(&formatter.format_state(&state, lock.as_ref()))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            let Some(current) = store.lock_info().await? else {
                eprintln!("State is not locked.");
                return Ok(ExitCode::SUCCESS);
            };

            match lock_id {
                _ if force => {}
                Some(id) if id == current.lock_id => {}
                Some(id) => {
                    eprintln!(
                        "Lock id {id} does not match the current lock {} held by {}.",
                        current.lock_id, current.holder
                    );
                    return Ok(ExitCode::FAILURE);
                }
                None => {
                    eprintln!(
                        "State is locked by {} ({}). Provide --lock-id {} or use --force.",
                        current.holder, current.operation, current.lock_id
                    );
                    return Ok(ExitCode::FAILURE);
                }
            }

            if let Some(removed) = store.force_unlock().await? {
                warn!("Removed lock {} held by {}", removed.lock_id, removed.holder);
            }
            eprintln!("State unlocked.");
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loaded configuration and the directory it was found in.
struct Project {
    config: TopologyConfig,
    dir: PathBuf,
}

impl Project {
    /// Loads, resolves and validates the configuration.
    fn load(
        config_path: Option<&Path>,
        overrides: &std::collections::BTreeMap<String, String>,
    ) -> Result<Self> {
        let (config, dir) = load_config(config_path, overrides)?;
        ConfigValidator::new().validate(&config)?;
        Ok(Self { config, dir })
    }

    /// Creates the state store named by the configuration.
    async fn open_store(&self) -> Result<Box<dyn StateStore>> {
        let scope = StateScope::new(&self.config.project.name, &self.config.project.environment);

        let store: Box<dyn StateStore> = match self.config.state.backend {
            StateBackend::Local => {
                let dir = self.dir.join(self.config.state_dir());
                debug!("Using local state in {}", dir.display());
                Box::new(LocalStateStore::new(dir, scope))
            }
            StateBackend::S3 => {
                let bucket = self.config.state.bucket.as_deref().ok_or_else(|| {
                    TopoformError::Config(ConfigError::validation(
                        "S3 bucket not configured",
                        "state.bucket",
                    ))
                })?;
                let key = self.config.state_key();
                let region = self.config.state.region.as_deref();
                Box::new(S3StateStore::new(bucket, &key, region, scope).await?)
            }
        };

        Ok(store)
    }

    /// Connects the provider adapter.
    async fn adapter(&self) -> Result<Arc<dyn ProviderAdapter>> {
        let token = ConfigParser::resolve_credentials(&self.config)?;
        let api = connect(&self.config.provider, token).await?;
        Ok(adapter_for(self.config.provider.kind, api))
    }

    /// Builds an engine whose cancel flag is raised on Ctrl-C.
    async fn engine(&self, parallelism: Option<usize>) -> Result<Engine<Box<dyn StateStore>>> {
        let store = self.open_store().await?;
        let adapter = self.adapter().await?;

        let mut engine = Engine::new(store, adapter).with_cancel_flag(cancel_on_ctrl_c());
        if let Some(parallelism) = parallelism {
            engine = engine.with_parallelism(parallelism);
        }
        Ok(engine)
    }
}

/// Finds, loads and resolves the configuration without validating it.
fn load_config(
    config_path: Option<&Path>,
    overrides: &std::collections::BTreeMap<String, String>,
) -> Result<(TopologyConfig, PathBuf)> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file(".")?,
    };
    debug!("Loading configuration from: {}", config_file.display());

    let dir = config_file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let parser = ConfigParser::new().with_base_path(&dir);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    let config = VariableResolver::from_process_env(overrides.clone()).apply(config)?;
    Ok((config, dir))
}

/// Returns a flag raised when the process receives Ctrl-C.
fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight changes");
            flag.store(true, Ordering::SeqCst);
        }
    });
    cancel
}

/// Prints what an apply changed before a failed checkpoint stopped it.
fn show_interrupted(formatter: &OutputFormatter, err: TopoformError) -> TopoformError {
    if let TopoformError::Apply(ApplyError::CheckpointFailed { report, .. }) = &err {
        eprint!("{}", formatter.format_report(report));
    }
    err
}

fn exit_for(phase: Phase) -> ExitCode {
    if phase == Phase::Committed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn write_stdout(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_prepares_local_state_and_is_idempotent() {
        let temp = TempDir::new().expect("temp dir");

        let code = cmd_init(temp.path(), ProviderKind::Gcp, false).await.expect("init");
        assert_eq!(code, ExitCode::SUCCESS);
        assert!(temp.path().join("topoform.yaml").exists());
        assert!(temp.path().join(".topoform/dev").is_dir());

        let again = cmd_init(temp.path(), ProviderKind::Gcp, false).await.expect("re-init");
        assert_eq!(again, ExitCode::SUCCESS);
    }

    #[tokio::test]
    async fn test_init_rejects_unusable_endpoint() {
        let temp = TempDir::new().expect("temp dir");
        let config = render_template(ProviderKind::Aws).replace("endpoint: sim", "endpoint: ''");
        std::fs::write(temp.path().join("topoform.yaml"), config).expect("write");

        assert!(cmd_init(temp.path(), ProviderKind::Aws, false).await.is_err());
    }
}
