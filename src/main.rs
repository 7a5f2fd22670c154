//! Binary entry point for the Tether CLI.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tether::policy::RegistryError;
use tether::{
    ApiConfig, ConfigError, DesiredDocument, DesiredInstance, FileStateStore,
    InstanceRepresentation, PlanError, PlanReport, Planner, ReconcileError, ReconcileOutcome,
    ReconcileRequest, Reconciler, RestApiError, RestComputeApi, StateStore, StateStoreError,
};

mod cli;

use cli::{ApplyCommand, Cli, DestroyCommand, PlanCommand, RefreshCommand, WaitArgs};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("client error: {0}")]
    Client(#[from] RestApiError),
    #[error("state error: {0}")]
    State(#[from] StateStoreError),
    #[error("invalid schema: {0}")]
    Schema(#[from] RegistryError),
    #[error("plan failed: {0}")]
    Plan(#[from] PlanError),
    #[error("reconcile failed: {0}")]
    Reconcile(#[from] ReconcileError<RestApiError>),
    #[error("failed to read desired configuration {path}: {message}")]
    Desired { path: Utf8PathBuf, message: String },
    #[error("no instance recorded in {path}; run apply first")]
    NoRecordedInstance { path: Utf8PathBuf },
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "tether=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            write_error(io::stderr(), &err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Plan(command) => plan(command),
        Cli::Apply(command) => apply(command).await,
        Cli::Destroy(command) => destroy(command).await,
        Cli::Refresh(command) => refresh(command).await,
        Cli::List => list().await,
    }
}

fn plan(command: PlanCommand) -> Result<(), CliError> {
    let desired = read_desired(&utf8(command.desired)?)?;
    let observed = match command.state {
        Some(path) => FileStateStore::new(utf8(path)?).load()?,
        None => None,
    };
    let planner = Planner::compute_instance()?;
    let plan = planner.plan(&desired, observed.as_ref())?;
    let empty = tether::Fields::new();
    let observed_fields = observed.as_ref().map_or(&empty, |instance| &instance.fields);
    write!(io::stdout(), "{}", PlanReport::new(&plan, observed_fields)).ok();
    Ok(())
}

async fn apply(command: ApplyCommand) -> Result<(), CliError> {
    let desired = read_desired(&utf8(command.desired)?)?;
    let store = FileStateStore::new(utf8(command.state)?);
    let observed = store.load()?;
    let config = load_config()?;
    let reconciler = reconciler(&config)?;

    let request = match observed {
        Some(instance) => ReconcileRequest::update(desired, instance),
        None => ReconcileRequest::create(desired),
    };
    let outcome = match reconciler
        .reconcile(with_wait(request, &command.wait, &config))
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return Err(record_failure(&store, err)),
    };
    if let Some(instance) = outcome.representation() {
        store.save(instance)?;
    }
    writeln!(io::stdout(), "{}", summarise(&outcome)).ok();
    Ok(())
}

async fn destroy(command: DestroyCommand) -> Result<(), CliError> {
    let store = FileStateStore::new(utf8(command.state)?);
    let observed = recorded_instance(&store)?;
    let id = observed.id.clone();
    let config = load_config()?;
    let reconciler = reconciler(&config)?;

    let request = ReconcileRequest::delete(observed);
    reconciler
        .reconcile(with_wait(request, &command.wait, &config))
        .await?;
    store.clear()?;
    writeln!(io::stdout(), "deleted {id}").ok();
    Ok(())
}

async fn refresh(command: RefreshCommand) -> Result<(), CliError> {
    let store = FileStateStore::new(utf8(command.state)?);
    let observed = recorded_instance(&store)?;
    let config = load_config()?;
    let reconciler = reconciler(&config)?;

    if let Some(instance) = reconciler.refresh(&observed.id).await? {
        store.save(&instance)?;
        writeln!(io::stdout(), "{} {}", instance.id, instance.status).ok();
    } else {
        info!(instance_id = %observed.id, "instance no longer exists; clearing state");
        store.clear()?;
        writeln!(io::stdout(), "{} gone", observed.id).ok();
    }
    Ok(())
}

async fn list() -> Result<(), CliError> {
    let config = load_config()?;
    let reconciler = reconciler(&config)?;
    let mut stdout = io::stdout();
    for instance in reconciler.list().await? {
        let name = instance
            .fields
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("-");
        writeln!(stdout, "{}\t{}\t{name}", instance.id, instance.status).ok();
    }
    Ok(())
}

fn load_config() -> Result<ApiConfig, CliError> {
    let config = ApiConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

fn reconciler(config: &ApiConfig) -> Result<Reconciler<RestComputeApi>, CliError> {
    let api = RestComputeApi::new(config)?;
    Ok(Reconciler::new(api, Planner::compute_instance()?).with_waiter(config.waiter()))
}

fn with_wait(request: ReconcileRequest, args: &WaitArgs, config: &ApiConfig) -> ReconcileRequest {
    if !args.wait {
        return request;
    }
    let timeout = args
        .timeout
        .map_or_else(|| config.wait_timeout(), Duration::from_secs);
    request.wait(timeout)
}

/// Persists the instance a failed request left behind so that the next
/// `apply` updates it instead of creating another one.
fn record_failure(store: &impl StateStore, err: ReconcileError<RestApiError>) -> CliError {
    if let Some(instance) = err.instance() {
        if let Err(save_err) = store.save(instance) {
            return save_err.into();
        }
        info!(instance_id = %instance.id, "recorded instance state after failure");
    }
    err.into()
}

fn recorded_instance(store: &FileStateStore) -> Result<InstanceRepresentation, CliError> {
    store
        .load()?
        .ok_or_else(|| CliError::NoRecordedInstance {
            path: store.path().to_path_buf(),
        })
}

fn summarise(outcome: &ReconcileOutcome) -> String {
    match outcome {
        ReconcileOutcome::Created(instance) => {
            format!("created {} ({})", instance.id, instance.status)
        }
        ReconcileOutcome::Updated(instance) => {
            format!("updated {} ({})", instance.id, instance.status)
        }
        ReconcileOutcome::Unchanged(instance) => format!("{} unchanged", instance.id),
        ReconcileOutcome::Deleted => String::from("deleted"),
    }
}

fn utf8(path: PathBuf) -> Result<Utf8PathBuf, CliError> {
    Utf8PathBuf::from_path_buf(path).map_err(|raw| CliError::NonUtf8Path(raw.display().to_string()))
}

fn read_desired(path: &Utf8Path) -> Result<DesiredInstance, CliError> {
    let desired_error = |message: String| CliError::Desired {
        path: path.to_path_buf(),
        message,
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| desired_error(String::from("path is missing a filename")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| desired_error(err.to_string()))?;
    let contents = dir
        .read_to_string(file_name)
        .map_err(|err| desired_error(err.to_string()))?;
    serde_json::from_str::<DesiredDocument>(&contents)
        .map(DesiredInstance::from)
        .map_err(|err| desired_error(err.to_string()))
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
