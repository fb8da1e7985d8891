use clap::Parser;
use image_cache::ImageCache;
use log::info;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use testenv_vm::{CreateInput, DeleteInput, EnvSpec, Orchestrator, StateStore};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use error::Result;

const DEFAULT_STATE_DIR: &str = ".testenv-vm";

#[derive(Debug, Parser)]
#[command(about = "Provisions short-lived VM test environments")]
struct Args {
    #[arg(global = true, long, default_value = "INFO")]
    log_level: LevelFilter,

    #[command(subcommand)]
    subcommand: SubCommand,
}

#[derive(Debug, Parser)]
enum SubCommand {
    /// Creates the environment described by a spec file.
    Create(CreateArgs),
    /// Destroys a previously created environment.
    Delete(DeleteArgs),
    /// Lists environments with persisted state.
    List(ListArgs),
}

#[derive(Debug, Parser)]
struct CreateArgs {
    /// Path to the environment spec (YAML).
    #[arg(long)]
    spec: PathBuf,

    /// Identifier of the calling test; keys the persisted state.
    #[arg(long)]
    test_id: String,

    /// Runtime variables exposed to templates as {{ .Env.KEY }}.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[arg(long)]
    image_cache_dir: Option<PathBuf>,

    /// Leave partially-created resources in place on failure.
    #[arg(long)]
    no_cleanup_on_failure: bool,
}

#[derive(Debug, Parser)]
struct DeleteArgs {
    #[arg(long)]
    test_id: String,

    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ListArgs {
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    SimpleLogger::init(args.log_level, LogConfig::default()).context(error::LoggerSnafu)?;

    let rt = Runtime::new().context(error::RuntimeSnafu)?;
    rt.block_on(async {
        match args.subcommand {
            SubCommand::Create(create_args) => create(create_args).await,
            SubCommand::Delete(delete_args) => delete(delete_args).await,
            SubCommand::List(list_args) => list(list_args),
        }
    })
}

async fn create(args: CreateArgs) -> Result<()> {
    let spec = EnvSpec::from_path(&args.spec).context(error::SpecSnafu { path: &args.spec })?;

    let state_dir = args
        .state_dir
        .or_else(|| spec.state_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    let cache_dir = args
        .image_cache_dir
        .or_else(|| spec.image_cache_dir.clone())
        .unwrap_or_else(|| state_dir.join("image-cache"));
    let cache = Arc::new(ImageCache::new(&cache_dir).context(error::CacheSnafu)?);
    let artifact_dir = spec.artifact_dir.clone();

    let mut env = BTreeMap::new();
    for pair in &args.env {
        let (key, value) = pair
            .split_once('=')
            .context(error::BadEnvPairSnafu { pair })?;
        env.insert(key.to_string(), value.to_string());
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted; rolling back");
            signal_cancel.cancel();
        }
    });

    let orchestrator = Orchestrator::new(StateStore::new(&state_dir), cache);
    let input = CreateInput {
        spec,
        test_id: args.test_id,
        env,
        cleanup_on_failure: !args.no_cleanup_on_failure,
    };
    let artifact = orchestrator
        .create(&cancel, &input)
        .await
        .context(error::CreateSnafu)?;

    let rendered =
        serde_json::to_string_pretty(&artifact).context(error::RenderArtifactSnafu)?;
    if let Some(dir) = artifact_dir {
        std::fs::create_dir_all(&dir).context(error::ArtifactWriteSnafu { path: &dir })?;
        let path = dir.join(format!("testenv-{}.artifact.json", artifact.test_id));
        std::fs::write(&path, &rendered).context(error::ArtifactWriteSnafu { path: &path })?;
        info!("Artifact written to '{}'", path.display());
    }
    println!("{}", rendered);
    Ok(())
}

async fn delete(args: DeleteArgs) -> Result<()> {
    let state_dir = args
        .state_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    // The image cache is untouched by delete; point it under the state dir.
    let cache = Arc::new(
        ImageCache::new(state_dir.join("image-cache")).context(error::CacheSnafu)?,
    );
    let orchestrator = Orchestrator::new(StateStore::new(&state_dir), cache);

    let cancel = CancellationToken::new();
    orchestrator
        .delete(
            &cancel,
            &DeleteInput {
                test_id: args.test_id,
                ..DeleteInput::default()
            },
        )
        .await
        .context(error::DeleteSnafu)?;
    Ok(())
}

fn list(args: ListArgs) -> Result<()> {
    let state_dir = args
        .state_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    let store = StateStore::new(&state_dir);
    for id in store.list().context(error::ListSnafu)? {
        println!("{}", id);
    }
    Ok(())
}

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to write artifact at '{}': {}", path.display(), source))]
        ArtifactWrite {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("--env takes KEY=VALUE pairs, got '{}'", pair))]
        BadEnvPair { pair: String },

        #[snafu(display("Failed to open image cache: {}", source))]
        Cache { source: image_cache::Error },

        #[snafu(display("{}", source))]
        Create {
            source: testenv_vm::orchestrator::Error,
        },

        #[snafu(display("{}", source))]
        Delete {
            source: testenv_vm::orchestrator::Error,
        },

        #[snafu(display("Failed to list environments: {}", source))]
        List {
            source: testenv_vm::state::Error,
        },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("Failed to render artifact: {}", source))]
        RenderArtifact { source: serde_json::Error },

        #[snafu(display("Failed to create async runtime: {}", source))]
        Runtime { source: std::io::Error },

        #[snafu(display("Failed to load spec '{}': {}", path.display(), source))]
        Spec {
            path: PathBuf,
            source: testenv_vm::spec::Error,
        },
    }

    pub type Result<T> = std::result::Result<T, Error>;
}
