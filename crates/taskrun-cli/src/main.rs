//! TaskRun CLI - run a single CI task in a sandbox.

mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskrun_core::{ImageRef, TaskDeclaration, TaskSpec, Workspace};
use taskrun_engine::report::EXIT_ENGINE_FAULT;
use taskrun_engine::{
    DirectoryRegistry, Engine, EngineConfig, Isolation, ResultReporter, RetryPolicy,
};

/// TaskRun - single-task CI execution engine
#[derive(Parser)]
#[command(name = "taskrun")]
#[command(about = "Run a CI task declaration in an isolated sandbox", long_about = None)]
struct Cli {
    /// State directory holding the image store and sandboxes
    #[arg(long, env = "TASKRUN_ROOT", global = true)]
    root: Option<PathBuf>,

    /// Local registry mirror laid out as <repository>/<tag>/
    #[arg(long, env = "TASKRUN_REGISTRY", global = true)]
    registry: Option<PathBuf>,

    /// Never contact the registry; use cached images only
    #[arg(long, env = "TASKRUN_OFFLINE", global = true)]
    offline: bool,

    /// Image pull attempts before giving up
    #[arg(long, env = "TASKRUN_PULL_ATTEMPTS", default_value = "3", global = true)]
    pull_attempts: u32,

    /// Emit JSON lines on stdout instead of human output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a task declaration
    Run {
        /// Task declaration (YAML)
        task: PathBuf,

        /// Host path for an input, as NAME=PATH
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(String, PathBuf)>,

        /// Directory holding inputs not given with --input
        #[arg(long, env = "TASKRUN_INPUTS_DIR", default_value = ".")]
        inputs_dir: PathBuf,

        /// Directory receiving outputs
        #[arg(long, env = "TASKRUN_OUTPUTS_DIR")]
        outputs_dir: Option<PathBuf>,

        /// Directory holding persistent caches
        #[arg(long, env = "TASKRUN_CACHE_DIR")]
        cache_dir: Option<PathBuf>,

        /// Key separating this task's caches from other tasks' (default: file stem)
        #[arg(long)]
        cache_key: Option<String>,

        /// Kill the command after this many seconds
        #[arg(long, env = "TASKRUN_TIMEOUT")]
        timeout: Option<u64>,

        /// Seconds between SIGTERM and SIGKILL
        #[arg(long, env = "TASKRUN_GRACE", default_value = "10")]
        grace: u64,

        /// Sandbox isolation level
        #[arg(long, env = "TASKRUN_ISOLATION", value_enum, default_value = "directory")]
        isolation: IsolationArg,
    },

    /// Parse a task declaration and print what it would mount
    Validate {
        /// Task declaration (YAML)
        task: PathBuf,
    },

    /// Resolve an image reference into the local store
    Resolve {
        /// Image reference, repository[:tag]
        image: String,
    },

    /// Manage the local image store
    Images {
        #[command(subcommand)]
        command: ImagesCommand,
    },
}

#[derive(Subcommand)]
enum ImagesCommand {
    /// List cached images
    List,

    /// Remove one cached image
    Rm {
        /// Image reference, repository[:tag]
        image: String,
    },

    /// Remove every cached image
    Prune,
}

#[derive(Clone, Copy, ValueEnum)]
enum IsolationArg {
    Directory,
    Namespaces,
}

impl From<IsolationArg> for Isolation {
    fn from(arg: IsolationArg) -> Self {
        match arg {
            IsolationArg::Directory => Isolation::Directory,
            IsolationArg::Namespaces => Isolation::Namespaces,
        }
    }
}

fn parse_input(s: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got '{s}'"))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=PATH, got '{s}'"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries task output and JSON.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = EngineConfig::default().with_offline(cli.offline);
    config.retry = RetryPolicy::new(cli.pull_attempts, config.retry.base_delay);
    if let Some(root) = &cli.root {
        config = config.with_root(root);
    }
    let registry_root = cli
        .registry
        .clone()
        .unwrap_or_else(|| config.store_dir.with_file_name("registry"));

    match cli.command {
        Commands::Run {
            task,
            inputs,
            inputs_dir,
            outputs_dir,
            cache_dir,
            cache_key,
            timeout,
            grace,
            isolation,
        } => {
            let config = config
                .with_grace_period(Duration::from_secs(grace))
                .with_isolation(isolation.into());
            let mut workspace = Workspace::new(inputs_dir, task_key(&task, cache_key));
            if let Some(dir) = outputs_dir {
                workspace = workspace.with_outputs_dir(dir);
            }
            if let Some(dir) = cache_dir {
                workspace = workspace.with_cache_dir(dir);
            }
            for (name, path) in inputs {
                workspace = workspace.with_input(name, path);
            }

            let spec = load_spec(&task, &workspace)?;
            let engine = Engine::new(config, Arc::new(DirectoryRegistry::new(registry_root)))?;
            let code = run_task(&engine, spec, timeout.map(Duration::from_secs), cli.json).await?;
            std::process::exit(code);
        }
        Commands::Validate { task } => {
            let workspace = Workspace::new(".", task_key(&task, None));
            let spec = load_spec(&task, &workspace)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&spec)?);
            } else {
                render::print_spec(&spec);
            }
        }
        Commands::Resolve { image } => {
            let engine = Engine::new(config, Arc::new(DirectoryRegistry::new(registry_root)))?;
            let image = ImageRef::parse(&image)?;
            match engine.resolver().resolve(&image).await {
                Ok(resolved) => render::print_image(&resolved, cli.json)?,
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(EXIT_ENGINE_FAULT);
                }
            }
        }
        Commands::Images { command } => {
            let engine = Engine::new(config, Arc::new(DirectoryRegistry::new(registry_root)))?;
            let store = engine.store();
            match command {
                ImagesCommand::List => {
                    for image in store.list().await {
                        render::print_image(&image, cli.json)?;
                    }
                }
                ImagesCommand::Rm { image } => {
                    let image = ImageRef::parse(&image)?;
                    if store.evict(&image).await? {
                        println!("removed {image}");
                    } else {
                        println!("{image} is not cached or still in use");
                    }
                }
                ImagesCommand::Prune => {
                    for image in store.prune().await? {
                        println!("removed {image}");
                    }
                }
            }
        }
    }

    Ok(())
}

fn task_key(task: &Path, explicit: Option<String>) -> String {
    explicit.unwrap_or_else(|| {
        task.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "task".to_string())
    })
}

fn load_spec(task: &Path, workspace: &Workspace) -> Result<TaskSpec, Box<dyn std::error::Error>> {
    let declaration = TaskDeclaration::from_path(task)
        .map_err(|e| format!("{}: {e}", task.display()))?;
    Ok(declaration.into_spec(workspace)?)
}

/// Execute one task, streaming events, and return the process exit code.
async fn run_task(
    engine: &Engine,
    spec: TaskSpec,
    timeout: Option<Duration>,
    json: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let (tx, mut rx) = engine.event_channel();
    let mut runner = engine.runner(spec).with_events(tx);
    if let Some(timeout) = timeout {
        runner = runner.with_timeout(timeout);
    }

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling task");
            cancel.cancel();
        }
    });

    info!(execution = %runner.execution_id(), "Starting task");
    let execution = tokio::spawn(runner.execute());

    while let Some(event) = rx.recv().await {
        render::print_event(&event, json)?;
    }
    let outcome = execution.await?;

    let report = ResultReporter::new().report(&outcome);
    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        eprint!("{report}");
    }
    Ok(report.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(
            parse_input("repo=/src/checkout").unwrap(),
            ("repo".to_string(), PathBuf::from("/src/checkout"))
        );
        assert!(parse_input("repo").is_err());
        assert!(parse_input("=/src").is_err());
    }

    #[test]
    fn test_task_key_defaults_to_file_stem() {
        assert_eq!(task_key(Path::new("ci/build.yml"), None), "build");
        assert_eq!(task_key(Path::new("ci/build.yml"), Some("main".into())), "main");
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "taskrun",
            "--offline",
            "run",
            "ci/build.yml",
            "--input",
            "repo=.",
            "--timeout",
            "60",
        ])
        .unwrap();
        assert!(cli.offline);
        match cli.command {
            Commands::Run { inputs, timeout, .. } => {
                assert_eq!(inputs, vec![("repo".to_string(), PathBuf::from("."))]);
                assert_eq!(timeout, Some(60));
            }
            _ => panic!("expected run"),
        }
    }
}
