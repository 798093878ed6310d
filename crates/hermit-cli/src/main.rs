//! Hermit CLI - drive a local workspace from the shell
//!
//! Usage:
//!   hermit run -c "command"                 Run a command, streaming its output
//!   hermit fs read|write|rm|ls|stat <path>   File operations
//!   hermit agent --prompt "..." --decider-url URL
//!                                           Run the agent, printing updates as SSE
//!
//! Every subcommand works on the directory given by `--root` (default: the
//! current directory), seen by commands and paths as `/workspace`.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use hermit::agent::{AgentLoop, AgentMode, AgentSource, AgentTaskRecord, HttpDecider};
use hermit::executor::OutputChunk;
use hermit::{
    ExecutionRequest, FileStore, HermitConfig, InMemoryStore, LOCAL_OWNER, SandboxExecutor, Store,
    StreamBroker, Workspace,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hermit")]
#[command(about = "Run commands, edit files and drive an agent in a sandboxed workspace")]
struct Cli {
    /// Directory to use as the workspace
    #[arg(long, global = true, env = "HERMIT_ROOT", default_value = ".")]
    root: PathBuf,

    /// Optional TOML configuration file
    #[arg(long, global = true, env = "HERMIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a shell command and exit with its exit code
    Run {
        /// The command line, run with `sh -c`
        #[arg(short = 'c', long = "command")]
        command: String,

        /// Working directory inside the workspace
        #[arg(long)]
        cwd: Option<String>,

        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// File operations
    Fs {
        #[command(subcommand)]
        op: FsCommand,
    },

    /// Run the agent loop against an HTTP decision endpoint
    Agent {
        /// What the agent should do
        #[arg(long)]
        prompt: String,

        /// Run autonomously with the larger iteration ceiling
        #[arg(long)]
        autonomous: bool,

        /// Iteration ceiling for this run
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Decision endpoint (falls back to the config file)
        #[arg(long, env = "HERMIT_DECIDER_URL")]
        decider_url: Option<String>,

        /// Model id forwarded to the decision endpoint
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum FsCommand {
    /// Print a file to stdout
    Read { path: String },
    /// Replace a file with `--content` or stdin
    Write {
        path: String,
        #[arg(long)]
        content: Option<String>,
    },
    /// Delete a file or directory tree
    Rm { path: String },
    /// List a directory
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Print metadata as JSON
    Stat { path: String },
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("hermit: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = HermitConfig::load_or_default(cli.config.as_deref())?;
    let root = std::fs::canonicalize(&cli.root)
        .with_context(|| format!("workspace root {} is not accessible", cli.root.display()))?;
    let workspace = Workspace::local(root, config.workspace_config());

    match cli.command {
        Command::Run {
            command,
            cwd,
            timeout_ms,
        } => {
            let mut request = ExecutionRequest::new(command);
            request.cwd = cwd;
            request.timeout = timeout_ms.map(Duration::from_millis);
            run_command(&config, &workspace, request).await
        }
        Command::Fs { op } => {
            file_op(&FileStore::new(&config.sandbox.guest_root), &workspace, op).await?;
            Ok(0)
        }
        Command::Agent {
            prompt,
            autonomous,
            max_iterations,
            decider_url,
            model,
        } => {
            let Some(url) = decider_url.or_else(|| config.decision.url.clone()) else {
                bail!("no decision endpoint: pass --decider-url or set [decision] url");
            };
            let mode = if autonomous {
                AgentMode::Autonomous {
                    max_iterations: max_iterations
                        .unwrap_or(config.agent.autonomous_max_iterations),
                }
            } else {
                if let Some(n) = max_iterations {
                    config.agent.interactive_max_iterations = n;
                }
                AgentMode::Interactive
            };
            let model = model.or_else(|| config.decision.model.clone());
            run_agent(&config, workspace, &url, prompt, mode, model).await
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            token.cancel();
        }
    });
    cancel
}

fn executor(config: &HermitConfig, store: Arc<dyn Store>) -> Arc<SandboxExecutor> {
    Arc::new(
        SandboxExecutor::new(config.launcher(), store, &config.sandbox.guest_root)
            .with_term_grace(config.sandbox.term_grace),
    )
}

async fn run_command(
    config: &HermitConfig,
    workspace: &Workspace,
    request: ExecutionRequest,
) -> anyhow::Result<i32> {
    let executor = executor(config, Arc::new(InMemoryStore::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        while let Some(chunk) = rx.recv().await {
            match chunk {
                OutputChunk::Stdout(bytes) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                OutputChunk::Stderr(bytes) => {
                    stderr.write_all(&bytes).await?;
                    stderr.flush().await?;
                }
            }
        }
        Ok::<_, std::io::Error>(())
    });

    let cancel = cancel_on_ctrl_c();
    let result = executor
        .execute(workspace, request, Some(tx), &cancel)
        .await?;
    printer.await??;

    if result.truncated {
        eprintln!("hermit: output truncated");
    }
    if result.timed_out {
        eprintln!(
            "hermit: timed out after {} ms",
            result.duration.as_millis()
        );
    }
    Ok(result.exit_code)
}

async fn file_op(files: &FileStore, workspace: &Workspace, op: FsCommand) -> anyhow::Result<()> {
    match op {
        FsCommand::Read { path } => {
            let bytes = files.read(workspace, &path).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&bytes).await?;
            stdout.flush().await?;
        }
        FsCommand::Write { path, content } => {
            let content = match content {
                Some(content) => content.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin()
                        .read_to_end(&mut buf)
                        .context("failed to read stdin")?;
                    buf
                }
            };
            let written = files.write(workspace, &path, &content).await?;
            eprintln!("wrote {written} bytes");
        }
        FsCommand::Rm { path } => files.delete(workspace, &path).await?,
        FsCommand::Ls { path } => {
            for entry in files.list(workspace, &path).await? {
                if entry.is_dir {
                    println!("{}/", entry.name);
                } else {
                    println!("{}\t{}", entry.name, entry.size);
                }
            }
        }
        FsCommand::Stat { path } => {
            let stat = files.stat(workspace, &path).await?;
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
    }
    Ok(())
}

async fn run_agent(
    config: &HermitConfig,
    workspace: Workspace,
    url: &str,
    prompt: String,
    mode: AgentMode,
    model: Option<String>,
) -> anyhow::Result<i32> {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    store.insert_workspace(workspace.clone()).await?;

    let decider = Arc::new(HttpDecider::new(
        url,
        model.clone(),
        config.agent.decision_timeout,
    ));
    let agent = Arc::new(AgentLoop::new(
        executor(config, store.clone()),
        FileStore::new(&config.sandbox.guest_root),
        store.clone(),
        decider,
        config.agent_config(),
    ));

    let task = AgentTaskRecord::new(workspace.id, LOCAL_OWNER, prompt, mode, model);
    store.insert_task(task.clone()).await?;

    let broker = StreamBroker::new(config.broker_config());
    let mut channel = broker.open(AgentSource::new(agent, workspace, task));
    let interrupt = cancel_on_ctrl_c();
    let cancel = channel.cancellation();
    tokio::spawn(async move {
        interrupt.cancelled().await;
        cancel.cancel();
    });

    let mut stdout = tokio::io::stdout();
    let mut completed = false;
    while let Some(event) = channel.recv().await {
        completed = event.name() == "complete";
        stdout.write_all(event.to_sse().as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(if completed { 0 } else { 1 })
}
