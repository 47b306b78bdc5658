//! Commander CLI - call an operation in a running command server
//!
//! ```text
//! commander <channel> <target> <operation> [args...]
//! ```
//!
//! Exit status is 0 on `OK`, 1 on `FAIL`, unrecognized replies and transport
//! errors, and 2 on bad arguments.

use clap::Parser;
use commander_ipc::{invoke_async, CancellationToken, IpcConfig, IpcError, Request, Response, TransportKind};
use console::style;
use std::io::Write;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "commander")]
#[command(about = "Invoke a named operation inside a running command server")]
#[command(version)]
struct Cli {
    /// Channel identifier (socket path for the local-socket transport)
    channel: String,

    /// Target object name
    target: String,

    /// Operation name
    operation: String,

    /// Operation arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Transport: shm or socket (detected when omitted)
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// Shared-memory ring capacity in bytes
    #[arg(long)]
    capacity: Option<u64>,

    /// Give up after this many milliseconds
    #[arg(long, value_name = "MS")]
    timeout: Option<u64>,

    /// Log transport activity to stderr
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> IpcConfig {
        let mut config = IpcConfig::new(&self.channel);
        if let Some(kind) = self.transport {
            config = config.with_transport(kind);
        }
        if let Some(capacity) = self.capacity {
            config = config.with_capacity(capacity);
        }
        config
    }
}

/// Run one invocation, reporting to `out`/`err`, and return the exit status
async fn run(cli: &Cli, out: &mut impl Write, err: &mut impl Write) -> i32 {
    let config = cli.config();
    let request = Request::new(&cli.target, &cli.operation, cli.args.iter().map(String::as_str));
    let token = CancellationToken::new();

    let deadline = cli.timeout.map(|ms| {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            debug!(ms, "deadline reached");
            token.cancel();
        })
    });

    let outcome = invoke_async(&config, &request, &token).await;
    if let Some(deadline) = deadline {
        deadline.abort();
    }

    // Reporting is best effort; a closed stdout must not change the status
    match outcome {
        Ok(Response::Ok(result)) => {
            if let Some(result) = result {
                let _ = writeln!(out, "{result}");
            }
            0
        }
        Ok(Response::Fail(Some(text))) => {
            let _ = writeln!(err, "{} {text}", style("FAIL:").red().for_stderr());
            1
        }
        Ok(Response::Fail(None)) => {
            let _ = writeln!(err, "{}", style("FAIL").red().for_stderr());
            1
        }
        Err(IpcError::UnrecognizedResponse(reply)) => {
            debug!(%reply, "unrecognized reply");
            let _ = writeln!(err, "{}", style("no answer").yellow().for_stderr());
            1
        }
        Err(IpcError::Cancelled) => {
            let ms = cli.timeout.unwrap_or_default();
            let _ = writeln!(err, "{} timed out after {ms} ms", style("error:").red().for_stderr());
            1
        }
        Err(e) => {
            let _ = writeln!(err, "{} {e}", style("error:").red().for_stderr());
            1
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = run(&cli, &mut std::io::stdout(), &mut std::io::stderr()).await;
    std::process::exit(code);
}
