//! Example command server
//!
//! Serves a few operations until Ctrl+C. Try it with the CLI:
//!
//! ```text
//! cargo run --example echo_server -- /tmp/commander.sock
//! commander /tmp/commander.sock Echo Join a b c
//! commander /tmp/commander.sock Math Add 40 2
//! ```

use commander_ipc::{CommandServer, DispatchError, IpcConfig, Registry, TransportKind};
use tracing_subscriber::EnvFilter;

fn parse_int(text: &str) -> Result<i64, DispatchError> {
    text.parse()
        .map_err(|e| DispatchError::Failed(format!("'{text}' is not an integer: {e}")))
}

fn registry() -> Registry {
    let start = std::time::Instant::now();
    let mut registry = Registry::new();

    registry
        .register("Echo", "Join", |args| Ok(Some(args.join(" "))))
        .register("Echo", "Count", |args| Ok(Some(args.len().to_string())))
        .register("Math", "Add", |args| {
            if args.len() != 2 {
                return Err(DispatchError::ArgumentCount {
                    expected: 2,
                    got: args.len(),
                });
            }
            Ok(Some((parse_int(&args[0])? + parse_int(&args[1])?).to_string()))
        })
        .register("Server", "Pid", |_| Ok(Some(std::process::id().to_string())))
        .register("Server", "Uptime", move |_| {
            Ok(Some(format!("{:.1}s", start.elapsed().as_secs_f64())))
        })
        .register("Server", "Ping", |_| Ok(None));
    registry
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let channel = args.next().unwrap_or_else(|| "/tmp/commander.sock".to_string());
    let mut config = IpcConfig::new(channel);
    if let Some(kind) = args.next() {
        match kind.parse::<TransportKind>() {
            Ok(kind) => config = config.with_transport(kind),
            Err(e) => {
                eprintln!("[Server] {e}");
                std::process::exit(2);
            }
        }
    }

    let server = match CommandServer::start(&config, registry()) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("[Server] Failed to start: {e}");
            std::process::exit(1);
        }
    };

    println!("[Server] Listening on '{}' ({})", server.channel(), server.kind());
    println!("[Server] Ctrl+C to quit");

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("[Server] Failed to wait for Ctrl+C: {e}");
    }

    println!("[Server] Shutting down...");
    if let Err(e) = server.shutdown().await {
        eprintln!("[Server] Shutdown failed: {e}");
        std::process::exit(1);
    }
}
