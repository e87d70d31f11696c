// dfs-node: replicated file store daemon with optional one-shot put/get.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use dfs_core::{FileServer, ServerState, TcpTransport};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BOOTSTRAP_WAIT: Duration = Duration::from_secs(5);

const USAGE: &str = "usage: dfs-node [--config PATH] [-v] [--version] [put KEY FILE | get KEY OUT]";

#[derive(Debug, PartialEq)]
enum Command {
    Serve,
    Put { key: String, file: PathBuf },
    Get { key: String, out: PathBuf },
}

#[derive(Debug, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    verbose: bool,
    version: bool,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut config = None;
    let mut verbose = false;
    let mut version = false;
    let mut rest = Vec::new();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => version = true,
            "-v" | "--verbose" => verbose = true,
            "--config" | "-c" => {
                let p = it.next().context("--config needs a path")?;
                config = Some(PathBuf::from(p));
            }
            _ => rest.push(arg),
        }
    }
    let command = match rest.as_slice() {
        [] => Command::Serve,
        [cmd, key, file] if cmd == "put" => Command::Put {
            key: key.clone(),
            file: PathBuf::from(file),
        },
        [cmd, key, out] if cmd == "get" => Command::Get {
            key: key.clone(),
            out: PathBuf::from(out),
        },
        _ => bail!("{USAGE}"),
    };
    Ok(Args {
        config,
        verbose,
        version,
        command,
    })
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("dfs-node {}", VERSION);
        return Ok(());
    }

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let cfg = config::load(args.config.as_deref())?;
    let opts = cfg.to_server_opts()?;
    let transport = TcpTransport::new(cfg.to_transport_opts());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let server = Arc::new(FileServer::new(opts, transport));
        let run = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };
        wait_running(&server).await;
        if server.state() != ServerState::Running {
            return run.await?.context("file server failed to start");
        }
        let expected = cfg.bootstrap_nodes.iter().filter(|a| !a.is_empty()).count();
        wait_bootstrap(&server, expected).await;

        let outcome = run_command(&server, args.command).await;
        if outcome.is_ok() {
            shutdown_signal().await?;
        }
        server.stop()?;
        run.await??;
        outcome
    })
}

async fn run_command(server: &FileServer<TcpTransport>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve => Ok(()),
        Command::Put { key, file } => {
            let mut f = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            let n = server.store(&key, &mut f).await?;
            info!(key = %key, bytes = n, peers = server.peer_count(), "stored file");
            Ok(())
        }
        Command::Get { key, out } => {
            let (size, mut f) = server.get(&key).await?;
            let mut dst = tokio::fs::File::create(&out)
                .await
                .with_context(|| format!("creating {}", out.display()))?;
            tokio::io::copy(&mut f, &mut dst).await?;
            info!(key = %key, bytes = size, out = %out.display(), "fetched file");
            Ok(())
        }
    }
}

async fn wait_running(server: &FileServer<TcpTransport>) {
    while matches!(server.state(), ServerState::Idle | ServerState::Listening) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Give bootstrap dials a bounded window to register before running a command.
async fn wait_bootstrap(server: &FileServer<TcpTransport>, expected: usize) {
    let deadline = tokio::time::Instant::now() + BOOTSTRAP_WAIT;
    while server.peer_count() < expected {
        if tokio::time::Instant::now() >= deadline {
            warn!(connected = server.peer_count(), expected, "bootstrap incomplete");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> anyhow::Result<Args> {
        parse_args(s.split_whitespace().map(String::from))
    }

    #[test]
    fn serve_by_default() {
        let a = args("").unwrap();
        assert_eq!(a.command, Command::Serve);
        assert!(!a.verbose && !a.version && a.config.is_none());
    }

    #[test]
    fn flags_and_put() {
        let a = args("-v --config /tmp/n.toml put pic ./cat.jpg").unwrap();
        assert!(a.verbose);
        assert_eq!(a.config, Some(PathBuf::from("/tmp/n.toml")));
        assert_eq!(
            a.command,
            Command::Put {
                key: "pic".into(),
                file: PathBuf::from("./cat.jpg")
            }
        );
    }

    #[test]
    fn get_command() {
        let a = args("get pic out.jpg").unwrap();
        assert_eq!(
            a.command,
            Command::Get {
                key: "pic".into(),
                out: PathBuf::from("out.jpg")
            }
        );
    }

    #[test]
    fn bad_usage() {
        assert!(args("put onlykey").is_err());
        assert!(args("delete k").is_err());
        assert!(args("--config").is_err());
    }
}
