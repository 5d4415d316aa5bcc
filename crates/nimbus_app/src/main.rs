mod cli;

use std::future::Future;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nimbus_controllers::Container;
use nimbus_core::{BroadcastHub, BroadcastMessage, LogicalEnv, NimbusConfig, NimbusError, logging};
use nimbus_terminal::TokioCommandRunner;
use serde::Serialize;
use serde_json::Value;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::{Cli, Command};

/// Exit code for failures before or around the tool itself.
const FAILURE: u8 = 1;

/// Exit code after Ctrl+C or SIGTERM.
const INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let message = match e.downcast_ref::<NimbusError>() {
                Some(nimbus) => nimbus.user_message(),
                None => format!("{e:#}"),
            };
            error!("{message}");
            eprintln!("nimbus: {message}");
            ExitCode::from(FAILURE)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => NimbusConfig::load_from_path(path)?,
        None => NimbusConfig::load()?,
    };
    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    let _log_guard = logging::init_logging(&level).context("Failed to initialize logging")?;
    info!("nimbus v{} starting", env!("CARGO_PKG_VERSION"));

    let container = Container::build(config, Arc::new(TokioCommandRunner::new()))?;
    let watcher = cli.stream.then(|| spawn_watcher(container.hub(), std::io::stderr()));

    // Dropping an unfinished dispatch kills any tool it launched.
    let code = match until_shutdown(dispatch(&container, cli.command), shutdown_signal()).await {
        Some(code) => code,
        None => {
            eprintln!("nimbus: interrupted");
            Ok(ExitCode::from(INTERRUPTED))
        }
    };

    if let Some((stop, handle)) = watcher {
        let _ = stop.send(());
        if let Err(e) = handle.await {
            warn!(error = %e, "watcher task failed");
        }
    }
    code
}

/// Runs `work` unless `shutdown` resolves first.
async fn until_shutdown<F, S>(work: F, shutdown: S) -> Option<F::Output>
where
    F: Future,
    S: Future<Output = ()>,
{
    tokio::select! {
        output = work => Some(output),
        () = shutdown => None,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

async fn dispatch(container: &Container, command: Command) -> Result<ExitCode> {
    match command {
        Command::Exec {
            provider,
            env,
            timeout_secs,
            args,
        } => {
            let env = LogicalEnv::new(env)?;
            let provider = container
                .providers()
                .get_kind(provider)
                .ok_or_else(|| NimbusError::UnknownComponent(provider.as_str().to_string()))?;
            let args = Command::exec_args(provider.kind(), &args);
            let execution = provider
                .execute_args(&env, &args, timeout_secs.map(Duration::from_secs))
                .await?;
            print_json(&execution.to_result())?;
            let status = execution.exit_status.unwrap_or(i32::from(FAILURE));
            Ok(ExitCode::from(u8::try_from(status).unwrap_or(FAILURE)))
        }
        Command::Ensure { provider, env } => {
            let env = LogicalEnv::new(env)?;
            let provider = container
                .providers()
                .get_kind(provider)
                .ok_or_else(|| NimbusError::UnknownComponent(provider.as_str().to_string()))?;
            let state = provider.ensure_context(&env).await?;
            print_json(&state)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let providers = container.providers().aggregate_status().await;
            let controllers = container.controllers().aggregate_status().await;
            let healthy = providers.values().all(|s| s.is_healthy())
                && controllers.values().all(|s| s.is_healthy());
            print_json(&serde_json::json!({
                "providers": providers,
                "controllers": controllers,
            }))?;
            Ok(if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(FAILURE)
            })
        }
        Command::Invoke {
            controller,
            action,
            params,
            env,
        } => {
            let mut params: Value =
                serde_json::from_str(&params).context("--params must be a JSON object")?;
            let Some(object) = params.as_object_mut() else {
                anyhow::bail!("--params must be a JSON object");
            };
            if let Some(env) = env {
                object.insert("logical_env".into(), Value::String(env));
            }
            let result = container
                .controllers()
                .dispatch(&controller, &action, &params)
                .await?;
            print_json(&result)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Mirrors every hub message to `out` as one JSON line.
///
/// After the stop signal, messages already published are written before the
/// task returns `out`.
fn spawn_watcher<W>(hub: &BroadcastHub, mut out: W) -> (oneshot::Sender<()>, JoinHandle<W>)
where
    W: Write + Send + 'static,
{
    let mut subscription = hub.subscribe();
    let (stop_tx, mut stop) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                message = subscription.recv() => message,
                _ = &mut stop => None,
            };
            let Some(message) = next else { break };
            write_message(&mut out, subscription.take_lagged(), &message);
        }
        while let Some(message) = subscription.try_recv() {
            write_message(&mut out, subscription.take_lagged(), &message);
        }
        out
    });
    (stop_tx, handle)
}

fn write_message(out: &mut impl Write, lagged: u64, message: &BroadcastMessage) {
    if lagged > 0 {
        let notice = format!("watcher fell behind, {lagged} messages dropped");
        write_line(out, &BroadcastMessage::error("nimbus", &notice).to_json_line());
    }
    write_line(out, &message.to_json_line());
}

fn write_line(out: &mut impl Write, line: &str) {
    if let Err(e) = writeln!(out, "{line}") {
        debug!(error = %e, "watcher output failed");
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
