use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;

use lesson_runner::config::CliArgs;
use lesson_runner::dispatcher::Dispatcher;
use lesson_runner::execution::{ExecutionResult, format_duration};
use lesson_runner::lifecycle::{RunController, RunPhase};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    match run(CliArgs::parse()).await {
        Ok(result) if result.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: CliArgs) -> Result<ExecutionResult> {
    let config = cli.to_config().context("Failed to load configuration")?;
    let dispatcher = Dispatcher::from_config(&config);
    if cli.prewarm {
        // The handle is dropped; the load keeps going and is joined by the run
        let _ = dispatcher.prewarm();
    }

    let source = read_source(cli.file.as_deref())?;
    let controller = RunController::new(Arc::new(dispatcher), config.execution.timeout_ms.into());
    let mut updates = controller.subscribe();

    let Some(run_id) = controller.start(&cli.language, source) else {
        bail!("Language \"{}\" does not support execution", cli.language);
    };
    log::debug!("Waiting for run {run_id}");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-c received, stopping run...");
                controller.stop();
            }
            changed = updates.changed() => {
                changed.context("Run controller went away")?;
                let snapshot = updates.borrow_and_update().clone();
                match snapshot.phase {
                    RunPhase::Loading => log::info!("Loading runtime..."),
                    RunPhase::Running => log::debug!("Running..."),
                    RunPhase::Idle => {
                        let Some(result) = snapshot.result else {
                            bail!("Run {run_id} finished without a result");
                        };
                        print_result(&result);
                        return Ok(result);
                    }
                }
            }
        }
    }
}

fn read_source(file: Option<&str>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}")),
        None => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("Failed to read snippet from stdin")?;
            Ok(source)
        }
    }
}

fn print_result(result: &ExecutionResult) {
    if !result.output.is_empty() {
        print!("{}", result.output);
        if !result.output.ends_with('\n') {
            println!();
        }
    }
    if let Some(error) = &result.error {
        eprintln!("{error}");
        if let Some(hint) = result.timeout_hint() {
            eprintln!("{hint}");
        }
    }
    if let Some(duration_ms) = result.duration_ms {
        eprintln!("Executed in {}", format_duration(duration_ms));
    }
}
