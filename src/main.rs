//! runnerd entry point.
//!
//! One-shot CLI dispatching the orchestrator subcommands:
//!
//! - `runnerd register` - install and register the configured runners
//! - `runnerd start`    - bring registered runners up and supervise them
//! - `runnerd stop`     - deregister and clean leftover installations
//! - `runnerd status`   - show pool and platform state (`--json` for machines)
//! - `runnerd monitor`  - supervise and autoscale (alias of `start`)
//! - `runnerd run`      - register + start + monitor, tear down on exit
//!
//! Exit codes: 0 success, 1 failure, 130 interrupted by signal.

use std::process::ExitCode;

use runnerd::manager::MonitorOutcome;
use runnerd::{telemetry, Config, Manager};

const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "help" | "--help" | "-h" => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        "version" | "--version" | "-V" => {
            println!("runnerd {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    let mut config = Config::load();
    let mut json_output = false;
    if let Err(message) = apply_overrides(&mut config, &mut json_output, &args[2..]) {
        eprintln!("{message}");
        return ExitCode::FAILURE;
    }

    let errors = config.validate();
    if !errors.is_empty() {
        eprintln!("configuration errors:");
        for error in &errors {
            eprintln!("  - {error}");
        }
        return ExitCode::FAILURE;
    }

    telemetry::init(config.log_file.clone().as_deref());

    let code = match command {
        "register" => cmd_register(config).await,
        "start" | "monitor" => cmd_start(config, false).await,
        "run" => cmd_start(config, true).await,
        "stop" => cmd_stop(config).await,
        "status" => cmd_status(config, json_output).await,
        other => {
            eprintln!("unknown command: {other}");
            print_usage();
            1
        }
    };
    ExitCode::from(code)
}

async fn cmd_register(config: Config) -> u8 {
    let mut manager = match Manager::new(config).await {
        Ok(manager) => manager,
        Err(err) => return fatal(err),
    };
    match manager.register_runners().await {
        Ok(()) => 0,
        Err(err) => fatal(err),
    }
}

/// Bring runners up and supervise until a signal or timeout, then tear
/// down. With `register_first` this is the all-in-one `run` command.
async fn cmd_start(config: Config, register_first: bool) -> u8 {
    let mut manager = match Manager::new(config).await {
        Ok(manager) => manager,
        Err(err) => return fatal(err),
    };

    if register_first {
        if let Err(err) = manager.register_runners().await {
            return fatal(err);
        }
    } else {
        let adopted = manager.adopt_installed().await;
        if adopted > 0 {
            tracing::info!(count = adopted, "adopted registered installations");
        }
    }

    if let Err(err) = manager.start_runners() {
        return fatal(err);
    }

    let outcome = match manager.monitor().await {
        Ok(outcome) => outcome,
        Err(err) => {
            manager.shutdown().await;
            return fatal(err);
        }
    };
    manager.shutdown().await;

    match outcome {
        MonitorOutcome::Interrupted => EXIT_INTERRUPTED,
        MonitorOutcome::Expired => 0,
    }
}

async fn cmd_stop(config: Config) -> u8 {
    let mut manager = match Manager::new(config).await {
        Ok(manager) => manager,
        Err(err) => return fatal(err),
    };
    match manager.deregister_installed().await {
        Ok(removed) => {
            println!("deregistered {removed} runner installation(s)");
            0
        }
        Err(err) => fatal(err),
    }
}

async fn cmd_status(config: Config, json_output: bool) -> u8 {
    let manager = match Manager::new(config).await {
        Ok(manager) => manager,
        Err(err) => return fatal(err),
    };
    let report = manager.status().await;

    if json_output {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("serialization failed: {err}");
                return 1;
            }
        }
        return 0;
    }

    println!(
        "runnerd status ({})",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  platform: {} ({})", report.platform, report.scope);
    println!("  mode:     {}", report.mode);
    match report.queue {
        Some(queue) => println!("  queue:    {queue} pending"),
        None => println!("  queue:    unavailable"),
    }
    println!(
        "  pool:     {} total, {} idle",
        report.pool_total, report.pool_idle
    );
    if !report.runners.is_empty() {
        println!("  local runners:");
        for runner in &report.runners {
            let uptime = runner
                .uptime_secs
                .map(|s| format!("{s}s"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    {:<28} {:<12} pid {:<8} up {}",
                runner.name,
                runner.state,
                runner.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                uptime
            );
        }
    }
    if !report.remote_runners.is_empty() {
        println!("  platform inventory:");
        for remote in &report.remote_runners {
            println!(
                "    {:<28} {:?}{}",
                remote.name,
                remote.status,
                if remote.busy { " (busy)" } else { "" }
            );
        }
    }
    0
}

fn apply_overrides(
    config: &mut Config,
    json_output: &mut bool,
    args: &[String],
) -> Result<(), String> {
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--runner-count" => {
                let value = args
                    .get(i + 1)
                    .ok_or("missing value for --runner-count")?;
                config.runner_count = value
                    .parse()
                    .map_err(|_| format!("invalid --runner-count: {value}"))?;
                i += 2;
            }
            "--labels" => {
                let value = args.get(i + 1).ok_or("missing value for --labels")?;
                config.labels = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                i += 2;
            }
            "--json" => {
                *json_output = true;
                i += 1;
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(())
}

fn fatal(err: impl std::fmt::Display) -> u8 {
    tracing::error!(error = %err, "command failed");
    eprintln!("error: {err}");
    1
}

fn print_usage() {
    eprintln!(
        "runnerd {} - self-hosted CI runner orchestrator

USAGE:
    runnerd <COMMAND> [OPTIONS]

COMMANDS:
    register     Install and register the configured runners
    start        Start registered runners and supervise them
    stop         Deregister and clean leftover runner installations
    status       Show pool, queue, and platform inventory
    monitor      Supervise and autoscale (same loop as start)
    run          Register, start, and monitor in one process
    version      Show version information
    help         Show this help message

OPTIONS:
    --runner-count N   Override the configured pool size (register, run)
    --labels a,b,c     Override the extra runner labels (register, run)
    --json             Machine-readable output (status)

CONFIGURATION:
    Read from the environment merged over a .env file; the environment
    wins. RUNNER_TOKEN and RUNNER_REPOSITORY (or RUNNER_PROJECT_ID for
    GitLab) are required. All options use the RUNNER_ prefix; see the
    config module documentation for the full set.

EXIT CODES:
    0    Success
    1    Failure
    130  Interrupted by signal
",
        env!("CARGO_PKG_VERSION")
    );
}
