//! jobpool-run: run the shell commands read from stdin in parallel, joining
//! the parent's make jobserver when there is one.

mod args;
mod logging;
mod runner;

use std::process::ExitCode;

use jobpool::{JobServerConfig, registry};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::args::{Args, ReportFormat, USAGE, parse_args};

#[tokio::main]
async fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if msg.is_empty() {
                println!("{USAGE}");
                return ExitCode::SUCCESS;
            }
            eprintln!("error: {msg}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    logging::init_tracing();

    match run(&args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every command succeeded.
async fn run(args: &Args) -> anyhow::Result<bool> {
    let config = args.apply(JobServerConfig::from_env()?);
    // Safety: descriptors named in MAKEFLAGS come from our parent, and nothing
    // else in this process has touched them before this point.
    let server = unsafe { registry::init(&config) }?;
    tracing::info!(
        mode = %server.mode(),
        parallel_level = server.parallel_level().get(),
        "Jobserver ready"
    );

    let commands = read_commands().await?;
    let report = runner::run_commands(server, &args.shell, commands).await?;

    if let Some(ReportFormat::Json) = args.report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    let failed = report.failed();
    if failed > 0 {
        tracing::warn!(failed, total = report.commands.len(), "Some commands failed");
    }
    Ok(failed == 0)
}

/// Non-empty stdin lines that are not `#` comments.
async fn read_commands() -> anyhow::Result<Vec<String>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut commands = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        commands.push(line.to_string());
    }
    Ok(commands)
}
