use std::process;

use snapcache::{
    application::{
        commands::{self, DropinOutcome},
        error::AppError,
    },
    config::{self, Command},
    infra::telemetry,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let chain = error.chain();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?chain, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?chain, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    let Some(command) = cli_args.command else {
        return Err(AppError::validation(
            "no command given; run `snapcache --help` for the command list",
        ));
    };

    match command {
        Command::Purge(args) => {
            let report = commands::purge(&settings, &args)?;
            println!("purged {}: {report}", args.url);
        }
        Command::PurgeAll => {
            commands::purge_all(&settings)?;
            println!(
                "cleared {}",
                settings.cache.base_directory.display()
            );
        }
        Command::Sweep(args) => {
            let report = commands::sweep_cache(&settings, &args).await?;
            println!(
                "sweep: {} -> {} bytes, {} files evicted, {} failed",
                report.total_before, report.total_after, report.evicted_files, report.failed
            );
        }
        Command::Invalidate(args) => {
            let report = commands::invalidate(&settings, &args)?;
            println!("invalidated: {report}");
        }
        Command::Warm(args) => {
            let report = commands::warm(&settings, &args).await?;
            println!(
                "warmup done ({} URLs, {} failed)",
                report.requested, report.failed
            );
        }
        Command::Dropin(args) => match commands::dropin(&settings, args.action)? {
            DropinOutcome::Installed(state) if state.installed => {
                println!("early-serve manifest installed");
            }
            DropinOutcome::Installed(state) => {
                println!(
                    "early-serve manifest not installed: {}",
                    state.reason.as_deref().unwrap_or("unknown")
                );
            }
            DropinOutcome::Uninstalled { removed } => {
                println!(
                    "early-serve manifest {}",
                    if removed { "removed" } else { "left in place" }
                );
            }
            DropinOutcome::Status(status) => {
                println!("presence: {}", status.presence.as_str());
                match status.recorded {
                    Some(state) => println!(
                        "recorded: installed={} ours={} reason={}",
                        state.installed,
                        state.ours,
                        state.reason.as_deref().unwrap_or("-")
                    ),
                    None => println!("recorded: none"),
                }
            }
        },
    }

    info!(target = "snapcache", "Command completed");
    Ok(())
}
