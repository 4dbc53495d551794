mod backend;
mod cli;
mod commands;
mod paths;
mod progress;
mod runner;
mod settings;
mod ui;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use settings::Settings;
use std::io;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub settings: Settings,
}

/// Exit code for an error that aborted a command
fn exit_code(error: &anyhow::Error) -> i32 {
    if let Some(e) = error.downcast_ref::<converge::Error>() {
        e.code()
    } else if let Some(e) = error.downcast_ref::<certkit::Error>() {
        e.code()
    } else if error.downcast_ref::<catalog::Error>().is_some() {
        2
    } else {
        1
    }
}

fn to_exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "phoenix", &mut io::stdout());
        return ExitCode::SUCCESS;
    }

    let settings_path = paths::settings_file(cli.config.as_deref());
    let settings = match Settings::load(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            ui::error(&format!("{e:#}"));
            return to_exit_code(2);
        }
    };

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        settings,
    };

    let result = match &cli.command {
        Command::Create { ids, yes, jobs } => commands::create::run(&ctx, ids, *yes, *jobs),
        Command::Plan { ids } => commands::plan::run(&ctx, ids),
        Command::Status { ids } => commands::status::run(&ctx, ids),
        Command::Validate => commands::validate::run(&ctx),
        Command::RenewCerts { dry_run } => commands::renew::run(&ctx, *dry_run),
        Command::Completions { .. } => Ok(0),
    };

    match result {
        Ok(code) => to_exit_code(code),
        Err(e) => {
            let code = exit_code(&e);
            ui::error(&format!("{e:#}"));
            to_exit_code(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        let cycle = anyhow::Error::from(converge::Error::Dependency {
            cycle: vec![101, 102, 101],
        });
        assert_eq!(exit_code(&cycle), 3);

        let held = anyhow::Error::from(certkit::Error::RunLockHeld {
            path: "/var/lib/phoenix/renew-certs.lock".into(),
        });
        assert_eq!(exit_code(&held), 22);

        let config = anyhow::Error::from(catalog::Error::Document {
            document: "resource",
            reason: "expected an array".to_string(),
        })
        .context("Could not load phoenix_lxc_configs.json");
        assert_eq!(exit_code(&config), 2);

        assert_eq!(exit_code(&anyhow::anyhow!("pct not found")), 1);
    }
}
