use clap::Command;

pub(super) const RUN: &str = "run";
pub(super) const VALIDATE: &str = "validate";

pub(super) fn root_cli() -> Command {
    Command::new("harvest")
        .about("Incrementally ships audit-log events to a downstream sink")
        .long_about(
            "Incrementally ships audit-log events to a downstream sink.\n\n\
             All settings are read from HARVEST_* environment variables.",
        )
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_run_subcommand())
        .subcommand(add_validate_subcommand())
}

fn add_run_subcommand() -> Command {
    Command::new(RUN).about("Poll the audit-log API until SIGINT or SIGTERM")
}

fn add_validate_subcommand() -> Command {
    Command::new(VALIDATE).about("Check the configuration and exit")
}
