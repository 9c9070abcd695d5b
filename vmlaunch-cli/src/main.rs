mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, RunArgs};
use vmlaunch::util::init_logging;
use vmlaunch_shared::constants::home;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logs_dir = cli.global.home_dir().join(home::LOGS_DIR);
    let log_guard = init_logging(Some(logs_dir.as_path()), cli.global.log_filter());

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // process::exit skips destructors and does not join an interrupted
    // extraction thread; flush the log writer by hand
    drop(log_guard);
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let global = cli.global;
    match cli.command {
        None => {
            let args = RunArgs {
                launch: cli.run,
                boot_args: Vec::new(),
            };
            commands::run::execute(args, &global).await
        }
        Some(Commands::Run(args)) => commands::run::execute(args, &global).await,
        Some(Commands::Prepare(args)) => commands::prepare::execute(args, &global).map(|_| 0),
        Some(Commands::Check(args)) => commands::check::execute(args, &global).map(|_| 0),
        Some(Commands::Stop) => commands::stop::execute(&global).await.map(|_| 0),
        Some(Commands::Status) => commands::status::execute(&global).map(|_| 0),
    }
}
