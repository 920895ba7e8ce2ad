mod commands;
mod terminal;

use commands::{CommandLine, Commands, cancel, merge, submit, work};
use terminal::{logging, print};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let commands = CommandLine::parse_args();

    logging::init(&commands.log);

    match commands.command {
        Commands::Work(args) => {
            print::header("starting worker");
            work::work(&commands.redis_url, args).await
        }
        Commands::Cancel(args) => cancel::cancel(&commands.redis_url, args).await,
        Commands::Submit(args) => submit::submit(&commands.redis_url, args).await,
        Commands::Merge(args) => merge::merge(args),
    }
}
