use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};
use vicare_heating_tools::commands;

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Features(commands::features::Args),
    Read(commands::read::Args),
    Homie(commands::homie::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description =
        std::env::var("VICARE_HEATING_TOOLS_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: could not parse `VICARE_HEATING_TOOLS_LOG`: {e}");
            std::process::exit(2);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Features(args) => end(commands::features::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Homie(args) => end(commands::homie::run(args)),
    }
}
