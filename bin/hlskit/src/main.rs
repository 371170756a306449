use clap::{Parser, Subcommand};

mod probe;
mod serve;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct HlskitArgs {
    #[clap(subcommand)]
    command: HlskitCommand,
}

#[derive(Subcommand, Debug)]
enum HlskitCommand {
    /// Print the tracks of a stream and the timestamps of its samples
    Probe(probe::ProbeCommand),
    /// Relay a stream through the muxer and serve it over HTTP
    Serve(serve::ServeCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .try_from_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = HlskitArgs::parse();
    match args.command {
        HlskitCommand::Probe(command) => command.run().await,
        HlskitCommand::Serve(command) => command.run().await,
    }
}
