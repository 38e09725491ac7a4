mod cmd;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::format::FmtSpan;

use cmd::config::{ConsumeArgs, ConsumeSettings, GetArgs, GetSettings, PublishArgs, PublishSettings};

#[derive(Parser)]
#[command(name = "rmq2pg", about = "Batch RabbitMQ messages into a Postgres table")]
struct Cli {
    /// Log the time spent decoding and committing (span close events)
    #[arg(long, global = true)]
    profile: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the queue and insert records batch by batch
    Consume(ConsumeArgs),
    /// Publish numbered test messages to the queue
    Publish(PublishArgs),
    /// Take messages off the queue and print them
    Get(GetArgs),
}

/// Default filter when `RUST_LOG` is unset.
fn default_filter(profile: bool) -> &'static str {
    if profile { "info,pipeline=debug" } else { "info" }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let span_events = if cli.profile { FmtSpan::CLOSE } else { FmtSpan::NONE };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(cli.profile).into()),
        )
        .with_span_events(span_events)
        .init();

    let result = match cli.command {
        Command::Consume(args) => match ConsumeSettings::new(&args) {
            Ok(settings) => cmd::consume::run(&settings).await.map(|summary| {
                println!("Processed {} messages", summary.reads);
            }),
            Err(e) => Err(e),
        },
        Command::Publish(args) => match PublishSettings::new(&args) {
            Ok(settings) => cmd::publish::run(&settings).await,
            Err(e) => Err(e),
        },
        Command::Get(args) => match GetSettings::new(&args) {
            Ok(settings) => cmd::get::run(&settings).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_is_global_and_raises_pipeline_logs() {
        let cli = Cli::try_parse_from(["rmq2pg", "get", "3", "--profile"]).unwrap();
        assert!(cli.profile);
        assert!(matches!(cli.command, Command::Get(ref args) if args.count == 3));

        let cli = Cli::try_parse_from(["rmq2pg", "consume"]).unwrap();
        assert!(!cli.profile);

        assert_eq!(default_filter(false), "info");
        assert!(default_filter(true).contains("pipeline=debug"));
    }
}
