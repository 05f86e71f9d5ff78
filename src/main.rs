use tracing::{debug, trace};

use minijob::cli::{self, Commands};
use minijob::commands;

#[tokio::main]
async fn main() {
    let cli = cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .init();

    debug!("minijob started with verbosity level: {}", cli.verbose);
    trace!("full argv: {:?}", std::env::args().collect::<Vec<_>>());

    let verbose = cli.verbose;
    let result = match cli.command {
        Commands::Run(args) => commands::run(args, verbose).await,
        Commands::Submit(args) => commands::submit(args, verbose).await,
        Commands::Bulksubmit(args) => commands::bulksubmit(args, verbose).await,
        Commands::Batch(args) => commands::batch(args, verbose).await,
        Commands::Alloc(args) => commands::alloc(args, verbose).await,
        Commands::Jobs(args) => commands::jobs(args, verbose).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            debug!("fatal: {e:#}");
            eprintln!("minijob: {e:#}");
            std::process::exit(1);
        }
    }
}
