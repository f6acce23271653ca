use clap::Parser;

use galera::Cli;

fn main() {
    let cli = Cli::parse();

    let config = match galera::load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e:?}");
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::new(if config.debug { "debug" } else { "info" });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = galera::run_node(config) {
        tracing::error!(target: "galera", error = ?e, "node exited with a fatal error");
        std::process::abort();
    }
}
