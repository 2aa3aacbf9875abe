use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use courier::app::App;
use courier::config::Config;

#[derive(Debug, Parser)]
#[command(name = "courier", about = "A multi-protocol real-time messaging server")]
struct Opts {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Load and print the resolved configuration, then exit.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => match Config::from_path(path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("configuration error: {error}");
                std::process::exit(exitcode::CONFIG);
            }
        },
        None => Config::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if opts.validate {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("{rendered}");
                std::process::exit(exitcode::OK);
            }
            Err(error) => {
                eprintln!("configuration error: {error}");
                std::process::exit(exitcode::CONFIG);
            }
        }
    }

    let app = match App::build(config).await {
        Ok(app) => app,
        Err(error) => {
            tracing::error!(%error, "Failed to build the server.");
            std::process::exit(exitcode::UNAVAILABLE);
        }
    };

    if let Err(error) = app.run().await {
        tracing::error!(%error, "Server exited with an error.");
        std::process::exit(exitcode::SOFTWARE);
    }
}
