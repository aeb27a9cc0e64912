//! The traffic application domain test agent.
//!
//! Listens for command connections and runs the requested traffic operations. Call example:
//!
//! * `tad-agent --listen 0.0.0.0:5005 --config tad.json --log tad=debug`
use std::process;

use tracing::error;
use tracing_subscriber::EnvFilter;

use tad::Tad;
use tad_agent::{Config, Server};

fn main() {
    let config = Config::from_args();
    setup_logging(&config.log);

    if let Err(err) = run(&config) {
        error!(error = %err, "agent failed");
        eprintln!("tad-agent: {}", err);
        process::exit(1);
    }
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let tad = Tad::new(config.tad_config()?);
    let server = Server::bind(tad.clone(), config.listen)?;
    let result = server.run();
    tad.shutdown();
    Ok(result?)
}
