use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "tad-agent", about = "Serve traffic application domain commands over TCP")]
pub struct Config {
    /// Address to accept command connections on.
    #[structopt(long, default_value = "127.0.0.1:5005")]
    pub listen: SocketAddr,

    /// JSON file with the engine configuration.
    #[structopt(long, parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// Log filter, used when `RUST_LOG` is not set.
    #[structopt(long, default_value = "info")]
    pub log: String,

    /// First CSAP id handed out, overrides the configuration file.
    #[structopt(long)]
    pub csap_id_offset: Option<u32>,
}

impl Config {
    pub fn from_args() -> Self {
        StructOpt::from_args()
    }

    /// The engine configuration: the file if one was given, then the command line overrides.
    pub fn tad_config(&self) -> tad::Result<tad::Config> {
        let mut config = match &self.config {
            Some(path) => tad::Config::from_json(&fs::read_to_string(path)?)?,
            None => tad::Config::default(),
        };

        if let Some(offset) = self.csap_id_offset {
            config.csap_id_offset = offset;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::from_iter_safe(std::iter::once("tad-agent").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.listen, "127.0.0.1:5005".parse().unwrap());
        assert_eq!(config.log, "info");
        assert_eq!(config.tad_config().unwrap(), tad::Config::default());
    }

    #[test]
    fn offset_override() {
        let config = parse(&["--csap-id-offset", "40", "--listen", "0.0.0.0:7000"]);
        assert_eq!(config.tad_config().unwrap().csap_id_offset, 40);
        assert_eq!(config.listen.port(), 7000);
    }

    #[test]
    fn missing_file() {
        let config = parse(&["--config", "/nonexistent/tad.json"]);
        assert!(config.tad_config().is_err());
    }
}
