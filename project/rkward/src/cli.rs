use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rkward",
    version,
    about = "Replicated coordinator that supervises containerized workers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start this coordinator replica
    Start {
        /// Worker manifest path, overriding COMPOSE_PATH
        #[arg(long)]
        compose: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_accepts_a_compose_override() {
        let cli = Cli::try_parse_from(["rkward", "start", "--compose", "/tmp/w.yml"])
            .expect("parse");
        let Commands::Start { compose } = cli.command;
        assert_eq!(compose, Some(PathBuf::from("/tmp/w.yml")));
    }

    #[test]
    fn a_subcommand_is_required() {
        assert!(Cli::try_parse_from(["rkward"]).is_err());
    }
}
