use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Local dev-environment orchestrator")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Answer yes to every confirmation
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Sub‑commands (start if omitted)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    /// Launch and supervise every service until Ctrl+C or a service exits
    Start,
    /// Terminate every managed process (Exit 1 = some survived)
    Stop,
    /// Health of services, dependency and workspace
    Status,
    /// Remove build artifacts of every service
    Clean,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_the_default_command() {
        let args = Args::try_parse_from(["devstack"]).unwrap();
        assert_eq!(args.sub.unwrap_or(Cmd::Start), Cmd::Start);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let args = Args::try_parse_from(["devstack", "stop", "--yes", "--config", "dev.toml"]).unwrap();
        assert_eq!(args.sub, Some(Cmd::Stop));
        assert!(args.yes);
        assert_eq!(args.config, Some(PathBuf::from("dev.toml")));
    }

    #[test]
    fn init_takes_force() {
        let args = Args::try_parse_from(["devstack", "init", "--force"]).unwrap();
        assert_eq!(args.sub, Some(Cmd::Init { force: true }));
    }
}
