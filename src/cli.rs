//! Command line interface definitions.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

/// An incremental build engine with dynamic dependencies.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "kumade", version, about)]
pub struct Cli {
    /// Rulefile to load, resolved relative to the working directory.
    #[arg(short = 'f', long = "file", default_value = "Kumadefile")]
    pub file: Utf8PathBuf,

    /// Change to this directory before doing anything.
    #[arg(short = 'C', long = "directory")]
    pub directory: Option<Utf8PathBuf>,

    /// Maximum number of concurrently running actions.
    #[arg(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,

    /// Stop starting new actions after the first failure.
    #[arg(long)]
    pub fail_fast: bool,

    /// Stage action outputs in private scratch directories and verify the
    /// produced file set exactly.
    #[arg(long)]
    pub sandbox: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Subcommand; defaults to `build`.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Bring the requested targets or aliases up to date.
    Build(BuildArgs),
    /// List registered targets and aliases.
    Graph,
}

/// Arguments for the build subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct BuildArgs {
    /// Targets or alias names; defaults to every alias, or every target
    /// when no alias is registered.
    pub targets: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_flags_parse() {
        let cli = Cli::parse_from(["kumade", "-j", "4", "--fail-fast"]);
        assert_eq!(cli.jobs, Some(4));
        assert!(cli.fail_fast);
        assert!(cli.command.is_none());
    }

    #[test]
    fn explicit_targets_are_collected() {
        let cli = Cli::parse_from(["kumade", "build", "a.o", "test"]);
        let Some(Commands::Build(args)) = cli.command else {
            panic!("expected build subcommand");
        };
        assert_eq!(args.targets, ["a.o", "test"]);
    }
}
