use std::path::PathBuf;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    /// Log debug output (same as VENVPOOL_LOG=debug)
    #[clap(short, long, global = true)]
    pub(crate) verbose: bool,
    /// Pool directory. Overrides the config file and VENVPOOL_ROOT
    #[clap(long, global = true)]
    pub(crate) root: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: VenvpoolCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum VenvpoolCommand {
    /// Run a program from a pooled environment that satisfies the requirements
    Run {
        /// Python version of the environment, e.g. `3` or `3.11`
        #[clap(long, default_value = "3")]
        python: String,
        /// Requirements file to satisfy
        #[clap(short, long)]
        requirements: Option<PathBuf>,
        /// Additional requirement, may be repeated
        #[clap(long = "with")]
        with: Vec<String>,
        /// Use a private environment that is deleted afterwards
        #[clap(long, conflicts_with = "write")]
        transient: bool,
        /// Lock the environment exclusively so the program may modify it
        #[clap(long)]
        write: bool,
        /// Program inside the environment's bin directory
        program: String,
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a script as a module with the requirements of its project (the nearest
    /// `requirements.txt` above it)
    Launch {
        /// Python version of the environment
        #[clap(long, default_value = "3")]
        python: String,
        script: PathBuf,
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Hard-link identical files across all idle environments
    Compact,
    /// List environments and their lock state
    List {
        /// Print JSON instead of text
        #[clap(long)]
        json: bool,
    },
}
