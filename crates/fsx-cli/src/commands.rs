use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "fsx")]
#[command(about = "Content-addressed file tree indexing and deduplication", long_about = None)]
pub struct Cli {
    /// Index file path (defaults to the configured index_path)
    #[arg(short = 'f', long, global = true)]
    pub index: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a new file system index
    Create {
        /// Directory tree to index
        root: PathBuf,
    },
    /// Update an existing index, rehashing only changed files
    Update {
        /// Override the recorded root directory
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Write the index to stdout in its textual form
    Cat,
    /// Find directories whose contents are fully preserved elsewhere
    Dups {
        /// Restrict the search to this subdirectory
        #[arg(long, default_value = ".")]
        dir: String,
        /// Report at most this many directories
        #[arg(long)]
        max_dups: Option<usize>,
        /// Unique files that may be lost per directory
        #[arg(long)]
        max_lost: Option<usize>,
    },
    /// Protect files and directories from deduplication
    Keep {
        /// Files or directories to mark
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Mark files or directories as removable duplicates
    Dup {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Mark files or directories as junk (all copies removable)
    Junk {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Calculate BLAKE3 digests for one or more files
    Hash {
        /// Report whether all file contents are identical
        #[arg(long)]
        cmp: bool,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}
