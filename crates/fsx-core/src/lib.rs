pub mod config;
pub mod dedup;
pub mod error;
pub mod flag;
pub mod hasher;
pub mod index;
pub mod path;
pub mod progress;
pub mod scanner;
pub mod tree;

pub use config::AppConfig;
pub use dedup::Dup;
pub use error::Error;
pub use flag::Flag;
pub use hasher::{Digest, Hasher};
pub use index::{File, Files, Index};
pub use path::Path;
pub use progress::Progress;
pub use scanner::source::{FileSource, LocalSource};
pub use scanner::{scan, ScanOptions};
pub use tree::{Dir, Tree};
