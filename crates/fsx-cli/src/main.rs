mod commands;
mod logging;
mod progress;

use std::io::Write;
use std::path::{Path as StdPath, PathBuf};
use std::process;

use clap::Parser;
use colored::Colorize;
use dotenv::dotenv;
use rayon::prelude::*;
use tracing::{error, info};

use commands::{Cli, Commands};
use fsx_core::{scan, Digest, Error, Hasher, Index, LocalSource, ScanOptions};
use progress::ScanReporter;

fn main() {
    dotenv().ok();
    let _guard = logging::init_logger();

    let config = match fsx_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("error loading configuration: {err}");
            process::exit(2);
        }
    };

    let args = Cli::parse();
    let index = args
        .index
        .unwrap_or_else(|| PathBuf::from(&config.index_path));

    let code = match run(args.command, &index, &config) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            1
        }
    };
    process::exit(code);
}

fn run(
    cmd: Commands,
    index: &StdPath,
    config: &fsx_core::AppConfig,
) -> Result<i32, Error> {
    match cmd {
        Commands::Create { root } => create(index, &root),
        Commands::Update { root } => update(index, root),
        Commands::Cat => {
            let idx = Index::load(index)?;
            let stdout = std::io::stdout().lock();
            idx.write_text(stdout)?;
            Ok(0)
        }
        Commands::Dups {
            dir,
            max_dups,
            max_lost,
        } => dups(
            index,
            &dir,
            max_dups.or(config.max_dups),
            max_lost.unwrap_or(config.max_lost),
        ),
        Commands::Keep { paths } => mark(index, &paths, Mark::Keep),
        Commands::Dup { paths } => mark(index, &paths, Mark::Dup),
        Commands::Junk { paths } => mark(index, &paths, Mark::Junk),
        Commands::Hash { cmp, files } => hash(&files, cmp),
    }
}

/// Runs a scan or rescan with error counting and spinner progress, returning
/// the index and whether any per-file errors were reported.
fn run_scan(
    source: &LocalSource,
    tree: Option<fsx_core::Tree>,
    msg: &str,
) -> Result<(Index, bool), Error> {
    let mut had_errors = false;
    let mut err_fn = |e: Error| {
        had_errors = true;
        error!("{e}");
    };
    let reporter = ScanReporter::new(msg);
    let mut prog_fn = |p: &fsx_core::Progress| reporter.update(p);
    let opts = ScanOptions {
        err_fn: Some(&mut err_fn),
        progress_fn: Some(&mut prog_fn),
        cancel: None,
    };
    let idx = match tree {
        Some(t) => t.rescan(source, opts)?,
        None => scan(source, opts)?,
    };
    Ok((idx, had_errors))
}

fn create(index: &StdPath, root: &StdPath) -> Result<i32, Error> {
    let source = LocalSource::new(root);
    let (idx, had_errors) = run_scan(&source, None, "Indexing files...")?;
    idx.overwrite(index)?;
    info!("index written to {}", index.display());
    Ok(had_errors as i32)
}

fn update(index: &StdPath, root: Option<PathBuf>) -> Result<i32, Error> {
    let idx = Index::load(index)?;
    let root = root.unwrap_or_else(|| PathBuf::from(idx.root()));
    std::fs::metadata(&root)?;
    let source = LocalSource::new(&root);
    let (idx, had_errors) = run_scan(&source, Some(idx.to_tree()), "Updating index...")?;
    idx.save(index)?;
    info!("index updated at {}", index.display());
    Ok(had_errors as i32)
}

fn dups(
    index: &StdPath,
    dir: &str,
    max_dups: Option<usize>,
    max_lost: usize,
) -> Result<i32, Error> {
    let idx = Index::load(index)?;
    let tree = idx.to_tree();
    let dups = tree.dups(dir, max_dups, max_lost);
    if dups.is_empty() {
        println!("no duplicate directories found under {dir}");
        return Ok(0);
    }
    let mut out = std::io::stdout().lock();
    for dup in &dups {
        writeln!(out, "{}", dup.path().to_string().bold())?;
        for alt in dup.alts() {
            writeln!(out, "\t= {alt}")?;
        }
        for f in dup.lost() {
            writeln!(out, "\t{} {}", "lost".red(), f.path())?;
        }
        for f in dup.ignored() {
            writeln!(out, "\t{} {}", "ignored".dimmed(), f.path())?;
        }
    }
    info!("{} duplicate directories found", dups.len());
    Ok(0)
}

enum Mark {
    Dup,
    Junk,
    Keep,
}

fn mark(index: &StdPath, paths: &[String], mark: Mark) -> Result<i32, Error> {
    let idx = Index::load(index)?;
    let tree = idx.to_tree();
    for name in paths {
        match mark {
            Mark::Dup => tree.mark_dup(name)?,
            Mark::Junk => tree.mark_junk(name)?,
            Mark::Keep => tree.mark_keep(name)?,
        }
    }
    // Marks were applied to file records shared with the loaded index
    idx.save(index)?;
    Ok(0)
}

fn hash(files: &[PathBuf], cmp: bool) -> Result<i32, Error> {
    let results: Vec<Result<Digest, Error>> =
        files.par_iter().map(|name| hash_one(name)).collect();

    let mut code = 0;
    let mut first: Option<Digest> = None;
    let mut diff = false;
    for (name, result) in files.iter().zip(&results) {
        match result {
            Ok(digest) => {
                println!("{digest}  {}", name.display());
                match first {
                    None => first = Some(*digest),
                    Some(d) if d != *digest => diff = true,
                    Some(_) => {}
                }
            }
            Err(err) => {
                error!("{err}");
                code = 1;
            }
        }
    }
    if cmp && code == 0 {
        if diff {
            eprintln!("Files are different");
            code = 1;
        } else {
            eprintln!("Files are identical");
        }
    }
    Ok(code)
}

fn hash_one(name: &StdPath) -> Result<Digest, Error> {
    let dir = match name.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => StdPath::new("."),
    };
    let base = name
        .file_name()
        .ok_or_else(|| Error::InvalidPath(name.display().to_string()))?
        .to_string_lossy();
    let source = LocalSource::new(dir);
    let mut hasher = Hasher::new(None);
    Ok(hasher.read(&source, &base, false)?.digest())
}
