//! `binschema-cli`: a thin collaborator around the `binschema` generator
//! core — schema loading, directory walking, and output writing live here,
//! not in the core library.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argh::FromArgs;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use binschema::Schema;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(FromArgs, PartialEq, Debug)]
/// Generates Rust encoder/decoder source from binschema YAML schemas.
struct Cli {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum Command {
    GenerateFile(GenerateFile),
    GenerateDir(GenerateDir),
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "generate-file")]
/// Generates Rust source for a single schema YAML file.
struct GenerateFile {
    /// path to the schema YAML file
    #[argh(positional)]
    schema_path: PathBuf,

    /// write generated source here instead of stdout
    #[argh(option, short = 'o')]
    out: Option<PathBuf>,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "generate-dir")]
/// Generates Rust source for every `*.yaml`/`*.yml` schema under a directory.
struct GenerateDir {
    /// directory to walk for schema files
    #[argh(positional)]
    dir_path: PathBuf,

    /// output directory (mirrors input directory structure); defaults to
    /// writing each `foo.yaml` to `foo.rs` alongside it
    #[argh(option, short = 'o')]
    out_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli: Cli = argh::from_env();
    match cli.command {
        Command::GenerateFile(cmd) => generate_file(&cmd.schema_path, cmd.out.as_deref()),
        Command::GenerateDir(cmd) => generate_dir(&cmd.dir_path, cmd.out_dir.as_deref()),
    }
}

fn generate_file(schema_path: &Path, out: Option<&Path>) -> Result<()> {
    let source = generate_one(schema_path)?;
    match out {
        Some(out_path) => {
            fs::write(out_path, source)
                .with_context(|| format!("writing generated source to {}", out_path.display()))?;
        }
        None => println!("{source}"),
    }
    Ok(())
}

fn generate_one(schema_path: &Path) -> Result<String> {
    let schema = Schema::load_from_file(schema_path)
        .with_context(|| format!("loading schema {}", schema_path.display()))?;
    binschema::generate(&schema)
        .map_err(|errs| anyhow::anyhow!("{errs}"))
        .with_context(|| format!("planning/emitting schema {}", schema_path.display()))
}

fn generate_dir(dir_path: &Path, out_dir: Option<&Path>) -> Result<()> {
    let schema_files: Vec<PathBuf> = walkdir::WalkDir::new(dir_path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| matches!(e.path().extension().and_then(|s| s.to_str()), Some("yaml" | "yml")))
        .map(|e| e.into_path())
        .collect();

    let bar = ProgressBar::new(schema_files.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let results: Vec<Result<(PathBuf, String)>> = schema_files
        .par_iter()
        .map(|path| {
            let result = generate_one(path).map(|src| (path.clone(), src));
            bar.inc(1);
            result
        })
        .collect();
    bar.finish_and_clear();

    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok((path, source)) => {
                let dest = match out_dir {
                    Some(dir) => {
                        let rel = path.strip_prefix(dir_path).unwrap_or(&path);
                        let mut d = dir.join(rel);
                        d.set_extension("rs");
                        d
                    }
                    None => path.with_extension("rs"),
                };
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                fs::write(&dest, source)
                    .with_context(|| format!("writing {}", dest.display()))?;
                log::debug!("generated {}", dest.display());
            }
            Err(e) => failures.push(e),
        }
    }

    if !failures.is_empty() {
        for failure in &failures {
            eprintln!("error: {failure:?}");
        }
        anyhow::bail!("{} of {} schema(s) failed to generate", failures.len(), schema_files.len());
    }
    Ok(())
}
