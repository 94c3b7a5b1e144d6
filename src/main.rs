use clap::{Parser, Subcommand};
use cumulus::builder;
use cumulus::config::{BuildConfig, ThreadSpec};
use cumulus::endpoints::{Arbiter, Endpoints};
use cumulus::info;
use cumulus::metadata::Subset;
use cumulus::pipeline;
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cumulus",
    about = "Index unordered point clouds into a streamable chunked octree"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build (or continue building) a dataset from input point clouds
    Build {
        /// JSON configuration file; command line flags override its values
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Input files or directories
        #[arg(long, short)]
        input: Vec<String>,
        /// Output dataset directory
        #[arg(long, short)]
        output: Option<String>,
        /// Scratch directory for localized sources
        #[arg(long)]
        tmp: Option<String>,
        /// Total thread count, split between work and clip pools
        #[arg(long, short)]
        threads: Option<usize>,
        /// Stop after this many files (0 = no limit)
        #[arg(long)]
        limit: Option<u64>,
        /// Seconds between progress reports (0 = quiet)
        #[arg(long)]
        progress_interval: Option<u64>,
        /// Build one subset tile: -s ID OF
        #[arg(long, short, num_args = 2, value_names = ["ID", "OF"])]
        subset: Option<Vec<u32>>,
        /// Start over, ignoring any existing build at the output
        #[arg(long)]
        force: bool,
        /// Gather full per-dimension statistics during analysis
        #[arg(long)]
        deep: bool,
        /// Per-chunk grid resolution (power of two)
        #[arg(long)]
        span: Option<u64>,
        /// Chunk codec: binary or gzip
        #[arg(long)]
        data_type: Option<String>,
        /// Quantization scale applied to X/Y/Z
        #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"])]
        scale: Option<Vec<f64>>,
        /// Quantization offset applied to X/Y/Z
        #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], allow_hyphen_values = true)]
        offset: Option<Vec<f64>>,
    },
    /// Stitch completed subset builds into one canonical dataset
    Merge {
        /// Dataset directory holding ept-1.json .. ept-N.json
        #[arg(long, short)]
        output: String,
        #[arg(long, short)]
        threads: Option<usize>,
        /// Overwrite an already-merged dataset
        #[arg(long)]
        force: bool,
    },
    /// Analyze inputs and print what a build would see
    Info {
        /// Input files or directories
        #[arg(long, short)]
        input: Vec<String>,
        /// Gather full per-dimension statistics
        #[arg(long)]
        deep: bool,
        #[arg(long, short)]
        threads: Option<usize>,
    },
}

fn build_config(
    config: Option<PathBuf>,
    input: Vec<String>,
    output: Option<String>,
    tmp: Option<String>,
    threads: Option<usize>,
    limit: Option<u64>,
    progress_interval: Option<u64>,
    subset: Option<Vec<u32>>,
    force: bool,
    deep: bool,
    span: Option<u64>,
    data_type: Option<String>,
    scale: Option<Vec<f64>>,
    offset: Option<Vec<f64>>,
) -> io::Result<BuildConfig> {
    let mut cfg = match config {
        Some(path) => BuildConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => BuildConfig::default(),
    };

    if !input.is_empty() {
        cfg.input = input;
    }
    if let Some(output) = output {
        cfg.output = output;
    }
    if tmp.is_some() {
        cfg.tmp = tmp;
    }
    if let Some(total) = threads {
        cfg.threads = Some(ThreadSpec::Total(total));
    }
    if let Some(limit) = limit {
        cfg.limit = limit;
    }
    if let Some(interval) = progress_interval {
        cfg.progress_interval = interval;
    }
    if let Some(subset) = subset {
        cfg.subset = Some(Subset {
            id: subset[0],
            of: subset[1],
        });
    }
    if force {
        cfg.force = true;
    }
    if deep {
        cfg.deep = true;
    }
    if let Some(span) = span {
        cfg.span = span;
    }
    if let Some(data_type) = data_type {
        cfg.data_type = data_type
            .parse()
            .map_err(|e: String| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    }
    if let Some(scale) = scale {
        cfg.scale = Some([scale[0], scale[1], scale[2]]);
    }
    if let Some(offset) = offset {
        cfg.offset = Some([offset[0], offset[1], offset[2]]);
    }

    cfg.validate()?;
    Ok(cfg)
}

fn run() -> io::Result<()> {
    match Cli::parse().command {
        Command::Build {
            config,
            input,
            output,
            tmp,
            threads,
            limit,
            progress_interval,
            subset,
            force,
            deep,
            span,
            data_type,
            scale,
            offset,
        } => {
            let cfg = build_config(
                config,
                input,
                output,
                tmp,
                threads,
                limit,
                progress_interval,
                subset,
                force,
                deep,
                span,
                data_type,
                scale,
                offset,
            )?;
            let inserted = builder::run_from_config(&cfg)?;
            println!("inserted {} points", builder::commify(inserted));
            Ok(())
        }
        Command::Merge {
            output,
            threads,
            force,
        } => {
            let arbiter = Arbiter;
            let endpoints = Endpoints::new(arbiter.resolve(&output)?, None);
            let threads = threads
                .map(cumulus::metadata::Threads::from_total)
                .unwrap_or_else(|| BuildConfig::default().threads());
            builder::merge(endpoints, threads, force)
        }
        Command::Info {
            input,
            deep,
            threads,
        } => {
            let arbiter = Arbiter;
            let mut inputs = Vec::new();
            for pattern in &input {
                inputs.extend(arbiter.expand(pattern)?);
            }
            let threads = threads.unwrap_or(4);
            let sources = info::analyze(
                &inputs,
                &pipeline::default_template(),
                deep,
                &std::env::temp_dir(),
                &arbiter,
                threads,
            );

            let mut total = 0u64;
            for source in &sources {
                let info = &source.info;
                if info.errors.is_empty() {
                    println!("{}: {} points", source.path, builder::commify(info.points));
                } else {
                    println!("{}: {}", source.path, info.errors.join("; "));
                }
                total += info.points;
            }
            println!("total: {} points", builder::commify(total));
            Ok(())
        }
    }
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
