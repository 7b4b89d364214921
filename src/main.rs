use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;

use meshslim::ply::{read_mesh, write_mesh, MeshAttributes};
use meshslim::quadric::QuadricKind;
use meshslim::simplifier::{simplify, SimplifyOptions, Weighting};
use meshslim::smooth::taubin_smooth;

const SMOOTH_PASSES: u32 = 10;

/// Parallel quadric-error-metric triangle mesh simplifier.
#[derive(Debug, Parser)]
#[command(name = "meshslim", version)]
struct Args {
    /// Input PLY file (binary little-endian)
    #[arg(long = "in", value_name = "PATH")]
    input: PathBuf,

    /// Output PLY file (ascii)
    #[arg(long = "out", value_name = "PATH")]
    output: PathBuf,

    /// Overwrite the output file if it exists
    #[arg(short, long)]
    force: bool,

    /// Run a Taubin smoothing pass before simplifying
    #[arg(short, long)]
    smooth: bool,

    /// Quadric weighting: 0 = none, 1 = by face area
    #[arg(short, long, default_value_t = 0)]
    weight: u32,

    /// Stop once the remaining vertex percentage drops below this
    /// (0 disables the target)
    #[arg(short, long, default_value_t = 0)]
    reduction: u32,

    /// Maximum number of outer iterations
    #[arg(short = 'i', long = "max-iter", default_value_t = 10)]
    max_iter: u32,

    /// Worker threads
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Quadric flavour: 3 = position, 6 = +colour, 9 = +normal
    #[arg(short, long, default_value_t = 3)]
    quadric: u32,

    /// Partition factor; the spatial grid is this many cells per axis
    #[arg(short, long, default_value_t = 2)]
    clusters: u32,

    /// Vertex layout: 1 = position/colour/normal, 2 = position only
    #[arg(short = 'm', long, default_value_t = 2)]
    attributes: u32,

    /// Error-threshold growth exponent, 1.0 to 10.0
    #[arg(short, long, default_value_t = 7.0)]
    aggressiveness: f64,

    /// Per-worker progress output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn options(&self) -> Result<SimplifyOptions> {
        let quadric = match QuadricKind::from_dim(self.quadric) {
            Some(kind) => kind,
            None => bail!("--quadric must be 3, 6 or 9, got {}", self.quadric),
        };
        let weighting = match Weighting::from_flag(self.weight) {
            Some(weighting) => weighting,
            None => bail!("--weight must be 0 or 1, got {}", self.weight),
        };
        if !(1.0..=10.0).contains(&self.aggressiveness) {
            bail!(
                "--aggressiveness must lie in [1.0, 10.0], got {}",
                self.aggressiveness
            );
        }
        if self.threads < 1 {
            bail!("--threads must be at least 1");
        }
        if self.clusters < 1 {
            bail!("--clusters must be at least 1");
        }
        if self.max_iter < 1 {
            bail!("--max-iter must be at least 1");
        }

        Ok(SimplifyOptions {
            threads: self.threads,
            clusters: self.clusters,
            max_iter: self.max_iter,
            reduction: self.reduction,
            aggressiveness: self.aggressiveness,
            weighting,
            quadric,
            verbose: self.verbose,
        })
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    let options = args.options()?;
    let attributes = match MeshAttributes::from_flag(args.attributes) {
        Some(attributes) => attributes,
        None => bail!("--attributes must be 1 or 2, got {}", args.attributes),
    };

    if !args.input.is_file() {
        bail!("input file {} does not exist", args.input.display());
    }
    if args.output.exists() && !args.force {
        bail!(
            "output file {} already exists, pass --force to overwrite",
            args.output.display()
        );
    }
    if let Some(parent) = args.output.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating output directory {}", parent.display()))?;
        }
    }

    let mut mesh = read_mesh(&args.input, attributes)?;

    if args.smooth {
        taubin_smooth(&mut mesh, SMOOTH_PASSES);
    }

    simplify(&mut mesh, &options)?;

    write_mesh(&args.output, &mesh, attributes)
}
