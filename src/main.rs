//! Spriter Project Resizer CLI
//!
//! Command-line interface for rescaling Spriter projects.

use anyhow::{bail, Context};
use clap::Parser;
use spriter_resize::{file_ops::resize_project_file, ResizeOptions, RunStatus};
use std::path::PathBuf;

/// Rescale a Spriter project: resample every image and patch the .scml document
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input .scml document
    #[arg(short, long)]
    input: PathBuf,

    /// Output .scml document (must be outside the input directory)
    #[arg(short, long)]
    output: PathBuf,

    /// Uniform scale factor applied to images and pixel-unit attributes
    #[arg(short, long, default_value = "0.5")]
    scale: f64,

    /// Radius of the blur run before each bicubic step
    #[arg(short, long, default_value = "2")]
    blur_radius: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let options = ResizeOptions {
        scale: args.scale,
        blur_radius: args.blur_radius,
    };

    println!("Spriter Project Resizer");
    println!("=======================");

    let report = resize_project_file(&args.input, &args.output, &options, |event| {
        println!("{}", event);
    })
    .with_context(|| format!("Failed to resize {:?}", args.input))?;

    println!(
        "\nDone in {:.2?}! {} images referenced: {} resized, {} failed ({:?})",
        report.elapsed,
        report.files_seen,
        report.files_resized,
        report.failures.len(),
        report.status()
    );
    for failure in &report.failures {
        println!("  {}: {}", failure.file, failure.message);
    }
    println!("Output saved to: {:?}", args.output);

    if report.status() == RunStatus::Failure {
        bail!("No image in {:?} could be resized", args.input);
    }

    Ok(())
}
