//! dscex - extract dylibs from Apple's dyld shared cache.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

use dscex::{extract_image, find_images, Activity, DyldContext};

/// Extract standalone dylibs from a dyld shared cache.
#[derive(Parser, Debug)]
#[command(name = "dscex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, global = true, default_value = "1")]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract images from the cache
    Extract {
        /// Path to the dyld shared cache file
        cache: PathBuf,

        /// Image to extract, by path or basename
        #[arg(short, long)]
        image: Option<String>,

        /// Extract every image matching this substring
        #[arg(short, long)]
        filter: Option<String>,

        /// Output path (file for a single image, directory otherwise)
        #[arg(short, long, default_value = "extracted")]
        output: PathBuf,

        /// Number of parallel jobs (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// List images in the cache
    List {
        /// Path to the dyld shared cache file
        cache: PathBuf,

        /// Filter images by substring
        #[arg(short, long)]
        filter: Option<String>,

        /// Show header addresses
        #[arg(short = 'A', long)]
        addresses: bool,
    },

    /// Show cache information
    Info {
        /// Path to the dyld shared cache file
        cache: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    match cli.command {
        Commands::Extract {
            cache,
            image,
            filter,
            output,
            jobs,
        } => cmd_extract(cache, image, filter, output, jobs),
        Commands::List {
            cache,
            filter,
            addresses,
        } => cmd_list(cache, filter, addresses),
        Commands::Info { cache } => cmd_info(cache),
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn cmd_extract(
    cache_path: PathBuf,
    image: Option<String>,
    filter: Option<String>,
    output: PathBuf,
    jobs: Option<usize>,
) -> Result<()> {
    let cache = DyldContext::open(&cache_path)
        .with_context(|| format!("failed to open cache '{}'", cache_path.display()))?;

    let started = Instant::now();

    match (image, filter) {
        (Some(image), None) => {
            let activity = Activity::spinner(&image);
            extract_image(&cache, &image, &output, &activity)
                .with_context(|| format!("failed to extract '{}'", image))?;
            activity.finish();
            println!(
                "Extracted {} to {} in {:.2?}",
                image,
                output.display(),
                started.elapsed()
            );
            Ok(())
        }
        (None, Some(filter)) => {
            let images: Vec<_> = find_images(&cache, &filter)
                .map(|img| img.path.clone())
                .collect();
            if images.is_empty() {
                bail!("no images match '{}'", filter);
            }

            if let Some(jobs) = jobs {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(jobs)
                    .build_global()
                    .context("failed to configure thread pool")?;
            }

            let bar = ProgressBar::new(images.len() as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );

            let failed = AtomicUsize::new(0);
            images.par_iter().for_each(|path| {
                let out = output.join(path.trim_start_matches('/'));
                if let Err(e) = extract_image(&cache, path, &out, &Activity::disabled()) {
                    warn!("skipping {}: {}", path, e);
                    failed.fetch_add(1, Ordering::Relaxed);
                }
                bar.inc(1);
                bar.set_message(path.rsplit('/').next().unwrap_or(path).to_string());
            });
            bar.finish_and_clear();

            let failed = failed.load(Ordering::Relaxed);
            println!(
                "Extracted {}/{} images to {} in {:.2?}",
                images.len() - failed,
                images.len(),
                output.display(),
                started.elapsed()
            );
            Ok(())
        }
        (Some(_), Some(_)) => bail!("--image and --filter are mutually exclusive"),
        (None, None) => bail!("specify --image or --filter"),
    }
}

fn cmd_list(cache_path: PathBuf, filter: Option<String>, addresses: bool) -> Result<()> {
    let cache = DyldContext::open(&cache_path)
        .with_context(|| format!("failed to open cache '{}'", cache_path.display()))?;

    let filter = filter.unwrap_or_default();
    let mut count = 0usize;
    for image in find_images(&cache, &filter) {
        if addresses {
            println!("{:#014x}  {}", image.address, image.path);
        } else {
            println!("{}", image.path);
        }
        count += 1;
    }
    eprintln!("{} images", count);
    Ok(())
}

fn cmd_info(cache_path: PathBuf) -> Result<()> {
    let cache = DyldContext::open(&cache_path)
        .with_context(|| format!("failed to open cache '{}'", cache_path.display()))?;

    println!("{}", cache.header);
    println!("Architecture:  {}", cache.architecture());
    println!("Images:        {}", cache.image_count());
    println!("Subcaches:     {}", cache.subcaches.len());
    println!(
        "Symbols file:  {}",
        match &cache.symbols_file {
            Some(f) => f.path.display().to_string(),
            None => "none".to_string(),
        }
    );
    println!("Total size:    {} MiB", cache.total_size() / (1024 * 1024));

    println!("Mappings:");
    for mapping in &cache.mappings {
        let prot = |p: u32| {
            format!(
                "{}{}{}",
                if p & 1 != 0 { "r" } else { "-" },
                if p & 2 != 0 { "w" } else { "-" },
                if p & 4 != 0 { "x" } else { "-" }
            )
        };
        println!(
            "  {:#014x}..{:#014x}  {}  {:?}  subcache {}",
            mapping.address,
            mapping.address + mapping.size,
            prot(mapping.init_prot),
            mapping.flags,
            mapping.subcache_index
        );
    }

    Ok(())
}
