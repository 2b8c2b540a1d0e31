use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{error, info};
use simplelog::{Config, LevelFilter, WriteLogger};

use pagesplit::panic_handler::initialize_panic_handler;
use pagesplit::pdf::determine_optimal_cut_positions;
use pagesplit::settings::{self, Settings};

/// Split-render exam PDF pages and propose question boundaries.
#[derive(Parser, Debug)]
#[command(name = "pagesplit")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Write the log here
    #[arg(long, default_value = "pagesplit.log")]
    log_file: PathBuf,

    /// Use debug logging level regardless of the configured one
    #[arg(short = 'd', long)]
    debug: bool,

    /// Read settings from this file instead of the user config directory
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print suggested cut positions for a rendered page image as JSON
    Snap {
        image: PathBuf,
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        #[arg(long, default_value_t = 1.0)]
        end: f64,
        /// The image is the full page; only scan rows between start and end
        #[arg(long)]
        main: bool,
    },

    /// Render a section of a PDF page to PNG and print its cut positions
    #[cfg(feature = "mupdf")]
    Render {
        pdf: PathBuf,
        /// 1-based page number
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 1.0)]
        scale: f64,
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        #[arg(long, default_value_t = 1.0)]
        end: f64,
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_file, args.debug)?;
    initialize_panic_handler();

    let settings = match &args.config {
        Some(path) => settings::load_settings_from(path).inspect_err(|e| error!("{e}"))?,
        None => settings::load_settings(),
    };
    let level = log_level(args.debug, &settings);
    info!("Log level {level}");
    log::set_max_level(level);

    match args.command {
        Command::Snap {
            image,
            start,
            end,
            main,
        } => snap(&image, start, end, main),
        #[cfg(feature = "mupdf")]
        Command::Render {
            pdf,
            page,
            scale,
            start,
            end,
            output,
        } => render::run(&settings, &pdf, page, scale, start, end, &output),
    }
}

/// Install the file logger. Until settings are loaded only `info` and
/// above are recorded (`debug` with `--debug`).
fn init_logging(log_file: &Path, debug: bool) -> Result<()> {
    let file = File::create(log_file)
        .with_context(|| format!("cannot create log file {}", log_file.display()))?;
    WriteLogger::init(LevelFilter::Trace, Config::default(), file)?;
    log::set_max_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    info!("Starting pagesplit {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn log_level(debug: bool, settings: &Settings) -> LevelFilter {
    if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::from_str(&settings.log_level).unwrap_or(LevelFilter::Info)
    }
}

fn snap(path: &Path, start: f64, end: f64, main: bool) -> Result<()> {
    if end <= start {
        bail!("end ({end}) must be greater than start ({start})");
    }
    let image = image::open(path)
        .with_context(|| format!("cannot open image {}", path.display()))?
        .to_rgba8();
    let regions = determine_optimal_cut_positions(&image, start, end, main);
    info!("{}: {} snap regions", path.display(), regions.len());
    println!("{}", serde_json::to_string_pretty(&regions)?);
    Ok(())
}

#[cfg(feature = "mupdf")]
mod render {
    use std::path::Path;
    use std::rc::Rc;

    use anyhow::{Context, Result};
    use futures::executor::LocalPool;
    use image::imageops;
    use log::info;

    use pagesplit::pdf::{MupdfDocument, PdfCache, SectionRequest, TimerQueue, to_pixels};
    use pagesplit::settings::Settings;

    pub fn run(
        settings: &Settings,
        pdf: &Path,
        page: u32,
        scale: f64,
        start: f64,
        end: f64,
        output: &Path,
    ) -> Result<()> {
        let document = Rc::new(MupdfDocument::open(pdf)?);
        let timers = Rc::new(TimerQueue::new());
        let mut executor = LocalPool::new();
        let config = settings.cache_config();
        let grace = config.eviction_grace;
        let cache = PdfCache::new(document, timers.clone(), Rc::new(executor.spawner()), config);

        let request = SectionRequest::new(page, scale, start, end);
        let section = executor.run_until(cache.render_section(request))?;
        let regions = cache.cut_points(&section, &request);

        let image = if section.is_main_canvas {
            let pixels = section.canvas.pixels();
            let height = f64::from(pixels.height());
            let top = to_pixels(height * start).min(pixels.height());
            let bottom = to_pixels(height * end).min(pixels.height());
            imageops::crop_imm(&*pixels, 0, top, pixels.width(), bottom.saturating_sub(top))
                .to_image()
        } else {
            section.canvas.to_image()
        };
        image
            .save(output)
            .with_context(|| format!("cannot write {}", output.display()))?;
        info!(
            "page {page} [{start}, {end}] written to {} ({}x{})",
            output.display(),
            image.width(),
            image.height()
        );
        println!("{}", serde_json::to_string_pretty(&regions)?);

        section.reference.release();
        executor.run_until_stalled();
        timers.advance(grace);
        cache.pool().log_stats();
        Ok(())
    }
}
