use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use spatial_quant_rust_lib::config::Config;
use spatial_quant_rust_lib::image_io::prepare_input;
use spatial_quant_rust_lib::pipeline::{condense_channels, quantify_sample};
use spatial_quant_rust_lib::thresholds::{
    generate_initial_thresholds, generate_quality_control, sync_thresholds, update_thresholds,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about = "Per-cell marker expression quantification for multiplexed tissue images")]
struct Args {
    /// Path to configuration file (TOML, or JSON by extension)
    #[clap(short, long, global = true)]
    config: Option<String>,

    /// Enable debug logging
    #[clap(long, global = true)]
    debug: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Quantify marker expression per cell from a segmentation mask
    Quantify {
        /// Path to the QPTIFF or TIF image
        #[clap(short, long)]
        image_path: Option<String>,

        /// Path to the segmentation mask (.npy, .tif or .png)
        #[clap(short, long)]
        mask_path: Option<String>,

        /// Path to channel_names.txt, used only when metadata parsing fails
        #[clap(short, long)]
        panel_path: Option<String>,

        /// Output directory (defaults to the mask's directory)
        #[clap(short, long)]
        output_dir: Option<String>,

        /// Aggregate channels on a single thread
        #[clap(long)]
        sequential: bool,
    },

    /// Move each image in a directory into its own <sample>/data folder
    FormatDirectories {
        /// Directory containing .tiff, .tif or .qptiff images
        #[clap(short, long)]
        data_directory: String,
    },

    /// Remove channels from an image and write a condensed panel
    Condense {
        /// Path to the image
        #[clap(short, long)]
        image_path: Option<String>,

        /// Path to channel_names.txt
        #[clap(short, long)]
        panel_path: Option<String>,

        /// Channel names to remove, comma separated
        #[clap(short, long, value_delimiter = ',')]
        remove: Vec<String>,
    },

    /// Create or refresh per-sample cell-type threshold sheets
    Thresholds {
        /// Clinical data CSV with TMA, TMA_PART and CORE_IMAGE_ID columns
        #[clap(short = 'd', long)]
        clinical_data: Option<String>,

        /// Signature matrix CSV with a CELL_TYPE column
        #[clap(short = 'm', long)]
        signature_matrix: String,

        /// Directory holding the *_thresholds.csv sheets
        #[clap(short, long)]
        save_path: String,

        /// Only refresh existing sheets against the signature matrix
        #[clap(long, conflicts_with = "reset")]
        update: bool,

        /// Overwrite every sheet with default thresholds
        #[clap(long)]
        reset: bool,
    },

    /// Write a quality-control sheet listing every sample against the panel
    QualityControl {
        /// Clinical data CSV with TMA, TMA_PART and CORE_IMAGE_ID columns
        #[clap(short = 'd', long)]
        clinical_data: String,

        /// Path to channel_names.txt
        #[clap(short, long)]
        panel_path: String,

        /// Output prefix; `_quality_control.csv` is appended
        #[clap(short, long)]
        save_path: String,
    },
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

/// Main function
fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();
    init_logging(args.debug);

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let start_time = Instant::now();

    match args.command {
        Command::Quantify {
            image_path,
            mask_path,
            panel_path,
            output_dir,
            sequential,
        } => {
            // Override config with command-line arguments
            if let Some(image_path) = image_path {
                config.image_path = image_path;
            }
            if let Some(mask_path) = mask_path {
                config.mask_path = mask_path;
            }
            if panel_path.is_some() {
                config.panel_path = panel_path;
            }
            if output_dir.is_some() {
                config.output_dir = output_dir;
            }
            if sequential {
                config.use_parallel = false;
            }

            config.validate()?;

            let output_path = quantify_sample(&config)
                .with_context(|| format!("Failed to quantify {}", config.image_path))?;
            println!("{}", output_path.display());
        }
        Command::FormatDirectories { data_directory } => {
            let moved = prepare_input(&data_directory)
                .with_context(|| format!("Failed to format {}", data_directory))?;
            info!("Organized {} images", moved.len());
        }
        Command::Condense {
            image_path,
            panel_path,
            remove,
        } => {
            let image_path = image_path
                .or_else(|| Some(config.image_path.clone()).filter(|p| !p.is_empty()))
                .context("condense requires --image-path")?;
            let panel_path = panel_path
                .or_else(|| config.panel_path.clone())
                .context("condense requires --panel-path")?;
            if !remove.is_empty() {
                config.channels_to_remove = remove;
            }

            let output = condense_channels(
                PathBuf::from(&image_path),
                PathBuf::from(&panel_path),
                &config.channels_to_remove,
            )
            .with_context(|| format!("Failed to condense {}", image_path))?;
            println!("{}", output.image_path.display());
            println!("{}", output.panel_path.display());
        }
        Command::Thresholds {
            clinical_data,
            signature_matrix,
            save_path,
            update,
            reset,
        } => {
            let result = if update {
                update_thresholds(&save_path, &signature_matrix)
            } else {
                let clinical_data =
                    clinical_data.context("thresholds requires --clinical-data unless --update is set")?;
                if reset {
                    generate_initial_thresholds(&clinical_data, &signature_matrix, &save_path)
                } else {
                    sync_thresholds(&clinical_data, &signature_matrix, &save_path)
                }
            };
            let sheets =
                result.with_context(|| format!("Failed to write threshold sheets in {}", save_path))?;
            info!("{} threshold sheets up to date", sheets.len());
        }
        Command::QualityControl {
            clinical_data,
            panel_path,
            save_path,
        } => {
            let output_path = generate_quality_control(&clinical_data, &panel_path, &save_path)
                .with_context(|| format!("Failed to write quality-control sheet for {}", clinical_data))?;
            println!("{}", output_path.display());
        }
    }

    info!("Completed in {:.2} seconds", start_time.elapsed().as_secs_f64());

    Ok(())
}
