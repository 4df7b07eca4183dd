#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use uart_flash_loader::linux::LineSettings;
use uart_flash_loader::{Loader, Options};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(flatten)]
    line: LineSettings,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Read platform and version from the bootloader
    Info,

    /// Write a raw firmware image
    Flash {
        /// Binary image file
        #[structopt(parse(from_os_str))]
        file: PathBuf,

        /// Start the application once written
        #[structopt(long)]
        start: bool,
    },

    /// Start the application
    Start,
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let mut l = Loader::linux(&o.line, o.options.clone())
        .with_context(|| format!("Error connecting to serial port {}", o.line.port))?;

    info!("Connecting to bootloader");

    l.init().map_err(|e| anyhow!("Error connecting to bootloader: {}", e))?;

    let platform = l.platform().map_err(|e| anyhow!("Error reading platform: {}", e))?;
    info!("Bootloader connected! Platform: {}", platform);

    match o.operation {
        Operation::Info => {
            let version = l.version().map_err(|e| anyhow!("Error reading version: {}", e))?;
            info!("Version: {}", version);
        }
        Operation::Flash { file, start } => {
            let image = std::fs::read(&file)
                .with_context(|| format!("Error reading image {}", file.display()))?;

            info!(
                "Writing {} ({})",
                file.display(),
                bytefmt::format(image.len() as u64)
            );
            debug!("Image header: {}", hex::encode(&image[..image.len().min(16)]));

            let bar = ProgressBar::new(image.len() as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{bar:40} {bytes}/{total_bytes} ({eta})")
                    .progress_chars("=> "),
            );

            let res = l.write_image(&image, |n| bar.set_position(n as u64));
            bar.finish();

            res.map_err(|e| anyhow!("Error writing image: {}", e))?;
            info!("Image written");

            if start {
                l.start_app().map_err(|e| anyhow!("Error starting application: {}", e))?;
                info!("Application started");
            }
        }
        Operation::Start => {
            l.start_app().map_err(|e| anyhow!("Error starting application: {}", e))?;
            info!("Application started");
        }
    }

    Ok(())
}
