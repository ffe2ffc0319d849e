//! Commandline tool converting a DICOM CT series into an RT Structure Set.
//!
//! Writes the NIfTI volume, the label volume of the segmentation tool and the
//! structure set into the output directory.

use clap::{Parser, ValueEnum};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, error};

use dicom_autoseg::{CatalogueSource, Pipeline, PipelineConfig, SortBy};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortOrder {
    /// Position along the slice normal
    Position,
    /// InstanceNumber
    Instance,
}

impl From<SortOrder> for SortBy {
    fn from(order: SortOrder) -> Self {
        match order {
            SortOrder::Position => SortBy::ImagePositionPatient,
            SortOrder::Instance => SortBy::InstanceNumber,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Folder containing the DICOM slices of one CT series
    #[arg(short, long)]
    input: PathBuf,

    /// Output folder, created with its parents if missing
    #[arg(short, long)]
    output: PathBuf,

    /// Slice ordering
    #[arg(long, value_enum, default_value_t = SortOrder::Position)]
    sort_by: SortOrder,

    /// Segmentation program to run instead of TotalSegmentator
    #[arg(long)]
    segmenter: Option<String>,

    /// Argument of the segmentation program, repeatable; replaces the default
    /// arguments. `{input}` and `{output}` are replaced by the volume and
    /// label volume paths
    #[arg(long = "segmenter-arg", allow_hyphen_values = true)]
    segmenter_args: Vec<String>,

    /// Pass --fast to the segmentation program
    #[arg(long)]
    fast: bool,

    /// JSON file mapping label values to structure names
    #[arg(long)]
    catalogue: Option<PathBuf>,

    /// Structure set label
    #[arg(long)]
    label: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> PipelineConfig {
        let mut config = PipelineConfig {
            sort_by: self.sort_by.into(),
            ..PipelineConfig::default()
        };
        if let Some(program) = self.segmenter {
            config.segmenter.program = program;
        }
        if !self.segmenter_args.is_empty() {
            config.segmenter.args = self.segmenter_args;
        }
        if self.fast {
            config.segmenter.args.push("--fast".to_string());
        }
        if let Some(path) = self.catalogue {
            config.catalogue = CatalogueSource::File(path);
        }
        if let Some(label) = self.label {
            config.structure_set_label = label;
        }
        config
    }
}

fn report(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        // skip sources already part of the message
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if let Err(e) = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level)
            .finish(),
    ) {
        eprintln!("[ERROR] Could not set up logging: {e}");
    }

    let input = args.input.clone();
    let output = args.output.clone();
    let pipeline = Pipeline::from_config(args.into_config());

    match pipeline.run(&input, &output).await {
        Ok(artifacts) => {
            println!("{}", artifacts.structure_set.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", report(&e));
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
