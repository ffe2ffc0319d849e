use crate::staging;

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};
use web_time::Instant;

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("Could not start segmentation tool {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Segmentation tool {program} failed with {status}")]
    Execution { program: String, status: ExitStatus },

    #[error("Segmentation reported success but wrote no label volume at {}", path.display())]
    OutputMissing { path: PathBuf },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Something that turns a volumetric image into a multi-label volume file.
#[allow(async_fn_in_trait)]
pub trait Segmenter {
    /// File name of the label volume created inside the output folder.
    fn output_name(&self) -> &str;

    /// Segment `input`, returning the path of the label volume written to
    /// `output_dir`. Completes only once the label volume is in place.
    async fn run(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, SegmentationError>;
}

/// Program and argument list of an external segmentation tool.
///
/// Arguments may contain the placeholders `{input}` and `{output}`, replaced
/// with the input image path and the label volume path respectively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub const INPUT: &'static str = "{input}";
    pub const OUTPUT: &'static str = "{output}";

    /// TotalSegmentator writing a single multi-label file (`--ml`).
    pub fn total_segmentator() -> Self {
        Self {
            program: "TotalSegmentator".to_string(),
            args: ["-i", Self::INPUT, "-o", Self::OUTPUT, "--ml"]
                .map(String::from)
                .to_vec(),
        }
    }

    pub fn render(&self, input: &Path, output: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| match arg.as_str() {
                Self::INPUT => input.as_os_str().to_os_string(),
                Self::OUTPUT => output.as_os_str().to_os_string(),
                _ => arg
                    .replace(Self::INPUT, &input.to_string_lossy())
                    .replace(Self::OUTPUT, &output.to_string_lossy())
                    .into(),
            })
            .collect()
    }
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self::total_segmentator()
    }
}

/// Runs an external segmentation tool as a child process.
#[derive(Debug, Clone)]
pub struct CommandSegmenter {
    template: CommandTemplate,
    output_name: String,
}

impl CommandSegmenter {
    pub fn new(template: CommandTemplate, output_name: impl Into<String>) -> Self {
        Self {
            template,
            output_name: output_name.into(),
        }
    }
}

impl Segmenter for CommandSegmenter {
    fn output_name(&self) -> &str {
        &self.output_name
    }

    async fn run(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, SegmentationError> {
        let output = output_dir.join(&self.output_name);
        let partial = staging::partial_path(&output);
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SegmentationError::Io { path, source }
        };

        // a label volume left over from an earlier run must never pass for this one
        staging::discard(&output).map_err(io_error(&output))?;
        staging::discard(&partial).map_err(io_error(&partial))?;

        let program = &self.template.program;
        let args = self.template.render(input, &partial);
        info!("Running {program} {:?}", args);

        let started = Instant::now();
        let status = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| SegmentationError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !status.success() {
            if let Err(e) = staging::discard(&partial) {
                warn!("Could not remove {}: {e}", partial.display());
            }
            return Err(SegmentationError::Execution {
                program: program.clone(),
                status,
            });
        }

        if !partial.is_file() {
            return Err(SegmentationError::OutputMissing { path: output });
        }
        staging::commit(&partial, &output).map_err(io_error(&output))?;

        info!(
            "Segmentation finished in {:.1?}, labels at {}",
            started.elapsed(),
            output.display()
        );
        Ok(output)
    }
}
