//! End-to-end conversion of a DICOM CT series into an RT Structure Set.
//!
//! Stages run strictly one after another and hand typed values to each
//! other: the ordered [`SliceSeries`] from volume conversion is the one the
//! structure set refers to, and the label volume path is the one the
//! segmenter reported. Artifacts of earlier runs are deleted before anything
//! else happens, so a failed run never leaves stale output that looks current.

use crate::catalogue::CatalogueError;
use crate::config::{Artifacts, PipelineConfig};
use crate::enums::Stage;
use crate::label_mapper::{LabelVolume, LabelVolumeMapper, MapperError};
use crate::rtstruct::{StructureRegistrationError, StructureSetBuilder};
use crate::segmentation::{CommandSegmenter, SegmentationError, Segmenter};
use crate::series::SliceSeries;
use crate::staging;
use crate::volume::{ConversionError, VolumeConverter};

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use web_time::Instant;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("setup failed on {}: {source}", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("setup failed: {0}")]
    Catalogue(#[from] CatalogueError),

    #[error("volume conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("segmentation failed: {0}")]
    Segmentation(#[from] SegmentationError),

    #[error("label mapping failed: {0}")]
    LabelMapping(#[from] MapperError),

    #[error("structure set failed: {0}")]
    StructureSet(#[from] StructureRegistrationError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Setup { .. } | PipelineError::Catalogue(_) => Stage::Setup,
            PipelineError::Conversion(_) => Stage::VolumeConversion,
            PipelineError::Segmentation(_) => Stage::Segmentation,
            PipelineError::LabelMapping(_) => Stage::LabelMapping,
            PipelineError::StructureSet(_) => Stage::StructureSet,
        }
    }

    /// Process exit status reported for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Conversion(ConversionError::Series(_)) => 1,
            PipelineError::Conversion(ConversionError::Write(_)) => 2,
            PipelineError::Segmentation(_) => 3,
            PipelineError::LabelMapping(_) => 4,
            PipelineError::StructureSet(_) => 5,
            PipelineError::Setup { .. } | PipelineError::Catalogue(_) => 6,
        }
    }
}

pub struct Pipeline<S> {
    config: PipelineConfig,
    segmenter: S,
}

impl Pipeline<CommandSegmenter> {
    /// Pipeline running the configured external segmentation tool.
    pub fn from_config(config: PipelineConfig) -> Self {
        let segmenter = CommandSegmenter::new(config.segmenter.clone(), config.labels_file.clone());
        Self::new(config, segmenter)
    }
}

impl<S: Segmenter> Pipeline<S> {
    pub fn new(config: PipelineConfig, segmenter: S) -> Self {
        Self { config, segmenter }
    }

    /// Artifact paths of a run writing to `output_dir`.
    pub fn artifacts(&self, output_dir: &Path) -> Artifacts {
        let mut artifacts = self.config.artifacts(output_dir);
        artifacts.labels = output_dir.join(self.segmenter.output_name());
        artifacts
    }

    /// Convert the series in `input_dir` and write all artifacts to
    /// `output_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// The first failing stage ends the run; its error is returned and no
    /// later stage is attempted.
    pub async fn run(
        &self,
        input_dir: &Path,
        output_dir: &Path,
    ) -> Result<Artifacts, PipelineError> {
        let started = Instant::now();
        let mut artifacts = self.artifacts(output_dir);
        self.prepare(output_dir, &artifacts)?;
        let mapper = LabelVolumeMapper::new(self.config.catalogue.load()?);

        info!("Stage 1/3: {}", Stage::VolumeConversion);
        let series =
            VolumeConverter::convert(input_dir, &artifacts.volume, self.config.sort_by)?;

        info!("Stage 2/3: {}", Stage::Segmentation);
        artifacts.labels = self.segmenter.run(&artifacts.volume, output_dir).await?;

        info!("Stage 3/3: {}", Stage::StructureSet);
        self.build_structure_set(&series, &mapper, &artifacts)?;

        info!(
            "Finished in {:.1?}, structure set at {}",
            started.elapsed(),
            artifacts.structure_set.display()
        );
        Ok(artifacts)
    }

    fn prepare(&self, output_dir: &Path, artifacts: &Artifacts) -> Result<(), PipelineError> {
        let setup_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PipelineError::Setup { path, source }
        };

        fs::create_dir_all(output_dir).map_err(setup_error(output_dir))?;
        for path in artifacts.iter() {
            if path.exists() {
                warn!("Removing artifact of an earlier run: {}", path.display());
            }
            staging::discard(path).map_err(setup_error(path))?;
            let partial = staging::partial_path(path);
            staging::discard(&partial).map_err(setup_error(&partial))?;
        }
        Ok(())
    }

    fn build_structure_set(
        &self,
        series: &SliceSeries,
        mapper: &LabelVolumeMapper,
        artifacts: &Artifacts,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let labels = LabelVolume::open(&artifacts.labels)?.to_patient_frame();

        let (depth, rows, columns) = series.dim();
        if labels.dim() != (rows, columns, depth) {
            return Err(MapperError::MalformedLabelVolume {
                path: artifacts.labels.clone(),
                reason: format!(
                    "shape {:?} (rows, columns, slices) does not match the series {:?}",
                    labels.dim(),
                    (rows, columns, depth)
                ),
            }
            .into());
        }

        let masks = mapper.map(&labels)?;
        if masks.len() == 0 {
            warn!("Label volume {} contains no structures", artifacts.labels.display());
        }

        let mut builder =
            StructureSetBuilder::new(series, self.config.structure_set_label.as_str());
        for structure in masks {
            builder.add_roi(&structure.name, structure.mask.view())?;
        }
        builder.save(&artifacts.structure_set)?;

        info!(
            "Registered {} structures in {:.1?}",
            builder.len(),
            started.elapsed()
        );
        Ok(())
    }
}
