use crate::catalogue::CatalogueSource;
use crate::enums::SortBy;
use crate::segmentation::CommandTemplate;

use std::path::{Path, PathBuf};

/// Settings of one conversion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// File name of the NIfTI volume written from the DICOM series
    pub volume_file: String,
    /// File name of the label volume written by the segmentation tool
    pub labels_file: String,
    /// File name of the RT Structure Set
    pub structure_set_file: String,
    pub sort_by: SortBy,
    pub segmenter: CommandTemplate,
    pub catalogue: CatalogueSource,
    /// Structure Set Label and Series Description of the output
    pub structure_set_label: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            volume_file: "ct.nii.gz".to_string(),
            labels_file: "segmentation.nii.gz".to_string(),
            structure_set_file: "rtstruct.dcm".to_string(),
            sort_by: SortBy::default(),
            segmenter: CommandTemplate::default(),
            catalogue: CatalogueSource::default(),
            structure_set_label: "AutoSeg".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Paths of the three artifacts inside `output_dir`.
    pub fn artifacts(&self, output_dir: &Path) -> Artifacts {
        Artifacts {
            volume: output_dir.join(&self.volume_file),
            labels: output_dir.join(&self.labels_file),
            structure_set: output_dir.join(&self.structure_set_file),
        }
    }
}

/// Files produced by a run, in the order they are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub volume: PathBuf,
    pub labels: PathBuf,
    pub structure_set: PathBuf,
}

impl Artifacts {
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        [&self.volume, &self.labels, &self.structure_set]
            .into_iter()
            .map(PathBuf::as_path)
    }
}
