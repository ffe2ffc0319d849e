//! # DICOM-autoseg library
//!
//! This crate turns a DICOM CT series into an RT Structure Set holding one
//! ROI per anatomical structure found by an automatic segmentation tool.
//!
//! It is built on the dicom-rs ecosystem and runs in three stages:
//!  - Volume conversion: the slices of a series are read in parallel using
//!    rayon, ordered along the slice normal and written as a NIfTI volume
//!  - Segmentation: an external tool (TotalSegmentator by default) turns the
//!    volume into a multi-label NIfTI volume
//!  - Structure set: every label present is named through a label catalogue,
//!    its mask traced into closed planar contours per slice and stored as an
//!    ROI referencing the original slices
//!
//!  DICOM files are assumed to have the following attributes:
//!   - Images from a single series (Series Instance UID)
//!   - No multiframe (always the first frame is used)
//!   - Parallel slices sharing one orientation and matrix size
//!
//! # Examples
//!
//! ## Running the full conversion
//!
//! ```no_run
//! # use dicom_autoseg::{Pipeline, PipelineConfig};
//! # use std::path::Path;
//! # async fn run() -> Result<(), dicom_autoseg::PipelineError> {
//! let pipeline = Pipeline::from_config(PipelineConfig::default());
//! let artifacts = pipeline.run(Path::new("dicom"), Path::new("out")).await?;
//! println!("{}", artifacts.structure_set.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Mapping an existing label volume
//!
//! ```no_run
//! # use dicom_autoseg::{LabelCatalogue, LabelVolume, LabelVolumeMapper};
//! # use std::path::Path;
//! let labels = LabelVolume::open(Path::new("out/segmentation.nii.gz"))
//!     .expect("should have read the label volume")
//!     .to_patient_frame();
//! let mapper = LabelVolumeMapper::new(LabelCatalogue::total());
//! for structure in mapper.map(&labels).expect("should know every label") {
//!     println!("{} {}", structure.label, structure.name);
//! }
//! ```

pub mod catalogue;
pub mod config;
pub mod contour;
pub mod enums;
pub mod label_mapper;
pub mod pipeline;
pub mod rtstruct;
pub mod segmentation;
pub mod series;
mod staging;
pub mod volume;

pub use catalogue::{CatalogueSource, LabelCatalogue};
pub use config::{Artifacts, PipelineConfig};
pub use enums::{SortBy, Stage};
pub use label_mapper::{LabelVolume, LabelVolumeMapper, PatientLabels, StructureMask};
pub use pipeline::{Pipeline, PipelineError};
pub use rtstruct::StructureSetBuilder;
pub use segmentation::{CommandSegmenter, CommandTemplate, Segmenter};
pub use series::{SeriesLoader, SliceSeries};
pub use volume::{Volume, VolumeConverter};
