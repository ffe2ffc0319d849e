//! RT Structure Set assembly and encoding.

use crate::contour::{Contour, trace_contours};
use crate::series::{SliceInfo, SliceSeries};
use crate::staging;

use chrono::Local;
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::mem::InMemElement;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::{tags, uids};
use ndarray::{ArrayView3, Axis};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// RT Structure Set Storage
pub const RT_STRUCTURE_SET_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.3";
/// Detached Study Management, referenced from the RT Referenced Study Sequence
const STUDY_MANAGEMENT: &str = "1.2.840.10008.3.1.2.3.1";

const MANUFACTURER: &str = "dicom-autoseg";

/// Display colours assigned to ROIs in registration order.
const PALETTE: [[u8; 3]; 16] = [
    [255, 0, 255],
    [0, 235, 235],
    [255, 255, 0],
    [255, 0, 0],
    [0, 132, 255],
    [0, 240, 0],
    [255, 175, 0],
    [0, 208, 255],
    [180, 255, 105],
    [255, 20, 147],
    [160, 32, 240],
    [0, 255, 127],
    [255, 114, 0],
    [64, 224, 208],
    [220, 20, 60],
    [218, 165, 32],
];

/// Tags of the RT modules
pub mod rt_tags {
    use dicom::core::Tag;

    pub const STRUCTURE_SET_LABEL: Tag = Tag(0x3006, 0x0002);
    pub const STRUCTURE_SET_NAME: Tag = Tag(0x3006, 0x0004);
    pub const STRUCTURE_SET_DATE: Tag = Tag(0x3006, 0x0008);
    pub const STRUCTURE_SET_TIME: Tag = Tag(0x3006, 0x0009);
    pub const REFERENCED_FRAME_OF_REFERENCE_SEQUENCE: Tag = Tag(0x3006, 0x0010);
    pub const RT_REFERENCED_STUDY_SEQUENCE: Tag = Tag(0x3006, 0x0012);
    pub const RT_REFERENCED_SERIES_SEQUENCE: Tag = Tag(0x3006, 0x0014);
    pub const CONTOUR_IMAGE_SEQUENCE: Tag = Tag(0x3006, 0x0016);
    pub const STRUCTURE_SET_ROI_SEQUENCE: Tag = Tag(0x3006, 0x0020);
    pub const ROI_NUMBER: Tag = Tag(0x3006, 0x0022);
    pub const REFERENCED_FRAME_OF_REFERENCE_UID: Tag = Tag(0x3006, 0x0024);
    pub const ROI_NAME: Tag = Tag(0x3006, 0x0026);
    pub const ROI_DISPLAY_COLOR: Tag = Tag(0x3006, 0x002A);
    pub const ROI_GENERATION_ALGORITHM: Tag = Tag(0x3006, 0x0036);
    pub const ROI_CONTOUR_SEQUENCE: Tag = Tag(0x3006, 0x0039);
    pub const CONTOUR_SEQUENCE: Tag = Tag(0x3006, 0x0040);
    pub const CONTOUR_GEOMETRIC_TYPE: Tag = Tag(0x3006, 0x0042);
    pub const NUMBER_OF_CONTOUR_POINTS: Tag = Tag(0x3006, 0x0046);
    pub const CONTOUR_NUMBER: Tag = Tag(0x3006, 0x0048);
    pub const CONTOUR_DATA: Tag = Tag(0x3006, 0x0050);
    pub const RT_ROI_OBSERVATIONS_SEQUENCE: Tag = Tag(0x3006, 0x0080);
    pub const OBSERVATION_NUMBER: Tag = Tag(0x3006, 0x0082);
    pub const REFERENCED_ROI_NUMBER: Tag = Tag(0x3006, 0x0084);
    pub const RT_ROI_INTERPRETED_TYPE: Tag = Tag(0x3006, 0x00A4);
    pub const ROI_INTERPRETER: Tag = Tag(0x3006, 0x00A6);
}

#[derive(Debug, Error)]
pub enum StructureRegistrationError {
    #[error("Structure name {name:?} is already registered")]
    DuplicateName { name: String },

    #[error("Mask of {name:?} has shape {found:?}, the series needs {expected:?}")]
    ShapeMismatch {
        name: String,
        found: (usize, usize, usize),
        expected: (usize, usize, usize),
    },

    #[error("Mask of {name:?} is empty")]
    EmptyMask { name: String },

    #[error("Could not encode structure set {}: {reason}", path.display())]
    Dicom { path: PathBuf, reason: String },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
struct Roi {
    number: u32,
    name: String,
    color: [u8; 3],
    /// Contours keyed by slice index, ascending
    planes: Vec<(usize, Vec<Contour>)>,
}

/// Collects named masks over a series and writes them as one RTSTRUCT.
///
/// Nothing touches the filesystem before [`StructureSetBuilder::save`], so a
/// failed registration never leaves a partial structure set behind.
pub struct StructureSetBuilder<'a> {
    series: &'a SliceSeries,
    label: String,
    series_instance_uid: String,
    sop_instance_uid: String,
    rois: Vec<Roi>,
}

impl<'a> StructureSetBuilder<'a> {
    pub fn new(series: &'a SliceSeries, label: impl Into<String>) -> Self {
        Self {
            series,
            label: label.into(),
            series_instance_uid: generate_uid(),
            sop_instance_uid: generate_uid(),
            rois: Vec::new(),
        }
    }

    /// Register a structure from a (rows, columns, slices) mask.
    ///
    /// # Errors
    ///
    /// Rejects names already registered, masks whose shape differs from the
    /// series and masks without any voxel set.
    pub fn add_roi(
        &mut self,
        name: &str,
        mask: ArrayView3<'_, bool>,
    ) -> Result<(), StructureRegistrationError> {
        if self.rois.iter().any(|roi| roi.name == name) {
            return Err(StructureRegistrationError::DuplicateName {
                name: name.to_string(),
            });
        }

        let (depth, rows, columns) = self.series.dim();
        if mask.dim() != (rows, columns, depth) {
            return Err(StructureRegistrationError::ShapeMismatch {
                name: name.to_string(),
                found: mask.dim(),
                expected: (rows, columns, depth),
            });
        }

        let planes: Vec<(usize, Vec<Contour>)> = (0..depth)
            .into_par_iter()
            .map(|k| (k, trace_contours(mask.index_axis(Axis(2), k))))
            .filter(|(_, contours)| !contours.is_empty())
            .collect();
        if planes.is_empty() {
            return Err(StructureRegistrationError::EmptyMask {
                name: name.to_string(),
            });
        }

        let number = self.rois.len() as u32 + 1;
        debug!(
            "ROI {number} {name}: {} contours on {} slices",
            planes.iter().map(|(_, c)| c.len()).sum::<usize>(),
            planes.len()
        );
        self.rois.push(Roi {
            number,
            name: name.to_string(),
            color: PALETTE[(number as usize - 1) % PALETTE.len()],
            planes,
        });
        Ok(())
    }

    /// Registered ROI names in registration order.
    pub fn roi_names(&self) -> impl Iterator<Item = &str> {
        self.rois.iter().map(|roi| roi.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    pub fn sop_instance_uid(&self) -> &str {
        &self.sop_instance_uid
    }

    /// Encode the structure set data set.
    pub fn build(&self) -> InMemDicomObject {
        let study = self.series.study();
        let now = Local::now();
        let date = now.format("%Y%m%d").to_string();
        let time = now.format("%H%M%S").to_string();

        let mut elements = vec![
            text(tags::SPECIFIC_CHARACTER_SET, VR::CS, "ISO_IR 192"),
            text(tags::INSTANCE_CREATION_DATE, VR::DA, &date),
            text(tags::INSTANCE_CREATION_TIME, VR::TM, &time),
            text(tags::SOP_CLASS_UID, VR::UI, RT_STRUCTURE_SET_STORAGE),
            text(tags::SOP_INSTANCE_UID, VR::UI, &self.sop_instance_uid),
            optional_text(tags::STUDY_DATE, VR::DA, study.study_date.as_deref()),
            optional_text(tags::STUDY_TIME, VR::TM, study.study_time.as_deref()),
            optional_text(tags::ACCESSION_NUMBER, VR::SH, study.accession_number.as_deref()),
            text(tags::MODALITY, VR::CS, "RTSTRUCT"),
            text(tags::MANUFACTURER, VR::LO, MANUFACTURER),
            optional_text(
                tags::REFERRING_PHYSICIAN_NAME,
                VR::PN,
                study.referring_physician_name.as_deref(),
            ),
            optional_text(tags::STUDY_DESCRIPTION, VR::LO, study.study_description.as_deref()),
            text(tags::SERIES_DESCRIPTION, VR::LO, &self.label),
            optional_text(tags::PATIENT_NAME, VR::PN, study.patient_name.as_deref()),
            optional_text(tags::PATIENT_ID, VR::LO, study.patient_id.as_deref()),
            optional_text(tags::PATIENT_BIRTH_DATE, VR::DA, study.patient_birth_date.as_deref()),
            optional_text(tags::PATIENT_SEX, VR::CS, study.patient_sex.as_deref()),
            text(tags::STUDY_INSTANCE_UID, VR::UI, &study.study_instance_uid),
            text(tags::SERIES_INSTANCE_UID, VR::UI, &self.series_instance_uid),
            optional_text(tags::STUDY_ID, VR::SH, study.study_id.as_deref()),
            text(tags::SERIES_NUMBER, VR::IS, "1"),
            text(tags::INSTANCE_NUMBER, VR::IS, "1"),
            text(tags::FRAME_OF_REFERENCE_UID, VR::UI, &study.frame_of_reference_uid),
            text(rt_tags::STRUCTURE_SET_LABEL, VR::SH, &self.label),
            text(rt_tags::STRUCTURE_SET_NAME, VR::LO, &self.label),
            text(rt_tags::STRUCTURE_SET_DATE, VR::DA, &date),
            text(rt_tags::STRUCTURE_SET_TIME, VR::TM, &time),
        ];
        elements.push(self.referenced_frame_of_reference());
        elements.push(sequence(
            rt_tags::STRUCTURE_SET_ROI_SEQUENCE,
            self.rois.iter().map(|roi| self.structure_set_roi(roi)).collect(),
        ));
        elements.push(sequence(
            rt_tags::ROI_CONTOUR_SEQUENCE,
            self.rois.iter().map(|roi| self.roi_contour(roi)).collect(),
        ));
        elements.push(sequence(
            rt_tags::RT_ROI_OBSERVATIONS_SEQUENCE,
            self.rois.iter().map(roi_observation).collect(),
        ));

        InMemDicomObject::from_element_iter(elements)
    }

    /// Encode and write the structure set, replacing any file at `path`.
    ///
    /// The file is written beside `path` and renamed once complete.
    pub fn save(&self, path: &Path) -> Result<PathBuf, StructureRegistrationError> {
        let dicom_error = |reason: String| StructureRegistrationError::Dicom {
            path: path.to_path_buf(),
            reason,
        };

        let meta = FileMetaTableBuilder::new()
            .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .media_storage_sop_class_uid(RT_STRUCTURE_SET_STORAGE)
            .media_storage_sop_instance_uid(self.sop_instance_uid.as_str());
        let file = self
            .build()
            .with_meta(meta)
            .map_err(|e| dicom_error(e.to_string()))?;

        let partial = staging::partial_path(path);
        if let Err(e) = file.write_to_file(&partial) {
            if let Err(cleanup) = staging::discard(&partial) {
                warn!("Could not remove {}: {cleanup}", partial.display());
            }
            return Err(dicom_error(e.to_string()));
        }
        staging::commit(&partial, path).map_err(|source| StructureRegistrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        info!(
            "Wrote structure set with {} ROIs to {}",
            self.rois.len(),
            path.display()
        );
        Ok(path.to_path_buf())
    }

    fn referenced_frame_of_reference(&self) -> InMemElement {
        let study = self.series.study();
        let contour_images = self.series.slices().iter().map(image_reference).collect();

        let referenced_series = InMemDicomObject::from_element_iter([
            text(tags::SERIES_INSTANCE_UID, VR::UI, &study.series_instance_uid),
            sequence(rt_tags::CONTOUR_IMAGE_SEQUENCE, contour_images),
        ]);
        let referenced_study = InMemDicomObject::from_element_iter([
            text(tags::REFERENCED_SOP_CLASS_UID, VR::UI, STUDY_MANAGEMENT),
            text(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, &study.study_instance_uid),
            sequence(rt_tags::RT_REFERENCED_SERIES_SEQUENCE, vec![referenced_series]),
        ]);
        let frame_of_reference = InMemDicomObject::from_element_iter([
            text(tags::FRAME_OF_REFERENCE_UID, VR::UI, &study.frame_of_reference_uid),
            sequence(rt_tags::RT_REFERENCED_STUDY_SEQUENCE, vec![referenced_study]),
        ]);

        sequence(
            rt_tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE,
            vec![frame_of_reference],
        )
    }

    fn structure_set_roi(&self, roi: &Roi) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            text(rt_tags::ROI_NUMBER, VR::IS, roi.number.to_string()),
            text(
                rt_tags::REFERENCED_FRAME_OF_REFERENCE_UID,
                VR::UI,
                &self.series.study().frame_of_reference_uid,
            ),
            text(rt_tags::ROI_NAME, VR::LO, &roi.name),
            text(rt_tags::ROI_GENERATION_ALGORITHM, VR::CS, "AUTOMATIC"),
        ])
    }

    fn roi_contour(&self, roi: &Roi) -> InMemDicomObject {
        let slices = self.series.slices();
        let contours = roi
            .planes
            .iter()
            .flat_map(|(k, contours)| contours.iter().map(move |contour| (&slices[*k], contour)))
            .enumerate()
            .map(|(i, (slice, contour))| contour_item(i + 1, slice, contour))
            .collect();

        InMemDicomObject::from_element_iter([
            DataElement::new(
                rt_tags::ROI_DISPLAY_COLOR,
                VR::IS,
                PrimitiveValue::Strs(roi.color.iter().map(u8::to_string).collect()),
            ),
            sequence(rt_tags::CONTOUR_SEQUENCE, contours),
            text(rt_tags::REFERENCED_ROI_NUMBER, VR::IS, roi.number.to_string()),
        ])
    }
}

fn contour_item(number: usize, slice: &SliceInfo, contour: &Contour) -> InMemDicomObject {
    let coordinates = contour
        .centred_points()
        .map(|(column, row)| slice.pixel_to_patient(column, row))
        .flat_map(|point| [point.x, point.y, point.z]);

    InMemDicomObject::from_element_iter([
        sequence(rt_tags::CONTOUR_IMAGE_SEQUENCE, vec![image_reference(slice)]),
        text(rt_tags::CONTOUR_GEOMETRIC_TYPE, VR::CS, "CLOSED_PLANAR"),
        text(rt_tags::NUMBER_OF_CONTOUR_POINTS, VR::IS, contour.len().to_string()),
        text(rt_tags::CONTOUR_NUMBER, VR::IS, number.to_string()),
        DataElement::new(
            rt_tags::CONTOUR_DATA,
            VR::DS,
            PrimitiveValue::Strs(coordinates.map(format_decimal).collect()),
        ),
    ])
}

fn roi_observation(roi: &Roi) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        text(rt_tags::OBSERVATION_NUMBER, VR::IS, roi.number.to_string()),
        text(rt_tags::REFERENCED_ROI_NUMBER, VR::IS, roi.number.to_string()),
        text(rt_tags::RT_ROI_INTERPRETED_TYPE, VR::CS, "ORGAN"),
        DataElement::new(rt_tags::ROI_INTERPRETER, VR::PN, PrimitiveValue::Empty),
    ])
}

fn image_reference(slice: &SliceInfo) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        text(tags::REFERENCED_SOP_CLASS_UID, VR::UI, &slice.sop_class_uid),
        text(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, &slice.sop_instance_uid),
    ])
}

fn text(tag: Tag, vr: VR, value: impl Into<String>) -> InMemElement {
    DataElement::new(tag, vr, PrimitiveValue::from(value.into()))
}

fn optional_text(tag: Tag, vr: VR, value: Option<&str>) -> InMemElement {
    match value {
        Some(value) => text(tag, vr, value),
        None => DataElement::new(tag, vr, PrimitiveValue::Empty),
    }
}

fn sequence(tag: Tag, items: Vec<InMemDicomObject>) -> InMemElement {
    DataElement::new(tag, VR::SQ, DataSetSequence::from(items))
}

/// Decimal string of at most 16 characters.
fn format_decimal(value: f64) -> String {
    let formatted = format!("{value:.4}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}

/// UUID-derived UID under the `2.25` root.
pub fn generate_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}
