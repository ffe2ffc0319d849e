use crate::enums::SortBy;

use dicom::core::Tag;
use dicom::object::{InMemDicomObject, open_file};
use dicom_dictionary_std::tags;
use nalgebra::Vector3;
use rayon::prelude::*;
use std::{
    cmp::Ordering,
    fs,
    io::Read,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

const POSITION_TOLERANCE: f64 = 1e-4;
const ORIENTATION_TOLERANCE: f64 = 1e-4;
const SPACING_DEVIATION: f64 = 0.01;

#[derive(Debug, Error)]
pub enum InputSeriesError {
    #[error("No DICOM slices found in {}", path.display())]
    NoValidImages { path: PathBuf },

    #[error("Could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: dicom::object::ReadError,
    },

    #[error("Could not decode pixel data of {}: {reason}", path.display())]
    PixelData { path: PathBuf, reason: String },

    #[error("{} is missing required attribute {attribute}", path.display())]
    MissingAttribute {
        path: PathBuf,
        attribute: &'static str,
    },

    #[error("Slices belong to more than one series ({first} and {second})")]
    MultipleSeries { first: String, second: String },

    #[error(
        "Image {} is {rows}x{columns}, expected {expected_rows}x{expected_columns}",
        path.display()
    )]
    InconsistentDimensions {
        path: PathBuf,
        rows: usize,
        columns: usize,
        expected_rows: usize,
        expected_columns: usize,
    },

    #[error("Inconsistent image orientation in {}", path.display())]
    InconsistentOrientation { path: PathBuf },

    #[error("Cannot order slices: {reason}")]
    Unsortable { reason: String },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Spatial and identifying attributes of a single slice.
#[derive(Debug, Clone)]
pub struct SliceInfo {
    pub path: PathBuf,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub series_instance_uid: String,
    pub instance_number: Option<i32>,
    /// Image Position (Patient), the LPS centre of the first transmitted pixel
    pub position: Vector3<f64>,
    /// Direction of increasing column index
    pub row_direction: Vector3<f64>,
    /// Direction of increasing row index
    pub column_direction: Vector3<f64>,
    /// Distance between adjacent rows, in mm
    pub row_spacing: f64,
    /// Distance between adjacent columns, in mm
    pub column_spacing: f64,
    pub rows: usize,
    pub columns: usize,
    pub slice_thickness: Option<f64>,
}

impl SliceInfo {
    /// Extract slice attributes from a parsed DICOM data set.
    ///
    /// # Errors
    ///
    /// Returns [`InputSeriesError::MissingAttribute`] if any attribute needed
    /// to place the slice in patient space is absent or malformed.
    pub fn from_object(path: &Path, obj: &InMemDicomObject) -> Result<Self, InputSeriesError> {
        let position = required_floats(
            obj,
            path,
            tags::IMAGE_POSITION_PATIENT,
            "ImagePositionPatient",
            3,
        )?;
        let orientation = required_floats(
            obj,
            path,
            tags::IMAGE_ORIENTATION_PATIENT,
            "ImageOrientationPatient",
            6,
        )?;
        let spacing = required_floats(obj, path, tags::PIXEL_SPACING, "PixelSpacing", 2)?;

        Ok(Self {
            path: path.to_path_buf(),
            sop_class_uid: required_str(obj, path, tags::SOP_CLASS_UID, "SOPClassUID")?,
            sop_instance_uid: required_str(obj, path, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
            series_instance_uid: required_str(
                obj,
                path,
                tags::SERIES_INSTANCE_UID,
                "SeriesInstanceUID",
            )?,
            instance_number: obj
                .element(tags::INSTANCE_NUMBER)
                .ok()
                .and_then(|e| e.to_int::<i32>().ok()),
            position: Vector3::new(position[0], position[1], position[2]),
            row_direction: Vector3::new(orientation[0], orientation[1], orientation[2]),
            column_direction: Vector3::new(orientation[3], orientation[4], orientation[5]),
            row_spacing: spacing[0],
            column_spacing: spacing[1],
            rows: required_usize(obj, path, tags::ROWS, "Rows")?,
            columns: required_usize(obj, path, tags::COLUMNS, "Columns")?,
            slice_thickness: obj
                .element(tags::SLICE_THICKNESS)
                .ok()
                .and_then(|e| e.to_float64().ok()),
        })
    }

    /// Unit normal of the image plane (row direction x column direction).
    pub fn normal(&self) -> Vector3<f64> {
        self.row_direction.cross(&self.column_direction).normalize()
    }

    /// Signed distance of this slice along `normal`.
    pub fn location(&self, normal: &Vector3<f64>) -> f64 {
        self.position.dot(normal)
    }

    /// Patient-space (LPS) coordinate of a point given in fractional
    /// (column, row) pixel-centre coordinates of this slice.
    pub fn pixel_to_patient(&self, column: f64, row: f64) -> Vector3<f64> {
        self.position
            + self.row_direction * (column * self.column_spacing)
            + self.column_direction * (row * self.row_spacing)
    }
}

/// Study-level attributes shared by all slices and carried into derived objects.
#[derive(Debug, Clone, Default)]
pub struct StudyContext {
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub study_instance_uid: String,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub study_id: Option<String>,
    pub study_description: Option<String>,
    pub accession_number: Option<String>,
    pub referring_physician_name: Option<String>,
    pub frame_of_reference_uid: String,
    pub series_instance_uid: String,
}

impl StudyContext {
    pub fn from_object(path: &Path, obj: &InMemDicomObject) -> Result<Self, InputSeriesError> {
        Ok(Self {
            patient_name: optional_str(obj, tags::PATIENT_NAME),
            patient_id: optional_str(obj, tags::PATIENT_ID),
            patient_birth_date: optional_str(obj, tags::PATIENT_BIRTH_DATE),
            patient_sex: optional_str(obj, tags::PATIENT_SEX),
            study_instance_uid: required_str(
                obj,
                path,
                tags::STUDY_INSTANCE_UID,
                "StudyInstanceUID",
            )?,
            study_date: optional_str(obj, tags::STUDY_DATE),
            study_time: optional_str(obj, tags::STUDY_TIME),
            study_id: optional_str(obj, tags::STUDY_ID),
            study_description: optional_str(obj, tags::STUDY_DESCRIPTION),
            accession_number: optional_str(obj, tags::ACCESSION_NUMBER),
            referring_physician_name: optional_str(obj, tags::REFERRING_PHYSICIAN_NAME),
            frame_of_reference_uid: required_str(
                obj,
                path,
                tags::FRAME_OF_REFERENCE_UID,
                "FrameOfReferenceUID",
            )?,
            series_instance_uid: required_str(
                obj,
                path,
                tags::SERIES_INSTANCE_UID,
                "SeriesInstanceUID",
            )?,
        })
    }
}

/// Voxel grid of an ordered series in patient (LPS) space.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesGeometry {
    pub origin: Vector3<f64>,
    pub row_direction: Vector3<f64>,
    pub column_direction: Vector3<f64>,
    /// Direction from the first towards the last slice
    pub slice_direction: Vector3<f64>,
    pub row_spacing: f64,
    pub column_spacing: f64,
    pub slice_spacing: f64,
}

/// An ordered, validated single-series stack of slices.
#[derive(Debug, Clone)]
pub struct SliceSeries {
    slices: Vec<SliceInfo>,
    study: StudyContext,
    geometry: SeriesGeometry,
}

impl SliceSeries {
    /// Slices in stacking order.
    pub fn slices(&self) -> &[SliceInfo] {
        &self.slices
    }

    pub fn study(&self) -> &StudyContext {
        &self.study
    }

    pub fn geometry(&self) -> &SeriesGeometry {
        &self.geometry
    }

    /// Get the dimensions of the series (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        let first = &self.slices[0];
        (self.slices.len(), first.rows, first.columns)
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Always false, a series holds at least one slice.
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

pub struct SeriesLoader;

impl SeriesLoader {
    /// Load the series stored in a directory
    ///
    /// Every regular file carrying the DICOM preamble is treated as a slice.
    /// Files without the preamble are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if no slices are found, if any slice fails to parse,
    /// or if the slices do not form a single orderable series
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<SliceSeries, InputSeriesError> {
        let dir = path.as_ref();
        let io_error = |source| InputSeriesError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            if !path.is_file() {
                continue;
            }
            if has_dicom_preamble(&path)? {
                paths.push(path);
            } else {
                debug!("Skipping non-DICOM file {}", path.display());
            }
        }

        if paths.is_empty() {
            return Err(InputSeriesError::NoValidImages {
                path: dir.to_path_buf(),
            });
        }

        // directory listing order is platform dependent
        paths.sort();

        Self::load_from_file_paths(&paths, sort_by)
    }

    /// Load a series from explicit file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<SliceSeries, InputSeriesError> {
        let parsed: Vec<(SliceInfo, StudyContext)> = paths
            .par_iter()
            .map(|path| -> Result<_, InputSeriesError> {
                let path = path.as_ref();
                let obj = open_file(path).map_err(|source| InputSeriesError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Ok((
                    SliceInfo::from_object(path, &obj)?,
                    StudyContext::from_object(path, &obj)?,
                ))
            })
            .collect::<Result<_, InputSeriesError>>()?;

        let mut parsed = parsed.into_iter();
        let Some((first, study)) = parsed.next() else {
            return Err(InputSeriesError::NoValidImages {
                path: PathBuf::new(),
            });
        };
        let slices = std::iter::once(first)
            .chain(parsed.map(|(slice, _)| slice))
            .collect();

        Self::from_slices(slices, study, sort_by)
    }

    /// Validate and order already extracted slices
    pub fn from_slices(
        mut slices: Vec<SliceInfo>,
        study: StudyContext,
        sort_by: SortBy,
    ) -> Result<SliceSeries, InputSeriesError> {
        if slices.is_empty() {
            return Err(InputSeriesError::NoValidImages {
                path: PathBuf::new(),
            });
        }

        Self::validate_series(&slices)?;
        Self::sort_slices(&mut slices, sort_by)?;
        let geometry = Self::compute_geometry(&slices)?;

        debug!(
            "Ordered {} slices, spacing {:.3}x{:.3}x{:.3} mm",
            slices.len(),
            geometry.column_spacing,
            geometry.row_spacing,
            geometry.slice_spacing
        );

        Ok(SliceSeries {
            slices,
            study,
            geometry,
        })
    }

    fn validate_series(slices: &[SliceInfo]) -> Result<(), InputSeriesError> {
        let first = &slices[0];
        for slice in slices {
            if slice.series_instance_uid != first.series_instance_uid {
                return Err(InputSeriesError::MultipleSeries {
                    first: first.series_instance_uid.clone(),
                    second: slice.series_instance_uid.clone(),
                });
            }
            if slice.rows != first.rows || slice.columns != first.columns {
                return Err(InputSeriesError::InconsistentDimensions {
                    path: slice.path.clone(),
                    rows: slice.rows,
                    columns: slice.columns,
                    expected_rows: first.rows,
                    expected_columns: first.columns,
                });
            }
            let row_deviation = (slice.row_direction - first.row_direction).amax();
            let column_deviation = (slice.column_direction - first.column_direction).amax();
            if row_deviation > ORIENTATION_TOLERANCE || column_deviation > ORIENTATION_TOLERANCE {
                return Err(InputSeriesError::InconsistentOrientation {
                    path: slice.path.clone(),
                });
            }
        }
        Ok(())
    }

    fn sort_slices(slices: &mut [SliceInfo], sort_by: SortBy) -> Result<(), InputSeriesError> {
        let normal = slices[0].normal();
        let by_location =
            |a: &SliceInfo, b: &SliceInfo| a.location(&normal).total_cmp(&b.location(&normal));
        let by_uid = |a: &SliceInfo, b: &SliceInfo| a.sop_instance_uid.cmp(&b.sop_instance_uid);

        match sort_by {
            SortBy::ImagePositionPatient => {
                slices.sort_by(|a, b| {
                    by_location(a, b)
                        .then_with(|| a.instance_number.cmp(&b.instance_number))
                        .then_with(|| by_uid(a, b))
                });
            }
            SortBy::InstanceNumber => {
                if let Some(slice) = slices.iter().find(|s| s.instance_number.is_none()) {
                    return Err(InputSeriesError::Unsortable {
                        reason: format!("{} has no InstanceNumber", slice.path.display()),
                    });
                }
                slices.sort_by(|a, b| {
                    a.instance_number
                        .cmp(&b.instance_number)
                        .then_with(|| by_location(a, b))
                        .then_with(|| by_uid(a, b))
                });

                let locations: Vec<f64> = slices.iter().map(|s| s.location(&normal)).collect();
                let ascending = locations.windows(2).all(|w| w[1] - w[0] > -POSITION_TOLERANCE);
                let descending = locations.windows(2).all(|w| w[0] - w[1] > -POSITION_TOLERANCE);
                if !ascending && !descending {
                    return Err(InputSeriesError::Unsortable {
                        reason: "InstanceNumber order is not monotonic along the slice normal"
                            .to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    fn compute_geometry(slices: &[SliceInfo]) -> Result<SeriesGeometry, InputSeriesError> {
        let first = &slices[0];
        let last = &slices[slices.len() - 1];

        let (slice_direction, slice_spacing) = if slices.len() > 1 {
            let extent = last.position - first.position;
            let distance = extent.norm();
            if distance < POSITION_TOLERANCE {
                return Err(InputSeriesError::Unsortable {
                    reason: format!("all {} slices share the same position", slices.len()),
                });
            }
            (extent / distance, distance / (slices.len() - 1) as f64)
        } else {
            let thickness = first.slice_thickness.filter(|t| *t > 0.0).unwrap_or(1.0);
            (first.normal(), thickness)
        };

        if let Some(pair) = slices.windows(2).find(|pair| {
            let gap = (pair[1].position - pair[0].position).norm();
            (gap - slice_spacing).abs() > slice_spacing * SPACING_DEVIATION
        }) {
            warn!(
                "Non-uniform slice spacing between {} and {} (mean spacing {:.3} mm)",
                pair[0].path.display(),
                pair[1].path.display(),
                slice_spacing
            );
        }

        Ok(SeriesGeometry {
            origin: first.position,
            row_direction: first.row_direction,
            column_direction: first.column_direction,
            slice_direction,
            row_spacing: first.row_spacing,
            column_spacing: first.column_spacing,
            slice_spacing,
        })
    }
}

fn has_dicom_preamble(path: &Path) -> Result<bool, InputSeriesError> {
    let mut header = [0u8; 132];
    let mut file = fs::File::open(path).map_err(|source| InputSeriesError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match file.read_exact(&mut header) {
        Ok(()) => Ok(&header[128..] == b"DICM"),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(source) => Err(InputSeriesError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn optional_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = obj.element(tag).ok()?.to_str().ok()?;
    let value = value.trim_end_matches(['\0', ' ']);
    (!value.is_empty()).then(|| value.to_string())
}

fn required_str(
    obj: &InMemDicomObject,
    path: &Path,
    tag: Tag,
    attribute: &'static str,
) -> Result<String, InputSeriesError> {
    optional_str(obj, tag).ok_or_else(|| InputSeriesError::MissingAttribute {
        path: path.to_path_buf(),
        attribute,
    })
}

fn required_floats(
    obj: &InMemDicomObject,
    path: &Path,
    tag: Tag,
    attribute: &'static str,
    count: usize,
) -> Result<Vec<f64>, InputSeriesError> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_multi_float64().ok())
        .filter(|values| values.len() >= count)
        .ok_or_else(|| InputSeriesError::MissingAttribute {
            path: path.to_path_buf(),
            attribute,
        })
}

fn required_usize(
    obj: &InMemDicomObject,
    path: &Path,
    tag: Tag,
    attribute: &'static str,
) -> Result<usize, InputSeriesError> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_int::<u32>().ok())
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .ok_or_else(|| InputSeriesError::MissingAttribute {
            path: path.to_path_buf(),
            attribute,
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::object::FileMetaTableBuilder;
    use dicom_dictionary_std::uids;

    fn strs(values: &[String]) -> PrimitiveValue {
        PrimitiveValue::Strs(values.iter().cloned().collect())
    }

    /// Axial slice object at height `z`, 4x4 pixels of 0.5 x 0.75 mm.
    pub(crate) fn axial_slice(z: f64, instance: i32, series: &str) -> InMemDicomObject {
        let position = [-10.0, 20.0, z].map(|v| v.to_string());
        let orientation = ["1", "0", "0", "0", "1", "0"].map(String::from);
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.2"),
            ),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(format!("1.2.3.{instance}")),
            ),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3")),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(series)),
            DataElement::new(tags::FRAME_OF_REFERENCE_UID, VR::UI, PrimitiveValue::from("1.2.3.9")),
            DataElement::new(
                tags::INSTANCE_NUMBER,
                VR::IS,
                PrimitiveValue::from(instance.to_string()),
            ),
            DataElement::new(tags::IMAGE_POSITION_PATIENT, VR::DS, strs(&position)),
            DataElement::new(tags::IMAGE_ORIENTATION_PATIENT, VR::DS, strs(&orientation)),
            DataElement::new(tags::PIXEL_SPACING, VR::DS, strs(&["0.5".into(), "0.75".into()])),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(4_u16)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(4_u16)),
        ])
    }

    fn slice_info(z: f64, instance: i32) -> SliceInfo {
        let path = PathBuf::from(format!("slice{instance}.dcm"));
        SliceInfo::from_object(&path, &axial_slice(z, instance, "1.2.3.4")).unwrap()
    }

    fn study() -> StudyContext {
        StudyContext::from_object(Path::new("slice.dcm"), &axial_slice(0.0, 1, "1.2.3.4")).unwrap()
    }

    #[test]
    fn extracts_slice_attributes() {
        let info = slice_info(2.5, 7);
        assert_eq!(info.instance_number, Some(7));
        assert_eq!(info.sop_instance_uid, "1.2.3.7");
        assert_eq!((info.rows, info.columns), (4, 4));
        assert_eq!(info.row_spacing, 0.5);
        assert_eq!(info.column_spacing, 0.75);
        assert_eq!(info.position, Vector3::new(-10.0, 20.0, 2.5));
        assert_eq!(info.normal(), Vector3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn missing_position_is_reported() {
        let mut obj = axial_slice(0.0, 1, "1.2.3.4");
        obj.remove_element(tags::IMAGE_POSITION_PATIENT);
        let err = SliceInfo::from_object(Path::new("a.dcm"), &obj).unwrap_err();
        assert!(matches!(
            err,
            InputSeriesError::MissingAttribute {
                attribute: "ImagePositionPatient",
                ..
            }
        ));
    }

    #[test]
    fn sorts_by_ascending_position() {
        let slices = vec![slice_info(5.0, 1), slice_info(-5.0, 3), slice_info(0.0, 2)];
        let series =
            SeriesLoader::from_slices(slices, study(), SortBy::ImagePositionPatient).unwrap();
        let z: Vec<f64> = series.slices().iter().map(|s| s.position.z).collect();
        assert_eq!(z, vec![-5.0, 0.0, 5.0]);
        assert_eq!(series.dim(), (3, 4, 4));
        assert_eq!(series.geometry().slice_spacing, 5.0);
        assert_eq!(series.geometry().slice_direction, Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(series.geometry().origin.z, -5.0);
    }

    #[test]
    fn equal_positions_fall_back_to_instance_number() {
        let slices = vec![
            slice_info(1.0, 4),
            slice_info(0.0, 9),
            slice_info(0.0, 2),
            slice_info(1.0, 3),
        ];
        let series =
            SeriesLoader::from_slices(slices, study(), SortBy::ImagePositionPatient).unwrap();
        let order: Vec<i32> = series
            .slices()
            .iter()
            .filter_map(|s| s.instance_number)
            .collect();
        assert_eq!(order, vec![2, 9, 3, 4]);
    }

    #[test]
    fn ordering_is_independent_of_input_order() {
        let forward = vec![slice_info(0.0, 1), slice_info(1.0, 2), slice_info(2.0, 3)];
        let mut backward = forward.clone();
        backward.reverse();

        let a = SeriesLoader::from_slices(forward, study(), SortBy::ImagePositionPatient).unwrap();
        let b = SeriesLoader::from_slices(backward, study(), SortBy::ImagePositionPatient).unwrap();
        let uids = |s: &SliceSeries| {
            s.slices()
                .iter()
                .map(|s| s.sop_instance_uid.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(uids(&a), uids(&b));
    }

    #[test]
    fn sorts_by_instance_number() {
        let slices = vec![slice_info(0.0, 3), slice_info(2.0, 1), slice_info(1.0, 2)];
        let series = SeriesLoader::from_slices(slices, study(), SortBy::InstanceNumber).unwrap();
        let z: Vec<f64> = series.slices().iter().map(|s| s.position.z).collect();
        assert_eq!(z, vec![2.0, 1.0, 0.0]);
        assert_eq!(series.geometry().slice_direction, Vector3::new(0.0, 0.0, -1.0));
        assert_eq!(series.geometry().slice_spacing, 1.0);
    }

    #[test]
    fn instance_order_must_follow_the_slice_normal() {
        let slices = vec![slice_info(0.0, 3), slice_info(1.0, 1), slice_info(2.0, 2)];
        let err = SeriesLoader::from_slices(slices, study(), SortBy::InstanceNumber).unwrap_err();
        assert!(matches!(err, InputSeriesError::Unsortable { .. }));
    }

    #[test]
    fn closely_spaced_slices_stay_monotonic() {
        let slices: Vec<SliceInfo> = (0..40)
            .map(|i| slice_info(i as f64 * 6e-5, 40 - i))
            .collect();
        let series =
            SeriesLoader::from_slices(slices, study(), SortBy::ImagePositionPatient).unwrap();
        let z: Vec<f64> = series.slices().iter().map(|s| s.position.z).collect();
        assert!(z.windows(2).all(|w| w[0] <= w[1]), "{z:?}");
    }

    #[test]
    fn instance_ordering_requires_instance_numbers() {
        let mut slices = vec![slice_info(0.0, 1), slice_info(1.0, 2)];
        slices[1].instance_number = None;
        let err = SeriesLoader::from_slices(slices, study(), SortBy::InstanceNumber).unwrap_err();
        assert!(matches!(err, InputSeriesError::Unsortable { .. }));
    }

    #[test]
    fn rejects_mixed_series() {
        let path = PathBuf::from("other.dcm");
        let other = SliceInfo::from_object(&path, &axial_slice(1.0, 2, "9.9.9")).unwrap();
        let slices = vec![slice_info(0.0, 1), other];
        let err =
            SeriesLoader::from_slices(slices, study(), SortBy::ImagePositionPatient).unwrap_err();
        assert!(matches!(err, InputSeriesError::MultipleSeries { .. }));
    }

    #[test]
    fn rejects_inconsistent_dimensions() {
        let mut slices = vec![slice_info(0.0, 1), slice_info(1.0, 2)];
        slices[1].columns = 8;
        let err =
            SeriesLoader::from_slices(slices, study(), SortBy::ImagePositionPatient).unwrap_err();
        assert!(matches!(err, InputSeriesError::InconsistentDimensions { columns: 8, .. }));
    }

    #[test]
    fn rejects_degenerate_stack() {
        let slices = vec![slice_info(0.0, 1), slice_info(0.0, 2)];
        let err =
            SeriesLoader::from_slices(slices, study(), SortBy::ImagePositionPatient).unwrap_err();
        assert!(matches!(err, InputSeriesError::Unsortable { .. }));
    }

    #[test]
    fn single_slice_uses_thickness() {
        let mut slice = slice_info(0.0, 1);
        slice.slice_thickness = Some(2.5);
        let series =
            SeriesLoader::from_slices(vec![slice], study(), SortBy::ImagePositionPatient).unwrap();
        assert_eq!(series.geometry().slice_spacing, 2.5);
    }

    pub(crate) fn write_slices(dir: &Path, positions: &[f64]) {
        for (i, &z) in positions.iter().enumerate() {
            let instance = i as i32 + 1;
            let meta = FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
                .media_storage_sop_instance_uid(format!("1.2.3.{instance}"));
            axial_slice(z, instance, "1.2.3.4")
                .with_meta(meta)
                .unwrap()
                .write_to_file(dir.join(format!("slice{instance}.dcm")))
                .unwrap();
        }
    }

    /// DICM preamble followed by bytes that are no file meta group.
    pub(crate) fn write_corrupt_slice(path: &Path) {
        let mut bytes = vec![0_u8; 128];
        bytes.extend_from_slice(b"DICM");
        bytes.extend_from_slice(&[0xFF; 64]);
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn loads_headers_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_slices(dir.path(), &[2.0, 0.0, 1.0]);
        let series =
            SeriesLoader::load_from_directory(dir.path(), SortBy::ImagePositionPatient).unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series.slices()[0].sop_instance_uid, "1.2.3.2");
    }

    #[test]
    fn unreadable_slice_fails_the_series() {
        let dir = tempfile::tempdir().unwrap();
        write_slices(dir.path(), &[0.0, 1.0]);
        let corrupt = dir.path().join("slice9.dcm");
        write_corrupt_slice(&corrupt);

        let err = SeriesLoader::load_from_directory(dir.path(), SortBy::default()).unwrap_err();
        match err {
            InputSeriesError::Read { path, .. } => assert_eq!(path, corrupt),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_directory_has_no_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a dicom file").unwrap();
        let err = SeriesLoader::load_from_directory(dir.path(), SortBy::default()).unwrap_err();
        assert!(matches!(err, InputSeriesError::NoValidImages { .. }));
    }

    #[test]
    fn maps_pixel_centres_to_patient_space() {
        let info = slice_info(3.0, 1);
        let point = info.pixel_to_patient(2.0, 1.0);
        assert_eq!(point, Vector3::new(-10.0 + 2.0 * 0.75, 20.0 + 0.5, 3.0));
    }
}
