//! Multi-label volume to named structure masks.
//!
//! The segmentation tool stores label volumes as (column, row, slice), the
//! NIfTI voxel order, while structure set masks are (row, column, slice). The
//! two are bridged in exactly one place, [`LabelVolume::to_patient_frame`],
//! and the mapper only accepts the corrected [`PatientLabels`]. Skipping the
//! swap would not fail, it would silently transpose every contour.

use crate::catalogue::LabelCatalogue;

use ndarray::parallel::prelude::*;
use ndarray::{Array3, ArrayD, Axis, Ix3};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("Label {label} is present in the label volume but missing from the label catalogue")]
    UnknownLabel { label: u8 },

    #[error("Malformed label volume {}: {reason}", path.display())]
    MalformedLabelVolume { path: PathBuf, reason: String },

    #[error("Could not read label volume {}: {source}", path.display())]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },
}

/// Label volume in the voxel order it was stored in: (column, row, slice).
#[derive(Debug, Clone, PartialEq)]
pub struct LabelVolume {
    data: Array3<u8>,
}

impl LabelVolume {
    pub fn new(data: Array3<u8>) -> Self {
        Self { data }
    }

    /// Read a label volume from a NIfTI file.
    ///
    /// # Errors
    ///
    /// Fails with [`MapperError::MalformedLabelVolume`] unless the volume is
    /// three dimensional (trailing singleton dimensions are dropped) and every
    /// voxel holds an integer between 0 and 255.
    pub fn open(path: &Path) -> Result<Self, MapperError> {
        let nifti_error = |source| MapperError::Nifti {
            path: path.to_path_buf(),
            source,
        };
        let data = ReaderOptions::new()
            .read_file(path)
            .map_err(nifti_error)?
            .into_volume()
            .into_ndarray::<f32>()
            .map_err(nifti_error)?;

        Self::from_values(data, path)
    }

    /// Validate raw voxel values and narrow them to label values.
    pub fn from_values(mut data: ArrayD<f32>, path: &Path) -> Result<Self, MapperError> {
        let malformed = |reason: String| MapperError::MalformedLabelVolume {
            path: path.to_path_buf(),
            reason,
        };

        let shape = data.shape().to_vec();
        if shape.len() < 3 || shape[3..].iter().any(|&extent| extent != 1) {
            return Err(malformed(format!("expected a 3D volume, found shape {shape:?}")));
        }
        while data.ndim() > 3 {
            let last = Axis(data.ndim() - 1);
            data = data.index_axis_move(last, 0);
        }
        let data = data
            .into_dimensionality::<Ix3>()
            .map_err(|e| malformed(e.to_string()))?;

        if let Some(value) = data
            .iter()
            .find(|v| !v.is_finite() || v.fract() != 0.0 || **v < 0.0 || **v > u8::MAX as f32)
        {
            return Err(malformed(format!(
                "voxel value {value} is not a label between 0 and {}",
                u8::MAX
            )));
        }

        Ok(Self::new(data.mapv(|v| v as u8)))
    }

    /// Get the dimensions as stored (columns, rows, slices)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &Array3<u8> {
        &self.data
    }

    /// Swap axes 0 and 1 so the volume is indexed (row, column, slice) like
    /// the DICOM series it was derived from.
    pub fn to_patient_frame(self) -> PatientLabels {
        let data = self
            .data
            .permuted_axes([1, 0, 2])
            .as_standard_layout()
            .into_owned();
        PatientLabels { data }
    }
}

/// Label volume indexed (row, column, slice).
#[derive(Debug, Clone, PartialEq)]
pub struct PatientLabels {
    data: Array3<u8>,
}

impl PatientLabels {
    /// Get the dimensions (rows, columns, slices)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &Array3<u8> {
        &self.data
    }
}

/// Voxels of one structure, true where the label volume equals `label`.
#[derive(Debug, Clone)]
pub struct StructureMask {
    pub label: u8,
    pub name: String,
    pub mask: Array3<bool>,
}

pub struct LabelVolumeMapper {
    catalogue: LabelCatalogue,
}

impl LabelVolumeMapper {
    pub fn new(catalogue: LabelCatalogue) -> Self {
        Self { catalogue }
    }

    /// Distinct non-zero labels present in the volume, ascending.
    pub fn labels_present(labels: &PatientLabels) -> Vec<u8> {
        let seen = labels
            .data
            .par_iter()
            .fold(
                || [false; 256],
                |mut seen, &label| {
                    seen[label as usize] = true;
                    seen
                },
            )
            .reduce(
                || [false; 256],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(a, b)| *a |= b);
                    a
                },
            );

        (1..=u8::MAX).filter(|&label| seen[label as usize]).collect()
    }

    /// Resolve every label present to its structure name and return the
    /// masks as a lazy sequence in ascending label order.
    ///
    /// # Errors
    ///
    /// [`MapperError::UnknownLabel`] if any present label has no catalogue
    /// entry. Names are resolved up front, so no mask is produced in that case.
    pub fn map<'a>(&self, labels: &'a PatientLabels) -> Result<StructureMasks<'a>, MapperError> {
        let pending = Self::labels_present(labels)
            .into_iter()
            .map(|label| {
                let name = self
                    .catalogue
                    .name(label)
                    .ok_or(MapperError::UnknownLabel { label })?;
                debug!("Label {label} -> {name}");
                Ok((label, name.to_string()))
            })
            .collect::<Result<Vec<_>, MapperError>>()?;

        Ok(StructureMasks {
            data: &labels.data,
            pending: pending.into_iter(),
        })
    }
}

/// Iterator over the structure masks of a label volume.
pub struct StructureMasks<'a> {
    data: &'a Array3<u8>,
    pending: std::vec::IntoIter<(u8, String)>,
}

impl Iterator for StructureMasks<'_> {
    type Item = StructureMask;

    fn next(&mut self) -> Option<Self::Item> {
        let (label, name) = self.pending.next()?;
        Some(StructureMask {
            label,
            name,
            mask: self.data.mapv(|value| value == label),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.pending.size_hint()
    }
}

impl ExactSizeIterator for StructureMasks<'_> {}
