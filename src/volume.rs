use crate::enums::SortBy;
use crate::series::{InputSeriesError, SeriesGeometry, SeriesLoader, SliceInfo, SliceSeries};
use crate::staging;

use dicom::object::open_file;
use dicom::pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption};
use nalgebra::{Matrix4, Vector4};
use ndarray::{Array2, Array3, s};
use nifti::{NiftiHeader, writer::WriterOptions};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use web_time::Instant;

/// NIfTI `xyzt_units` code for millimetres
const NIFTI_UNITS_MM: u8 = 2;
/// NIfTI xform code for scanner-based anatomical coordinates
const NIFTI_XFORM_SCANNER_ANAT: i16 = 1;

#[derive(Debug, Error)]
pub enum VolumeWriteError {
    #[error("Could not write NIfTI volume {}: {source}", path.display())]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error(transparent)]
    Series(#[from] InputSeriesError),

    #[error(transparent)]
    Write(#[from] VolumeWriteError),
}

/// Scalar volume of a series in (depth, height, width) layout together with
/// its patient-space geometry.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f32>,
    pub geometry: SeriesGeometry,
}

impl Volume {
    pub fn new(data: Array3<f32>, geometry: SeriesGeometry) -> Self {
        Self { data, geometry }
    }

    /// Decode every slice of `series` with the modality LUT applied.
    ///
    /// # Errors
    ///
    /// A failure to read or decode any single slice fails the whole volume.
    pub fn from_series(series: &SliceSeries) -> Result<Self, InputSeriesError> {
        let images: Vec<Array2<f32>> = series
            .slices()
            .par_iter()
            .map(Self::decode_slice)
            .collect::<Result<_, _>>()?;

        Self::validate_dimensions(series.slices(), &images)?;

        Ok(Self::new(
            Self::build_volume_array(&images),
            series.geometry().clone(),
        ))
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Voxel-to-world transform in NIfTI convention: voxel index
    /// (column, row, slice) to RAS millimetres.
    pub fn ras_affine(&self) -> Matrix4<f64> {
        let g = &self.geometry;
        let (r, c, n, o) = (
            g.row_direction * g.column_spacing,
            g.column_direction * g.row_spacing,
            g.slice_direction * g.slice_spacing,
            g.origin,
        );
        #[rustfmt::skip]
        let lps = Matrix4::new(
            r.x, c.x, n.x, o.x,
            r.y, c.y, n.y, o.y,
            r.z, c.z, n.z, o.z,
            0.0, 0.0, 0.0, 1.0,
        );
        // DICOM is LPS, NIfTI is RAS
        Matrix4::from_diagonal(&Vector4::new(-1.0, -1.0, 1.0, 1.0)) * lps
    }

    /// Write the volume as a NIfTI file, replacing any existing file.
    ///
    /// The file is written next to `path` first and moved into place once
    /// complete.
    pub fn write_nifti(&self, path: &Path) -> Result<(), VolumeWriteError> {
        let g = &self.geometry;
        let mut header = NiftiHeader::default();
        header.set_affine(&self.ras_affine());
        header.sform_code = NIFTI_XFORM_SCANNER_ANAT;
        header.qform_code = NIFTI_XFORM_SCANNER_ANAT;
        header.pixdim[1] = g.column_spacing as f32;
        header.pixdim[2] = g.row_spacing as f32;
        header.pixdim[3] = g.slice_spacing as f32;
        header.xyzt_units = NIFTI_UNITS_MM;

        // NIfTI indexes voxels as (i, j, k) = (column, row, slice)
        let data = self.data.view().permuted_axes([2, 1, 0]);

        let partial = staging::partial_path(path);
        WriterOptions::new(&partial)
            .reference_header(&header)
            .write_nifti(&data)
            .map_err(|source| VolumeWriteError::Nifti {
                path: partial.clone(),
                source,
            })?;
        staging::commit(&partial, path).map_err(|source| VolumeWriteError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn decode_slice(slice: &SliceInfo) -> Result<Array2<f32>, InputSeriesError> {
        let pixel_error = |reason: String| InputSeriesError::PixelData {
            path: slice.path.clone(),
            reason,
        };

        let dicom_object = open_file(&slice.path).map_err(|source| InputSeriesError::Read {
            path: slice.path.clone(),
            source,
        })?;
        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(|e| pixel_error(e.to_string()))?;
        let options = ConvertOptions::new()
            .with_modality_lut(ModalityLutOption::Default)
            .with_voi_lut(VoiLutOption::Identity);
        let image: Array2<f32> = pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map_err(|e| pixel_error(e.to_string()))?
            .slice_move(s![0, .., .., 0]);

        debug!(
            "Decoded {} ({}x{})",
            slice.path.display(),
            image.dim().0,
            image.dim().1
        );
        Ok(image)
    }

    fn validate_dimensions(
        slices: &[SliceInfo],
        images: &[Array2<f32>],
    ) -> Result<(), InputSeriesError> {
        for (slice, image) in slices.iter().zip(images) {
            let (rows, columns) = image.dim();
            if (rows, columns) != (slice.rows, slice.columns) {
                return Err(InputSeriesError::InconsistentDimensions {
                    path: slice.path.clone(),
                    rows,
                    columns,
                    expected_rows: slice.rows,
                    expected_columns: slice.columns,
                });
            }
        }
        Ok(())
    }

    fn build_volume_array(images: &[Array2<f32>]) -> Array3<f32> {
        let (height, width) = images[0].dim();
        let depth = images.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, image) in images.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(image);
        }

        volume
    }
}

pub struct VolumeConverter;

impl VolumeConverter {
    /// Read the series in `dicom_dir` and write it as a single NIfTI volume.
    ///
    /// Returns the ordered series so later stages reuse exactly the slice
    /// order the volume was built with.
    pub fn convert(
        dicom_dir: &Path,
        output: &Path,
        sort_by: SortBy,
    ) -> Result<SliceSeries, ConversionError> {
        let started = Instant::now();
        let series = SeriesLoader::load_from_directory(dicom_dir, sort_by)?;
        let volume = Volume::from_series(&series)?;
        volume.write_nifti(output)?;

        let (depth, height, width) = volume.dim();
        info!(
            "Converted {} slices ({width}x{height}x{depth}) to {} in {:.1?}",
            series.len(),
            output.display(),
            started.elapsed()
        );
        Ok(series)
    }
}
