use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject, open_file};
use dicom_autoseg::catalogue::CatalogueSource;
use dicom_autoseg::rtstruct::{RT_STRUCTURE_SET_STORAGE, rt_tags};
use dicom_autoseg::segmentation::SegmentationError;
use dicom_autoseg::{Pipeline, PipelineConfig, Segmenter, Stage};
use dicom_dictionary_std::{tags, uids};
use ndarray::{Array3, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::fs;
use std::path::{Path, PathBuf};

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const ROWS: usize = 4;
const COLUMNS: usize = 4;
/// Slice positions along z, listed in the order the files are written
const POSITIONS: [f64; 3] = [5.0, 0.0, 2.5];

fn element(tag: Tag, vr: VR, value: impl Into<String>) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, vr, PrimitiveValue::from(value.into()))
}

fn decimals(tag: Tag, values: &[&str]) -> DataElement<InMemDicomObject> {
    DataElement::new(
        tag,
        VR::DS,
        PrimitiveValue::Strs(values.iter().map(|v| v.to_string()).collect()),
    )
}

/// Write one 4x4 axial CT slice whose stored values encode its z position.
fn write_slice(dir: &Path, file_name: &str, z: f64) {
    let sop_instance_uid = format!("1.2.826.0.1.3680043.2.{}", (z * 10.0) as u32 + 1);
    let pixels: Vec<u16> = (0..ROWS * COLUMNS)
        .map(|i| 1000 + i as u16 + (z * 10.0) as u16)
        .collect();
    let z = z.to_string();

    let obj = InMemDicomObject::from_element_iter([
        element(tags::SOP_CLASS_UID, VR::UI, CT_IMAGE_STORAGE),
        element(tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid.as_str()),
        element(tags::MODALITY, VR::CS, "CT"),
        element(tags::PATIENT_NAME, VR::PN, "Doe^Jane"),
        element(tags::PATIENT_ID, VR::LO, "P-1"),
        element(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1.3680043.1"),
        element(tags::SERIES_INSTANCE_UID, VR::UI, "1.2.826.0.1.3680043.1.1"),
        element(tags::FRAME_OF_REFERENCE_UID, VR::UI, "1.2.826.0.1.3680043.1.9"),
        decimals(tags::IMAGE_POSITION_PATIENT, &["-100", "-50", &z]),
        decimals(tags::IMAGE_ORIENTATION_PATIENT, &["1", "0", "0", "0", "1", "0"]),
        decimals(tags::PIXEL_SPACING, &["1", "2"]),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
        element(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2"),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(ROWS as u16)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(COLUMNS as u16)),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
        decimals(tags::RESCALE_INTERCEPT, &["-1024"]),
        decimals(tags::RESCALE_SLOPE, &["1"]),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(pixels.into())),
    ]);

    let file = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_instance_uid.as_str()),
        )
        .unwrap();
    file.write_to_file(dir.join(file_name)).unwrap();
}

fn write_series(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    for (i, z) in POSITIONS.into_iter().enumerate() {
        write_slice(dir, &format!("IM{i}"), z);
    }
    fs::write(dir.join("README.txt"), "not a DICOM file").unwrap();
}

fn write_catalogue(dir: &Path) -> PathBuf {
    let path = dir.join("labels.json");
    fs::write(&path, r#"{"1": "organA", "2": "organB"}"#).unwrap();
    path
}

/// Label volume as the segmentation tool stores it, (column, row, slice).
///
/// In the patient frame organA covers row 1, columns 0 and 1 of the lowest
/// slice and organB covers rows 2 and 3, column 3 of the highest slice.
fn stored_labels() -> Array3<u8> {
    let mut labels = Array3::<u8>::zeros((COLUMNS, ROWS, 3));
    labels[[0, 1, 0]] = 1;
    labels[[1, 1, 0]] = 1;
    labels[[3, 2, 2]] = 2;
    labels[[3, 3, 2]] = 2;
    labels
}

/// Stands in for the segmentation tool by writing a fixed label volume.
struct FixedSegmenter {
    labels: Option<Array3<u8>>,
}

impl Segmenter for FixedSegmenter {
    fn output_name(&self) -> &str {
        "segmentation.nii.gz"
    }

    async fn run(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, SegmentationError> {
        assert!(input.is_file(), "volume must exist before segmentation");
        let Some(labels) = &self.labels else {
            return Err(SegmentationError::OutputMissing {
                path: output_dir.join(self.output_name()),
            });
        };
        let path = output_dir.join(self.output_name());
        WriterOptions::new(&path).write_nifti(labels).unwrap();
        Ok(path)
    }
}

fn pipeline(dir: &Path, labels: Option<Array3<u8>>) -> Pipeline<FixedSegmenter> {
    let config = PipelineConfig {
        catalogue: CatalogueSource::File(write_catalogue(dir)),
        ..PipelineConfig::default()
    };
    Pipeline::new(config, FixedSegmenter { labels })
}

fn string(obj: &InMemDicomObject, tag: Tag) -> String {
    obj.element(tag).unwrap().to_str().unwrap().trim().to_string()
}

fn items(obj: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
    obj.element(tag).unwrap().items().unwrap()
}

#[tokio::test]
async fn converts_series_into_structure_set() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("dicom");
    let output = dir.path().join("results").join("patient");
    write_series(&input);

    let artifacts = pipeline(dir.path(), Some(stored_labels()))
        .run(&input, &output)
        .await
        .unwrap();

    assert_eq!(artifacts.volume, output.join("ct.nii.gz"));
    assert!(artifacts.labels.is_file());

    // volume slices follow the position order, not the file order
    let volume = ReaderOptions::new()
        .read_file(&artifacts.volume)
        .unwrap()
        .into_volume()
        .into_ndarray::<f32>()
        .unwrap()
        .into_dimensionality::<Ix3>()
        .unwrap();
    assert_eq!(volume.dim(), (COLUMNS, ROWS, 3));
    assert_eq!(volume[[0, 0, 0]], 1000.0 - 1024.0);
    assert_eq!(volume[[0, 0, 1]], 1025.0 - 1024.0);
    assert_eq!(volume[[3, 2, 2]], 1000.0 + 11.0 + 50.0 - 1024.0);

    let rtstruct = open_file(&artifacts.structure_set).unwrap();
    assert_eq!(string(&rtstruct, tags::SOP_CLASS_UID), RT_STRUCTURE_SET_STORAGE);
    assert_eq!(string(&rtstruct, tags::MODALITY), "RTSTRUCT");
    assert_eq!(string(&rtstruct, tags::PATIENT_ID), "P-1");
    assert_eq!(string(&rtstruct, tags::STUDY_INSTANCE_UID), "1.2.826.0.1.3680043.1");

    let names: Vec<String> = items(&rtstruct, rt_tags::STRUCTURE_SET_ROI_SEQUENCE)
        .iter()
        .map(|roi| string(roi, rt_tags::ROI_NAME))
        .collect();
    assert_eq!(names, vec!["organA", "organB"]);

    let roi_contours = items(&rtstruct, rt_tags::ROI_CONTOUR_SEQUENCE);
    let organ_a = &items(&roi_contours[0], rt_tags::CONTOUR_SEQUENCE)[0];
    let image = &items(organ_a, rt_tags::CONTOUR_IMAGE_SEQUENCE)[0];
    assert_eq!(string(image, tags::REFERENCED_SOP_INSTANCE_UID), "1.2.826.0.1.3680043.2.1");

    // organA spans two 2mm columns of one 1mm row
    let points = organ_a
        .element(rt_tags::CONTOUR_DATA)
        .unwrap()
        .to_multi_float64()
        .unwrap();
    assert_eq!(points.len(), 12);
    let xs: Vec<f64> = points.iter().step_by(3).copied().collect();
    let ys: Vec<f64> = points.iter().skip(1).step_by(3).copied().collect();
    let extent = |values: &[f64]| {
        let max = values.iter().copied().fold(f64::MIN, f64::max);
        let min = values.iter().copied().fold(f64::MAX, f64::min);
        max - min
    };
    assert_eq!(extent(&xs), 4.0);
    assert_eq!(extent(&ys), 1.0);
    assert_eq!(ys.iter().copied().fold(f64::MAX, f64::min), -50.0 + 0.5);
    assert!(points.iter().skip(2).step_by(3).all(|&z| z == 0.0));

    let organ_b = &items(&roi_contours[1], rt_tags::CONTOUR_SEQUENCE)[0];
    let image = &items(organ_b, rt_tags::CONTOUR_IMAGE_SEQUENCE)[0];
    assert_eq!(string(image, tags::REFERENCED_SOP_INSTANCE_UID), "1.2.826.0.1.3680043.2.51");
}

#[tokio::test]
async fn failed_segmentation_produces_no_structure_set() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("dicom");
    let output = dir.path().join("out");
    write_series(&input);
    fs::create_dir_all(&output).unwrap();
    fs::write(output.join("rtstruct.dcm"), b"from an earlier run").unwrap();

    let err = pipeline(dir.path(), None)
        .run(&input, &output)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Stage::Segmentation);
    assert_eq!(err.exit_code(), 3);
    assert!(output.join("ct.nii.gz").is_file());
    assert!(!output.join("rtstruct.dcm").exists());
}

#[tokio::test]
async fn unknown_label_fails_label_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("dicom");
    let output = dir.path().join("out");
    write_series(&input);
    let mut labels = stored_labels();
    labels[[2, 2, 1]] = 7;

    let err = pipeline(dir.path(), Some(labels))
        .run(&input, &output)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Stage::LabelMapping);
    assert_eq!(err.exit_code(), 4);
    assert!(err.to_string().contains("Label 7"));
    assert!(!output.join("rtstruct.dcm").exists());
}

#[tokio::test]
async fn label_volume_of_another_shape_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("dicom");
    let output = dir.path().join("out");
    write_series(&input);

    let err = pipeline(dir.path(), Some(Array3::<u8>::ones((COLUMNS, ROWS, 2))))
        .run(&input, &output)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Stage::LabelMapping);
    assert!(!output.join("rtstruct.dcm").exists());
}
