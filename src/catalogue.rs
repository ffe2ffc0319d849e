//! Label value to anatomical structure name lookup.
//!
//! Label numbering belongs to a specific version of the segmentation tool, so
//! a catalogue must be kept in step with whichever tool produces the label
//! volumes it is used with. The built-in table is the `total` task of
//! TotalSegmentator v1.

use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("Could not read label catalogue {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed label catalogue {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Label catalogue key {key:?} is not a label value between 1 and 255")]
    InvalidLabel { key: String },

    #[error("Label catalogue assigns a name to the background label 0")]
    BackgroundEntry,
}

/// Where the catalogue of a run comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CatalogueSource {
    #[default]
    BuiltinTotal,
    File(PathBuf),
}

impl CatalogueSource {
    pub fn load(&self) -> Result<LabelCatalogue, CatalogueError> {
        match self {
            CatalogueSource::BuiltinTotal => Ok(LabelCatalogue::total()),
            CatalogueSource::File(path) => LabelCatalogue::from_json_file(path),
        }
    }
}

/// Immutable mapping from non-zero label value to structure name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelCatalogue {
    names: BTreeMap<u8, String>,
}

#[derive(Deserialize)]
#[serde(transparent)]
struct CatalogueFile(HashMap<String, String>);

impl LabelCatalogue {
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, CatalogueError>
    where
        I: IntoIterator<Item = (u8, S)>,
        S: Into<String>,
    {
        let names: BTreeMap<u8, String> = pairs
            .into_iter()
            .map(|(label, name)| (label, name.into()))
            .collect();
        if names.contains_key(&0) {
            return Err(CatalogueError::BackgroundEntry);
        }
        Ok(Self { names })
    }

    /// Read a JSON object of the form `{"1": "spleen", "2": "kidney_right"}`.
    pub fn from_json_file(path: &Path) -> Result<Self, CatalogueError> {
        let text = fs::read_to_string(path).map_err(|source| CatalogueError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text).map_err(|e| match e {
            CatalogueError::Json { source, .. } => CatalogueError::Json {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self, CatalogueError> {
        let CatalogueFile(entries) =
            serde_json::from_str(text).map_err(|source| CatalogueError::Json {
                path: PathBuf::new(),
                source,
            })?;
        let pairs = entries
            .into_iter()
            .map(|(key, name)| match key.trim().parse::<u8>() {
                Ok(label) => Ok((label, name)),
                Err(_) => Err(CatalogueError::InvalidLabel { key }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_pairs(pairs)
    }

    /// TotalSegmentator v1 `total` task, 104 classes.
    pub fn total() -> Self {
        let names = TOTAL
            .iter()
            .enumerate()
            .map(|(i, name)| ((i + 1) as u8, name.to_string()))
            .collect();
        Self { names }
    }

    pub fn name(&self, label: u8) -> Option<&str> {
        self.names.get(&label).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Entries in ascending label order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.names.iter().map(|(label, name)| (*label, name.as_str()))
    }
}

const TOTAL: [&str; 104] = [
    "spleen",
    "kidney_right",
    "kidney_left",
    "gallbladder",
    "liver",
    "stomach",
    "aorta",
    "inferior_vena_cava",
    "portal_vein_and_splenic_vein",
    "pancreas",
    "adrenal_gland_right",
    "adrenal_gland_left",
    "lung_upper_lobe_left",
    "lung_lower_lobe_left",
    "lung_upper_lobe_right",
    "lung_middle_lobe_right",
    "lung_lower_lobe_right",
    "vertebrae_L5",
    "vertebrae_L4",
    "vertebrae_L3",
    "vertebrae_L2",
    "vertebrae_L1",
    "vertebrae_T12",
    "vertebrae_T11",
    "vertebrae_T10",
    "vertebrae_T9",
    "vertebrae_T8",
    "vertebrae_T7",
    "vertebrae_T6",
    "vertebrae_T5",
    "vertebrae_T4",
    "vertebrae_T3",
    "vertebrae_T2",
    "vertebrae_T1",
    "vertebrae_C7",
    "vertebrae_C6",
    "vertebrae_C5",
    "vertebrae_C4",
    "vertebrae_C3",
    "vertebrae_C2",
    "vertebrae_C1",
    "esophagus",
    "trachea",
    "heart_myocardium",
    "heart_atrium_left",
    "heart_ventricle_left",
    "heart_atrium_right",
    "heart_ventricle_right",
    "pulmonary_artery",
    "brain",
    "iliac_artery_left",
    "iliac_artery_right",
    "iliac_vena_left",
    "iliac_vena_right",
    "small_bowel",
    "duodenum",
    "colon",
    "rib_left_1",
    "rib_left_2",
    "rib_left_3",
    "rib_left_4",
    "rib_left_5",
    "rib_left_6",
    "rib_left_7",
    "rib_left_8",
    "rib_left_9",
    "rib_left_10",
    "rib_left_11",
    "rib_left_12",
    "rib_right_1",
    "rib_right_2",
    "rib_right_3",
    "rib_right_4",
    "rib_right_5",
    "rib_right_6",
    "rib_right_7",
    "rib_right_8",
    "rib_right_9",
    "rib_right_10",
    "rib_right_11",
    "rib_right_12",
    "humerus_left",
    "humerus_right",
    "scapula_left",
    "scapula_right",
    "clavicula_left",
    "clavicula_right",
    "femur_left",
    "femur_right",
    "hip_left",
    "hip_right",
    "sacrum",
    "face",
    "gluteus_maximus_left",
    "gluteus_maximus_right",
    "gluteus_medius_left",
    "gluteus_medius_right",
    "gluteus_minimus_left",
    "gluteus_minimus_right",
    "autochthon_left",
    "autochthon_right",
    "iliopsoas_left",
    "iliopsoas_right",
    "urinary_bladder",
];
