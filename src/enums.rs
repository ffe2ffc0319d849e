use std::fmt;

/// Policy used to order the slices of a series along the stacking axis.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    /// Ascending position along the slice normal, ties broken by
    /// InstanceNumber and then SOPInstanceUID.
    #[default]
    ImagePositionPatient,
    /// Ascending InstanceNumber, ties broken by position and then
    /// SOPInstanceUID.
    InstanceNumber,
}

/// The stages of a conversion run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    VolumeConversion,
    Segmentation,
    LabelMapping,
    StructureSet,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::VolumeConversion => "volume conversion",
            Stage::Segmentation => "segmentation",
            Stage::LabelMapping => "label mapping",
            Stage::StructureSet => "structure set",
        };
        f.write_str(name)
    }
}
