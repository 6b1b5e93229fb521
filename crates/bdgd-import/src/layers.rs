//! Layer definitions
//!
//! Every layer runs through the same pipeline. What differs between layers is only which
//! source fields feed each canonical column and which monthly series they carry.

use crate::models::SeriesKind;

/// What a layer contributes to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Consumption units with their series, leads, and classification
    Units,
    /// Point geometry applied to units already loaded
    Coordinates,
}

/// Canonical columns a layer can map source fields to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    NaturalCode,
    Distributor,
    Municipality,
    Neighborhood,
    PostalCode,
    ConnectionDate,
    SystemType,
    VoltageGroup,
    TariffModality,
    Status,
    Class,
    Segment,
    Substation,
    Cnae,
    Description,
    InstalledPower,
    Latitude,
    Longitude,
    Geometry,
}

/// Source fields feeding one series. Month `m` of a prefix is read from `{prefix}{m:02}`.
/// With several prefixes the months are summed (peak + off-peak energy, for instance).
#[derive(Debug, Clone, Copy)]
pub struct SeriesDef {
    pub kind: SeriesKind,
    pub prefixes: &'static [&'static str],
}

#[derive(Debug)]
pub struct LayerSpec {
    /// Short code used in job keys and in the unit table's `origem` column
    pub code: &'static str,
    /// Acceptable layer names in the container, most specific first
    pub variants: &'static [&'static str],
    pub kind: LayerKind,
    /// Candidate source fields per column, first present wins
    pub columns: &'static [(Column, &'static [&'static str])],
    pub series: &'static [SeriesDef],
}

impl LayerSpec {
    /// Source field candidates for a column (empty when the layer does not map it)
    pub fn sources(&self, column: Column) -> &'static [&'static str] {
        self.columns
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, fields)| *fields)
            .unwrap_or(&[])
    }

    pub fn by_code(code: &str) -> Option<&'static LayerSpec> {
        ALL_LAYERS
            .iter()
            .copied()
            .find(|spec| spec.code.eq_ignore_ascii_case(code))
    }
}

/// Layers in the order they run for each (distributor, year). Units come before
/// coordinates because the coordinates layer updates rows the unit layers create.
pub static ALL_LAYERS: &[&LayerSpec] = &[&UCAT, &UCMT, &UCBT, &PONNOT];

const ADDRESS_COLUMNS: [(Column, &[&str]); 5] = [
    (Column::NaturalCode, &["COD_ID"]),
    (Column::Distributor, &["DIST"]),
    (Column::Municipality, &["MUN"]),
    (Column::Neighborhood, &["BRR"]),
    (Column::PostalCode, &["CEP"]),
];

const QUALITY_SERIES: [SeriesDef; 2] = [
    SeriesDef {
        kind: SeriesKind::Dic,
        prefixes: &["DIC_"],
    },
    SeriesDef {
        kind: SeriesKind::Fic,
        prefixes: &["FIC_"],
    },
];

/// High-voltage consumers
pub static UCAT: LayerSpec = LayerSpec {
    code: "UCAT",
    variants: &["UCAT_tab", "UCAT"],
    kind: LayerKind::Units,
    columns: &[
        ADDRESS_COLUMNS[0],
        ADDRESS_COLUMNS[1],
        ADDRESS_COLUMNS[2],
        ADDRESS_COLUMNS[3],
        ADDRESS_COLUMNS[4],
        (Column::ConnectionDate, &["DAT_CON"]),
        (Column::SystemType, &["TIP_CC", "TIP_SIST"]),
        (Column::VoltageGroup, &["GRU_TEN"]),
        (Column::TariffModality, &["GRU_TAR"]),
        (Column::Status, &["SIT_ATIV"]),
        (Column::Class, &["CLAS_SUB"]),
        (Column::Segment, &["CONJ"]),
        (Column::Substation, &["SUB"]),
        (Column::Cnae, &["CNAE"]),
        (Column::Description, &["ARE_LOC", "DESCR"]),
        (Column::InstalledPower, &["CAR_INST"]),
    ],
    series: &[
        SeriesDef {
            kind: SeriesKind::Energy,
            prefixes: &["ENE_P_", "ENE_F_"],
        },
        SeriesDef {
            kind: SeriesKind::DemandPeak,
            prefixes: &["DEM_P_"],
        },
        SeriesDef {
            kind: SeriesKind::DemandOffPeak,
            prefixes: &["DEM_F_"],
        },
        SeriesDef {
            kind: SeriesKind::DemandContracted,
            prefixes: &["DEM_CONT_"],
        },
        QUALITY_SERIES[0],
        QUALITY_SERIES[1],
    ],
};

/// Medium-voltage consumers
pub static UCMT: LayerSpec = LayerSpec {
    code: "UCMT",
    variants: &["UCMT_tab", "UCMT"],
    kind: LayerKind::Units,
    columns: &[
        ADDRESS_COLUMNS[0],
        ADDRESS_COLUMNS[1],
        ADDRESS_COLUMNS[2],
        ADDRESS_COLUMNS[3],
        ADDRESS_COLUMNS[4],
        (Column::ConnectionDate, &["DAT_CON"]),
        (Column::SystemType, &["TIP_SIST", "TIP_CC"]),
        (Column::VoltageGroup, &["GRU_TEN"]),
        (Column::TariffModality, &["GRU_TAR"]),
        (Column::Status, &["SIT_ATIV"]),
        (Column::Class, &["CLAS_SUB"]),
        (Column::Segment, &["CONJ"]),
        (Column::Substation, &["SUB"]),
        (Column::Cnae, &["CNAE"]),
        (Column::Description, &["DESCR", "ARE_LOC"]),
        (Column::InstalledPower, &["PN_CON", "CAR_INST"]),
    ],
    series: &[
        SeriesDef {
            kind: SeriesKind::Energy,
            prefixes: &["ENE_P_", "ENE_F_"],
        },
        SeriesDef {
            kind: SeriesKind::DemandPeak,
            prefixes: &["DEM_P_"],
        },
        SeriesDef {
            kind: SeriesKind::DemandOffPeak,
            prefixes: &["DEM_F_"],
        },
        SeriesDef {
            kind: SeriesKind::DemandContracted,
            prefixes: &["DEM_CONT_"],
        },
        QUALITY_SERIES[0],
        QUALITY_SERIES[1],
    ],
};

/// Low-voltage consumers. No demand metering at this voltage.
pub static UCBT: LayerSpec = LayerSpec {
    code: "UCBT",
    variants: &["UCBT_tab", "UCBT"],
    kind: LayerKind::Units,
    columns: &[
        ADDRESS_COLUMNS[0],
        ADDRESS_COLUMNS[1],
        ADDRESS_COLUMNS[2],
        ADDRESS_COLUMNS[3],
        ADDRESS_COLUMNS[4],
        (Column::ConnectionDate, &["DAT_CON"]),
        (Column::SystemType, &["TIP_SIST"]),
        (Column::VoltageGroup, &["GRU_TEN"]),
        (Column::TariffModality, &["GRU_TAR"]),
        (Column::Status, &["SIT_ATIV"]),
        (Column::Class, &["CLAS_SUB"]),
        (Column::Segment, &["CONJ"]),
        (Column::Substation, &["SUB"]),
        (Column::Cnae, &["CNAE"]),
        (Column::Description, &["DESCR"]),
        (Column::InstalledPower, &["CAR_INST"]),
    ],
    series: &[
        SeriesDef {
            kind: SeriesKind::Energy,
            prefixes: &["ENE_"],
        },
        QUALITY_SERIES[0],
        QUALITY_SERIES[1],
    ],
};

/// Delivery points (geometry only)
pub static PONNOT: LayerSpec = LayerSpec {
    code: "PONNOT",
    variants: &["PONNOT", "PONNOT_tab"],
    kind: LayerKind::Coordinates,
    columns: &[
        (Column::NaturalCode, &["COD_ID"]),
        (Column::Latitude, &["LAT", "Y"]),
        (Column::Longitude, &["LNG", "LON", "X"]),
        (Column::Geometry, &["GEOMETRY", "WKT", "SHAPE"]),
    ],
    series: &[],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_code_is_case_insensitive() {
        assert_eq!(LayerSpec::by_code("ucbt").map(|s| s.code), Some("UCBT"));
        assert!(LayerSpec::by_code("UCXX").is_none());
    }

    #[test]
    fn test_sources_lookup() {
        assert_eq!(UCMT.sources(Column::InstalledPower), &["PN_CON", "CAR_INST"]);
        assert!(UCBT.sources(Column::Latitude).is_empty());
    }

    #[test]
    fn test_units_layers_run_before_coordinates() {
        let kinds: Vec<LayerKind> = ALL_LAYERS.iter().map(|s| s.kind).collect();
        let first_coordinates = kinds.iter().position(|k| *k == LayerKind::Coordinates);
        assert_eq!(first_coordinates, Some(ALL_LAYERS.len() - 1));
    }

    #[test]
    fn test_every_units_layer_maps_natural_code_and_energy() {
        for spec in ALL_LAYERS.iter().filter(|s| s.kind == LayerKind::Units) {
            assert_eq!(spec.sources(Column::NaturalCode), &["COD_ID"]);
            assert!(spec.series.iter().any(|s| s.kind == SeriesKind::Energy));
        }
    }
}
