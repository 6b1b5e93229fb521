//! Content-addressed identities for units and leads

use bdgd_common::checksum::digest_parts;

use crate::models::{CanonicalUnit, IdentifiedUnit, JobKey, Lead};

/// Unit identity: a pure function of (natural code, year, layer, distributor)
pub fn unit_id(natural_code: &str, year: i32, layer: &str, distributor: &str) -> String {
    let year = year.to_string();
    digest_parts(&[natural_code.trim(), year.as_str(), layer.trim(), distributor.trim()])
}

/// Lead identity: a pure function of the normalized address tuple.
///
/// Components are trimmed and lower-cased so cosmetic differences do not split a lead.
pub fn lead_id(
    neighborhood: Option<&str>,
    postal_code: &str,
    municipality: Option<&str>,
    distributor: &str,
) -> String {
    let parts: Vec<String> = [
        neighborhood.unwrap_or_default(),
        postal_code,
        municipality.unwrap_or_default(),
        distributor,
    ]
    .iter()
    .map(|p| p.trim().to_lowercase())
    .collect();
    digest_parts(&parts)
}

/// Attach identities to a sanitized chunk for one job
pub fn resolve(key: &JobKey, units: Vec<CanonicalUnit>) -> Vec<IdentifiedUnit> {
    units
        .into_iter()
        .map(|unit| IdentifiedUnit {
            unit_id: unit_id(&unit.natural_code, key.year, &key.layer, &key.prefix),
            lead_id: lead_id(
                unit.neighborhood.as_deref(),
                &unit.postal_code,
                unit.municipality.as_deref(),
                &key.prefix,
            ),
            unit,
        })
        .collect()
}

/// The lead a resolved unit belongs to
pub fn lead_for(key: &JobKey, unit: &IdentifiedUnit) -> Lead {
    Lead {
        id: unit.lead_id.clone(),
        neighborhood: unit.unit.neighborhood.clone(),
        postal_code: unit.unit.postal_code.clone(),
        municipality: unit.unit.municipality.clone(),
        distributor: key.prefix.clone(),
    }
}
