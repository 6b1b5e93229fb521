//! Field sanitization
//!
//! Pure transforms from [`RawValue`]s to canonical columns. Nothing in here fails a chunk:
//! bad values become nulls and are counted in the [`SanitizeReport`].

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

use crate::error::{ImportError, Result};
use crate::layers::{Column, LayerSpec};
use crate::models::{CanonicalUnit, CoordinateUpdate, MonthlySeries, SeriesSet, MONTHS};
use crate::source::{RawRecord, RawValue};

/// Length of a Brazilian postal code (CEP)
pub const POSTAL_CODE_LEN: usize = 8;

/// Per-chunk sanitization counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanitizeReport {
    pub records_in: u64,
    /// Values nulled because they could not be parsed
    pub malformed_fields: u64,
    /// Records dropped because they carry no natural code
    pub skipped_without_code: u64,
    /// Coordinate records dropped because they carry no usable point
    pub skipped_without_point: u64,
    /// Categorical values passed through without a known canonical form
    pub unrecognized_values: BTreeSet<String>,
}

impl SanitizeReport {
    pub fn merge(&mut self, other: SanitizeReport) {
        self.records_in += other.records_in;
        self.malformed_fields += other.malformed_fields;
        self.skipped_without_code += other.skipped_without_code;
        self.skipped_without_point += other.skipped_without_point;
        self.unrecognized_values.extend(other.unrecognized_values);
    }
}

// ============================================================================
// Scalar transforms
// ============================================================================

/// `"123.0"` and `"123.00"` become `"123"`; anything else is returned unchanged.
fn strip_integral_suffix(s: &str) -> &str {
    match s.split_once('.') {
        Some((int, frac))
            if !int.is_empty()
                && int.chars().all(|c| c.is_ascii_digit() || c == '-')
                && frac.chars().all(|c| c == '0') =>
        {
            int
        },
        _ => s,
    }
}

fn render_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

/// Render a value as trimmed text, `None` when empty
pub fn text(value: Option<&RawValue>) -> Option<String> {
    let rendered = match value? {
        RawValue::Null | RawValue::Geometry(_) => return None,
        RawValue::Text(s) => s.trim().to_string(),
        RawValue::Integer(i) => i.to_string(),
        RawValue::Float(f) => render_float(*f),
        RawValue::Bool(b) => b.to_string(),
        RawValue::Date(d) => d.format("%Y-%m-%d").to_string(),
    };
    if rendered.is_empty() {
        None
    } else {
        Some(rendered)
    }
}

/// Natural code as text; integral floats lose their fractional part. Empty when absent.
pub fn natural_code(value: Option<&RawValue>) -> String {
    text(value)
        .map(|code| strip_integral_suffix(&code).to_string())
        .unwrap_or_default()
}

/// Digits only, at most 8, zero-padded on the left. Empty when no digits are present.
pub fn postal_code(value: Option<&RawValue>) -> String {
    let Some(raw) = text(value) else {
        return String::new();
    };
    let digits: String = strip_integral_suffix(&raw)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .take(POSTAL_CODE_LEN)
        .collect();
    if digits.is_empty() {
        return digits;
    }
    format!("{:0>width$}", digits, width = POSTAL_CODE_LEN)
}

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%Y%m%d"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Calendar date from the usual export formats; unparseable or absent is `None`
pub fn parse_date(value: Option<&RawValue>) -> Option<NaiveDate> {
    let s = match value? {
        RawValue::Date(d) => return Some(*d),
        RawValue::Text(s) => s.trim().to_string(),
        RawValue::Integer(i) => i.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        return None;
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&s, fmt) {
            return Some(date);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Some(dt.date());
        }
    }
    // Timestamps with an offset or other trailing noise
    s.get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
}

/// Number from a numeric or textual value. Decimal commas are accepted (`"1.234,5"`).
///
/// Absent and empty values are `Ok(None)`; values that are present but unparseable are
/// `MalformedField`.
pub fn parse_number(field: &str, value: Option<&RawValue>) -> Result<Option<f64>> {
    let malformed = |v: &RawValue| ImportError::MalformedField {
        field: field.to_string(),
        value: format!("{:?}", v),
    };

    let Some(value) = value else {
        return Ok(None);
    };
    match value {
        RawValue::Null => Ok(None),
        RawValue::Integer(i) => Ok(Some(*i as f64)),
        RawValue::Float(f) if f.is_finite() => Ok(Some(*f)),
        RawValue::Text(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            let normalized = if s.contains(',') {
                s.replace('.', "").replace(',', ".")
            } else {
                s.to_string()
            };
            match normalized.parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(Some(f)),
                _ => Err(malformed(value)),
            }
        },
        other => Err(malformed(other)),
    }
}

// ============================================================================
// Categorical fields
// ============================================================================

struct CategoryMap {
    column: Column,
    canonical: &'static [&'static str],
    aliases: &'static [(&'static str, &'static str)],
}

static CATEGORY_MAPS: &[CategoryMap] = &[
    CategoryMap {
        column: Column::Status,
        canonical: &["AT", "DS"],
        aliases: &[
            ("ATIVO", "AT"),
            ("ATIVA", "AT"),
            ("ATIVADO", "AT"),
            ("DESLIGADO", "DS"),
            ("DESLIGADA", "DS"),
            ("INATIVO", "DS"),
        ],
    },
    CategoryMap {
        column: Column::VoltageGroup,
        canonical: &["AT", "MT", "BT"],
        aliases: &[("ALTA", "AT"), ("MEDIA", "MT"), ("MÉDIA", "MT"), ("BAIXA", "BT")],
    },
    CategoryMap {
        column: Column::TariffModality,
        canonical: &["A1", "A2", "A3", "A3a", "A4", "AS", "B1", "B2", "B3", "B4"],
        aliases: &[("A3A", "A3a")],
    },
];

/// Map a categorical value to its canonical code, matching case-insensitively on the trimmed
/// value and its known aliases.
///
/// Returns the value and whether it was recognized. Anything without a match comes back
/// trimmed but otherwise as published. Columns without a known code list are always
/// recognized.
pub fn normalize_category(column: Column, raw: &str) -> (String, bool) {
    let trimmed = raw.trim();
    let Some(map) = CATEGORY_MAPS.iter().find(|m| m.column == column) else {
        return (trimmed.to_string(), true);
    };

    let upper = trimmed.to_uppercase();
    if let Some(code) = map.canonical.iter().find(|c| c.to_uppercase() == upper) {
        return (code.to_string(), true);
    }
    if let Some((_, code)) = map.aliases.iter().find(|(alias, _)| *alias == upper) {
        return (code.to_string(), true);
    }
    (trimmed.to_string(), false)
}

// ============================================================================
// Records
// ============================================================================

/// Sanitizer bound to one layer's column mapping
#[derive(Debug, Clone, Copy)]
pub struct Sanitizer {
    spec: &'static LayerSpec,
}

impl Sanitizer {
    pub fn new(spec: &'static LayerSpec) -> Self {
        Self { spec }
    }

    fn value<'a>(&self, record: &'a RawRecord, column: Column) -> Option<&'a RawValue> {
        record.first_of(self.spec.sources(column))
    }

    fn number(&self, record: &RawRecord, column: Column, report: &mut SanitizeReport) -> Option<f64> {
        let fields = self.spec.sources(column);
        let field = fields.first().copied().unwrap_or_default();
        self.checked_number(field, self.value(record, column), report)
    }

    fn checked_number(
        &self,
        field: &str,
        value: Option<&RawValue>,
        report: &mut SanitizeReport,
    ) -> Option<f64> {
        match parse_number(field, value) {
            Ok(v) => v,
            Err(e) => {
                trace!(layer = self.spec.code, error = %e, "Nulling malformed value");
                report.malformed_fields += 1;
                None
            },
        }
    }

    fn category(&self, record: &RawRecord, column: Column, report: &mut SanitizeReport) -> Option<String> {
        let raw = text(self.value(record, column))?;
        let (value, recognized) = normalize_category(column, &raw);
        if !recognized {
            report.unrecognized_values.insert(format!("{:?}={}", column, value));
        }
        Some(value)
    }

    fn series(&self, record: &RawRecord, report: &mut SanitizeReport) -> SeriesSet {
        let mut set = SeriesSet::default();
        for def in self.spec.series {
            let mut total = MonthlySeries::default();
            for prefix in def.prefixes {
                let mut months = [None; MONTHS];
                for (i, slot) in months.iter_mut().enumerate() {
                    let field = format!("{}{:02}", prefix, i + 1);
                    *slot = self.checked_number(&field, record.get(&field), report);
                }
                total = total.add(&MonthlySeries(months));
            }
            if def.kind.zero_fills() {
                total = total.fill_missing_with_zero();
            }
            set.set(def.kind, total);
        }
        // Energy is dense even for layers that never publish it
        if !self.spec.series.iter().any(|d| d.kind.zero_fills()) {
            set.energy = MonthlySeries::zeros();
        }
        set
    }

    fn unit(&self, record: &RawRecord, report: &mut SanitizeReport) -> Option<CanonicalUnit> {
        let natural_code = natural_code(self.value(record, Column::NaturalCode));
        if natural_code.is_empty() {
            report.skipped_without_code += 1;
            return None;
        }

        Some(CanonicalUnit {
            natural_code,
            distributor_code: text(self.value(record, Column::Distributor)),
            municipality: text(self.value(record, Column::Municipality)),
            neighborhood: text(self.value(record, Column::Neighborhood)),
            postal_code: postal_code(self.value(record, Column::PostalCode)),
            connection_date: parse_date(self.value(record, Column::ConnectionDate)),
            system_type: self.category(record, Column::SystemType, report),
            voltage_group: self.category(record, Column::VoltageGroup, report),
            tariff_modality: self.category(record, Column::TariffModality, report),
            status: self.category(record, Column::Status, report),
            class: self.category(record, Column::Class, report),
            segment: text(self.value(record, Column::Segment)),
            substation: text(self.value(record, Column::Substation)),
            cnae: text(self.value(record, Column::Cnae)),
            description: text(self.value(record, Column::Description)),
            installed_power: self.number(record, Column::InstalledPower, report),
            series: self.series(record, report),
        })
    }

    /// Sanitize a chunk of unit records. Records without a natural code are dropped.
    pub fn sanitize_units(&self, records: &[RawRecord]) -> (Vec<CanonicalUnit>, SanitizeReport) {
        let mut report = SanitizeReport {
            records_in: records.len() as u64,
            ..Default::default()
        };
        let units: Vec<CanonicalUnit> = records
            .iter()
            .filter_map(|r| self.unit(r, &mut report))
            .collect();

        self.log_report(&report);
        (units, report)
    }

    /// Sanitize a chunk of point records into coordinate updates
    pub fn sanitize_coordinates(
        &self,
        records: &[RawRecord],
    ) -> (Vec<CoordinateUpdate>, SanitizeReport) {
        let mut report = SanitizeReport {
            records_in: records.len() as u64,
            ..Default::default()
        };

        let mut updates = Vec::with_capacity(records.len());
        for record in records {
            let natural_code = natural_code(self.value(record, Column::NaturalCode));
            if natural_code.is_empty() {
                report.skipped_without_code += 1;
                continue;
            }

            let lat = self.number(record, Column::Latitude, &mut report);
            let lng = self.number(record, Column::Longitude, &mut report);
            let point = match (lat, lng) {
                (Some(lat), Some(lng)) => Some((lat, lng)),
                _ => match self.value(record, Column::Geometry) {
                    Some(RawValue::Geometry(g)) | Some(RawValue::Text(g)) => parse_point(g),
                    _ => None,
                },
            };

            match point {
                Some((lat, lng)) => updates.push(CoordinateUpdate {
                    natural_code,
                    lat,
                    lng,
                }),
                None => report.skipped_without_point += 1,
            }
        }

        self.log_report(&report);
        (updates, report)
    }

    fn log_report(&self, report: &SanitizeReport) {
        if report.skipped_without_code > 0 {
            warn!(
                layer = self.spec.code,
                skipped = report.skipped_without_code,
                "Dropped records without a natural code"
            );
        }
        if report.malformed_fields > 0 || report.skipped_without_point > 0 {
            debug!(
                layer = self.spec.code,
                malformed = report.malformed_fields,
                without_point = report.skipped_without_point,
                "Sanitized chunk with nulled values"
            );
        }
        if !report.unrecognized_values.is_empty() {
            debug!(
                layer = self.spec.code,
                values = ?report.unrecognized_values,
                "Unrecognized categorical values passed through"
            );
        }
    }
}

/// `(lat, lng)` from a GeoJSON Point or a WKT `POINT (x y)`. Longitude is x.
pub fn parse_point(geometry: &str) -> Option<(f64, f64)> {
    let trimmed = geometry.trim();

    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        if !value.get("type")?.as_str()?.eq_ignore_ascii_case("point") {
            return None;
        }
        let coords = value.get("coordinates")?.as_array()?;
        let x = coords.first()?.as_f64()?;
        let y = coords.get(1)?.as_f64()?;
        return Some((y, x));
    }

    let upper = trimmed.to_uppercase();
    let rest = upper.strip_prefix("POINT")?;
    let open = rest.find('(')?;
    let close = rest.rfind(')')?;
    let mut parts = rest.get(open + 1..close)?.split_whitespace();
    let x: f64 = parts.next()?.parse().ok()?;
    let y: f64 = parts.next()?.parse().ok()?;
    Some((y, x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{PONNOT, UCAT, UCBT};

    fn t(s: &str) -> RawValue {
        RawValue::Text(s.to_string())
    }

    #[test]
    fn test_postal_code() {
        assert_eq!(postal_code(Some(&t("01310-100"))), "01310100");
        assert_eq!(postal_code(Some(&RawValue::Integer(1310100))), "01310100");
        assert_eq!(postal_code(Some(&RawValue::Float(1310100.0))), "01310100");
        assert_eq!(postal_code(Some(&t("1310100.0"))), "01310100");
        assert_eq!(postal_code(Some(&t("013101009999"))), "01310100");
        assert_eq!(postal_code(Some(&t("sem cep"))), "");
        assert_eq!(postal_code(Some(&RawValue::Null)), "");
        assert_eq!(postal_code(None), "");
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2019, 5, 3);
        for input in ["2019-05-03", "03/05/2019", "2019/05/03", "20190503", "2019-05-03T00:00:00", "2019-05-03 10:30:00.5"] {
            assert_eq!(parse_date(Some(&t(input))), expected, "input {}", input);
        }
        assert_eq!(parse_date(Some(&RawValue::Integer(20190503))), expected);
        assert_eq!(parse_date(Some(&t("not a date"))), None);
        assert_eq!(parse_date(Some(&t("31/02/2019"))), None);
        assert_eq!(parse_date(None), None);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("F", Some(&t("1.234,5"))).unwrap(), Some(1234.5));
        assert_eq!(parse_number("F", Some(&t("12,5"))).unwrap(), Some(12.5));
        assert_eq!(parse_number("F", Some(&t(" 7.25 "))).unwrap(), Some(7.25));
        assert_eq!(parse_number("F", Some(&RawValue::Integer(3))).unwrap(), Some(3.0));
        assert_eq!(parse_number("F", Some(&t(""))).unwrap(), None);
        assert_eq!(parse_number("F", None).unwrap(), None);
        assert!(matches!(
            parse_number("ENE_01", Some(&t("abc"))),
            Err(ImportError::MalformedField { field, .. }) if field == "ENE_01"
        ));
        assert!(parse_number("F", Some(&t("NaN"))).is_err());
    }

    #[test]
    fn test_natural_code_drops_integral_fraction() {
        assert_eq!(natural_code(Some(&RawValue::Float(123.0))), "123");
        assert_eq!(natural_code(Some(&t("123.0"))), "123");
        assert_eq!(natural_code(Some(&t(" UC-9 "))), "UC-9");
        assert_eq!(natural_code(Some(&RawValue::Float(1.5))), "1.5");
        assert_eq!(natural_code(None), "");
    }

    #[test]
    fn test_normalize_category() {
        assert_eq!(normalize_category(Column::Status, " ativo "), ("AT".to_string(), true));
        assert_eq!(normalize_category(Column::TariffModality, "a3a"), ("A3a".to_string(), true));
        assert_eq!(normalize_category(Column::VoltageGroup, " Xx "), ("Xx".to_string(), false));
        assert_eq!(normalize_category(Column::Class, "re1"), ("re1".to_string(), true));
    }

    #[test]
    fn test_free_text_keeps_decimal_suffix() {
        assert_eq!(text(Some(&t(" 3.0 "))), Some("3.0".to_string()));
        assert_eq!(postal_code(Some(&t("1310100.00"))), "01310100");

        let record = RawRecord::new()
            .with("COD_ID", t("7.0"))
            .with("DESCR", t("3.0"))
            .with("SIT_ATIV", t("Xx"));
        let (units, report) = Sanitizer::new(&UCBT).sanitize_units(&[record]);
        let unit = &units[0];
        assert_eq!(unit.natural_code, "7");
        assert_eq!(unit.description.as_deref(), Some("3.0"));
        assert_eq!(unit.status.as_deref(), Some("Xx"));
        assert!(report.unrecognized_values.contains("Status=Xx"));
    }

    #[test]
    fn test_sanitize_units_fills_absent_columns_with_null() {
        let record = RawRecord::new()
            .with("COD_ID", t("X1"))
            .with("ENE_01", t("10"))
            .with("ENE_03", t("bad"))
            .with("DIC_01", t("1,5"));

        let (units, report) = Sanitizer::new(&UCBT).sanitize_units(&[record]);
        assert_eq!(units.len(), 1);
        let unit = &units[0];
        assert_eq!(unit.natural_code, "X1");
        assert_eq!(unit.municipality, None);
        assert_eq!(unit.postal_code, "");
        assert_eq!(unit.installed_power, None);
        assert_eq!(unit.series.energy.0[0], Some(10.0));
        assert_eq!(unit.series.energy.0[2], Some(0.0));
        assert_eq!(unit.series.energy.0[11], Some(0.0));
        assert_eq!(unit.series.dic.0[0], Some(1.5));
        assert_eq!(unit.series.dic.0[1], None);
        assert!(!unit.series.has_demand());
        assert_eq!(report.malformed_fields, 1);
    }

    #[test]
    fn test_sanitize_units_sums_peak_and_off_peak_energy() {
        let record = RawRecord::new()
            .with("COD_ID", RawValue::Integer(55))
            .with("ENE_P_01", RawValue::Float(2.0))
            .with("ENE_F_01", RawValue::Float(3.0))
            .with("DEM_P_02", RawValue::Float(40.0))
            .with("SIT_ATIV", t("ativo"));

        let (units, _) = Sanitizer::new(&UCAT).sanitize_units(&[record]);
        let unit = &units[0];
        assert_eq!(unit.natural_code, "55");
        assert_eq!(unit.series.energy.0[0], Some(5.0));
        assert_eq!(unit.series.demand_peak.0[1], Some(40.0));
        assert_eq!(unit.series.demand_peak.0[0], None);
        assert_eq!(unit.status.as_deref(), Some("AT"));
    }

    #[test]
    fn test_sanitize_units_drops_records_without_code() {
        let records = vec![
            RawRecord::new().with("COD_ID", RawValue::Null),
            RawRecord::new().with("MUN", t("3550308")),
            RawRecord::new().with("COD_ID", t("X2")),
        ];
        let (units, report) = Sanitizer::new(&UCBT).sanitize_units(&records);
        assert_eq!(units.len(), 1);
        assert_eq!(report.records_in, 3);
        assert_eq!(report.skipped_without_code, 2);
    }

    #[test]
    fn test_parse_point() {
        assert_eq!(
            parse_point(r#"{"type": "Point", "coordinates": [-46.63, -23.55]}"#),
            Some((-23.55, -46.63))
        );
        assert_eq!(parse_point("POINT (-46.63 -23.55)"), Some((-23.55, -46.63)));
        assert_eq!(parse_point("point z (-46.63 -23.55 760)"), Some((-23.55, -46.63)));
        assert_eq!(parse_point("LINESTRING (0 0, 1 1)"), None);
        assert_eq!(parse_point("garbage"), None);
    }

    #[test]
    fn test_sanitize_coordinates() {
        let records = vec![
            RawRecord::new()
                .with("COD_ID", t("X1"))
                .with("GEOMETRY", RawValue::Geometry("POINT (-46.6 -23.5)".into())),
            RawRecord::new()
                .with("COD_ID", t("X2"))
                .with("LAT", RawValue::Float(-22.9))
                .with("LON", RawValue::Float(-43.2)),
            RawRecord::new().with("COD_ID", t("X3")),
        ];
        let (updates, report) = Sanitizer::new(&PONNOT).sanitize_coordinates(&records);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].lat, -23.5);
        assert_eq!(updates[1].lng, -43.2);
        assert_eq!(report.skipped_without_point, 1);
    }
}
