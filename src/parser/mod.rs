//! Resolves raw log lines against the pattern catalog.
//!
//! The first pattern whose regex matches the line wins, in catalog order.
//! Forced flow type / application arguments narrow the set of candidate
//! patterns to the corresponding catalog view.

use chrono::{DateTime, NaiveDateTime};
use indexmap::IndexMap;
use serde::Serialize;

use crate::catalog::{Catalog, CatalogView};

/// A typed, extracted record produced from one raw line.
///
/// The three field maps preserve the order in which fields are declared by
/// the matching pattern; the ingestor picks the main reference as the first
/// non-empty identifier field.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedLog {
    pub timestamp: NaiveDateTime,
    pub log_type: String,
    pub application: String,
    pub flux_type: String,
    pub identifier_fields: IndexMap<String, String>,
    pub payload_fields: IndexMap<String, String>,
    pub reference_links: IndexMap<String, String>,
    pub raw_log: String,
}

/// Match a raw line against the catalog, optionally forcing the flow type
/// and/or the application.
///
/// Returns `None` for empty lines, unknown forced selectors and lines no
/// pattern recognizes. A pattern whose regex matches but whose timestamp
/// does not parse is skipped and matching continues.
pub fn parse_line(
    catalog: &Catalog,
    line: &str,
    force_flux: Option<&str>,
    force_app: Option<&str>,
) -> Option<ParsedLog> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let view: CatalogView<'_> = match (force_flux, force_app) {
        (Some(flux), Some(app)) => match catalog.view_flux_application(flux, app) {
            Some(view) => view,
            None => {
                tracing::error!(flux, application = app, "unknown flow/application combination");
                return None;
            }
        },
        (Some(flux), None) => match catalog.view_flux(flux) {
            Some(view) => view,
            None => {
                tracing::error!(flux, "unknown flow type");
                return None;
            }
        },
        (None, Some(app)) => match catalog.view_application(app) {
            Some(view) => view,
            None => {
                tracing::error!(application = app, "unknown application");
                return None;
            }
        },
        (None, None) => catalog.view(),
    };

    for (flux_name, app_name, stage_name, pattern) in view {
        let Some(caps) = pattern.regex.captures(line) else {
            continue;
        };

        let raw_timestamp = caps.name("timestamp").map(|m| m.as_str()).unwrap_or("");
        let Some(timestamp) = parse_timestamp_flexible(raw_timestamp, &pattern.timestamp_format)
        else {
            tracing::warn!(
                stage = stage_name,
                value = raw_timestamp,
                "pattern matched but timestamp did not parse, trying next pattern"
            );
            continue;
        };

        let extract = |fields: &[String]| -> IndexMap<String, String> {
            fields
                .iter()
                .map(|field| {
                    let value = caps
                        .name(field)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    (field.clone(), value)
                })
                .collect()
        };

        return Some(ParsedLog {
            timestamp,
            log_type: stage_name.to_string(),
            application: app_name.to_string(),
            flux_type: flux_name.to_string(),
            identifier_fields: extract(&pattern.identifier_fields),
            payload_fields: extract(&pattern.payload_fields),
            reference_links: extract(&pattern.reference_links),
            raw_log: line.to_string(),
        });
    }

    tracing::debug!(line, "unrecognized line");
    None
}

/// Timestamp formats accepted when the declared format fails: ISO-like with
/// `T` or space separator and an optional subsecond part.
const FALLBACK_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Offset-carrying variants, normalized to naive UTC.
const FALLBACK_FORMATS_TZ: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%z"];

/// Parse a captured timestamp, trying the declared format first and a small
/// set of near-variants after it.
fn parse_timestamp_flexible(value: &str, declared_format: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(ts) = NaiveDateTime::parse_from_str(value, declared_format) {
        return Some(ts);
    }

    for format in FALLBACK_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts);
        }
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.naive_utc());
    }
    for format in FALLBACK_FORMATS_TZ {
        if let Ok(ts) = DateTime::parse_from_str(value, format) {
            return Some(ts.naive_utc());
        }
    }

    None
}
