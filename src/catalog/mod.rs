//! Compiled, immutable pattern catalog.
//!
//! Built once from configuration and shared read-only afterwards. Every
//! `(flow type, application, stage)` triple holds a compiled regex plus the
//! field-role lists; the nested `BTreeMap`s give the parser its
//! deterministic alphabetical iteration order.

use std::collections::BTreeMap;

use regex::Regex;

use crate::config::Config;
use crate::errors::AppError;

/// Compiled schema for one `(flow type, application, stage)` triple.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub regex: Regex,
    pub timestamp_format: String,
    pub identifier_fields: Vec<String>,
    pub payload_fields: Vec<String>,
    pub reference_links: Vec<String>,
}

/// Stage-level metadata of a flow type, kept for diagnostics and the
/// `list-config` rendering.
#[derive(Debug, Clone)]
pub struct FluxTypeMeta {
    pub description: String,
    pub required_steps: Vec<String>,
    pub optional_steps: Vec<String>,
}

type StageTable = BTreeMap<String, CompiledPattern>;
type AppTable = BTreeMap<String, StageTable>;

/// The immutable pattern catalog.
#[derive(Debug)]
pub struct Catalog {
    patterns: BTreeMap<String, AppTable>,
    meta: BTreeMap<String, FluxTypeMeta>,
}

/// A selected slice of the catalog, flattened in match order:
/// flow types alphabetically, then applications, then stage names.
pub type CatalogView<'a> = Vec<(&'a str, &'a str, &'a str, &'a CompiledPattern)>;

impl Catalog {
    /// Compile the configuration into a catalog.
    ///
    /// Fails when a regex does not compile or when a declared field (or the
    /// mandatory `timestamp`) is not a named capture group of its regex.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let mut patterns: BTreeMap<String, AppTable> = BTreeMap::new();
        let mut meta = BTreeMap::new();

        for (flux_name, flux_config) in &config.flux_types {
            meta.insert(
                flux_name.clone(),
                FluxTypeMeta {
                    description: flux_config.description.clone(),
                    required_steps: flux_config.required_steps.clone(),
                    optional_steps: flux_config.optional_steps.clone(),
                },
            );

            let mut apps: AppTable = BTreeMap::new();
            for (app_name, app_config) in &flux_config.applications {
                let mut stages: StageTable = BTreeMap::new();
                for (stage_name, pattern_config) in &app_config.patterns {
                    let regex = Regex::new(&pattern_config.regex).map_err(|e| {
                        AppError::Config(format!(
                            "{flux_name}/{app_name}/{stage_name}: invalid regex: {e}"
                        ))
                    })?;

                    let compiled = CompiledPattern {
                        regex,
                        timestamp_format: pattern_config.timestamp_format.clone(),
                        identifier_fields: pattern_config.identifier_fields.clone(),
                        payload_fields: pattern_config.payload_fields.clone(),
                        reference_links: pattern_config.reference_links.clone(),
                    };
                    validate_captures(flux_name, app_name, stage_name, &compiled)?;
                    stages.insert(stage_name.clone(), compiled);
                }
                apps.insert(app_name.clone(), stages);
            }
            patterns.insert(flux_name.clone(), apps);
        }

        Ok(Self { patterns, meta })
    }

    /// Full view over every configured pattern.
    pub fn view(&self) -> CatalogView<'_> {
        self.collect_view(|_, _| true)
    }

    /// View restricted to one flow type. `None` if the flow type is unknown.
    pub fn view_flux(&self, flux: &str) -> Option<CatalogView<'_>> {
        if !self.patterns.contains_key(flux) {
            return None;
        }
        Some(self.collect_view(|f, _| f == flux))
    }

    /// View restricted to one application across all flow types. `None` if
    /// the application appears in no flow type.
    pub fn view_application(&self, app: &str) -> Option<CatalogView<'_>> {
        let view = self.collect_view(|_, a| a == app);
        if view.is_empty() {
            return None;
        }
        Some(view)
    }

    /// View restricted to one `(flow type, application)` cell. `None` if the
    /// combination is unknown.
    pub fn view_flux_application(&self, flux: &str, app: &str) -> Option<CatalogView<'_>> {
        self.patterns.get(flux)?.get(app)?;
        Some(self.collect_view(|f, a| f == flux && a == app))
    }

    fn collect_view(&self, keep: impl Fn(&str, &str) -> bool) -> CatalogView<'_> {
        let mut view = Vec::new();
        for (flux_name, apps) in &self.patterns {
            for (app_name, stages) in apps {
                if !keep(flux_name, app_name) {
                    continue;
                }
                for (stage_name, pattern) in stages {
                    view.push((
                        flux_name.as_str(),
                        app_name.as_str(),
                        stage_name.as_str(),
                        pattern,
                    ));
                }
            }
        }
        view
    }

    /// Per-flow-type metadata, in alphabetical flow type order.
    pub fn flux_types(&self) -> impl Iterator<Item = (&str, &FluxTypeMeta)> {
        self.meta.iter().map(|(name, meta)| (name.as_str(), meta))
    }

    /// Metadata of one flow type.
    pub fn flux_meta(&self, flux: &str) -> Option<&FluxTypeMeta> {
        self.meta.get(flux)
    }
}

/// Check that every declared field resolves to a named capture group.
/// The same capture may serve several roles.
fn validate_captures(
    flux: &str,
    app: &str,
    stage: &str,
    pattern: &CompiledPattern,
) -> Result<(), AppError> {
    let capture_names: Vec<&str> = pattern
        .regex
        .capture_names()
        .flatten()
        .collect();

    let declared = pattern
        .identifier_fields
        .iter()
        .chain(&pattern.payload_fields)
        .chain(&pattern.reference_links)
        .map(String::as_str)
        .chain(std::iter::once("timestamp"));

    for field in declared {
        if !capture_names.contains(&field) {
            return Err(AppError::Config(format!(
                "{flux}/{app}/{stage}: field '{field}' is not a named capture group"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config::from_yaml(
            r#"
flux_types:
  COMMANDE:
    description: "Suivi des commandes"
    required_steps: [COMMANDE_RECU]
    applications:
      Backend:
        patterns:
          VALIDATION_COMMANDE:
            regex: '\[(?P<timestamp>[^\]]+)\] VALIDATION_COMMANDE (?P<commande_id>\S+)'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: [commande_id]
            payload_fields: []
      Frontend:
        patterns:
          COMMANDE_RECU:
            regex: '\[(?P<timestamp>[^\]]+)\] COMMANDE_RECU (?P<commande_id>\S+)'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: [commande_id]
            payload_fields: []
  LIVRAISON:
    applications:
      Transporteur:
        patterns:
          LIVRAISON_CREEE:
            regex: '\[(?P<timestamp>[^\]]+)\] LIVRAISON_CREEE (?P<livraison_id>\S+)'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: [livraison_id]
            payload_fields: []
"#,
        )
        .unwrap()
    }

    #[test]
    fn full_view_is_alphabetical() {
        let catalog = Catalog::from_config(&sample_config()).unwrap();
        let view = catalog.view();
        let cells: Vec<(&str, &str, &str)> =
            view.iter().map(|(f, a, s, _)| (*f, *a, *s)).collect();
        assert_eq!(
            cells,
            vec![
                ("COMMANDE", "Backend", "VALIDATION_COMMANDE"),
                ("COMMANDE", "Frontend", "COMMANDE_RECU"),
                ("LIVRAISON", "Transporteur", "LIVRAISON_CREEE"),
            ]
        );
    }

    #[test]
    fn flux_view_filters_to_one_type() {
        let catalog = Catalog::from_config(&sample_config()).unwrap();
        let view = catalog.view_flux("LIVRAISON").unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].2, "LIVRAISON_CREEE");
        assert!(catalog.view_flux("INCONNU").is_none());
    }

    #[test]
    fn application_view_spans_flow_types() {
        let catalog = Catalog::from_config(&sample_config()).unwrap();
        let view = catalog.view_application("Frontend").unwrap();
        assert_eq!(view.len(), 1);
        assert!(catalog.view_application("Nowhere").is_none());
    }

    #[test]
    fn flux_application_view_requires_known_pair() {
        let catalog = Catalog::from_config(&sample_config()).unwrap();
        assert!(catalog
            .view_flux_application("COMMANDE", "Frontend")
            .is_some());
        assert!(catalog
            .view_flux_application("LIVRAISON", "Frontend")
            .is_none());
    }

    #[test]
    fn missing_capture_group_is_rejected() {
        let config = Config::from_yaml(
            r#"
flux_types:
  COMMANDE:
    applications:
      Frontend:
        patterns:
          COMMANDE_RECU:
            regex: '\[(?P<timestamp>[^\]]+)\] COMMANDE_RECU'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: [commande_id]
            payload_fields: []
"#,
        )
        .unwrap();
        let err = Catalog::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("commande_id"));
    }

    #[test]
    fn missing_timestamp_capture_is_rejected() {
        let config = Config::from_yaml(
            r#"
flux_types:
  COMMANDE:
    applications:
      Frontend:
        patterns:
          COMMANDE_RECU:
            regex: 'COMMANDE_RECU (?P<commande_id>\S+)'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: [commande_id]
            payload_fields: []
"#,
        )
        .unwrap();
        let err = Catalog::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("timestamp"));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let config = Config::from_yaml(
            r#"
flux_types:
  COMMANDE:
    applications:
      Frontend:
        patterns:
          COMMANDE_RECU:
            regex: '(?P<timestamp>[unclosed'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: []
            payload_fields: []
"#,
        )
        .unwrap();
        let err = Catalog::from_config(&config).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
