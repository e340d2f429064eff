use crate::{EngineError, EngineResult, MetricCategory, MetricType, MetricUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub code: &'static str,
    pub name: &'static str,
    pub category: MetricCategory,
    pub unit: MetricUnit,
}

/// Canonical metric types seeded by every migration.
pub const CATALOG_V1: &[CatalogEntry] = &[
    CatalogEntry {
        code: "electricity",
        name: "Electricity",
        category: MetricCategory::Energy,
        unit: MetricUnit::Kwh,
    },
    CatalogEntry {
        code: "natural_gas",
        name: "Natural Gas",
        category: MetricCategory::Energy,
        unit: MetricUnit::Kwh,
    },
    CatalogEntry {
        code: "water_usage",
        name: "Water Usage",
        category: MetricCategory::Water,
        unit: MetricUnit::Liters,
    },
    CatalogEntry {
        code: "general_waste",
        name: "General Waste",
        category: MetricCategory::Waste,
        unit: MetricUnit::Kg,
    },
    CatalogEntry {
        code: "recycled_waste",
        name: "Recycled Waste",
        category: MetricCategory::Recycling,
        unit: MetricUnit::Kg,
    },
    CatalogEntry {
        code: "recycling_rate",
        name: "Recycling Rate",
        category: MetricCategory::Recycling,
        unit: MetricUnit::Percent,
    },
    CatalogEntry {
        code: "attendee_travel",
        name: "Attendee Travel",
        category: MetricCategory::Transportation,
        unit: MetricUnit::Km,
    },
    CatalogEntry {
        code: "freight_transport",
        name: "Freight Transport",
        category: MetricCategory::Transportation,
        unit: MetricUnit::Km,
    },
    CatalogEntry {
        code: "carbon_emissions",
        name: "Carbon Emissions",
        category: MetricCategory::Emissions,
        unit: MetricUnit::KgCo2e,
    },
];

/// Allowed range for a metric value. `None` fields match anything; the most
/// specific matching row applies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRule {
    pub category: Option<MetricCategory>,
    pub unit: Option<MetricUnit>,
    pub min: f64,
    pub max: Option<f64>,
}

const VALUE_RULES: &[ValueRule] = &[
    ValueRule {
        category: None,
        unit: Some(MetricUnit::Percent),
        min: 0.0,
        max: Some(100.0),
    },
    ValueRule {
        category: None,
        unit: None,
        min: 0.0,
        max: None,
    },
];

#[must_use]
pub fn rule_for(category: MetricCategory, unit: MetricUnit) -> ValueRule {
    VALUE_RULES
        .iter()
        .filter(|rule| {
            (rule.category.is_none() || rule.category == Some(category))
                && (rule.unit.is_none() || rule.unit == Some(unit))
        })
        .max_by_key(|rule| u8::from(rule.category.is_some()) + u8::from(rule.unit.is_some()))
        .copied()
        .unwrap_or(ValueRule {
            category: None,
            unit: None,
            min: 0.0,
            max: None,
        })
}

/// Checks a candidate value against the rule table.
///
/// # Errors
/// Returns [`EngineError::InvalidValue`] for non-finite values or values
/// outside the rule's bounds.
pub fn validate_metric_value(metric_type: &MetricType, value: f64) -> EngineResult<()> {
    if !value.is_finite() {
        return Err(EngineError::InvalidValue(format!(
            "{} value MUST be finite",
            metric_type.code
        )));
    }

    let rule = rule_for(metric_type.category, metric_type.unit);
    if value < rule.min {
        return Err(EngineError::InvalidValue(format!(
            "{} value MUST be >= {}",
            metric_type.code, rule.min
        )));
    }

    if let Some(max) = rule.max {
        if value > max {
            return Err(EngineError::InvalidValue(format!(
                "{} value MUST be <= {max} {}",
                metric_type.code,
                metric_type.unit.as_str()
            )));
        }
    }

    Ok(())
}

/// Inactive types only accept updates to an observation that already exists.
///
/// # Errors
/// Returns [`EngineError::TypeInactiveForNewEntry`] when a new row would be
/// created for an inactive type.
pub fn ensure_ingestible(metric_type: &MetricType, has_existing: bool) -> EngineResult<()> {
    if MetricRegistry::is_active(metric_type) || has_existing {
        return Ok(());
    }

    Err(EngineError::TypeInactiveForNewEntry(metric_type.code.clone()))
}

/// Canonicalises a metric type identifier: trimmed, lowercase, with spaces
/// and hyphens folded into underscores.
///
/// # Errors
/// Returns [`EngineError::Validation`] for empty identifiers or characters
/// outside `[a-z0-9_]`.
pub fn normalize_code(raw: &str) -> EngineResult<String> {
    let code: String = raw
        .trim()
        .chars()
        .map(|ch| match ch {
            ' ' | '-' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect();

    if code.is_empty() {
        return Err(EngineError::Validation(
            "metric type identifier MUST be provided".to_string(),
        ));
    }

    if !code
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
    {
        return Err(EngineError::Validation(format!(
            "metric type identifier contains invalid characters: {raw}"
        )));
    }

    Ok(code)
}

/// Snapshot of the metric type catalog loaded inside one transaction.
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    types: Vec<MetricType>,
}

impl MetricRegistry {
    #[must_use]
    pub fn new(mut types: Vec<MetricType>) -> Self {
        types.sort_by(|lhs, rhs| lhs.code.cmp(&rhs.code));
        Self { types }
    }

    /// Resolves a metric type by code (any casing/spacing) or by id.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownMetricType`] when nothing matches and
    /// [`EngineError::Validation`] for malformed identifiers.
    pub fn resolve(&self, identifier: &str) -> EngineResult<&MetricType> {
        if let Some(found) = self
            .types
            .iter()
            .find(|item| item.metric_type_id.to_string() == identifier.trim())
        {
            return Ok(found);
        }

        let code = normalize_code(identifier)?;
        self.types
            .binary_search_by(|item| item.code.as_str().cmp(&code))
            .map(|index| &self.types[index])
            .map_err(|_| EngineError::UnknownMetricType(code))
    }

    #[must_use]
    pub fn get(&self, metric_type_id: crate::MetricTypeId) -> Option<&MetricType> {
        self.types
            .iter()
            .find(|item| item.metric_type_id == metric_type_id)
    }

    #[must_use]
    pub fn is_active(metric_type: &MetricType) -> bool {
        metric_type.is_active
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.types.iter().filter(|item| Self::is_active(item)).count()
    }

    #[must_use]
    pub fn types(&self) -> &[MetricType] {
        &self.types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetricTypeId;

    fn fixture_type(code: &str, category: MetricCategory, unit: MetricUnit) -> MetricType {
        MetricType {
            metric_type_id: MetricTypeId::generate(),
            code: code.to_string(),
            name: code.to_string(),
            category,
            unit,
            is_active: true,
        }
    }

    fn fixture_registry() -> MetricRegistry {
        MetricRegistry::new(
            CATALOG_V1
                .iter()
                .map(|entry| fixture_type(entry.code, entry.category, entry.unit))
                .collect(),
        )
    }

    #[test]
    fn resolve_normalizes_identifier_spelling() {
        let registry = fixture_registry();
        let resolved = match registry.resolve("  Recycled-Waste ") {
            Ok(value) => value,
            Err(err) => panic!("expected resolution: {err}"),
        };
        assert_eq!(resolved.code, "recycled_waste");
    }

    #[test]
    fn resolve_accepts_metric_type_id() {
        let registry = fixture_registry();
        let electricity = match registry.resolve("electricity") {
            Ok(value) => value.clone(),
            Err(err) => panic!("expected resolution: {err}"),
        };
        let by_id = registry.resolve(&electricity.metric_type_id.to_string());
        assert_eq!(by_id.map(|item| item.code.clone()), Ok("electricity".to_string()));
    }

    #[test]
    fn resolve_reports_unknown_types() {
        let registry = fixture_registry();
        assert_eq!(
            registry.resolve("solar_output").err(),
            Some(EngineError::UnknownMetricType("solar_output".to_string()))
        );
        assert!(matches!(
            registry.resolve("elec/tricity"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn percent_rule_caps_at_one_hundred() {
        let rate = fixture_type("recycling_rate", MetricCategory::Recycling, MetricUnit::Percent);
        assert!(validate_metric_value(&rate, 100.0).is_ok());
        assert!(matches!(
            validate_metric_value(&rate, 100.5),
            Err(EngineError::InvalidValue(_))
        ));
    }

    #[test]
    fn values_must_be_finite_and_non_negative() {
        let kwh = fixture_type("electricity", MetricCategory::Energy, MetricUnit::Kwh);
        assert!(validate_metric_value(&kwh, 0.0).is_ok());
        assert!(validate_metric_value(&kwh, 1_000_000.0).is_ok());
        assert!(validate_metric_value(&kwh, -0.1).is_err());
        assert!(validate_metric_value(&kwh, f64::NAN).is_err());
        assert!(validate_metric_value(&kwh, f64::INFINITY).is_err());
    }

    #[test]
    fn inactive_type_blocks_only_new_rows() {
        let mut gas = fixture_type("natural_gas", MetricCategory::Energy, MetricUnit::Kwh);
        gas.is_active = false;
        assert!(matches!(
            ensure_ingestible(&gas, false),
            Err(EngineError::TypeInactiveForNewEntry(_))
        ));
        assert!(ensure_ingestible(&gas, true).is_ok());
    }

    #[test]
    fn unit_rule_wins_over_generic_rule() {
        let rule = rule_for(MetricCategory::Recycling, MetricUnit::Percent);
        assert_eq!(rule.max, Some(100.0));
        let rule = rule_for(MetricCategory::Recycling, MetricUnit::Kg);
        assert_eq!(rule.max, None);
    }
}
