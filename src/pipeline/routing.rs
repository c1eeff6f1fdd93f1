//! Priority-ordered routing of free text onto categories.
//!
//! A [`RuleTable`] is an ordered list of case-insensitive regex predicates.
//! The first rule that matches wins; nothing matching yields the table's
//! fallback with confidence `0.0`. Sector parameters for the economic step
//! and the curated supplementary source catalogues hang off the
//! [`Sector`] routed this way.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::store::NewSource;

pub struct Rule<C> {
    pub name: &'static str,
    pattern: Regex,
    pub category: C,
    pub confidence: f64,
}

/// Result of routing a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Routed<C> {
    pub category: C,
    pub confidence: f64,
    /// Name of the matching rule, `None` for the fallback.
    pub rule: Option<&'static str>,
}

pub struct RuleTable<C> {
    rules: Vec<Rule<C>>,
    fallback: C,
}

impl<C: Clone> RuleTable<C> {
    pub fn new(fallback: C) -> Self {
        Self {
            rules: Vec::new(),
            fallback,
        }
    }

    /// Append a rule. Earlier rules take priority.
    pub fn rule(mut self, name: &'static str, pattern: &str, category: C, confidence: f64) -> Result<Self> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("Invalid routing pattern for rule '{}'", name))?;
        self.rules.push(Rule {
            name,
            pattern,
            category,
            confidence,
        });
        Ok(self)
    }

    pub fn route(&self, text: &str) -> Routed<C> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(text))
            .map(|rule| Routed {
                category: rule.category.clone(),
                confidence: rule.confidence,
                rule: Some(rule.name),
            })
            .unwrap_or_else(|| Routed {
                category: self.fallback.clone(),
                confidence: 0.0,
                rule: None,
            })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ── Sectors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sector {
    Pharmacy,
    RetailLocation,
    Generic,
}

/// Baseline economics used by the impact estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectorParams {
    /// Units sold per period at baseline
    pub baseline_units: f64,
    /// Gross margin per unit, percent
    pub margin_pct: f64,
    pub typical_investment: f64,
    /// Annual cost of capital, percent
    pub capital_cost_pct: f64,
}

impl Sector {
    pub fn params(&self) -> SectorParams {
        match self {
            Sector::Pharmacy => SectorParams {
                baseline_units: 3_800.0,
                margin_pct: 30.0,
                typical_investment: 50_000.0,
                capital_cost_pct: 5.0,
            },
            Sector::RetailLocation => SectorParams {
                baseline_units: 1.0,
                margin_pct: 15.0,
                typical_investment: 40_000_000.0,
                capital_cost_pct: 8.0,
            },
            Sector::Generic => SectorParams {
                baseline_units: 1.0,
                margin_pct: 20.0,
                typical_investment: 500_000.0,
                capital_cost_pct: 6.0,
            },
        }
    }

    /// Curated sources used when the supplementary search returns nothing
    /// usable.
    pub fn supplementary_catalogue(&self) -> Vec<NewSource> {
        match self {
            Sector::Pharmacy => vec![
                catalogue_entry("EMA Shortages Catalogue", "https://www.ema.europa.eu/en/human-regulatory-overview/post-authorisation/medicine-shortages-availability-issues", "regulatory", 9.0, "weekly"),
                catalogue_entry("Datacomex", "https://comercio.gob.es/estadisticas", "trade_statistics", 8.0, "monthly"),
                catalogue_entry("INE CNAE 21", "https://www.ine.es", "official_statistics", 9.0, "quarterly"),
                catalogue_entry("CGCOF/CISMED", "https://www.farmaceuticos.com", "professional_network", 8.0, "weekly"),
                catalogue_entry("BOE/AEMPS Alertas", "https://www.aemps.gob.es", "regulatory", 9.0, "daily"),
                catalogue_entry("AEMET", "https://www.aemet.es", "climate", 8.0, "daily"),
            ],
            Sector::RetailLocation | Sector::Generic => Vec::new(),
        }
    }
}

fn catalogue_entry(name: &str, url: &str, source_type: &str, reliability: f64, frequency: &str) -> NewSource {
    NewSource {
        name: name.to_string(),
        url: Some(url.to_string()),
        source_type: source_type.to_string(),
        reliability,
        update_frequency: Some(frequency.to_string()),
        tier: Some("curated".to_string()),
    }
}

/// Sector rules, most specific first.
pub fn sector_table() -> Result<RuleTable<Sector>> {
    RuleTable::new(Sector::Generic)
        .rule(
            "pharmacy",
            r"farmac|pharma|medicamento|botica",
            Sector::Pharmacy,
            0.9,
        )?
        .rule(
            "retail_location",
            r"centro.?comercial|shopping|mall|retail.*superficie|ubicaci[oó]n.*comercial|localizaci[oó]n",
            Sector::RetailLocation,
            0.8,
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_routing() {
        let table = sector_table().unwrap();
        let routed = table.route("Demanda de medicamentos en farmacias de Madrid");
        assert_eq!(routed.category, Sector::Pharmacy);
        assert_eq!(routed.rule, Some("pharmacy"));
        assert_eq!(routed.confidence, 0.9);

        let routed = table.route("Best SHOPPING centre location");
        assert_eq!(routed.category, Sector::RetailLocation);

        let routed = table.route("Ubicación comercial óptima");
        assert_eq!(routed.category, Sector::RetailLocation);
    }

    #[test]
    fn test_first_match_wins() {
        let table = sector_table().unwrap();
        // Both rules match; the pharmacy rule is earlier.
        let routed = table.route("pharmacy inside a mall");
        assert_eq!(routed.category, Sector::Pharmacy);
    }

    #[test]
    fn test_fallback_has_zero_confidence() {
        let table = sector_table().unwrap();
        let routed = table.route("solar panel adoption");
        assert_eq!(routed.category, Sector::Generic);
        assert_eq!(routed.confidence, 0.0);
        assert_eq!(routed.rule, None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = RuleTable::new(0u8).rule("bad", "(unclosed", 1, 1.0);
        assert!(result.is_err());
    }

    #[test]
    fn test_sector_params_and_catalogue() {
        assert_eq!(Sector::Pharmacy.params().baseline_units, 3_800.0);
        assert_eq!(Sector::RetailLocation.params().typical_investment, 40_000_000.0);
        assert_eq!(Sector::Generic.params().capital_cost_pct, 6.0);
        let catalogue = Sector::Pharmacy.supplementary_catalogue();
        assert_eq!(catalogue.len(), 6);
        assert!(catalogue.iter().any(|s| s.name == "AEMET"));
        assert!(Sector::Generic.supplementary_catalogue().is_empty());
    }
}
