//! Column-mapping registry for supplemental sources.
//!
//! Supplemental files carry region-specific, non-standardized column layouts.
//! Each known layout is a named mapping from logical fields to that layout's
//! header names; a file selects its mapping by header signature, up front,
//! never by per-row heuristics. Unrecognized signatures fail the region with
//! a diagnostic naming the headers seen.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::models::AttributeField;
use crate::readers::table::Table;

/// One named column layout.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMapping {
    pub name: String,
    /// Header carrying the parcel identifier, when the layout has one.
    #[serde(default)]
    pub identifier: Option<String>,
    /// Header carrying the property address. Required in every layout.
    pub address: String,
    /// Logical attribute field -> header name.
    #[serde(default)]
    pub fields: BTreeMap<AttributeField, String>,
}

impl ColumnMapping {
    /// Every header this mapping references.
    fn referenced_headers(&self) -> Vec<&str> {
        let mut headers: Vec<&str> = vec![self.address.as_str()];
        if let Some(id) = &self.identifier {
            headers.push(id.as_str());
        }
        headers.extend(self.fields.values().map(|s| s.as_str()));
        headers
    }

    /// True when every referenced header is present in the table.
    pub fn matches(&self, table: &Table) -> bool {
        self.referenced_headers()
            .iter()
            .all(|h| table.column(h).is_some())
    }

    /// Specificity used to break ties between matching layouts.
    fn weight(&self) -> usize {
        self.referenced_headers().len()
    }
}

/// Registry of known supplemental layouts.
#[derive(Debug, Clone)]
pub struct MappingRegistry {
    mappings: Vec<ColumnMapping>,
}

impl MappingRegistry {
    /// A registry with no layouts; callers register their own.
    pub fn empty() -> Self {
        Self {
            mappings: Vec::new(),
        }
    }

    /// The layouts observed across regional feeds.
    pub fn builtin() -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(AttributeField::OwnerName, "OWNER_NAME".to_string());
        fields.insert(AttributeField::CoOwnerName, "CO_OWNER".to_string());
        fields.insert(AttributeField::MailingAddress, "MAILING_ADDRESS".to_string());
        fields.insert(AttributeField::AssessedValue, "ASSESSED_VALUE".to_string());
        fields.insert(AttributeField::AppraisedValue, "APPRAISED_VALUE".to_string());
        fields.insert(AttributeField::Zoning, "ZONING".to_string());
        fields.insert(AttributeField::LandUse, "LAND_USE".to_string());
        fields.insert(AttributeField::YearBuilt, "YEAR_BUILT".to_string());
        fields.insert(AttributeField::LivingArea, "LIVING_AREA".to_string());
        fields.insert(AttributeField::LastSalePrice, "SALE_PRICE".to_string());
        fields.insert(AttributeField::LastSaleDate, "SALE_DATE".to_string());
        let assessor_standard = ColumnMapping {
            name: "assessor-standard".to_string(),
            identifier: Some("PARCEL_ID".to_string()),
            address: "PROPERTY_ADDRESS".to_string(),
            fields,
        };

        let mut fields = BTreeMap::new();
        fields.insert(AttributeField::OwnerName, "OWNER".to_string());
        fields.insert(AttributeField::MailingAddress, "MAIL_ADDR".to_string());
        fields.insert(AttributeField::AssessedValue, "ASSESSMENT".to_string());
        fields.insert(AttributeField::AppraisedValue, "APPRAISAL".to_string());
        fields.insert(AttributeField::Zoning, "ZONE".to_string());
        fields.insert(AttributeField::YearBuilt, "AYB".to_string());
        fields.insert(AttributeField::LivingArea, "GLA".to_string());
        let vision_export = ColumnMapping {
            name: "vision-export".to_string(),
            identifier: Some("PID".to_string()),
            address: "LOCATION".to_string(),
            fields,
        };

        let mut fields = BTreeMap::new();
        fields.insert(AttributeField::OwnerName, "OWNER_1".to_string());
        fields.insert(AttributeField::CoOwnerName, "OWNER_2".to_string());
        fields.insert(AttributeField::AssessedValue, "NET_ASSESSMENT".to_string());
        fields.insert(AttributeField::LandUse, "USE_CODE".to_string());
        let grand_list = ColumnMapping {
            name: "grand-list".to_string(),
            identifier: Some("ACCOUNT".to_string()),
            address: "SITE_ADDRESS".to_string(),
            fields,
        };

        Self {
            mappings: vec![assessor_standard, vision_export, grand_list],
        }
    }

    /// Add a config-supplied layout. Later registrations win ties against
    /// builtins of equal specificity.
    pub fn register(&mut self, mapping: ColumnMapping) {
        self.mappings.insert(0, mapping);
    }

    pub fn get(&self, name: &str) -> Option<&ColumnMapping> {
        self.mappings.iter().find(|m| m.name == name)
    }

    /// Select the most specific layout whose full signature is present.
    pub fn detect(&self, table: &Table) -> Option<&ColumnMapping> {
        self.mappings
            .iter()
            .filter(|m| m.matches(table))
            .max_by_key(|m| m.weight())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_assessor_standard() {
        let t = Table::parse(
            "PARCEL_ID,PROPERTY_ADDRESS,OWNER_NAME,CO_OWNER,MAILING_ADDRESS,ASSESSED_VALUE,\
             APPRAISED_VALUE,ZONING,LAND_USE,YEAR_BUILT,LIVING_AREA,SALE_PRICE,SALE_DATE\n",
        )
        .unwrap();
        let registry = MappingRegistry::builtin();
        assert_eq!(registry.detect(&t).unwrap().name, "assessor-standard");
    }

    #[test]
    fn test_detect_vision_export() {
        let t = Table::parse("PID,LOCATION,OWNER,MAIL_ADDR,ASSESSMENT,APPRAISAL,ZONE,AYB,GLA\n")
            .unwrap();
        let registry = MappingRegistry::builtin();
        assert_eq!(registry.detect(&t).unwrap().name, "vision-export");
    }

    #[test]
    fn test_unknown_signature() {
        let t = Table::parse("COL_A,COL_B,COL_C\n").unwrap();
        let registry = MappingRegistry::builtin();
        assert!(registry.detect(&t).is_none());
    }

    #[test]
    fn test_partial_signature_does_not_match() {
        // vision-export minus its ASSESSMENT column: not a match.
        let t = Table::parse("PID,LOCATION,OWNER,MAIL_ADDR,APPRAISAL,ZONE,AYB,GLA\n").unwrap();
        let registry = MappingRegistry::builtin();
        assert!(registry.detect(&t).is_none());
    }

    #[test]
    fn test_registered_mapping_detected() {
        let mut registry = MappingRegistry::builtin();
        let mut fields = BTreeMap::new();
        fields.insert(AttributeField::OwnerName, "EIGENTUEMER".to_string());
        registry.register(ColumnMapping {
            name: "custom".to_string(),
            identifier: None,
            address: "STRASSE".to_string(),
            fields,
        });

        let t = Table::parse("STRASSE,EIGENTUEMER\n").unwrap();
        assert_eq!(registry.detect(&t).unwrap().name, "custom");
        assert!(registry.get("custom").is_some());
    }
}
