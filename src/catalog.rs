use crate::error::{ExtractionError, Result};
use crate::schema::{Severity, TemplateField};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const HARDWARE_OVERVIEW: &str = include_str!("../catalogs/hardware_overview.json");

/// The static, ordered set of fields every document is measured against.
///
/// Declaration order is significant: gap reports fall back to it when two
/// gaps share a severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateCatalog {
    pub name: String,
    fields: Vec<TemplateField>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    name: Option<String>,
    fields: Vec<TemplateField>,
}

impl TemplateCatalog {
    pub fn new(name: impl Into<String>, fields: Vec<TemplateField>) -> Result<Self> {
        if fields.is_empty() {
            return Err(ExtractionError::ConfigurationError(
                "Template catalog must declare at least one field".to_string(),
            ));
        }

        let mut index = HashMap::with_capacity(fields.len());
        for (position, field) in fields.iter().enumerate() {
            if field.id.trim().is_empty() {
                return Err(ExtractionError::ConfigurationError(format!(
                    "Template field #{} has a blank id",
                    position
                )));
            }
            if field.display_name.trim().is_empty() {
                return Err(ExtractionError::ConfigurationError(format!(
                    "Template field '{}' has a blank display name",
                    field.id
                )));
            }
            if index.insert(field.id.clone(), position).is_some() {
                return Err(ExtractionError::ConfigurationError(format!(
                    "Duplicate template field id '{}'",
                    field.id
                )));
            }
        }

        let catalog = Self {
            name: name.into(),
            fields,
            index,
        };
        debug!(
            "Loaded template catalog '{}' with {} fields ({} required)",
            catalog.name,
            catalog.len(),
            catalog.required_fields().count()
        );
        Ok(catalog)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json).map_err(|e| {
            ExtractionError::ConfigurationError(format!("Invalid catalog JSON: {}", e))
        })?;
        Self::new(file.name.unwrap_or_else(|| "Unnamed catalog".to_string()), file.fields)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ExtractionError::ConfigurationError(format!(
                "Cannot read catalog {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&json)
    }

    /// The bundled 31-field hardware overview catalog.
    pub fn hardware_overview() -> Result<Self> {
        Self::from_json(HARDWARE_OVERVIEW)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[TemplateField] {
        &self.fields
    }

    pub fn iter(&self) -> impl Iterator<Item = &TemplateField> {
        self.fields.iter()
    }

    pub fn get(&self, id: &str) -> Option<&TemplateField> {
        self.position(id).map(|p| &self.fields[p])
    }

    /// Declaration position of a field.
    pub fn position(&self, id: &str) -> Option<usize> {
        if self.index.is_empty() {
            // deserialized catalogs skip the index
            return self.fields.iter().position(|f| f.id == id);
        }
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &TemplateField> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!("# Template Catalog - {}\n\n", self.name));
        output.push_str(&format!(
            "**Fields:** {} ({} required)\n\n",
            self.len(),
            self.required_fields().count()
        ));

        for severity in [Severity::Critical, Severity::High, Severity::Medium, Severity::Low] {
            let fields: Vec<&TemplateField> = self
                .fields
                .iter()
                .filter(|f| f.severity_class == severity)
                .collect();
            if fields.is_empty() {
                continue;
            }

            output.push_str(&format!("## {}\n\n", severity.label()));
            for field in fields {
                let required_marker = if field.required { " **[REQUIRED]**" } else { "" };
                output.push_str(&format!(
                    "- {} (`{}`, {:?}){}\n",
                    field.display_name, field.id, field.expected_kind, required_marker
                ));
            }
            output.push('\n');
        }

        output
    }
}
