//! Entity, claim and entity-type records shared by every agent.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ConfigError;

/// Run-local identifier for an entity.
///
/// Entities seeded from the graph store reuse their graph id so patches can
/// be addressed without a lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalEntityId(Uuid);

impl LocalEntityId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LocalEntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalEntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for LocalEntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A named entity discovered during research.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySummary {
    /// Run-local id.
    pub local_id: LocalEntityId,
    /// Display name as it appears in sources.
    pub name: String,
    /// One or two sentence description.
    pub summary: String,
    /// Entity type this entity belongs to.
    pub entity_type_id: String,
}

/// A single atomic fact about a subject entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Unique claim id.
    pub claim_id: Uuid,
    /// The fact, opening with the subject's name.
    pub text: String,
    /// Entity the claim is about.
    pub subject_entity_local_id: LocalEntityId,
    /// Second entity the claim relates the subject to, if any.
    pub object_entity_local_id: Option<LocalEntityId>,
    /// Qualifiers such as dates or places ("in 2019", "at Geneva").
    #[serde(default)]
    pub prepositional_phrases: Vec<String>,
    /// URLs the claim was taken from.
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Claim {
    /// Entity ids the claim refers to.
    pub fn entity_ids(&self) -> impl Iterator<Item = LocalEntityId> + '_ {
        std::iter::once(self.subject_entity_local_id).chain(self.object_entity_local_id)
    }

    /// Rewrites subject and object ids through `canonical`.
    pub fn rewrite_ids(&mut self, canonical: &HashMap<LocalEntityId, LocalEntityId>) {
        if let Some(id) = canonical.get(&self.subject_entity_local_id) {
            self.subject_entity_local_id = *id;
        }
        if let Some(object) = self.object_entity_local_id
            && let Some(id) = canonical.get(&object)
        {
            self.object_entity_local_id = Some(*id);
        }
    }
}

/// One group of summaries describing the same real-world entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateReport {
    /// Id that survives.
    pub canonical_id: LocalEntityId,
    /// Ids that are folded into the canonical one.
    pub duplicate_ids: Vec<LocalEntityId>,
}

/// Entity type the research is looking for.
///
/// `properties_schema` is an opaque JSON Schema object describing the
/// entity's properties; it is handed to the proposal agent as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeDefinition {
    /// Stable type identifier (usually a versioned URL).
    #[serde(alias = "$id", alias = "entityTypeId")]
    pub entity_type_id: String,
    /// Human-readable name.
    pub title: String,
    /// What instances of the type are.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the type's properties.
    #[serde(alias = "schema", alias = "propertiesSchema")]
    pub properties_schema: Value,
}

impl EntityTypeDefinition {
    /// Loads and checks a definition from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EntityType`] if the file cannot be read or
    /// parsed, the id is empty, or the schema is not an object.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::EntityType {
            path: path.display().to_string(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        Self::from_json_str(&text).map_err(invalid)
    }

    /// Parses and checks a definition.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn from_json_str(text: &str) -> Result<Self, String> {
        let definition: Self = serde_json::from_str(text).map_err(|e| e.to_string())?;
        if definition.entity_type_id.trim().is_empty() {
            return Err("entity_type_id must not be empty".to_string());
        }
        if !definition.properties_schema.is_object() {
            return Err("properties_schema must be a JSON object".to_string());
        }
        Ok(definition)
    }
}

/// A structured entity proposed for the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEntity {
    /// Run-local id of the summary it was built from.
    pub local_entity_id: LocalEntityId,
    /// Entity type.
    pub entity_type_id: String,
    /// Display name.
    pub name: String,
    /// Summary carried over from the entity summary.
    pub summary: String,
    /// Property values conforming to the type's schema.
    pub properties: Map<String, Value>,
    /// Claims the properties were derived from.
    pub claim_ids: Vec<Uuid>,
}
