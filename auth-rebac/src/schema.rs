use crate::{
    error::{RebacError, Result},
    models::*,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// How a relation's membership is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetExpr {
    /// A fixed set, independent of the object being checked.
    Absolute { set: SetHandle },
    /// Objects reaching the contextual object through `label`.
    Relative { label: String },
    /// For every object the contextual object reaches through `from_label`,
    /// the members of its `relation`.
    Relative2 { from_label: String, relation: String },
    /// Members of any sub-expression.
    Union { exprs: Vec<SetExpr> },
}

impl SetExpr {
    pub fn absolute(object: Object, label: &str) -> Self {
        Self::Absolute {
            set: SetHandle::new(object, label),
        }
    }

    pub fn relative(label: &str) -> Self {
        Self::Relative {
            label: label.to_string(),
        }
    }

    pub fn relative2(from_label: &str, relation: &str) -> Self {
        Self::Relative2 {
            from_label: from_label.to_string(),
            relation: relation.to_string(),
        }
    }

    pub fn union(exprs: Vec<SetExpr>) -> Self {
        Self::Union { exprs }
    }

    /// The stored sets this expression is made of when evaluated on
    /// `contextual`, and whether that list is exhaustive. `Relative2` members
    /// depend on the graph and make the list incomplete.
    pub fn static_sets(&self, contextual: &Object) -> (BTreeSet<SetHandle>, bool) {
        let mut sets = BTreeSet::new();
        let complete = self.collect_static_sets(contextual, &mut sets);
        (sets, complete)
    }

    fn collect_static_sets(&self, contextual: &Object, sets: &mut BTreeSet<SetHandle>) -> bool {
        match self {
            Self::Absolute { set } => {
                sets.insert(set.clone());
                true
            }
            Self::Relative { label } => {
                sets.insert(SetHandle::new(contextual.clone(), label));
                true
            }
            Self::Relative2 { .. } => false,
            Self::Union { exprs } => exprs
                .iter()
                .fold(true, |complete, expr| expr.collect_static_sets(contextual, sets) && complete),
        }
    }

    fn validate(&self, path: &str) -> Result<()> {
        let blank = |value: &str| value.trim().is_empty();
        match self {
            Self::Absolute { set } => {
                set.object.validate()?;
                if blank(&set.label) {
                    return Err(RebacError::Validation(format!("{}: absolute set has a blank label", path)));
                }
            }
            Self::Relative { label } if blank(label) => {
                return Err(RebacError::Validation(format!("{}: relative label is blank", path)));
            }
            Self::Relative { .. } => {}
            Self::Relative2 { from_label, relation } => {
                if blank(from_label) || blank(relation) {
                    return Err(RebacError::Validation(format!(
                        "{}: relative2 needs both a from_label and a relation",
                        path
                    )));
                }
            }
            Self::Union { exprs } => {
                if exprs.is_empty() {
                    return Err(RebacError::Validation(format!("{}: union has no branches", path)));
                }
                for expr in exprs {
                    expr.validate(path)?;
                }
            }
        }
        Ok(())
    }
}

/// Relation definitions of one object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub relations: BTreeMap<String, SetExpr>,
}

impl TypeDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(mut self, name: &str, expr: SetExpr) -> Self {
        self.relations.insert(name.to_string(), expr);
        self
    }
}

/// Per-type relation definitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub types: BTreeMap<String, TypeDefinition>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, name: &str, definition: TypeDefinition) -> Self {
        self.types.insert(name.to_string(), definition);
        self
    }

    pub fn from_yaml(source: &str) -> Result<Self> {
        let schema: Self = serde_yaml::from_str(source)
            .map_err(|e| RebacError::Validation(format!("Invalid schema YAML: {}", e)))?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_json(source: &str) -> Result<Self> {
        let schema: Self = serde_json::from_str(source)
            .map_err(|e| RebacError::Validation(format!("Invalid schema JSON: {}", e)))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Validate the entire schema is well-formed
    pub fn validate(&self) -> Result<()> {
        for (type_name, definition) in &self.types {
            if type_name.is_empty() || type_name.contains(':') {
                return Err(RebacError::Validation(format!(
                    "Invalid type name '{}'",
                    type_name
                )));
            }
            for (relation, expr) in &definition.relations {
                if relation.trim().is_empty() {
                    return Err(RebacError::Validation(format!(
                        "Type '{}' defines a blank relation name",
                        type_name
                    )));
                }
                expr.validate(&format!("{}#{}", type_name, relation))?;
            }
        }
        Ok(())
    }

    /// The definition of `relation` on `object_type`, if any.
    pub fn lookup(&self, object_type: &str, relation: &str) -> Option<&SetExpr> {
        self.types.get(object_type)?.relations.get(relation)
    }

    /// Stable digest of the schema, used to namespace derived caches.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        // BTreeMaps serialize in key order.
        if let Ok(encoded) = serde_json::to_vec(self) {
            hasher.update(&encoded);
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCS_SCHEMA: &str = r#"
types:
  group:
    relations:
      member:
        kind: relative
        label: member
  folder:
    relations:
      viewer:
        kind: relative
        label: viewer
  doc:
    relations:
      editor:
        kind: relative
        label: editor
      viewer:
        kind: union
        exprs:
          - kind: relative
            label: viewer
          - kind: relative
            label: editor
          - kind: relative2
            from_label: parent
            relation: viewer
          - kind: absolute
            set:
              object: "system:root"
              label: admin
"#;

    #[test]
    fn test_schema_from_yaml() {
        let schema = Schema::from_yaml(DOCS_SCHEMA).unwrap();
        assert_eq!(schema.types.len(), 3);
        assert!(matches!(
            schema.lookup("doc", "viewer"),
            Some(SetExpr::Union { exprs }) if exprs.len() == 4
        ));
        assert!(schema.lookup("doc", "owner").is_none());
        assert!(schema.lookup("unknown", "viewer").is_none());
    }

    #[test]
    fn test_empty_union_rejected() {
        let schema = Schema::new().with_type(
            "doc",
            TypeDefinition::new().relation("viewer", SetExpr::union(vec![])),
        );
        assert!(matches!(schema.validate(), Err(RebacError::Validation(_))));
    }

    #[test]
    fn test_static_sets_completeness() {
        let doc = Object::new("doc", "1");
        let schema = Schema::from_yaml(DOCS_SCHEMA).unwrap();

        let (sets, complete) = schema.lookup("doc", "editor").unwrap().static_sets(&doc);
        assert!(complete);
        assert_eq!(sets.len(), 1);

        let (sets, complete) = schema.lookup("doc", "viewer").unwrap().static_sets(&doc);
        assert!(!complete);
        assert!(sets.contains(&SetHandle::new(doc.clone(), "editor")));
        assert!(sets.contains(&SetHandle::new(Object::new("system", "root"), "admin")));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = Schema::from_yaml(DOCS_SCHEMA).unwrap();
        let b = Schema::from_yaml(DOCS_SCHEMA).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = b.with_type("team", TypeDefinition::new().relation("member", SetExpr::relative("member")));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
