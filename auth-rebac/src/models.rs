use crate::error::{RebacError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Label of group membership hops. Closure records keep the label of their
/// final hop only when every earlier hop carries this label.
pub const MEMBERSHIP_LABEL: &str = "member";

/// A typed node identifier in `"type:value"` form.
///
/// The type is everything before the first colon, so `"doc:a:b"` has type
/// `doc` and value `a:b`. Objects are globally scoped; two objects are the
/// same node exactly when their identifiers are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Object(String);

impl Object {
    pub fn new(object_type: &str, value: &str) -> Self {
        Self(format!("{}:{}", object_type, value))
    }

    /// Parse and validate an identifier.
    pub fn parse(raw: &str) -> Result<Self> {
        let object = Self(raw.to_string());
        object.validate()?;
        Ok(object)
    }

    pub fn validate(&self) -> Result<()> {
        match self.0.split_once(':') {
            Some((object_type, value)) if !object_type.is_empty() && !value.is_empty() => Ok(()),
            _ => Err(RebacError::Validation(format!(
                "Malformed object identifier '{}', expected 'type:value'",
                self.0
            ))),
        }
    }

    pub fn object_type(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(object_type, _)| object_type)
    }

    pub fn value(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, value)| value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Object {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Object {
    type Error = RebacError;

    fn try_from(value: String) -> Result<Self> {
        let object = Self(value);
        object.validate()?;
        Ok(object)
    }
}

impl From<Object> for String {
    fn from(object: Object) -> Self {
        object.0
    }
}

/// The identity of a direct relation: `from -name-> to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub from: Object,
    pub name: Option<String>,
    pub to: Object,
}

impl EdgeKey {
    pub fn new(from: Object, name: Option<&str>, to: Object) -> Self {
        Self {
            from,
            name: name.map(str::to_string),
            to,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.from.validate()?;
        self.to.validate()?;
        if self.from == self.to {
            return Err(RebacError::Validation(format!(
                "Self-referencing relation on {}",
                self.from
            )));
        }
        if matches!(self.name.as_deref(), Some(name) if name.trim().is_empty()) {
            return Err(RebacError::Validation("Relation name cannot be blank".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(ref name) => write!(f, "{} -{}-> {}", self.from, name, self.to),
            None => write!(f, "{} -> {}", self.from, self.to),
        }
    }
}

/// A stored direct relation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub from: Object,
    pub to: Object,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    /// A new edge with a random identifier.
    pub fn new(key: EdgeKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: key.from,
            to: key.to,
            name: key.name,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            from: self.from.clone(),
            name: self.name.clone(),
            to: self.to.clone(),
        }
    }

    pub fn matches(&self, key: &EdgeKey) -> bool {
        self.from == key.from && self.to == key.to && self.name == key.name
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key(), self.id)
    }
}

/// A materialized reachability fact. One record exists per distinct
/// derivation path, so a pair may have several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureRecord {
    pub id: Uuid,
    pub from: Object,
    pub to: Object,
    /// Label of the final hop, present only when every earlier hop is a
    /// [`MEMBERSHIP_LABEL`] hop.
    pub name: Option<String>,
    /// Edge IDs in path order, `from` first.
    pub path: Vec<Uuid>,
}

/// One path found by an ancestor or descendant traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalPath {
    /// The far end of the path (the ancestor, or the descendant).
    pub endpoint: Object,
    /// Traversed edge IDs, the hop touching the query root first.
    pub via: Vec<Uuid>,
    /// Label of the hop touching `endpoint`.
    pub far_name: Option<String>,
    /// Whether every hop except the one touching `endpoint` is a membership hop.
    pub through_members: bool,
}

impl TraversalPath {
    pub fn zero_hop(endpoint: Object, far_name: Option<String>) -> Self {
        Self {
            endpoint,
            via: Vec::new(),
            far_name,
            through_members: true,
        }
    }

    /// Whether every hop of the path is a membership hop. Holds for zero-hop paths.
    pub fn is_membership_chain(&self) -> bool {
        self.via.is_empty()
            || (self.through_members && self.far_name.as_deref() == Some(MEMBERSHIP_LABEL))
    }
}

/// A named bundle of verbs. Granting a role expands to one edge per verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub verbs: BTreeSet<String>,
}

impl Role {
    pub fn new<I, S>(id: &str, verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.to_string(),
            verbs: verbs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RebacError::Validation("Role id cannot be blank".to_string()));
        }
        if self.verbs.is_empty() {
            return Err(RebacError::Validation(format!("Role '{}' has no verbs", self.id)));
        }
        if self.verbs.iter().any(|verb| verb.trim().is_empty()) {
            return Err(RebacError::Validation(format!(
                "Role '{}' contains a blank verb",
                self.id
            )));
        }
        Ok(())
    }

    /// The edges granting this role on `object` to `subject`.
    pub fn expand(&self, subject: &Object, object: &Object) -> Vec<EdgeKey> {
        self.verbs
            .iter()
            .map(|verb| EdgeKey::new(subject.clone(), Some(verb.as_str()), object.clone()))
            .collect()
    }
}

/// Objects related to `object` via `label`; evaluated lazily.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetHandle {
    pub object: Object,
    pub label: String,
}

impl SetHandle {
    pub fn new(object: Object, label: &str) -> Self {
        Self {
            object,
            label: label.to_string(),
        }
    }
}

impl fmt::Display for SetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.object, self.label)
    }
}

impl FromStr for SetHandle {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        let (object, label) = s.rsplit_once('#').ok_or_else(|| {
            RebacError::Validation(format!("Malformed set '{}', expected 'type:value#label'", s))
        })?;
        if label.is_empty() {
            return Err(RebacError::Validation(format!("Set '{}' has an empty label", s)));
        }
        Ok(Self::new(Object::parse(object)?, label))
    }
}

/// Opaque cursor over edge-ID ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);

impl PageToken {
    pub fn after_edge(id: Uuid) -> Self {
        Self(URL_SAFE_NO_PAD.encode(id.as_bytes()))
    }

    pub fn edge_id(&self) -> Result<Uuid> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|_| RebacError::Validation("Malformed pagination token".to_string()))?;
        Uuid::from_slice(&bytes)
            .map_err(|_| RebacError::Validation("Malformed pagination token".to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PageToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Filter for listing direct relations. `None` fields act as wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationFilter {
    pub from: Option<Object>,
    pub to: Option<Object>,
    pub name: Option<String>,
    pub after: Option<PageToken>,
    pub limit: Option<usize>,
}

impl RelationFilter {
    pub fn with_from(mut self, object: Object) -> Self {
        self.from = Some(object);
        self
    }

    pub fn with_to(mut self, object: Object) -> Self {
        self.to = Some(object);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_after(mut self, token: PageToken) -> Self {
        self.after = Some(token);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, edge: &Edge) -> bool {
        self.from.as_ref().map_or(true, |from| *from == edge.from)
            && self.to.as_ref().map_or(true, |to| *to == edge.to)
            && self
                .name
                .as_ref()
                .map_or(true, |name| edge.name.as_ref() == Some(name))
    }
}

/// A page of relations ordered by edge ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationPage {
    pub edges: Vec<Edge>,
    pub next_page: Option<PageToken>,
}

/// One entry of a batch check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub subject: Object,
    pub relation: String,
    pub object: Object,
}

impl CheckRequest {
    pub fn new(subject: Object, relation: &str, object: Object) -> Self {
        Self {
            subject,
            relation: relation.to_string(),
            object,
        }
    }
}
