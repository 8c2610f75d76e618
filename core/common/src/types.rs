//! Common types used throughout Mailsync.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique identifier for an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create a new AccountId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains a path separator
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "AccountId cannot be empty".to_string(),
            ));
        }
        if id.contains('/') || id.contains('\\') {
            return Err(crate::Error::InvalidInput(
                "AccountId cannot contain separators".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an account organizes its mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrganizationUnit {
    /// Gmail-style labels; a thread may carry several.
    Label,
    /// IMAP/Exchange-style folders; a thread lives in one.
    Folder,
}

/// An account served by one sync worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub organization_unit: OrganizationUnit,
}

impl Account {
    pub fn new(id: AccountId, organization_unit: OrganizationUnit) -> Self {
        Self {
            id,
            organization_unit,
        }
    }

    /// The collection holding the account's labels or folders.
    pub fn primary_collection(&self) -> Collection {
        match self.organization_unit {
            OrganizationUnit::Label => Collection::Labels,
            OrganizationUnit::Folder => Collection::Folders,
        }
    }
}

/// A named remote resource set paginated and tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Threads,
    Labels,
    Folders,
    Drafts,
    Contacts,
    Calendars,
    Events,
}

impl Collection {
    /// Every collection the engine knows about.
    pub const ALL: [Collection; 7] = [
        Collection::Threads,
        Collection::Labels,
        Collection::Folders,
        Collection::Drafts,
        Collection::Contacts,
        Collection::Calendars,
        Collection::Events,
    ];

    /// Name used in persisted state and API paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Threads => "threads",
            Collection::Labels => "labels",
            Collection::Folders => "folders",
            Collection::Drafts => "drafts",
            Collection::Contacts => "contacts",
            Collection::Calendars => "calendars",
            Collection::Events => "events",
        }
    }

    /// Parse a collection name.
    pub fn parse(name: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == name)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown collection: {}", name)))
    }

    /// Whether this collection holds mailbox folders or labels.
    pub fn is_mailbox_container(&self) -> bool {
        matches!(self, Collection::Labels | Collection::Folders)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bounded-size slice of a collection fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub offset: u64,
    pub limit: u64,
}

impl PageRange {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// The first page of a collection.
    pub fn first(limit: u64) -> Self {
        Self { offset: 0, limit }
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offset={} limit={}", self.offset, self.limit)
    }
}

/// A metadata record attached to a remote object by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Object the metadata belongs to.
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Metadata records grouped by the object they belong to.
///
/// Rebuilt at the start of every sync pass and shared read-only with every
/// page request of that pass.
#[derive(Debug, Clone, Default)]
pub struct MetadataIndex {
    by_object: HashMap<String, Vec<MetadataRecord>>,
    records: usize,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, keeping arrival order per object.
    pub fn insert(&mut self, record: MetadataRecord) {
        self.by_object
            .entry(record.object_id.clone())
            .or_default()
            .push(record);
        self.records += 1;
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = MetadataRecord>) {
        for record in records {
            self.insert(record);
        }
    }

    /// Records for an object, in arrival order.
    pub fn get(&self, object_id: &str) -> &[MetadataRecord] {
        self.by_object
            .get(object_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of objects with at least one record.
    pub fn object_count(&self) -> usize {
        self.by_object.len()
    }

    /// Total number of records.
    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Copy each model's records onto the model.
    pub fn attach(&self, models: &mut [Model]) {
        for model in models {
            model.metadata = self.get(&model.id).to_vec();
        }
    }
}

/// A remote object as delivered by a collection endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    /// Display name; for folders and labels this is the canonical role name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<MetadataRecord>,
    /// Remaining attributes, kept as delivered.
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Model {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: None,
            name: None,
            metadata: Vec::new(),
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
