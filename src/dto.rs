//! Request and response bodies for the REST API.
//!
//! `*ForCreation` / `*ForUpdate` are deserialized from requests; `*Dto` are
//! serialized into responses and built from entities with `From`.
//! Timestamps leave the service as RFC 3339 strings.

use serde::{Deserialize, Serialize};

use crate::models::{
    Audit, Citation, ContentType, DocumentSourceType, FeedbackType, Message, MessageType, Node,
    Profile, Project, SourceDocument, SourceDocumentStatus, Thread,
};

pub fn iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Paging parameters accepted by list endpoints.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default = "default_page_number")]
    pub page_number: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page_number: default_page_number(),
            page_size: default_page_size(),
        }
    }
}

impl Page {
    pub fn limit(&self) -> i64 {
        self.page_size.clamp(1, 500) as i64
    }

    pub fn offset(&self) -> i64 {
        (self.page_number.max(1) as i64 - 1) * self.limit()
    }
}

fn default_page_number() -> u32 {
    1
}
fn default_page_size() -> u32 {
    50
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditDto {
    pub created_on: String,
    pub created_by: String,
    pub last_modified_on: String,
    pub last_modified_by: String,
}

impl From<Audit> for AuditDto {
    fn from(a: Audit) -> Self {
        Self {
            created_on: iso(a.created_on),
            created_by: a.created_by,
            last_modified_on: iso(a.last_modified_on),
            last_modified_by: a.last_modified_by,
        }
    }
}

// ============ Profiles ============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileForCreation {
    pub name: String,
    #[serde(default)]
    pub address_line1: Option<String>,
    #[serde(default)]
    pub address_line2: Option<String>,
    #[serde(default)]
    pub address_line3: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

pub type ProfileForUpdate = ProfileForCreation;

#[derive(Debug, Clone, Serialize)]
pub struct ProfileDto {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub address_line3: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub location_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(flatten)]
    pub audit: AuditDto,
}

impl From<Profile> for ProfileDto {
    fn from(p: Profile) -> Self {
        Self {
            id: p.id,
            user_id: p.user_id,
            name: p.name,
            address_line1: p.address_line1,
            address_line2: p.address_line2,
            address_line3: p.address_line3,
            city: p.city,
            postal_code: p.postal_code,
            country: p.country,
            location_id: p.location_id,
            latitude: p.latitude,
            longitude: p.longitude,
            audit: p.audit.into(),
        }
    }
}

// ============ Projects ============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectForCreation {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub type ProjectForUpdate = ProjectForCreation;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectDto {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub audit: AuditDto,
}

impl From<Project> for ProjectDto {
    fn from(p: Project) -> Self {
        Self {
            id: p.id,
            name: p.name,
            description: p.description,
            audit: p.audit.into(),
        }
    }
}

// ============ Threads ============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadForCreation {
    pub name: String,
}

pub type ThreadForUpdate = ThreadForCreation;

#[derive(Debug, Clone, Serialize)]
pub struct ThreadDto {
    pub id: String,
    pub name: String,
    pub has_pinned_messages: bool,
    #[serde(flatten)]
    pub audit: AuditDto,
}

impl From<Thread> for ThreadDto {
    fn from(t: Thread) -> Self {
        Self {
            id: t.id,
            name: t.name,
            has_pinned_messages: t.has_pinned_messages,
            audit: t.audit.into(),
        }
    }
}

// ============ Messages ============

#[derive(Debug, Clone, Deserialize)]
pub struct MessageForCreation {
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: ContentType,
    #[serde(default = "default_message_type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

impl MessageForCreation {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: default_content_type(),
            message_type: default_message_type(),
            citations: Vec::new(),
        }
    }
}

fn default_content_type() -> ContentType {
    ContentType::PlainText
}
fn default_message_type() -> MessageType {
    MessageType::User
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageForUpdate {
    pub content: String,
    pub content_type: ContentType,
    pub message_type: MessageType,
    pub feedback: FeedbackType,
    #[serde(default)]
    pub is_flagged: bool,
    #[serde(default)]
    pub is_pinned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageDto {
    pub id: String,
    pub thread_id: String,
    pub content: String,
    pub content_type: ContentType,
    pub message_type: MessageType,
    pub feedback: FeedbackType,
    pub is_flagged: bool,
    pub is_pinned: bool,
    pub citations: Vec<Citation>,
    #[serde(flatten)]
    pub audit: AuditDto,
}

impl From<Message> for MessageDto {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            thread_id: m.thread_id,
            content: m.content,
            content_type: m.content_type,
            message_type: m.message_type,
            feedback: m.feedback,
            is_flagged: m.is_flagged,
            is_pinned: m.is_pinned,
            citations: m.citations,
            audit: m.audit.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub question: String,
}

// ============ Nodes ============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeForCreation {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub is_asset: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub publication: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeForUpdate {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub is_asset: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub publication: Option<String>,
}

/// `parent_id: null` moves the node to the project root.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeParentUpdate {
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresignRequest {
    pub file_name: String,
    #[serde(default = "default_presign_method")]
    pub method: String,
}

fn default_presign_method() -> String {
    "PUT".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct PresignResponse {
    pub key: String,
    pub url: String,
    pub method: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeDto {
    pub id: String,
    pub project_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub file_name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub is_asset: bool,
    pub file_ext: Option<String>,
    pub url: Option<String>,
    pub s3_key: Option<String>,
    pub keywords: Option<String>,
    pub tags: Option<String>,
    pub publication: Option<String>,
    #[serde(flatten)]
    pub audit: AuditDto,
}

impl From<Node> for NodeDto {
    fn from(n: Node) -> Self {
        Self {
            id: n.id,
            project_id: n.project_id,
            parent_id: n.parent_id,
            name: n.name,
            file_name: n.file_name,
            display_name: n.display_name,
            description: n.description,
            author: n.author,
            language: n.language,
            is_asset: n.is_asset,
            file_ext: n.file_ext,
            url: n.url,
            s3_key: n.s3_key,
            keywords: n.keywords,
            tags: n.tags,
            publication: n.publication,
            audit: n.audit.into(),
        }
    }
}

// ============ Source documents ============

#[derive(Debug, Clone, Deserialize)]
pub struct SourceDocumentForCreation {
    pub name: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_source_type")]
    pub document_source_type: DocumentSourceType,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub storage_key: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub extracted_text: Option<String>,
    #[serde(default = "default_status")]
    pub status: SourceDocumentStatus,
}

impl SourceDocumentForCreation {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_id: None,
            display_name: None,
            description: None,
            tags: None,
            language: None,
            document_source_type: default_source_type(),
            url: None,
            storage_key: None,
            content_type: None,
            extracted_text: None,
            status: default_status(),
        }
    }
}

fn default_source_type() -> DocumentSourceType {
    DocumentSourceType::Blob
}
fn default_status() -> SourceDocumentStatus {
    SourceDocumentStatus::PrivateBucket
}

/// Partial update: absent or empty fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceDocumentForUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Query filters for listing source documents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceDocumentFilter {
    #[serde(default)]
    pub status: Option<SourceDocumentStatus>,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceDocumentDto {
    pub id: String,
    pub node_id: Option<String>,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub language: Option<String>,
    pub document_source_type: DocumentSourceType,
    pub url: Option<String>,
    pub storage_key: Option<String>,
    pub content_type: Option<String>,
    pub status: SourceDocumentStatus,
    pub is_trained: bool,
    pub import_warnings: Option<String>,
    pub error_text: Option<String>,
    pub date_trained: Option<String>,
    #[serde(flatten)]
    pub audit: AuditDto,
}

impl From<SourceDocument> for SourceDocumentDto {
    fn from(d: SourceDocument) -> Self {
        Self {
            id: d.id,
            node_id: d.node_id,
            name: d.name,
            display_name: d.display_name,
            description: d.description,
            tags: d.tags,
            language: d.language,
            document_source_type: d.document_source_type,
            url: d.url,
            storage_key: d.storage_key,
            content_type: d.content_type,
            status: d.status,
            is_trained: d.is_trained,
            import_warnings: d.import_warnings,
            error_text: d.error_text,
            date_trained: d.date_trained.map(iso),
            audit: d.audit.into(),
        }
    }
}

// ============ Search ============

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub min_similarity: Option<f32>,
    #[serde(default)]
    pub max_chunks: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHitDto {
    pub document_id: String,
    pub source_document: Option<String>,
    pub seq_no: u32,
    pub score: f32,
    pub content: String,
}
