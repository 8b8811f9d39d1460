//! Core data models for CX Container.
//!
//! Entities map one-to-one onto SQLite rows (see [`crate::migrate`]).
//! The small closed vocabularies (content types, message types, statuses,
//! roles) are string-backed enums that parse case-insensitively and are
//! stored by their canonical name.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

use crate::error::CxError;

macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $name {
            type Err = CxError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.name().eq_ignore_ascii_case(wanted))
                    .ok_or_else(|| {
                        CxError::Validation(format!(
                            "Invalid {} '{}'. Valid values: {}",
                            stringify!($name),
                            s,
                            Self::ALL.iter().map(|v| v.name()).collect::<Vec<_>>().join(", ")
                        ))
                    })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.name())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

named_enum!(ContentType {
    PlainText => "PlainText",
    Markdown => "Markdown",
    Html => "Html",
    Audio => "Audio",
    Video => "Video",
    Image => "Image",
});

named_enum!(MessageType {
    User => "User",
    System => "System",
    Error => "Error",
});

named_enum!(FeedbackType {
    None => "None",
    Positive => "Positive",
    Negative => "Negative",
});

named_enum!(Role {
    User => "User",
    SuperAdmin => "SuperAdmin",
    Restricted => "Restricted",
});

named_enum!(
    /// Lifecycle of a source document from upload to trained.
    SourceDocumentStatus {
        PublicBucket => "PublicBucket",
        PrivateBucket => "PrivateBucket",
        Ocr => "OCR",
        Scraping => "Scraping",
        OcrDone => "OCRDone",
        Decorating => "Decorating",
        DecoratingDone => "DecoratingDone",
        Training => "Training",
        TrainingDone => "TrainingDone",
        QueuedForRetrain => "QueuedForRetrain",
        Done => "Done",
        Error => "Error",
    }
);

named_enum!(DocumentSourceType {
    Blob => "Blob",
    Site => "Site",
});

/// Parses a stored enum column; a bad value in the database is a decode error.
fn column_enum<T: FromStr<Err = CxError>>(row: &SqliteRow, col: &str) -> sqlx::Result<T> {
    let raw: String = row.try_get(col)?;
    raw.parse().map_err(|e: CxError| sqlx::Error::ColumnDecode {
        index: col.to_string(),
        source: Box::new(e),
    })
}

/// Audit columns shared by every entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Audit {
    pub created_on: i64,
    pub created_by: String,
    pub last_modified_on: i64,
    pub last_modified_by: String,
    pub is_deleted: bool,
}

impl Audit {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            created_on: row.try_get("created_on")?,
            created_by: row.try_get("created_by")?,
            last_modified_on: row.try_get("last_modified_on")?,
            last_modified_by: row.try_get("last_modified_by")?,
            is_deleted: row.try_get::<i64, _>("is_deleted")? != 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Profile {
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
    pub audit: Audit,
}

impl Profile {
    pub fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            address_line1: row.try_get("address_line1")?,
            address_line2: row.try_get("address_line2")?,
            address_line3: row.try_get("address_line3")?,
            city: row.try_get("city")?,
            postal_code: row.try_get("postal_code")?,
            country: row.try_get("country")?,
            location_id: row.try_get("location_id")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            audit: Audit::from_row(row)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub audit: Audit,
}

impl Project {
    pub fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            audit: Audit::from_row(row)?,
        })
    }
}

/// A conversation. The owner is whoever created it.
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: String,
    pub name: String,
    pub has_pinned_messages: bool,
    pub audit: Audit,
}

impl Thread {
    pub fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            has_pinned_messages: row.try_get::<i64, _>("has_pinned_messages")? != 0,
            audit: Audit::from_row(row)?,
        })
    }

    pub fn owner(&self) -> &str {
        &self.audit.created_by
    }
}

/// Reference from an answer back to the document it was drawn from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub content: String,
    pub content_type: ContentType,
    pub message_type: MessageType,
    pub feedback: FeedbackType,
    pub is_flagged: bool,
    pub is_pinned: bool,
    pub citations: Vec<Citation>,
    pub audit: Audit,
}

impl Message {
    pub fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let citations_json: String = row.try_get("citations_json")?;
        let citations = serde_json::from_str(&citations_json).map_err(|e| {
            sqlx::Error::ColumnDecode {
                index: "citations_json".to_string(),
                source: Box::new(e),
            }
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            thread_id: row.try_get("thread_id")?,
            content: row.try_get("content")?,
            content_type: column_enum(row, "content_type")?,
            message_type: column_enum(row, "message_type")?,
            feedback: column_enum(row, "feedback")?,
            is_flagged: row.try_get::<i64, _>("is_flagged")? != 0,
            is_pinned: row.try_get::<i64, _>("is_pinned")? != 0,
            citations,
            audit: Audit::from_row(row)?,
        })
    }
}

/// A folder or file in a project's document tree.
#[derive(Debug, Clone)]
pub struct Node {
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
    pub audit: Audit,
}

impl Node {
    pub fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            parent_id: row.try_get("parent_id")?,
            name: row.try_get("name")?,
            file_name: row.try_get("file_name")?,
            display_name: row.try_get("display_name")?,
            description: row.try_get("description")?,
            author: row.try_get("author")?,
            language: row.try_get("language")?,
            is_asset: row.try_get::<i64, _>("is_asset")? != 0,
            file_ext: row.try_get("file_ext")?,
            url: row.try_get("url")?,
            s3_key: row.try_get("s3_key")?,
            keywords: row.try_get("keywords")?,
            tags: row.try_get("tags")?,
            publication: row.try_get("publication")?,
            audit: Audit::from_row(row)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SourceDocument {
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
    pub extracted_text: Option<String>,
    pub import_warnings: Option<String>,
    pub error_text: Option<String>,
    pub date_trained: Option<i64>,
    pub audit: Audit,
}

impl SourceDocument {
    pub fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            name: row.try_get("name")?,
            display_name: row.try_get("display_name")?,
            description: row.try_get("description")?,
            tags: row.try_get("tags")?,
            language: row.try_get("language")?,
            document_source_type: column_enum(row, "document_source_type")?,
            url: row.try_get("url")?,
            storage_key: row.try_get("storage_key")?,
            content_type: row.try_get("content_type")?,
            status: column_enum(row, "status")?,
            is_trained: row.try_get::<i64, _>("is_trained")? != 0,
            extracted_text: row.try_get("extracted_text")?,
            import_warnings: row.try_get("import_warnings")?,
            error_text: row.try_get("error_text")?,
            date_trained: row.try_get("date_trained")?,
            audit: Audit::from_row(row)?,
        })
    }
}

/// One bucket of a per-month count report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthCount {
    pub year: i32,
    pub month: u32,
    pub count: i64,
}
