//! Text chunks and their metadata.
//!
//! A [`TextChunk`] is the unit stored in a chunk archive and handed to the
//! chat model as context. Besides its content it carries [`ChunkMeta`],
//! part of which is rendered into the text the model sees
//! ([`TextChunk::metadata_string`]) and part of which is internal
//! bookkeeping (document id, group, page numbers, table flag).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::tokens::count_tokens;

pub const KEY_SOURCE_DOCUMENT: &str = "Source Document";
pub const KEY_DOCUMENT_DESCRIPTION: &str = "Source Document Description";
pub const KEY_TAGS: &str = "Source Document Tags";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub source_document: Option<String>,
    #[serde(default)]
    pub source_document_group: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub page_nos: BTreeSet<u32>,
    #[serde(default)]
    pub contains_tables: bool,
    /// Additional `key: value` lines shown to the model, in order.
    #[serde(default)]
    pub extra: Vec<(String, String)>,
}

impl ChunkMeta {
    /// Fills fields missing here from `other` and unions the page sets.
    pub fn merge(&mut self, other: &ChunkMeta) {
        fn fill(slot: &mut Option<String>, from: &Option<String>) {
            if slot.is_none() {
                slot.clone_from(from);
            }
        }
        fill(&mut self.document_id, &other.document_id);
        fill(&mut self.source_document, &other.source_document);
        fill(&mut self.source_document_group, &other.source_document_group);
        fill(&mut self.description, &other.description);
        fill(&mut self.tags, &other.tags);
        self.page_nos.extend(other.page_nos.iter().copied());
        self.contains_tables |= other.contains_tables;
        for (k, v) in &other.extra {
            if !self.extra.iter().any(|(ek, _)| ek == k) {
                self.extra.push((k.clone(), v.clone()));
            }
        }
    }

    pub fn first_page(&self) -> Option<u32> {
        self.page_nos.iter().next().copied()
    }
}

/// Strips the final extension from a file name, leaving any directory part.
fn without_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(dot) if !name[dot..].contains('/') && dot > 0 => &name[..dot],
        _ => name,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub seq_no: u32,
    pub content: String,
    pub est_tokens: usize,
    pub metadata: ChunkMeta,
    #[serde(default)]
    pub prev_content: Option<String>,
    #[serde(default)]
    pub next_content: Option<String>,
}

impl TextChunk {
    pub fn new(content: impl Into<String>, metadata: ChunkMeta) -> Self {
        let mut chunk = Self {
            seq_no: 0,
            content: content.into(),
            est_tokens: 0,
            metadata,
            prev_content: None,
            next_content: None,
        };
        chunk.est_tokens = count_tokens(&chunk.context_string());
        chunk
    }

    /// A standalone chunk whose document id is derived from its text.
    pub fn from_text(text: &str) -> Self {
        let digest = Sha256::digest(text.as_bytes());
        let meta = ChunkMeta {
            document_id: Some(hex::encode(&digest[..16])),
            ..Default::default()
        };
        Self::new(text, meta)
    }

    pub fn document_id(&self) -> Option<&str> {
        self.metadata.document_id.as_deref()
    }

    /// Visible metadata as `*key*: value` lines followed by a blank line.
    pub fn metadata_string(&self) -> String {
        let m = &self.metadata;
        let mut out = String::new();
        if let Some(doc) = &m.source_document {
            out.push_str(&format!("*{}*: {}\n", KEY_SOURCE_DOCUMENT, without_extension(doc)));
        }
        if let Some(desc) = &m.description {
            out.push_str(&format!("*{}*: {}\n", KEY_DOCUMENT_DESCRIPTION, desc));
        }
        if let Some(tags) = &m.tags {
            out.push_str(&format!("*{}*: {}\n", KEY_TAGS, tags));
        }
        for (k, v) in &m.extra {
            out.push_str(&format!("*{}*: {}\n", k, v));
        }
        out.push('\n');
        out
    }

    /// Metadata plus content; what the chat model is given.
    pub fn context_string(&self) -> String {
        format!("{}{}", self.metadata_string(), self.content)
            .trim()
            .to_string()
    }

    /// Metadata plus neighbouring content; what gets embedded.
    pub fn surrounding_context_string(&self) -> String {
        let mut out = self.metadata_string();
        if let Some(prev) = &self.prev_content {
            out.push_str(prev);
            out.push('\n');
        }
        out.push_str(&self.content);
        out.push('\n');
        if let Some(next) = &self.next_content {
            out.push_str(next);
            out.push('\n');
        }
        out.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ChunkMeta {
        ChunkMeta {
            document_id: Some("doc-1".into()),
            source_document: Some("reports/annual.pdf".into()),
            source_document_group: Some("finance".into()),
            description: Some("Annual report".into()),
            tags: None,
            page_nos: [3, 1].into_iter().collect(),
            contains_tables: true,
            extra: vec![("Region".into(), "EMEA".into())],
        }
    }

    #[test]
    fn metadata_string_hides_internal_fields() {
        let chunk = TextChunk::new("body", meta());
        let s = chunk.metadata_string();
        assert_eq!(
            s,
            "*Source Document*: reports/annual\n*Source Document Description*: Annual report\n*Region*: EMEA\n\n"
        );
        assert!(!s.contains("doc-1"));
        assert!(!s.contains("finance"));
    }

    #[test]
    fn context_string_is_trimmed_and_sets_tokens() {
        let chunk = TextChunk::new("hello world  \n", ChunkMeta::default());
        assert_eq!(chunk.context_string(), "hello world");
        assert_eq!(chunk.est_tokens, count_tokens("hello world"));
    }

    #[test]
    fn surrounding_context_includes_neighbours() {
        let mut chunk = TextChunk::new("middle", ChunkMeta::default());
        chunk.prev_content = Some("before".into());
        chunk.next_content = Some("after".into());
        assert_eq!(chunk.surrounding_context_string(), "before\nmiddle\nafter");
    }

    #[test]
    fn from_text_is_deterministic() {
        let a = TextChunk::from_text("same text");
        let b = TextChunk::from_text("same text");
        let c = TextChunk::from_text("other text");
        assert_eq!(a.document_id(), b.document_id());
        assert_ne!(a.document_id(), c.document_id());
    }

    #[test]
    fn merge_fills_gaps_and_unions_pages() {
        let mut a = ChunkMeta {
            page_nos: [2].into_iter().collect(),
            ..Default::default()
        };
        a.merge(&meta());
        assert_eq!(a.document_id.as_deref(), Some("doc-1"));
        assert_eq!(a.page_nos.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(a.first_page(), Some(1));
        assert!(a.contains_tables);
    }

    #[test]
    fn extension_stripping() {
        assert_eq!(without_extension("a.b.txt"), "a.b");
        assert_eq!(without_extension("dir.v2/readme"), "dir.v2/readme");
        assert_eq!(without_extension(".hidden"), ".hidden");
    }
}
