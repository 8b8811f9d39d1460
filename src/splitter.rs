//! Line-oriented document splitter.
//!
//! Turns extracted document text into a sequence of [`TextChunk`]s:
//!
//! 1. Line endings are normalised and words hyphenated across a line
//!    break are joined (`infor-\nmation` → `information`).
//! 2. The text is read line by line into segments. Each run of newlines
//!    ending a line becomes that segment's end-of-line strength; blank
//!    lines add to the previous segment's strength.
//! 3. `--- PAGE n ---` lines set the current page, which is recorded in
//!    every following segment. With a page limit, segments on other pages
//!    are dropped.
//! 4. Segments above the token limit are halved until they fit.
//! 5. Neighbouring segments are merged while the result stays under the
//!    limit: first only table rows with table rows and prose with prose,
//!    then without that restriction.
//! 6. Each segment becomes a chunk (`seq_no` from 1), prefixed with its
//!    first page marker, and chunks are linked to their neighbours.

use tracing::debug;

use crate::chunk::{ChunkMeta, TextChunk};
use crate::tokens::count_tokens;

#[derive(Debug, Clone)]
pub struct SplitRequest<'a> {
    pub document: &'a str,
    /// Metadata every chunk inherits (document id, source name, ...).
    pub meta: ChunkMeta,
    pub page_limit: Option<&'a [u32]>,
    pub token_limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub content: String,
    pub est_tokens: usize,
    pub eol_strength: usize,
    pub meta: ChunkMeta,
    pub contains_tables: bool,
}

impl Segment {
    fn new(content: String) -> Self {
        let est_tokens = count_tokens(&content);
        Self {
            content,
            est_tokens,
            eol_strength: 0,
            meta: ChunkMeta::default(),
            contains_tables: false,
        }
    }

    fn is_table_row(&self) -> bool {
        self.content.starts_with('|') && self.content.ends_with('|')
    }

    fn inherit(content: String, src: &Segment) -> Self {
        let mut seg = Segment::new(content);
        seg.eol_strength = src.eol_strength;
        seg.contains_tables = src.contains_tables;
        seg.meta = src.meta.clone();
        seg
    }

    fn can_merge_with(&self, next: &Segment, token_limit: usize, table_aware: bool) -> bool {
        if table_aware && self.is_table_row() != next.is_table_row() {
            return false;
        }
        self.est_tokens + next.est_tokens < token_limit
    }

    fn merge(&self, next: &Segment) -> Segment {
        let mut merged = Segment::new(format!("{}\n{}", self.content, next.content));
        merged.eol_strength = next.eol_strength;
        merged.meta = next.meta.clone();
        merged.meta.merge(&self.meta);
        merged.contains_tables = self.is_table_row()
            || next.is_table_row()
            || self.contains_tables
            || next.contains_tables;
        merged
    }

    fn into_chunk(self) -> TextChunk {
        let mut content = self.content;
        if let Some(page) = self.meta.first_page() {
            if !content.starts_with("---") {
                content = format!("--- PAGE {} ---\n{}", page, content);
            }
        }
        let mut meta = self.meta;
        meta.contains_tables |= self.contains_tables;
        TextChunk::new(content, meta)
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Joins `word-<whitespace>\nword` into `wordword`.
pub fn combine_hyphenated_lines(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if is_word_char(c) && chars.get(i + 1) == Some(&'-') {
            let mut j = i + 2;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let ends_with_newline = j > i + 2 && chars[j - 1] == '\n';
            if ends_with_newline && j < chars.len() && is_word_char(chars[j]) {
                out.push(c);
                out.push(chars[j]);
                i = j + 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Parses a `--- PAGE n ---` marker line.
pub fn page_number(line: &str) -> Option<u32> {
    let digits = line.strip_prefix("--- PAGE ")?.strip_suffix(" ---")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Reads lines into segments (steps 1-3), before any split or merge.
pub fn read_segments(document: &str, meta: &ChunkMeta, page_limit: Option<&[u32]>) -> Vec<Segment> {
    let normalized = document.replace("\r\n", "\n").replace('\r', "\n");
    let text = combine_hyphenated_lines(&normalized);

    let mut segments: Vec<Segment> = Vec::new();
    let mut current_page: Option<u32> = None;
    let mut rest = text.as_str();

    while !rest.is_empty() {
        let (line, eol_strength, next) = match rest.find('\n') {
            Some(pos) => {
                let after = &rest[pos..];
                let newlines = after.len() - after.trim_start_matches('\n').len();
                (&rest[..pos], newlines, &after[newlines..])
            }
            None => (rest, 0, ""),
        };
        rest = next;

        if line.trim().is_empty() {
            if let Some(last) = segments.last_mut() {
                last.eol_strength += eol_strength;
            }
            continue;
        }

        if let Some(page) = page_number(line) {
            current_page = Some(page);
        }

        if let (Some(limit), Some(page)) = (page_limit, current_page) {
            if !limit.contains(&page) {
                continue;
            }
        }

        let mut seg = Segment::new(line.to_string());
        seg.eol_strength = eol_strength;
        seg.meta.merge(meta);
        if let Some(page) = current_page {
            seg.meta.page_nos.insert(page);
        }
        segments.push(seg);
    }

    segments
}

fn split_oversized(segments: &mut Vec<Segment>, token_limit: usize) {
    let mut i = 0;
    while i < segments.len() {
        let seg = &segments[i];
        let char_count = seg.content.chars().count();
        if seg.est_tokens > token_limit && char_count > 1 {
            let mid = seg
                .content
                .char_indices()
                .nth(char_count / 2)
                .map(|(idx, _)| idx)
                .unwrap_or(seg.content.len());
            let left = Segment::inherit(seg.content[..mid].to_string(), seg);
            let right = Segment::inherit(seg.content[mid..].to_string(), seg);
            segments[i] = left;
            segments.insert(i + 1, right);
            // re-check the left half
            continue;
        }
        i += 1;
    }
}

fn merge_pass(segments: &mut Vec<Segment>, token_limit: usize, table_aware: bool) {
    let mut i = 0;
    while i + 1 < segments.len() {
        if segments[i].can_merge_with(&segments[i + 1], token_limit, table_aware) {
            let merged = segments[i].merge(&segments[i + 1]);
            segments[i] = merged;
            segments.remove(i + 1);
        } else {
            i += 1;
        }
    }
}

/// Splits a document into linked chunks.
pub fn split(req: &SplitRequest<'_>) -> Vec<TextChunk> {
    let token_limit = req.token_limit.max(1);
    let mut segments = read_segments(req.document, &req.meta, req.page_limit);
    split_oversized(&mut segments, token_limit);
    merge_pass(&mut segments, token_limit, true);
    merge_pass(&mut segments, token_limit, false);

    let mut chunks: Vec<TextChunk> = segments.into_iter().map(Segment::into_chunk).collect();
    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.seq_no = i as u32 + 1;
    }
    for i in 0..chunks.len() {
        if i > 0 {
            chunks[i].prev_content = Some(chunks[i - 1].content.clone());
        }
        if i + 1 < chunks.len() {
            chunks[i].next_content = Some(chunks[i + 1].content.clone());
        }
    }

    debug!(
        document_id = req.meta.document_id.as_deref().unwrap_or(""),
        chunks = chunks.len(),
        "document split"
    );
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(document: &str, token_limit: usize) -> SplitRequest<'_> {
        SplitRequest {
            document,
            meta: ChunkMeta {
                document_id: Some("doc".into()),
                source_document: Some("guide.pdf".into()),
                ..Default::default()
            },
            page_limit: None,
            token_limit,
        }
    }

    #[test]
    fn hyphenated_lines_are_joined() {
        assert_eq!(combine_hyphenated_lines("infor-\nmation"), "information");
        assert_eq!(combine_hyphenated_lines("infor-  \nmation"), "information");
        assert_eq!(combine_hyphenated_lines("well - \nknown"), "well - \nknown");
        assert_eq!(combine_hyphenated_lines("a-b"), "a-b");
    }

    #[test]
    fn page_marker_parsing() {
        assert_eq!(page_number("--- PAGE 12 ---"), Some(12));
        assert_eq!(page_number("--- PAGE x ---"), None);
        assert_eq!(page_number("--- PAGE 1 --- trailing"), None);
    }

    #[test]
    fn blank_lines_strengthen_previous_segment() {
        let segs = read_segments("one\n\n\ntwo\nthree", &ChunkMeta::default(), None);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].eol_strength, 3);
        assert_eq!(segs[1].eol_strength, 1);
        assert_eq!(segs[2].eol_strength, 0);
    }

    #[test]
    fn whitespace_lines_add_only_their_own_breaks() {
        let segs = read_segments("one\n  \n\ntwo\n   ", &ChunkMeta::default(), None);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].eol_strength, 3);
        // A trailing whitespace line ends without a newline.
        assert_eq!(segs[1].eol_strength, 1);
    }

    #[test]
    fn crlf_is_normalised() {
        let segs = read_segments("a\r\nb\rc", &ChunkMeta::default(), None);
        let contents: Vec<_> = segs.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[test]
    fn small_document_becomes_one_chunk() {
        let chunks = split(&req("First line.\nSecond line.\n\nThird line.", 1000));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].seq_no, 1);
        assert_eq!(chunks[0].content, "First line.\nSecond line.\nThird line.");
        assert!(chunks[0].prev_content.is_none());
        assert!(chunks[0].next_content.is_none());
    }

    #[test]
    fn chunks_are_numbered_and_linked() {
        let doc = (0..20)
            .map(|i| format!("Line number {} has some words in it.", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = split(&req(&doc, 30));
        assert!(chunks.len() > 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.seq_no, i as u32 + 1);
            assert!(count_tokens(&c.content) < 30 || !c.content.contains('\n'));
        }
        assert_eq!(chunks[1].prev_content.as_deref(), Some(chunks[0].content.as_str()));
        assert_eq!(chunks[1].next_content.as_deref(), Some(chunks[2].content.as_str()));
    }

    #[test]
    fn oversized_line_is_halved() {
        let long = "x".repeat(400); // 100 tokens
        let chunks = split(&req(&long, 30));
        assert!(chunks.len() >= 4);
        let rejoined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(rejoined, long);
        assert!(chunks.iter().all(|c| count_tokens(&c.content) <= 30));
    }

    #[test]
    fn page_markers_prefix_chunks_and_limit_pages() {
        let doc = "--- PAGE 1 ---\nalpha\n--- PAGE 2 ---\nbeta\n--- PAGE 3 ---\ngamma";
        let limit = [2u32];
        let request = SplitRequest {
            page_limit: Some(&limit),
            ..req(doc, 1000)
        };
        let chunks = split(&request);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "--- PAGE 2 ---\nbeta");
        assert_eq!(chunks[0].metadata.page_nos.iter().copied().collect::<Vec<_>>(), vec![2]);

        let mut seg = Segment::new("loose text".into());
        seg.meta.page_nos.insert(7);
        assert_eq!(seg.into_chunk().content, "--- PAGE 7 ---\nloose text");
    }

    #[test]
    fn table_rows_merge_separately_first() {
        // Two rows fit under the limit; intro plus both rows do not.
        let doc = "intro text\n| a | b |\n| c | d |";
        let chunks = split(&req(doc, 7));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "intro text");
        assert_eq!(chunks[1].content, "| a | b |\n| c | d |");
        assert!(chunks[1].metadata.contains_tables);
        assert!(!chunks[0].metadata.contains_tables);
    }

    #[test]
    fn chunks_inherit_request_metadata() {
        let chunks = split(&req("hello", 1000));
        assert_eq!(chunks[0].document_id(), Some("doc"));
        assert!(chunks[0].context_string().starts_with("*Source Document*: guide"));
    }
}
