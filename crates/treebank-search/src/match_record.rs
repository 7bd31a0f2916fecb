//! Raw match records as produced by the engine and stored in cache files.
//!
//! A record is `<match>F1||F2||...||F8</match>`. Cache files are plain
//! concatenations of records, so truncating at a record start never splits
//! a record.

use std::collections::BTreeMap;
use std::ops::Range;

use memchr::memmem;
use serde::Serialize;

use crate::error::{Result, SearchError};
use crate::tree::Element;
use crate::types::PartitionId;

const OPEN_TAG: &str = "<match>";
const CLOSE_TAG: &str = "</match>";
const FIELD_SEPARATOR: &str = "||";
const FIELD_COUNT: usize = 8;

/// One search hit, parsed from a match record.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub sentence_id: String,
    pub sentence: String,
    pub ids: String,
    pub begins: String,
    pub xml_sentences: String,
    pub meta: String,
    pub engine_variables: String,
    pub database: String,
    pub partition: PartitionId,
    /// `<vars>...</vars>` payload filled by variable resolution.
    pub variables: String,
    /// Derived descriptive attributes attached by annotation filters.
    pub attributes: BTreeMap<String, String>,
    #[serde(skip)]
    tree: Option<Element>,
}

impl SearchMatch {
    pub fn id(&self) -> &str {
        &self.sentence_id
    }

    /// Word positions of the hit, from the `-`-separated `begins` field.
    pub fn begin_positions(&self) -> Result<Vec<i64>> {
        self.begins
            .split('-')
            .filter(|part| !part.trim().is_empty())
            .map(|part| {
                part.trim().parse::<i64>().map_err(|error| {
                    SearchError::MalformedRecord(format!(
                        "invalid begin position {part:?} in match {}: {error}",
                        self.sentence_id
                    ))
                })
            })
            .collect()
    }

    /// The match tree, parsed on first use.
    ///
    /// Filters may replace the tree with a rewritten copy; the serialized
    /// `xml_sentences` field is never changed.
    pub fn tree(&mut self) -> Result<&Element> {
        if self.tree.is_none() {
            self.tree = Some(Element::parse(&self.xml_sentences)?);
        }
        self.tree
            .as_ref()
            .ok_or_else(|| SearchError::Internal("match tree missing after parse".to_string()))
    }

    pub fn set_tree(&mut self, tree: Element) {
        self.tree = Some(tree);
    }
}

/// Byte ranges of every record in `text`, including the tags.
///
/// Whitespace between records is ignored; anything else is malformed.
pub fn record_spans(text: &str) -> Result<Vec<Range<usize>>> {
    let open = memmem::Finder::new(OPEN_TAG);
    let close = memmem::Finder::new(CLOSE_TAG);
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut cursor = 0usize;

    loop {
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            break;
        }
        match open.find(&bytes[cursor..]) {
            Some(0) => {}
            _ => {
                return Err(SearchError::MalformedRecord(format!(
                    "unexpected text outside of a match record at byte {cursor}"
                )))
            }
        }
        let body_start = cursor + OPEN_TAG.len();
        let Some(close_offset) = close.find(&bytes[body_start..]) else {
            return Err(SearchError::MalformedRecord(format!(
                "unterminated match record starting at byte {cursor}"
            )));
        };
        let end = body_start + close_offset + CLOSE_TAG.len();
        spans.push(cursor..end);
        cursor = end;
    }

    Ok(spans)
}

#[cfg(test)]
pub(crate) fn count_records(text: &str) -> Result<usize> {
    Ok(record_spans(text)?.len())
}

/// The prefix of `text` holding exactly the first `limit` records.
pub fn truncate_records(text: &str, limit: usize) -> Result<&str> {
    let spans = record_spans(text)?;
    match spans.get(limit) {
        Some(span) => Ok(&text[..span.start]),
        None => Ok(text),
    }
}

/// Parses every record of `text`; the partition is not part of the record.
pub fn parse_records(text: &str, partition: &PartitionId) -> Result<Vec<SearchMatch>> {
    record_spans(text)?
        .into_iter()
        .map(|span| {
            let body = &text[span.start + OPEN_TAG.len()..span.end - CLOSE_TAG.len()];
            parse_record_body(body, partition)
        })
        .collect()
}

fn parse_record_body(body: &str, partition: &PartitionId) -> Result<SearchMatch> {
    let fields = body.split(FIELD_SEPARATOR).collect::<Vec<_>>();
    if fields.len() != FIELD_COUNT {
        return Err(SearchError::MalformedRecord(format!(
            "expected {FIELD_COUNT} fields, found {}",
            fields.len()
        )));
    }

    Ok(SearchMatch {
        sentence_id: fields[0].to_string(),
        sentence: fields[1].to_string(),
        ids: fields[2].to_string(),
        begins: fields[3].to_string(),
        xml_sentences: fields[4].to_string(),
        meta: fields[5].to_string(),
        engine_variables: fields[6].to_string(),
        database: fields[7].to_string(),
        partition: partition.clone(),
        variables: String::new(),
        attributes: BTreeMap::new(),
        tree: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> PartitionId {
        PartitionId::new("component")
    }

    const TWO_RECORDS: &str = "<match>id||sentence||ids||begins||xml_sentences||meta||vars||db</match>\
        <match>id2||sentence2||ids2||begins2||xml_sentences2||meta2||vars||db</match>";

    #[test]
    fn parses_records() {
        let matches = parse_records(TWO_RECORDS, &partition()).expect("parse");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].sentence, "sentence");
        assert_eq!(matches[1].meta, "meta2");
        assert_eq!(matches[1].partition, partition());
        assert_eq!(matches[1].database, "db");
    }

    #[test]
    fn incomplete_input_is_malformed() {
        let unterminated = "<match>id||sentence||ids||begins||xml_sentences||meta||</match>\
            <match>id2||sentence2||id";
        assert!(parse_records(unterminated, &partition()).is_err());

        let too_few_fields = "<match>id||sentence||ids||begins||xml_sentences</match>";
        assert!(matches!(
            parse_records(too_few_fields, &partition()),
            Err(SearchError::MalformedRecord(_))
        ));
    }

    #[test]
    fn blank_input_has_no_records() {
        assert!(parse_records("", &partition()).expect("empty").is_empty());
        assert!(parse_records("\n ", &partition()).expect("blank").is_empty());
    }

    #[test]
    fn stray_text_is_malformed() {
        assert!(record_spans("garbage<match>a</match>").is_err());
    }

    #[test]
    fn truncation_keeps_whole_records_only() {
        let kept = truncate_records(TWO_RECORDS, 1).expect("truncate");
        assert_eq!(count_records(kept).expect("count"), 1);
        assert!(kept.ends_with(CLOSE_TAG));

        assert_eq!(truncate_records(TWO_RECORDS, 0).expect("truncate"), "");
        assert_eq!(truncate_records(TWO_RECORDS, 5).expect("truncate"), TWO_RECORDS);
    }

    #[test]
    fn begin_positions_parse_dash_separated() {
        let mut matches = parse_records(
            "<match>s1||w||1-2||3-5||<node/>||m||v||db</match>",
            &partition(),
        )
        .expect("parse");
        let hit = matches.remove(0);
        assert_eq!(hit.begin_positions().expect("begins"), vec![3, 5]);
    }

    #[test]
    fn tree_is_parsed_lazily() {
        let mut matches = parse_records(
            r#"<match>s1||w||1||0||<node cat="smain"/>||m||v||db</match>"#,
            &partition(),
        )
        .expect("parse");
        let tree = matches[0].tree().expect("tree");
        assert_eq!(tree.attribute("cat"), Some("smain"));
    }
}
