use crate::error::StreamError;
use crate::models::StreamRecord;
use serde_json::error::Category;

// Heartbeat record the backend sends to keep the connection alive
const HEARTBEAT: &str = "{}";

/// Result of offering one fragment to the parser.
#[derive(Debug)]
pub enum ParseOutcome {
    /// Empty fragment or heartbeat; nothing changed.
    Skipped,
    /// The running buffer is not a complete JSON object yet.
    Incomplete,
    Parsed(StreamRecord),
    /// The exchange must stop.
    Fatal(StreamError),
}

/// Reassembles stream records from fragments that may split an object anywhere.
///
/// Completeness is decided only by whether the buffered text parses as JSON.
#[derive(Debug, Default)]
pub struct RecordParser {
    running: String,
}

impl RecordParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text buffered while waiting for the rest of a record.
    pub fn buffered(&self) -> &str {
        &self.running
    }

    pub fn push(&mut self, fragment: &str) -> ParseOutcome {
        // A heartbeat only counts as one between records; inside a split record
        // it is genuine payload (e.g. an empty nested object).
        if fragment.is_empty() || (fragment == HEARTBEAT && self.running.is_empty()) {
            return ParseOutcome::Skipped;
        }

        self.running.push_str(fragment);
        match serde_json::from_str::<StreamRecord>(&self.running) {
            Ok(record) => {
                let was_heartbeat = self.running.trim() == HEARTBEAT;
                self.running.clear();
                if was_heartbeat {
                    return ParseOutcome::Skipped;
                }
                if let Some(failure) = record.failure() {
                    log::error!("Backend reported an error in record {}: {:?}", record.id, failure);
                    return ParseOutcome::Fatal(StreamError::Backend {
                        message: failure.text(),
                    });
                }
                ParseOutcome::Parsed(record)
            }
            Err(e) if matches!(e.classify(), Category::Eof | Category::Syntax) => {
                log::debug!("Incomplete record ({} bytes buffered). Continuing...", self.running.len());
                ParseOutcome::Incomplete
            }
            Err(e) => {
                log::error!("Stream record has an unexpected shape: {}", e);
                ParseOutcome::Fatal(StreamError::Malformed(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FrameDecoder;
    use crate::models::Role;

    const STREAM: &str = concat!(
        "{\"id\":\"r1\",\"choices\":[{\"messages\":[{\"role\":\"tool\",\"content\":\"{\\\"citations\\\":[]}\"}]}]}\n",
        "{}\n",
        "{\"id\":\"r2\",\"choices\":[{\"messages\":[{\"role\":\"assistant\",\"content\":\"Hel\"}]}],\"extra\":{}}\n",
        "{\"id\":\"r3\",\"choices\":[{\"messages\":[{\"role\":\"assistant\",\"content\":\"lo \u{e9}\"}]}]}\n",
        "{\"id\":\"r4\",\"choices\":[],\"history_metadata\":{\"conversation_id\":\"c1\",\"title\":\"t\"}}\n",
    );

    fn decode(chunks: &[&[u8]]) -> Vec<StreamRecord> {
        let mut decoder = FrameDecoder::new();
        let mut parser = RecordParser::new();
        let mut records = Vec::new();
        let mut fragments = Vec::new();
        for chunk in chunks {
            fragments.extend(decoder.feed(chunk));
        }
        fragments.extend(decoder.finish());
        for fragment in fragments {
            match parser.push(&fragment) {
                ParseOutcome::Parsed(record) => records.push(record),
                ParseOutcome::Fatal(e) => panic!("unexpected fatal outcome: {e}"),
                ParseOutcome::Skipped | ParseOutcome::Incomplete => {}
            }
        }
        records
    }

    // Dates are stamped at parse time, so compare everything else.
    fn summary(records: &[StreamRecord]) -> Vec<(String, Vec<(Role, String)>, Option<String>)> {
        records
            .iter()
            .map(|r| {
                let messages = r
                    .choices
                    .iter()
                    .flat_map(|c| c.messages.iter().map(|m| (m.role, m.content.clone())))
                    .collect();
                let conversation = r.history_metadata.as_ref().map(|h| h.conversation_id.clone());
                (r.id.clone(), messages, conversation)
            })
            .collect()
    }

    #[test]
    fn test_single_read_yields_every_record() {
        let records = decode(&[STREAM.as_bytes()]);
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3", "r4"]);
    }

    #[test]
    fn test_any_two_way_split_matches_single_read() {
        let bytes = STREAM.as_bytes();
        let expected = summary(&decode(&[bytes]));
        assert_eq!(expected.len(), 4);
        for cut in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(cut);
            assert_eq!(summary(&decode(&[head, tail])), expected, "split at byte {cut}");
        }
    }

    #[test]
    fn test_byte_at_a_time_matches_single_read() {
        let bytes = STREAM.as_bytes();
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(summary(&decode(&chunks)), summary(&decode(&[bytes])));
    }

    #[test]
    fn test_heartbeat_and_empty_fragments_leave_buffer_alone() {
        let mut parser = RecordParser::new();
        assert!(matches!(parser.push(""), ParseOutcome::Skipped));
        assert!(matches!(parser.push("{}"), ParseOutcome::Skipped));
        assert_eq!(parser.buffered(), "");

        assert!(matches!(parser.push("{\"id\":"), ParseOutcome::Incomplete));
        assert!(matches!(parser.push(""), ParseOutcome::Skipped));
        assert_eq!(parser.buffered(), "{\"id\":");
    }

    #[test]
    fn test_empty_object_inside_split_record_is_payload() {
        let mut parser = RecordParser::new();
        assert!(matches!(parser.push("{\"a\":"), ParseOutcome::Incomplete));
        assert!(matches!(parser.push("{}"), ParseOutcome::Incomplete));
        assert_eq!(parser.buffered(), "{\"a\":{}");
        assert!(matches!(parser.push("}"), ParseOutcome::Parsed(_)));
        assert_eq!(parser.buffered(), "");
    }

    #[test]
    fn test_empty_history_metadata_flows_through() {
        let mut parser = RecordParser::new();
        let fragment = "{\"id\":\"x\",\"choices\":[{\"messages\":[{\"role\":\"assistant\",\"content\":\"Hi\"}]}],\"history_metadata\":{}}";
        match parser.push(fragment) {
            ParseOutcome::Parsed(record) => {
                assert!(record.history_metadata.is_none());
                assert_eq!(record.choices[0].messages[0].content, "Hi");
            }
            other => panic!("expected a parsed record, got {other:?}"),
        }
    }

    #[test]
    fn test_null_content_delta_is_not_fatal() {
        let mut parser = RecordParser::new();
        let fragment = "{\"id\":\"x\",\"choices\":[{\"messages\":[{\"role\":\"assistant\",\"content\":null}]}]}";
        match parser.push(fragment) {
            ParseOutcome::Parsed(record) => assert_eq!(record.choices[0].messages[0].content, ""),
            other => panic!("expected a parsed record, got {other:?}"),
        }
    }

    #[test]
    fn test_success_resets_buffer() {
        let mut parser = RecordParser::new();
        assert!(matches!(parser.push("{\"id\":\"x\","), ParseOutcome::Incomplete));
        match parser.push("\"choices\":[{\"messages\":[{\"role\":\"assistant\",\"content\":\"Hi\"}]}]}") {
            ParseOutcome::Parsed(record) => {
                assert_eq!(record.id, "x");
                assert_eq!(record.choices[0].messages[0].role, Role::Assistant);
            }
            other => panic!("expected a parsed record, got {other:?}"),
        }
        assert_eq!(parser.buffered(), "");
    }

    #[test]
    fn test_error_record_is_fatal_with_text() {
        let mut parser = RecordParser::new();
        match parser.push("{\"error\":{\"message\":\"content filtered\"}}") {
            ParseOutcome::Fatal(StreamError::Backend { message }) => {
                assert_eq!(message.as_deref(), Some("content filtered"));
            }
            other => panic!("expected backend error, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_shape_is_fatal() {
        let mut parser = RecordParser::new();
        assert!(matches!(
            parser.push("{\"choices\":5}"),
            ParseOutcome::Fatal(StreamError::Malformed(_))
        ));
    }
}
