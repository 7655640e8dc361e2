/// Splits raw body chunks into newline-delimited text fragments.
///
/// Every chunk is decoded as UTF-8 and split on `'\n'`; each non-empty piece
/// is handed to the record parser, which owns the running JSON buffer. The
/// decoder does not look at JSON at all. The only state it carries across
/// reads is the tail of a multi-byte UTF-8 sequence cut by a chunk boundary.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one body chunk into candidate fragments, in arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let keep = incomplete_suffix_len(&self.pending);
        let tail = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        split_fragments(&text)
    }

    /// Flushes bytes still held back when the stream closes.
    pub fn finish(&mut self) -> Vec<String> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        split_fragments(&text)
    }
}

fn split_fragments(text: &str) -> Vec<String> {
    text.split('\n')
        .filter(|piece| !piece.is_empty())
        .map(str::to_owned)
        .collect()
}

// Number of trailing bytes that start a UTF-8 sequence the chunk cut short.
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = if byte & 0b1110_0000 == 0b1100_0000 {
            2
        } else if byte & 0b1111_0000 == 0b1110_0000 {
            3
        } else if byte & 0b1111_1000 == 0b1111_0000 {
            4
        } else {
            1
        };
        return if width > back { back } else { 0 };
    }
    0
}
