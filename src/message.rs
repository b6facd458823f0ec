//! Reassembly of a fragmented message (one data frame plus zero or more
//! continuation frames) into a complete [`Message`], grounded in the same
//! incremental-UTF-8 approach tungstenite uses for streaming text frames.

use crate::error::{Error, Result};

/// A complete inbound WebSocket message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    /// A complete text message, already validated as UTF-8.
    Text(String),
    /// A complete binary message.
    Binary(Vec<u8>),
}

/// Incrementally validates UTF-8 across fragment boundaries so a multi-frame
/// text message doesn't need to be fully buffered before we know it's valid.
struct Utf8Collector {
    data: String,
    decoder: utf8::Decoder,
}

impl Utf8Collector {
    fn new() -> Self {
        Self { data: String::new(), decoder: utf8::Decoder::new() }
    }

    fn extend(&mut self, chunk: &[u8]) -> Result<()> {
        let (sym, text, result) = self.decoder.decode(chunk);
        self.data.push_str(&sym);
        self.data.push_str(text);
        match result {
            utf8::Result::Ok | utf8::Result::Incomplete => Ok(()),
            utf8::Result::Error { .. } => Err(Error::Utf8),
        }
    }

    fn finish(self) -> Result<String> {
        if self.decoder.has_incomplete_sequence() {
            Err(Error::Utf8)
        } else {
            Ok(self.data)
        }
    }
}

enum Collector {
    Text(Utf8Collector),
    Binary(Vec<u8>),
}

/// The kind of message being assembled, set by the first (possibly only) fragment.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageKind {
    /// Text message; fragments are validated as UTF-8 as they arrive.
    Text,
    /// Binary message.
    Binary,
}

/// A message in the process of being assembled from fragments.
pub struct IncompleteMessage {
    collector: Collector,
    len: usize,
}

impl IncompleteMessage {
    /// Start assembling a new message of the given kind.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            collector: match kind {
                MessageKind::Text => Collector::Text(Utf8Collector::new()),
                MessageKind::Binary => Collector::Binary(Vec::new()),
            },
            len: 0,
        }
    }

    /// Running length of the message assembled so far, in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether anything has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append the next fragment's payload.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<()> {
        self.len += chunk.len();
        match &mut self.collector {
            Collector::Binary(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            Collector::Text(collector) => collector.extend(chunk),
        }
    }

    /// Finalize the message after the FIN fragment has been appended.
    pub fn complete(self) -> Result<Message> {
        match self.collector {
            Collector::Binary(buf) => Ok(Message::Binary(buf)),
            Collector::Text(collector) => Ok(Message::Text(collector.finish()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_accumulates_across_fragments() {
        let mut msg = IncompleteMessage::new(MessageKind::Binary);
        msg.extend(&[1, 2, 3]).unwrap();
        msg.extend(&[4, 5]).unwrap();
        assert_eq!(msg.len(), 5);
        assert_eq!(msg.complete().unwrap(), Message::Binary(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn text_accumulates_across_fragments() {
        let mut msg = IncompleteMessage::new(MessageKind::Text);
        msg.extend("He".as_bytes()).unwrap();
        msg.extend("llo".as_bytes()).unwrap();
        assert_eq!(msg.complete().unwrap(), Message::Text("Hello".to_string()));
    }

    #[test]
    fn text_splits_multibyte_char_across_fragments() {
        // "é" is 0xC3 0xA9 in UTF-8; split the two bytes across fragments.
        let bytes = "caf\u{e9}".as_bytes().to_vec();
        let mut msg = IncompleteMessage::new(MessageKind::Text);
        msg.extend(&bytes[..4]).unwrap();
        msg.extend(&bytes[4..]).unwrap();
        assert_eq!(msg.complete().unwrap(), Message::Text("caf\u{e9}".to_string()));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut msg = IncompleteMessage::new(MessageKind::Text);
        let result = msg.extend(&[0xff, 0xfe]);
        assert!(result.is_err());
    }

    #[test]
    fn empty_text_message_completes_to_empty_string() {
        let msg = IncompleteMessage::new(MessageKind::Text);
        assert_eq!(msg.complete().unwrap(), Message::Text(String::new()));
    }
}
