//! Fixed-size LMP messages
//!
//! A message is at most [`LMP_MSG_WORDS`] words. Word 0 is the type tag;
//! replies put the status in word 1. Strings travel as a length word followed
//! by the bytes packed little-endian into the remaining words.

use core::mem::size_of;

use tern_cap::Capability;
use tern_platform::{Word, LMP_MSG_WORDS};

use crate::protocol::{MessageType, Status, REPLY_BIT};
use crate::{IpcError, Result};

const WORD_BYTES: usize = size_of::<Word>();

/// One message, without the capability it may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    words: [Word; LMP_MSG_WORDS],
    len: usize,
}

impl Message {
    /// Start a message with `tag` in word 0
    pub fn new(tag: MessageType) -> Self {
        Self::from_words_unchecked(&[tag.tag()])
    }

    /// Start the reply to a `tag` request
    pub fn reply(tag: MessageType, status: Status) -> Self {
        Self::from_words_unchecked(&[tag.reply_tag(), status.as_word()])
    }

    /// Build a message from raw words
    pub fn from_words(words: &[Word]) -> Result<Self> {
        if words.is_empty() {
            return Err(IpcError::Malformed);
        }
        if words.len() > LMP_MSG_WORDS {
            return Err(IpcError::MessageTooLong { words: words.len() });
        }
        Ok(Self::from_words_unchecked(words))
    }

    fn from_words_unchecked(words: &[Word]) -> Self {
        let mut msg = Self { words: [0; LMP_MSG_WORDS], len: words.len() };
        msg.words[..words.len()].copy_from_slice(words);
        msg
    }

    /// Append arguments; fails if the message would exceed nine words
    pub fn with_args(mut self, args: &[Word]) -> Result<Self> {
        for &arg in args {
            self.push(arg)?;
        }
        Ok(self)
    }

    pub fn push(&mut self, word: Word) -> Result<()> {
        if self.len == LMP_MSG_WORDS {
            return Err(IpcError::MessageTooLong { words: self.len + 1 });
        }
        self.words[self.len] = word;
        self.len += 1;
        Ok(())
    }

    /// Append a byte string as a length word and packed bytes
    pub fn push_str(&mut self, bytes: &[u8]) -> Result<()> {
        let needed = 1 + words_for(bytes.len());
        if self.len + needed > LMP_MSG_WORDS {
            return Err(IpcError::MessageTooLong { words: self.len + needed });
        }
        self.words[self.len] = bytes.len();
        self.len += 1;
        for chunk in bytes.chunks(WORD_BYTES) {
            let mut buf = [0u8; WORD_BYTES];
            buf[..chunk.len()].copy_from_slice(chunk);
            self.words[self.len] = Word::from_le_bytes(buf);
            self.len += 1;
        }
        Ok(())
    }

    pub fn words(&self) -> &[Word] {
        &self.words[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw tag word
    pub fn tag(&self) -> Word {
        self.words[0]
    }

    pub fn msg_type(&self) -> Option<MessageType> {
        MessageType::from_word(self.tag())
    }

    pub fn is_reply(&self) -> bool {
        self.tag() & REPLY_BIT != 0
    }

    /// Word `i`, or `Malformed` if the message is shorter
    pub fn arg(&self, i: usize) -> Result<Word> {
        self.words().get(i).copied().ok_or(IpcError::Malformed)
    }

    /// Status word of a reply
    pub fn status(&self) -> Result<Status> {
        Ok(Status::from_word(self.arg(1)?))
    }

    /// Unpack a string pushed with [`Message::push_str`] starting at word `i`
    pub fn str_at(&self, i: usize, out: &mut [u8]) -> Result<usize> {
        let n = self.arg(i)?;
        if self.len < i + 1 + words_for(n) || n > out.len() {
            return Err(IpcError::Malformed);
        }
        let packed = &self.words[i + 1..i + 1 + words_for(n)];
        for (k, byte) in out[..n].iter_mut().enumerate() {
            *byte = packed[k / WORD_BYTES].to_le_bytes()[k % WORD_BYTES];
        }
        Ok(n)
    }
}

/// Words needed to hold `bytes` packed bytes
pub const fn words_for(bytes: usize) -> usize {
    (bytes + WORD_BYTES - 1) / WORD_BYTES
}

/// Longest string that fits after `used` words plus a length word
pub const fn max_str_bytes(used: usize) -> usize {
    (LMP_MSG_WORDS - used - 1) * WORD_BYTES
}

/// A received message and the capability that came with it
#[derive(Debug)]
pub struct Delivery {
    pub msg: Message,
    pub cap: Option<Capability>,
}

impl Delivery {
    pub fn new(msg: Message, cap: Option<Capability>) -> Self {
        Self { msg, cap }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_layout() {
        let reply = Message::reply(MessageType::Ping, Status::Ok).with_args(&[7]).unwrap();
        assert!(reply.is_reply());
        assert_eq!(reply.msg_type(), Some(MessageType::Ping));
        assert_eq!(reply.status(), Ok(Status::Ok));
        assert_eq!(reply.arg(2), Ok(7));
        assert_eq!(reply.arg(3), Err(IpcError::Malformed));
    }

    #[test]
    fn test_ten_words_rejected() {
        let msg = Message::new(MessageType::Ping);
        assert_eq!(
            msg.with_args(&[0; LMP_MSG_WORDS]),
            Err(IpcError::MessageTooLong { words: LMP_MSG_WORDS + 1 })
        );
        assert!(Message::from_words(&[]).is_err());
    }

    #[test]
    fn test_string_packing() {
        let mut msg = Message::new(MessageType::SpawnDomain).with_args(&[0]).unwrap();
        msg.push_str(b"hello, tern").unwrap();
        assert_eq!(msg.len(), 3 + words_for(11));

        let mut out = [0u8; 32];
        let n = msg.str_at(2, &mut out).unwrap();
        assert_eq!(&out[..n], b"hello, tern");

        let mut short = [0u8; 4];
        assert_eq!(msg.str_at(2, &mut short), Err(IpcError::Malformed));
    }

    #[test]
    fn test_string_too_long() {
        let mut msg = Message::new(MessageType::SerialPutstr);
        let long = [b'x'; 128];
        assert!(matches!(msg.push_str(&long), Err(IpcError::MessageTooLong { .. })));
        let fits = [b'y'; max_str_bytes(1)];
        msg.push_str(&fits).unwrap();
        assert_eq!(msg.len(), LMP_MSG_WORDS);
    }
}
