//! IPC message types

use heapless::Vec;

use crate::cap::{Badge, CapId};
use crate::error::{KernelResult, Resource};

/// Data words per message
pub const MSG_WORDS: usize = 8;

/// Capability ids per message
pub const MSG_CAPS: usize = 4;

/// Message buffer of a thread
///
/// Requests and replies are copied from the sender's buffer into the
/// receiver's buffer when the rendezvous happens. The badge is stamped by
/// the kernel from the directory entry the sender called through.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    tag: u64,
    words: Vec<u64, MSG_WORDS>,
    caps: Vec<CapId, MSG_CAPS>,
    badge: Badge,
}

impl Message {
    /// Create an empty message with a tag
    pub fn new(tag: u64) -> Self {
        Self {
            tag,
            ..Self::default()
        }
    }

    /// Create a message with inline data words
    pub fn with_words(tag: u64, words: &[u64]) -> Self {
        let mut msg = Self::new(tag);
        for &word in words.iter().take(MSG_WORDS) {
            // capacity checked by take()
            let _ = msg.words.push(word);
        }
        msg
    }

    /// Append a data word
    pub fn push_word(&mut self, word: u64) -> KernelResult<()> {
        self.words
            .push(word)
            .map_err(|_| crate::error::KernelError::InvalidArgument)
    }

    /// Attach a capability for transfer
    pub fn push_cap(&mut self, cap: CapId) -> KernelResult<()> {
        self.caps
            .push(cap)
            .map_err(|_| Resource::MessageCaps.into())
    }

    /// Message tag
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Inline data
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Attached capability ids
    pub fn caps(&self) -> &[CapId] {
        &self.caps
    }

    /// Identity of the sender, as minted into its capability
    pub fn badge(&self) -> Badge {
        self.badge
    }

    pub(crate) fn set_badge(&mut self, badge: Badge) {
        self.badge = badge;
    }

    pub(crate) fn replace_caps(&mut self, caps: Vec<CapId, MSG_CAPS>) {
        self.caps = caps;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;

    #[test]
    fn test_with_words_truncates() {
        let words: [u64; 10] = core::array::from_fn(|i| i as u64);
        let msg = Message::with_words(3, &words);
        assert_eq!(msg.tag(), 3);
        assert_eq!(msg.words().len(), MSG_WORDS);
        assert_eq!(msg.words()[7], 7);
    }

    #[test]
    fn test_cap_slots_bounded() {
        let mut msg = Message::new(0);
        for n in 1..=MSG_CAPS as u32 {
            msg.push_cap(CapId(n)).unwrap();
        }
        assert_eq!(
            msg.push_cap(CapId(99)),
            Err(KernelError::Exhausted(Resource::MessageCaps))
        );
        assert_eq!(msg.caps().len(), MSG_CAPS);
    }

    #[test]
    fn test_push_word_bounded() {
        let mut msg = Message::with_words(0, &[0; MSG_WORDS]);
        assert_eq!(msg.push_word(1), Err(KernelError::InvalidArgument));
    }
}
