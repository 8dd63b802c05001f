use std::str::Utf8Error;

use crate::profile::Profile;

/// What happened to a characteristic value pushed into an [`Accumulator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accumulated {
    /// The value was appended; the buffer now holds this many bytes.
    Appended(usize),
    /// The value was the sentinel; this is the completed message, sentinel excluded.
    Complete(Vec<u8>),
    /// The value was not valid UTF-8 and was dropped.
    Invalid(Utf8Error),
}

/// Collects notification payloads until an end-of-message sentinel arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accumulator {
    buffer: Vec<u8>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes one characteristic value.
    ///
    /// The value is compared as text, exactly, against the profile's end-of-message
    /// sentinel. On a match a copy of the accumulated bytes is handed back; the buffer
    /// itself is kept until the session that owns it is replaced.
    pub fn push(&mut self, value: &[u8], profile: &Profile) -> Accumulated {
        let text = match std::str::from_utf8(value) {
            Ok(text) => text,
            Err(err) => return Accumulated::Invalid(err),
        };

        if profile.is_end_of_message(text) {
            Accumulated::Complete(self.buffer.clone())
        } else {
            self.buffer.extend_from_slice(value);
            Accumulated::Appended(self.buffer.len())
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
