//! Capability bit vectors exchanged at link time.
//!
//! Each side acts only on bits it declared itself; remote vectors are
//! recorded for diagnostics and never intersected with local ones.

/// An ordered bit vector stored as little-endian `u32` words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    words: Vec<u32>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_words(words: Vec<u32>) -> Self {
        Self { words }
    }

    /// Set `bit`, growing the vector as needed.
    pub fn set(&mut self, bit: u32) {
        let word = (bit / 32) as usize;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % 32);
    }

    pub fn with(mut self, bit: u32) -> Self {
        self.set(bit);
        self
    }

    pub fn test(&self, bit: u32) -> bool {
        self.words
            .get((bit / 32) as usize)
            .is_some_and(|w| w & (1 << (bit % 32)) != 0)
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// The common and per-channel-type vectors of one side of a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub common: CapabilitySet,
    pub channel: CapabilitySet,
}

impl Capabilities {
    pub fn new(common: CapabilitySet, channel: CapabilitySet) -> Self {
        Self { common, channel }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_test_bits_across_words() {
        let caps = CapabilitySet::new().with(0).with(33);
        assert_eq!(caps.words(), &[1, 2]);
        assert!(caps.test(0));
        assert!(caps.test(33));
        assert!(!caps.test(1));
        assert!(!caps.test(200));
    }

    #[test]
    fn empty_set_tests_false() {
        let caps = CapabilitySet::new();
        assert!(caps.is_empty());
        assert!(!caps.test(0));
    }
}
