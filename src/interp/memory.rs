//! Paged word memory for the stack and heap regions

use thiserror::Error;

/// Default page size in words (4 KiB)
pub const DEFAULT_PAGE_WORDS: usize = 1024;
/// Default region cap in words (64 MiB)
pub const DEFAULT_MAX_WORDS: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("word index {index} is beyond the {limit}-word memory limit")]
    LimitExceeded { index: usize, limit: usize },
}

/// A growable arena of `u32` words
///
/// Grows by whole pages on demand and never shrinks. Fresh words read as 0.
#[derive(Debug, Clone)]
pub struct Memory {
    words: Vec<u32>,
    page_words: usize,
    max_words: usize,
}

impl Memory {
    pub fn new(page_words: usize, max_words: usize) -> Self {
        Self {
            words: Vec::new(),
            page_words: page_words.max(1),
            max_words,
        }
    }

    /// Make `index` addressable, growing by whole pages
    pub fn ensure(&mut self, index: usize) -> Result<(), MemoryError> {
        if index < self.words.len() {
            return Ok(());
        }
        if index >= self.max_words {
            return Err(MemoryError::LimitExceeded {
                index,
                limit: self.max_words,
            });
        }
        let pages = index / self.page_words + 1;
        let len = (pages * self.page_words).min(self.max_words);
        self.words.resize(len, 0);
        Ok(())
    }

    pub fn read(&mut self, index: usize) -> Result<u32, MemoryError> {
        self.ensure(index)?;
        Ok(self.words[index])
    }

    pub fn write(&mut self, index: usize, value: u32) -> Result<(), MemoryError> {
        self.ensure(index)?;
        self.words[index] = value;
        Ok(())
    }

    /// Drop every page
    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// Words currently backed by pages
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    pub fn page_words(&self) -> usize {
        self.page_words
    }

    /// Hard cap in words
    pub fn max_words(&self) -> usize {
        self.max_words
    }

    /// Backed words, for inspection
    pub fn as_slice(&self) -> &[u32] {
        &self.words
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_WORDS, DEFAULT_MAX_WORDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_by_pages() {
        let mut mem = Memory::new(4, 64);
        assert_eq!(mem.capacity(), 0);
        assert_eq!(mem.read(0).unwrap(), 0);
        assert_eq!(mem.capacity(), 4);
        mem.write(9, 7).unwrap();
        assert_eq!(mem.capacity(), 12);
        assert_eq!(mem.read(9).unwrap(), 7);
    }

    #[test]
    fn test_limit() {
        let mut mem = Memory::new(4, 10);
        mem.write(9, 1).unwrap();
        assert_eq!(mem.capacity(), 10);
        assert_eq!(
            mem.write(10, 1),
            Err(MemoryError::LimitExceeded { index: 10, limit: 10 })
        );
    }

    #[test]
    fn test_clear() {
        let mut mem = Memory::new(4, 64);
        mem.write(2, 5).unwrap();
        mem.clear();
        assert_eq!(mem.capacity(), 0);
        assert_eq!(mem.read(2).unwrap(), 0);
    }
}
