//! Occurrence counts of fixed-length token windows, used to penalize repeats.
//!
//! The table covers the whole history: a pattern seen at the very start of a
//! sequence is still penalized at the end of it.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct NgramTable {
    /// Length of the windows being counted.
    n: usize,
    /// Maps the first `n - 1` tokens of a window to the counts of the tokens completing it.
    index: HashMap<Vec<u32>, HashMap<u32, usize>>,
}

impl NgramTable {
    /// Count every window of length `n` in `tokens`.
    ///
    /// # Panics
    ///
    /// Panics if `n < 2`.
    pub fn new(n: usize, tokens: &[u32]) -> Self {
        assert!(n >= 2, "n-gram size must be at least 2");
        let mut table = Self {
            n,
            index: HashMap::new(),
        };
        for window in tokens.windows(n) {
            table.insert(window);
        }
        table
    }

    fn insert(&mut self, window: &[u32]) {
        let (prefix, last) = window.split_at(self.n - 1);
        *self
            .index
            .entry(prefix.to_vec())
            .or_default()
            .entry(last[0])
            .or_insert(0) += 1;
    }

    /// Record the window ending at the last token of `tokens`, which has just been appended.
    pub fn update(&mut self, tokens: &[u32]) {
        if let Some(start) = tokens.len().checked_sub(self.n) {
            self.insert(&tokens[start..]);
        }
    }

    /// How many times the exact window `ngram` occurs.
    #[cfg(test)]
    pub fn count(&self, ngram: &[u32]) -> usize {
        if ngram.len() != self.n {
            return 0;
        }
        let (prefix, last) = ngram.split_at(self.n - 1);
        self.index
            .get(prefix)
            .and_then(|next| next.get(&last[0]))
            .copied()
            .unwrap_or(0)
    }

    /// Tokens that would complete an already counted window after the last `n - 1` tokens of `tokens`.
    pub fn completions<'a>(&'a self, tokens: &[u32]) -> impl Iterator<Item = u32> + 'a {
        let prefix = tokens
            .len()
            .checked_sub(self.n - 1)
            .and_then(|start| self.index.get(&tokens[start..]));
        prefix.into_iter().flat_map(|next| next.keys().copied())
    }

    /// Subtract `penalty` from the score of every token that would repeat a counted window.
    ///
    /// Does nothing while `tokens` is shorter than the window length.
    pub fn penalize(&self, tokens: &[u32], logits: &mut [f32], penalty: f32) -> usize {
        if tokens.len() < self.n {
            return 0;
        }
        let mut count = 0;
        for token in self.completions(tokens) {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit -= penalty;
                count += 1;
            }
        }
        count
    }
}
