//! Fixed-size, order preserving batching.

/// Groups consecutive items of `inner` into batches of `batch_size`.
///
/// The final batch holds whatever is left and may be shorter; nothing is
/// padded, dropped or reordered.
pub struct Batcher<I> {
    inner: I,
    batch_size: usize,
}

impl<I: Iterator> Batcher<I> {
    /// `batch_size` must be positive. Callers validate it, see
    /// [`crate::pipeline::run`]; release builds treat zero as one.
    pub fn new(inner: I, batch_size: usize) -> Self {
        debug_assert!(batch_size > 0, "batch size must be positive");
        Self {
            inner,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<I: Iterator> Iterator for Batcher<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut items = Vec::with_capacity(self.batch_size);
        for _i in 0..self.batch_size {
            match self.inner.next() {
                Some(item) => items.push(item),
                None => break,
            }
        }
        if items.is_empty() {
            None
        } else {
            Some(items)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (lo, hi) = self.inner.size_hint();
        (
            lo.div_ceil(self.batch_size),
            hi.map(|hi| hi.div_ceil(self.batch_size)),
        )
    }
}

/// Number of batches needed for `len` items.
pub fn batch_count(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_by_two() {
        let sizes: Vec<usize> = Batcher::new(0..5, 2).map(|b| b.len()).collect();
        assert_eq!(sizes, [2, 2, 1]);
        assert_eq!(batch_count(5, 2), 3);
    }

    #[test]
    fn batches_cover_input_in_order() {
        for len in 0..20usize {
            for batch_size in 1..8usize {
                let items: Vec<usize> = (0..len).collect();
                let batches: Vec<Vec<usize>> =
                    Batcher::new(items.iter().copied(), batch_size).collect();
                assert_eq!(batches.len(), batch_count(len, batch_size));
                let n = batches.len();
                for (idx, batch) in batches.iter().enumerate() {
                    if idx + 1 < n {
                        assert_eq!(batch.len(), batch_size);
                    } else {
                        assert!(!batch.is_empty() && batch.len() <= batch_size);
                    }
                }
                let flat: Vec<usize> = batches.into_iter().flatten().collect();
                assert_eq!(flat, items);
            }
        }
    }

    #[test]
    fn oversized_batch_takes_everything() {
        let batches: Vec<Vec<&str>> = Batcher::new(["a", "b", "c"].into_iter(), 10).collect();
        assert_eq!(batches, vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn size_hint_matches_count() {
        let batcher = Batcher::new(0..7, 3);
        assert_eq!(batcher.size_hint(), (3, Some(3)));
        assert_eq!(batcher.count(), 3);
    }
}
