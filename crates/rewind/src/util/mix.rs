pub trait VecMix {
    type Item;

    fn mix(self) -> Vec<Self::Item>;
}

impl<T> VecMix for Vec<Vec<T>> {
    type Item = T;

    /// Interleaves the inner vectors so that every track advances at the same pace:
    /// `[[v1, v2, v3], [a1, a2]] -> [v1, a1, v2, a2, v3]`
    fn mix(self) -> Vec<Self::Item> {
        let total_len = self.iter().map(|v| v.len()).sum();
        let mut result = Vec::with_capacity(total_len);

        let mut iters: Vec<_> = self
            .into_iter()
            .map(|v| v.into_iter())
            .filter(|iter| iter.len() > 0)
            .collect();

        while !iters.is_empty() {
            iters.retain_mut(|iter| match iter.next() {
                Some(item) => {
                    result.push(item);
                    true
                }
                None => false,
            });
        }
        result
    }
}
