/// Iterate `low..high` outward from a pivot: `p, p-1, p+1, p-2, p+2, ...`,
/// skipping values outside `[low, high)`.
///
/// The radix-k composer uses this both to search for factors near the magic
/// k value and to stagger sends so that peers receive the piece that starts
/// their composite tree first.
pub fn pivot_range(low: usize, pivot: usize, high: usize) -> PivotRange {
    PivotRange {
        low,
        pivot,
        high,
        step: 0,
    }
}

/// Iterator returned by [`pivot_range`].
#[derive(Clone, Debug)]
pub struct PivotRange {
    low: usize,
    pivot: usize,
    high: usize,
    step: usize,
}

impl Iterator for PivotRange {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.low >= self.high {
            return None;
        }
        // Alternate pivot, pivot-1, pivot+1, pivot-2, pivot+2, ... until both
        // sides of the range are exhausted.
        let span = 2 * (self.pivot.max(self.high) - self.pivot.min(self.low) + 1);
        while self.step < span {
            let step = self.step;
            self.step += 1;
            if step == 0 {
                if (self.low..self.high).contains(&self.pivot) {
                    return Some(self.pivot);
                }
            } else if !step.is_multiple_of(2) {
                let dist = step.div_ceil(2);
                if self.pivot >= self.low + dist {
                    return Some(self.pivot - dist);
                }
            } else {
                let dist = step / 2;
                if self.pivot + dist < self.high {
                    return Some(self.pivot + dist);
                }
            }
        }
        None
    }
}
