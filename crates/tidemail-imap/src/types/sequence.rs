//! UID sets for addressing message ranges.

use super::Uid;

/// A set of UIDs expressed as sorted, non-overlapping inclusive ranges.
///
/// Serializes to IMAP sequence-set syntax (`1:5,9,12:20`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UidSet {
    ranges: Vec<(Uid, Uid)>,
}

impl UidSet {
    /// Creates a UID set from a single UID.
    #[must_use]
    pub fn single(uid: Uid) -> Self {
        Self {
            ranges: vec![(uid, uid)],
        }
    }

    /// Creates a UID set from an inclusive range.
    ///
    /// Returns `None` if `start` is 0 or the range is empty.
    #[must_use]
    pub fn range(start: u32, end: u32) -> Option<Self> {
        if start > end {
            return None;
        }
        Some(Self {
            ranges: vec![(Uid::new(start)?, Uid::new(end)?)],
        })
    }

    /// Builds a compact set from arbitrary UIDs, merging adjacent values.
    #[must_use]
    pub fn from_uids<I>(uids: I) -> Self
    where
        I: IntoIterator<Item = Uid>,
    {
        let mut values: Vec<u32> = uids.into_iter().map(Uid::get).collect();
        values.sort_unstable();
        values.dedup();

        let mut ranges: Vec<(Uid, Uid)> = Vec::new();
        for value in values {
            let Some(uid) = Uid::new(value) else {
                continue;
            };
            match ranges.last_mut() {
                Some((_, end)) if end.get() + 1 == value => *end = uid,
                _ => ranges.push((uid, uid)),
            }
        }

        Self { ranges }
    }

    /// Returns true if the set holds no UIDs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of UIDs covered by the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|(start, end)| (end.get() - start.get()) as usize + 1)
            .sum()
    }

    /// Returns true if the UID falls inside the set.
    #[must_use]
    pub fn contains(&self, uid: Uid) -> bool {
        self.ranges
            .iter()
            .any(|(start, end)| *start <= uid && uid <= *end)
    }

    /// The inclusive ranges making up this set.
    #[must_use]
    pub fn ranges(&self) -> &[(Uid, Uid)] {
        &self.ranges
    }
}

impl std::fmt::Display for UidSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{start}:{end}")
                }
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn uids(values: &[u32]) -> Vec<Uid> {
        values.iter().filter_map(|v| Uid::new(*v)).collect()
    }

    #[test]
    fn range_serializes_with_colon() {
        assert_eq!(UidSet::range(1991, 2000).unwrap().to_string(), "1991:2000");
    }

    #[test]
    fn range_rejects_zero_and_inverted() {
        assert!(UidSet::range(0, 10).is_none());
        assert!(UidSet::range(10, 9).is_none());
    }

    #[test]
    fn single_serializes_bare() {
        let set = UidSet::single(Uid::new(55).unwrap());
        assert_eq!(set.to_string(), "55");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn from_uids_compacts_runs() {
        let set = UidSet::from_uids(uids(&[9, 1, 2, 3, 5, 12, 10, 11, 3]));
        assert_eq!(set.to_string(), "1:3,5,9:12");
        assert_eq!(set.len(), 8);
    }

    #[test]
    fn from_uids_empty() {
        let set = UidSet::from_uids(Vec::new());
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }

    proptest! {
        #[test]
        fn compaction_preserves_membership(values in proptest::collection::vec(1u32..500, 0..80)) {
            let set = UidSet::from_uids(uids(&values));
            for v in &values {
                prop_assert!(set.contains(Uid::new(*v).unwrap()));
            }
            let mut distinct = values.clone();
            distinct.sort_unstable();
            distinct.dedup();
            prop_assert_eq!(set.len(), distinct.len());
        }

        #[test]
        fn compacted_ranges_never_touch(values in proptest::collection::vec(1u32..500, 1..80)) {
            let set = UidSet::from_uids(uids(&values));
            for pair in set.ranges().windows(2) {
                prop_assert!(pair[0].1.get() + 1 < pair[1].0.get());
            }
        }
    }
}
