//! Reconciles a deduplicated scan against the prior snapshot.

use std::collections::{HashMap, HashSet};

use aptwatch_core::{IdentityKey, Listing};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// One entry per fresh listing; known listings carry their stored record.
    pub current_view: Vec<Listing>,
    /// Fresh listings whose identity was absent from the prior snapshot.
    pub newly_observed: Vec<Listing>,
    /// Prior snapshot followed by `newly_observed`.
    pub updated_snapshot: Vec<Listing>,
    prior_len: usize,
}

impl MergeOutcome {
    pub fn prior_len(&self) -> usize {
        self.prior_len
    }

    pub fn snapshot_changed(&self) -> bool {
        self.updated_snapshot.len() != self.prior_len
    }
}

fn is_duplicate_free(listings: &[Listing]) -> bool {
    let mut seen = HashSet::with_capacity(listings.len());
    listings.iter().all(|l| seen.insert(l.identity()))
}

/// `fresh` must already be deduplicated; that is only checked in debug
/// builds. Known listings are replaced by the prior record so the original
/// capture time survives.
pub fn merge(prior: Vec<Listing>, fresh: Vec<Listing>) -> MergeOutcome {
    debug_assert!(
        is_duplicate_free(&fresh),
        "merge called with duplicate identity keys in the fresh scan"
    );

    // First stored position wins if an old snapshot holds repeats.
    let mut index: HashMap<IdentityKey, usize> = HashMap::with_capacity(prior.len());
    for (pos, listing) in prior.iter().enumerate() {
        index.entry(listing.identity()).or_insert(pos);
    }

    let mut current_view = Vec::with_capacity(fresh.len());
    let mut newly_observed = Vec::new();
    for listing in fresh {
        match index.get(&listing.identity()) {
            Some(&pos) => current_view.push(prior[pos].clone()),
            None => {
                newly_observed.push(listing.clone());
                current_view.push(listing);
            }
        }
    }

    let prior_len = prior.len();
    let mut updated_snapshot = prior;
    updated_snapshot.extend(newly_observed.iter().cloned());

    MergeOutcome {
        current_view,
        newly_observed,
        updated_snapshot,
        prior_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::dedupe;

    fn listing(address: &str, time: f64) -> Listing {
        Listing {
            address: address.into(),
            zip: "Boston, MA 02215".into(),
            keyword: "patio".into(),
            availability: "Avail Sep 01".into(),
            beds: "4 Bed".into(),
            price: "$4,800".into(),
            image: String::new(),
            phone: String::new(),
            link: format!("https://www.apartments.com/{address}"),
            time,
        }
    }

    fn assert_postconditions(prior: &[Listing], fresh: &[Listing], out: &MergeOutcome) {
        assert_eq!(out.updated_snapshot.len() - prior.len(), out.newly_observed.len());
        assert_eq!(out.current_view.len(), fresh.len());
        assert_eq!(&out.updated_snapshot[..prior.len()], prior);

        let prior_keys: HashMap<_, _> = prior.iter().map(|l| (l.identity(), l)).collect();
        for new in &out.newly_observed {
            assert!(!prior_keys.contains_key(&new.identity()));
        }
        for seen in &out.current_view {
            if let Some(stored) = prior_keys.get(&seen.identity()) {
                assert_eq!(seen, *stored);
            }
        }
    }

    #[test]
    fn first_run_reports_everything_as_new() {
        let a = listing("A", 1.0);
        let b = listing("B", 2.0);
        let out = merge(Vec::new(), vec![a.clone(), b.clone()]);

        assert_eq!(out.newly_observed, vec![a.clone(), b.clone()]);
        assert_eq!(out.current_view, vec![a, b]);
        assert_eq!(out.updated_snapshot.len(), 2);
        assert!(out.snapshot_changed());
    }

    #[test]
    fn known_listing_keeps_its_stored_record() {
        let a = listing("A", 1_000.0);
        let mut a_rescraped = listing("A", 9_999.0);
        a_rescraped.keyword = "deck".into();
        let b = listing("B", 9_999.0);

        let prior = vec![a.clone()];
        let fresh = vec![a_rescraped, b.clone()];
        let out = merge(prior.clone(), fresh.clone());

        assert_eq!(out.current_view, vec![a.clone(), b.clone()]);
        assert_eq!(out.current_view[0].time, 1_000.0);
        assert_eq!(out.current_view[0].keyword, "patio");
        assert_eq!(out.newly_observed, vec![b.clone()]);
        assert_eq!(out.updated_snapshot, vec![a, b]);
        assert_postconditions(&prior, &fresh, &out);
    }

    #[test]
    fn rescan_without_new_listings_leaves_snapshot_unchanged() {
        let prior = vec![listing("A", 1.0), listing("B", 2.0)];
        let fresh = vec![listing("A", 50.0), listing("B", 60.0)];
        let out = merge(prior.clone(), fresh);

        assert!(out.newly_observed.is_empty());
        assert_eq!(out.updated_snapshot, prior);
        assert!(!out.snapshot_changed());
    }

    #[test]
    fn delisted_listings_stay_in_the_snapshot() {
        let prior = vec![listing("A", 1.0), listing("B", 2.0)];
        let out = merge(prior.clone(), vec![listing("C", 3.0)]);

        assert_eq!(out.current_view, vec![listing("C", 3.0)]);
        assert_eq!(out.updated_snapshot.len(), 3);
        assert_eq!(&out.updated_snapshot[..2], &prior[..]);
    }

    #[test]
    fn new_listings_append_in_fresh_order() {
        let prior = vec![listing("M", 1.0)];
        let fresh = vec![listing("Z", 5.0), listing("M", 6.0), listing("A", 7.0)];
        let out = merge(prior.clone(), fresh.clone());

        let appended: Vec<_> = out.updated_snapshot[1..]
            .iter()
            .map(|l| l.address.as_str())
            .collect();
        assert_eq!(appended, vec!["Z", "A"]);
        assert_postconditions(&prior, &fresh, &out);
    }

    #[test]
    fn repeated_prior_entries_resolve_to_the_first_stored_record() {
        let first = listing("A", 1.0);
        let mut second = listing("A", 2.0);
        second.beds = "5 Bed".into();
        let out = merge(vec![first.clone(), second], vec![listing("A", 3.0)]);
        assert_eq!(out.current_view, vec![first]);
        assert!(out.newly_observed.is_empty());
    }

    #[test]
    fn snapshot_only_grows_across_runs() {
        let scans = vec![
            vec![listing("A", 1.0), listing("B", 1.0), listing("A", 1.5)],
            vec![listing("B", 2.0), listing("C", 2.0)],
            vec![],
            vec![listing("D", 4.0), listing("A", 4.0), listing("D", 4.5)],
            vec![listing("A", 5.0)],
        ];

        let mut snapshot: Vec<Listing> = Vec::new();
        for scan in scans {
            let fresh = dedupe(scan);
            let before = snapshot.clone();
            let out = merge(snapshot, fresh.clone());
            assert_postconditions(&before, &fresh, &out);
            assert!(out.updated_snapshot.len() >= before.len());
            snapshot = out.updated_snapshot;
        }

        let addresses: Vec<_> = snapshot.iter().map(|l| l.address.as_str()).collect();
        assert_eq!(addresses, vec!["A", "B", "C", "D"]);
        assert_eq!(snapshot[0].time, 1.0);
    }

    #[test]
    fn size_invariant_holds_for_mixed_inputs() {
        let prior: Vec<_> = (0..20).map(|i| listing(&format!("P{i}"), i as f64)).collect();
        let fresh: Vec<_> = (10..35)
            .map(|i| listing(&format!("P{i}"), 100.0 + i as f64))
            .collect();
        let out = merge(prior.clone(), fresh.clone());
        assert_eq!(out.newly_observed.len(), 15);
        assert_eq!(out.updated_snapshot.len(), prior.len() + out.newly_observed.len());
        assert_postconditions(&prior, &fresh, &out);
    }
}
