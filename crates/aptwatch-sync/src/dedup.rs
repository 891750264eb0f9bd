//! Intra-scan deduplication: overlapping keyword searches return the same
//! listing more than once.

use std::collections::HashSet;

use aptwatch_core::Listing;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub scanned: usize,
    pub unique: usize,
    pub duplicates: usize,
}

impl DedupStats {
    pub fn new(scanned: usize, unique: usize) -> Self {
        Self {
            scanned,
            unique,
            duplicates: scanned.saturating_sub(unique),
        }
    }
}

/// Keeps the first occurrence of every identity key, in input order. When a
/// listing matched several keywords, the earliest keyword's record wins.
pub fn dedupe(scan: Vec<Listing>) -> Vec<Listing> {
    let mut seen = HashSet::with_capacity(scan.len());
    scan.into_iter()
        .filter(|listing| seen.insert(listing.identity()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(address: &str, keyword: &str) -> Listing {
        Listing {
            address: address.into(),
            zip: "Boston, MA 02116".into(),
            keyword: keyword.into(),
            availability: "Avail Sep 01".into(),
            beds: "4 Bed".into(),
            price: "$5,000".into(),
            image: String::new(),
            phone: String::new(),
            link: String::new(),
            time: 100.0,
        }
    }

    fn addresses(listings: &[Listing]) -> Vec<&str> {
        listings.iter().map(|l| l.address.as_str()).collect()
    }

    #[test]
    fn empty_scan_stays_empty() {
        assert!(dedupe(Vec::new()).is_empty());
    }

    #[test]
    fn repeated_listing_collapses_to_first_occurrence() {
        let x = listing("1 Elm", "patio");
        let y = listing("2 Elm", "patio");
        let x_again = listing("1 Elm", "deck");

        let unique = dedupe(vec![x.clone(), y.clone(), x_again]);
        assert_eq!(unique, vec![x, y]);
        assert_eq!(unique[0].keyword, "patio");
    }

    #[test]
    fn all_same_identity_collapses_to_one() {
        let scan = ["patio", "deck", "roof", "porch"]
            .iter()
            .map(|k| listing("9 Oak", k))
            .collect::<Vec<_>>();
        let unique = dedupe(scan);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].keyword, "patio");
    }

    #[test]
    fn order_of_first_occurrences_is_preserved() {
        let scan = vec![
            listing("c", "patio"),
            listing("a", "patio"),
            listing("c", "deck"),
            listing("b", "deck"),
            listing("a", "yard"),
        ];
        assert_eq!(addresses(&dedupe(scan)), vec!["c", "a", "b"]);
    }

    #[test]
    fn dedupe_is_idempotent() {
        let scan = vec![
            listing("a", "patio"),
            listing("b", "patio"),
            listing("a", "deck"),
            listing("c", "pool"),
            listing("b", "pool"),
        ];
        let once = dedupe(scan);
        let twice = dedupe(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn price_change_is_a_different_listing() {
        let a = listing("1 Elm", "patio");
        let mut repriced = a.clone();
        repriced.price = "$4,900".into();
        assert_eq!(dedupe(vec![a, repriced]).len(), 2);
    }

    #[test]
    fn stats_count_duplicates() {
        let stats = DedupStats::new(10, 7);
        assert_eq!(stats.duplicates, 3);
    }
}
