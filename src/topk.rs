//! Bounded per-site top-K aggregation.
//!
//! Each site keeps a min-heap of at most K `(views, title)` pairs. Once the
//! heap is full a new pair only gets in by beating the current minimum, so the
//! heap always holds the K largest pairs seen so far regardless of the order
//! they arrived in. Ties on `views` are broken by title, compared bytewise.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// One ranked page. Field order matters: the derived ordering compares
/// `views` first and `title` second.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageCount {
    pub views: u64,
    pub title: String,
}

impl PageCount {
    pub fn new(views: u64, title: impl Into<String>) -> Self {
        Self { views, title: title.into() }
    }
}

/// A single bounded min-heap.
#[derive(Debug, Clone)]
pub struct BoundedTopK {
    capacity: usize,
    heap: BinaryHeap<Reverse<PageCount>>,
}

impl BoundedTopK {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    /// Returns `true` if the pair was kept.
    pub fn offer(&mut self, entry: PageCount) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(entry));
            return true;
        }
        match self.heap.peek_mut() {
            Some(mut min) if entry > min.0 => {
                // Replacing through `PeekMut` sifts the new value down on drop.
                *min = Reverse(entry);
                true
            }
            _ => false,
        }
    }

    pub fn min(&self) -> Option<&PageCount> {
        self.heap.peek().map(|r| &r.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Consumes the heap, smallest entry first.
    pub fn into_ascending(self) -> Vec<PageCount> {
        // Sorting `Reverse` values descending is ascending on the inner value.
        let mut entries = self.heap.into_sorted_vec();
        entries.reverse();
        entries.into_iter().map(|r| r.0).collect()
    }
}

/// Top-K heaps keyed by site code, remembering the order in which sites were
/// first seen.
#[derive(Debug, Clone)]
pub struct SiteTopK {
    capacity: usize,
    order: Vec<String>,
    heaps: HashMap<String, BoundedTopK>,
}

impl SiteTopK {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::new(),
            heaps: HashMap::new(),
        }
    }

    /// Offers one page to the heap of `site`, creating the heap on first use.
    pub fn offer(&mut self, site: &str, title: &str, views: u64) -> bool {
        if !self.heaps.contains_key(site) {
            self.order.push(site.to_string());
            self.heaps
                .insert(site.to_string(), BoundedTopK::new(self.capacity));
        }
        let Some(heap) = self.heaps.get_mut(site) else {
            return false;
        };
        // Cheap rejection before allocating an owned title.
        if heap.len() == self.capacity {
            if let Some(min) = heap.min() {
                if (views, title) <= (min.views, min.title.as_str()) {
                    return false;
                }
            }
        }
        heap.offer(PageCount::new(views, title))
    }

    pub fn len(&self, site: &str) -> usize {
        self.heaps.get(site).map_or(0, BoundedTopK::len)
    }

    pub fn site_count(&self) -> usize {
        self.heaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heaps.is_empty()
    }

    /// Removes the heap of `site` and returns its entries, smallest first.
    pub fn drain_ascending(&mut self, site: &str) -> Vec<PageCount> {
        match self.heaps.remove(site) {
            Some(heap) => {
                self.order.retain(|s| s != site);
                heap.into_ascending()
            }
            None => Vec::new(),
        }
    }

    /// Drains every site in first-seen order.
    pub fn drain_all(mut self) -> Vec<(String, Vec<PageCount>)> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|site| {
                let heap = self.heaps.remove(&site)?;
                Some((site, heap.into_ascending()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pc(views: u64, title: &str) -> PageCount {
        PageCount::new(views, title)
    }

    #[test]
    fn fills_up_to_capacity_unconditionally() {
        let mut top = SiteTopK::new(25);
        assert!(top.offer("en", "page_title", 5));
        assert_eq!(top.drain_ascending("en"), vec![pc(5, "page_title")]);
    }

    #[test]
    fn keeps_the_three_largest_in_arrival_order_example() {
        let mut top = SiteTopK::new(3);
        for (views, title) in [(3, "a"), (4, "b"), (5, "c"), (2, "d"), (6, "e")] {
            top.offer("en", title, views);
            assert!(top.len("en") <= 3);
        }
        assert_eq!(
            top.drain_ascending("en"),
            vec![pc(4, "b"), pc(5, "c"), pc(6, "e")]
        );
        assert_eq!(top.len("en"), 0);
    }

    #[test]
    fn smaller_entry_is_discarded_when_full() {
        let mut top = SiteTopK::new(3);
        top.offer("d", "page1", 3);
        top.offer("d", "page2", 4);
        top.offer("d", "page3", 5);
        assert!(!top.offer("d", "page_title", 2));
        assert!(!top.drain_ascending("d").contains(&pc(2, "page_title")));
    }

    #[test]
    fn equal_count_breaks_ties_on_title() {
        let mut top = SiteTopK::new(3);
        top.offer("d", "page1", 3);
        top.offer("d", "page2", 4);
        top.offer("d", "page3", 5);
        // (4, "page_title") beats the minimum (3, "page1") and evicts it.
        assert!(top.offer("d", "page_title", 4));
        let drained = top.drain_ascending("d");
        assert!(drained.contains(&pc(4, "page_title")));
        assert!(!drained.contains(&pc(3, "page1")));
        // An exact duplicate of the minimum is not strictly greater.
        let mut top = SiteTopK::new(1);
        top.offer("d", "same", 7);
        assert!(!top.offer("d", "same", 7));
        assert!(!top.offer("d", "Same", 7));
        assert!(top.offer("d", "samf", 7));
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut heap = BoundedTopK::new(0);
        assert!(!heap.offer(pc(1, "x")));
        assert!(heap.is_empty());
    }

    #[test]
    fn sites_drain_in_first_seen_order() {
        let mut top = SiteTopK::new(2);
        top.offer("en", "A", 1);
        top.offer("de", "B", 9);
        top.offer("en", "C", 3);
        top.offer("aa", "D", 2);
        let sites: Vec<String> = top.drain_all().into_iter().map(|(s, _)| s).collect();
        assert_eq!(sites, vec!["en", "de", "aa"]);
    }

    #[test]
    fn draining_discards_the_site() {
        let mut top = SiteTopK::new(2);
        top.offer("en", "A", 1);
        top.offer("de", "B", 1);
        top.drain_ascending("en");
        assert_eq!(top.site_count(), 1);
        assert!(top.drain_ascending("en").is_empty());
        let rest = top.drain_all();
        assert_eq!(rest, vec![("de".to_string(), vec![pc(1, "B")])]);
    }
}
