//! A map from boxes of a buffer's index space to values.
//!
//! The entries always form a disjoint cover of the extent: every element of
//! the extent is described by exactly one entry. Updates cut the new region
//! out of existing entries before inserting it, then merge face-adjacent
//! entries that carry equal values.

use crate::grid::{GridBox, GridRegion};

#[derive(Debug, Clone)]
pub struct RegionMap<T> {
    extent: GridBox,
    entries: Vec<(GridBox, T)>,
}

impl<T: Clone + PartialEq> RegionMap<T> {
    /// A map covering `extent` with a single default value.
    pub fn new(extent: GridBox, default: T) -> Self {
        let entries = if extent.is_empty() {
            Vec::new()
        } else {
            vec![(extent, default)]
        };
        Self { extent, entries }
    }

    pub fn extent(&self) -> GridBox {
        self.extent
    }

    pub fn entries(&self) -> &[(GridBox, T)] {
        &self.entries
    }

    /// Assign `value` to every element of `region` inside the extent.
    pub fn update_region(&mut self, region: &GridRegion, value: T) {
        let region = region.intersection(&GridRegion::from_box(self.extent));
        if region.is_empty() {
            return;
        }

        let mut next = Vec::with_capacity(self.entries.len() + region.boxes().len());
        for (b, v) in self.entries.drain(..) {
            if !region.intersects_box(&b) {
                next.push((b, v));
                continue;
            }
            let mut pieces = vec![b];
            for cut in region.boxes() {
                pieces = pieces.into_iter().flat_map(|p| p.subtract(cut)).collect();
            }
            next.extend(pieces.into_iter().map(|p| (p, v.clone())));
        }
        next.extend(region.boxes().iter().map(|b| (*b, value.clone())));
        self.entries = next;
        self.merge_equal_neighbours();
    }

    pub fn update_box(&mut self, b: &GridBox, value: T) {
        self.update_region(&GridRegion::from_box(*b), value);
    }

    /// All (box, value) pairs intersecting `request`, clipped to it.
    pub fn get_region_values(&self, request: &GridRegion) -> Vec<(GridBox, T)> {
        let mut out = Vec::new();
        for (b, v) in &self.entries {
            for r in request.boxes() {
                let isect = b.intersection(r);
                if !isect.is_empty() {
                    out.push((isect, v.clone()));
                }
            }
        }
        out
    }

    pub fn get_box_values(&self, request: &GridBox) -> Vec<(GridBox, T)> {
        self.get_region_values(&GridRegion::from_box(*request))
    }

    /// Rewrite every value in place.
    pub fn apply_to_values<F>(&mut self, mut f: F)
    where
        F: FnMut(&T) -> T,
    {
        for (_, v) in self.entries.iter_mut() {
            *v = f(v);
        }
        self.merge_equal_neighbours();
    }

    /// Check the disjoint-cover invariant.
    pub fn is_disjoint_cover(&self) -> bool {
        for (i, (a, _)) in self.entries.iter().enumerate() {
            if a.is_empty() {
                return false;
            }
            if self.entries[i + 1..].iter().any(|(b, _)| a.intersects(b)) {
                return false;
            }
        }
        let covered: usize = self.entries.iter().map(|(b, _)| b.area()).sum();
        covered == self.extent.area() && self.entries.iter().all(|(b, _)| self.extent.contains(b))
    }

    fn merge_equal_neighbours(&mut self) {
        loop {
            let mut merged = None;
            'search: for i in 0..self.entries.len() {
                for j in (i + 1)..self.entries.len() {
                    if self.entries[i].1 != self.entries[j].1 {
                        continue;
                    }
                    if let Some(m) = self.entries[i].0.try_merge(&self.entries[j].0) {
                        merged = Some((i, j, m));
                        break 'search;
                    }
                }
            }
            match merged {
                Some((i, j, m)) => {
                    self.entries[i].0 = m;
                    self.entries.remove(j);
                }
                None => break,
            }
        }
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
    }
}
