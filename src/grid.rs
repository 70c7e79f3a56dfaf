//! Region algebra over buffer index spaces.
//!
//! Every box is a half-open, three-dimensional integer range. One- and
//! two-dimensional buffers use an extent of one in their unused trailing
//! dimensions, so the same algebra serves all buffer ranks.
//!
//! A [`GridRegion`] is a set of pairwise disjoint, non-empty boxes kept in a
//! canonical form (face-adjacent boxes merged, sorted). Equality between
//! regions is set equality, independent of how the boxes are cut.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of dimensions every box carries.
pub const MAX_DIMS: usize = 3;

/// An offset plus a size, the way execution ranges and chunks are described.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subrange {
    pub offset: [usize; MAX_DIMS],
    pub range: [usize; MAX_DIMS],
}

impl Subrange {
    pub fn new(offset: [usize; MAX_DIMS], range: [usize; MAX_DIMS]) -> Self {
        Self { offset, range }
    }

    /// A subrange starting at the origin.
    pub fn from_range(range: [usize; MAX_DIMS]) -> Self {
        Self {
            offset: [0; MAX_DIMS],
            range,
        }
    }

    /// A one-dimensional subrange `[offset, offset + len)`.
    pub fn one_d(offset: usize, len: usize) -> Self {
        Self {
            offset: [offset, 0, 0],
            range: [len, 1, 1],
        }
    }

    pub fn size(&self) -> usize {
        self.range.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn to_box(&self) -> GridBox {
        let mut max = [0; MAX_DIMS];
        for (d, m) in max.iter_mut().enumerate() {
            *m = self.offset[d] + self.range[d];
        }
        GridBox::spanning(self.offset, max)
    }
}

impl std::fmt::Display for Subrange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_box())
    }
}

/// A half-open box `[min, max)` in three dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawBox", into = "RawBox")]
pub struct GridBox {
    min: [usize; MAX_DIMS],
    max: [usize; MAX_DIMS],
}

/// Wire form of [`GridBox`], validated on the way in.
#[derive(Serialize, Deserialize)]
struct RawBox {
    min: [usize; MAX_DIMS],
    max: [usize; MAX_DIMS],
}

impl TryFrom<RawBox> for GridBox {
    type Error = Error;

    fn try_from(raw: RawBox) -> Result<Self> {
        GridBox::new(raw.min, raw.max)
    }
}

impl From<GridBox> for RawBox {
    fn from(b: GridBox) -> Self {
        RawBox { min: b.min, max: b.max }
    }
}

impl GridBox {
    /// Create a box, rejecting inverted bounds.
    ///
    /// `min == max` in any dimension yields a valid, empty box.
    pub fn new(min: [usize; MAX_DIMS], max: [usize; MAX_DIMS]) -> Result<Self> {
        if (0..MAX_DIMS).any(|d| min[d] > max[d]) {
            return Err(Error::InvalidRegion(format!(
                "inverted bounds {:?} - {:?}",
                min, max
            )));
        }
        Ok(Self::spanning(min, max))
    }

    /// A one-dimensional box `[start, end)`.
    pub fn one_d(start: usize, end: usize) -> Result<Self> {
        Self::new([start, 0, 0], [end, 1, 1])
    }

    /// The box covering a whole buffer extent.
    pub fn from_extent(extent: [usize; MAX_DIMS]) -> Self {
        Self::spanning([0; MAX_DIMS], extent)
    }

    /// The canonical empty box.
    pub fn empty() -> Self {
        Self {
            min: [0; MAX_DIMS],
            max: [0; MAX_DIMS],
        }
    }

    // Degenerate bounds collapse to the canonical empty box.
    fn spanning(min: [usize; MAX_DIMS], max: [usize; MAX_DIMS]) -> Self {
        if (0..MAX_DIMS).any(|d| max[d] <= min[d]) {
            return Self::empty();
        }
        Self { min, max }
    }

    /// Inclusive lower corner.
    pub fn lower(&self) -> [usize; MAX_DIMS] {
        self.min
    }

    /// Exclusive upper corner.
    pub fn upper(&self) -> [usize; MAX_DIMS] {
        self.max
    }

    pub fn is_empty(&self) -> bool {
        (0..MAX_DIMS).any(|d| self.max[d] <= self.min[d])
    }

    /// Number of elements in the box.
    pub fn area(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (0..MAX_DIMS).map(|d| self.max[d] - self.min[d]).product()
    }

    pub fn intersection(&self, other: &GridBox) -> GridBox {
        let mut min = [0; MAX_DIMS];
        let mut max = [0; MAX_DIMS];
        for d in 0..MAX_DIMS {
            min[d] = self.min[d].max(other.min[d]);
            max[d] = self.max[d].min(other.max[d]);
            if max[d] <= min[d] {
                return GridBox::empty();
            }
        }
        GridBox { min, max }
    }

    pub fn intersects(&self, other: &GridBox) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Whether `other` lies completely inside this box. The empty box is
    /// contained in everything.
    pub fn contains(&self, other: &GridBox) -> bool {
        if other.is_empty() {
            return true;
        }
        (0..MAX_DIMS).all(|d| self.min[d] <= other.min[d] && other.max[d] <= self.max[d])
    }

    /// `self \ other` as at most six disjoint boxes.
    pub fn subtract(&self, other: &GridBox) -> Vec<GridBox> {
        if self.is_empty() {
            return Vec::new();
        }
        let isect = self.intersection(other);
        if isect.is_empty() {
            return vec![*self];
        }

        let mut pieces = Vec::new();
        let mut rest = *self;
        for d in 0..MAX_DIMS {
            if rest.min[d] < isect.min[d] {
                let mut piece = rest;
                piece.max[d] = isect.min[d];
                pieces.push(piece);
                rest.min[d] = isect.min[d];
            }
            if isect.max[d] < rest.max[d] {
                let mut piece = rest;
                piece.min[d] = isect.max[d];
                pieces.push(piece);
                rest.max[d] = isect.max[d];
            }
        }
        pieces
    }

    /// Merge two boxes that share a full face.
    pub(crate) fn try_merge(&self, other: &GridBox) -> Option<GridBox> {
        let mut merge_dim = None;
        for d in 0..MAX_DIMS {
            if self.min[d] == other.min[d] && self.max[d] == other.max[d] {
                continue;
            }
            if merge_dim.is_some() {
                return None;
            }
            if self.max[d] == other.min[d] || other.max[d] == self.min[d] {
                merge_dim = Some(d);
            } else {
                return None;
            }
        }
        let d = merge_dim?;
        let mut merged = *self;
        merged.min[d] = self.min[d].min(other.min[d]);
        merged.max[d] = self.max[d].max(other.max[d]);
        Some(merged)
    }

    pub fn to_subrange(&self) -> Subrange {
        if self.is_empty() {
            return Subrange::new(self.min, [0; MAX_DIMS]);
        }
        let mut range = [0; MAX_DIMS];
        for (d, r) in range.iter_mut().enumerate() {
            *r = self.max[d] - self.min[d];
        }
        Subrange::new(self.min, range)
    }
}

impl std::fmt::Display for GridBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{},{},{}] - [{},{},{}]",
            self.min[0], self.min[1], self.min[2], self.max[0], self.max[1], self.max[2]
        )
    }
}

/// A set of disjoint boxes in canonical form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridRegion {
    boxes: Vec<GridBox>,
}

impl GridRegion {
    pub fn new() -> Self {
        Self { boxes: Vec::new() }
    }

    pub fn from_box(b: GridBox) -> Self {
        Self::from_boxes([b])
    }

    /// Build a region from arbitrary, possibly overlapping boxes.
    pub fn from_boxes(boxes: impl IntoIterator<Item = GridBox>) -> Self {
        Self {
            boxes: Self::normalize(boxes),
        }
    }

    /// Turn a list of boxes into a disjoint cover of the same set.
    ///
    /// Overlaps are cut away first, then face-adjacent boxes are merged
    /// until no merge applies. The result is sorted so equal inputs always
    /// produce identical lists.
    pub fn normalize(boxes: impl IntoIterator<Item = GridBox>) -> Vec<GridBox> {
        let mut disjoint: Vec<GridBox> = Vec::new();
        for b in boxes {
            if b.is_empty() {
                continue;
            }
            let mut pieces = vec![b];
            for existing in &disjoint {
                pieces = pieces
                    .into_iter()
                    .flat_map(|p| p.subtract(existing))
                    .collect();
                if pieces.is_empty() {
                    break;
                }
            }
            disjoint.extend(pieces);
        }
        merge_boxes(&mut disjoint);
        disjoint.sort();
        disjoint
    }

    pub fn boxes(&self) -> &[GridBox] {
        &self.boxes
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn area(&self) -> usize {
        self.boxes.iter().map(GridBox::area).sum()
    }

    /// Smallest box enclosing the region.
    pub fn bounding_box(&self) -> GridBox {
        let Some(first) = self.boxes.first() else {
            return GridBox::empty();
        };
        let mut min = first.min;
        let mut max = first.max;
        for b in &self.boxes[1..] {
            for d in 0..MAX_DIMS {
                min[d] = min[d].min(b.min[d]);
                max[d] = max[d].max(b.max[d]);
            }
        }
        GridBox { min, max }
    }

    pub fn union(&self, other: &GridRegion) -> GridRegion {
        GridRegion::from_boxes(self.boxes.iter().chain(other.boxes.iter()).copied())
    }

    pub fn intersection(&self, other: &GridRegion) -> GridRegion {
        let mut out = Vec::new();
        for a in &self.boxes {
            for b in &other.boxes {
                let isect = a.intersection(b);
                if !isect.is_empty() {
                    out.push(isect);
                }
            }
        }
        GridRegion::from_boxes(out)
    }

    pub fn difference(&self, other: &GridRegion) -> GridRegion {
        let mut out = Vec::new();
        for a in &self.boxes {
            let mut pieces = vec![*a];
            for b in &other.boxes {
                pieces = pieces.into_iter().flat_map(|p| p.subtract(b)).collect();
                if pieces.is_empty() {
                    break;
                }
            }
            out.extend(pieces);
        }
        GridRegion::from_boxes(out)
    }

    pub fn intersects(&self, other: &GridRegion) -> bool {
        self.boxes
            .iter()
            .any(|a| other.boxes.iter().any(|b| a.intersects(b)))
    }

    pub fn intersects_box(&self, other: &GridBox) -> bool {
        self.boxes.iter().any(|a| a.intersects(other))
    }

    pub fn contains(&self, other: &GridRegion) -> bool {
        other.difference(self).is_empty()
    }
}

impl PartialEq for GridRegion {
    fn eq(&self, other: &Self) -> bool {
        self.area() == other.area() && self.contains(other)
    }
}

impl Eq for GridRegion {}

impl From<GridBox> for GridRegion {
    fn from(b: GridBox) -> Self {
        GridRegion::from_box(b)
    }
}

impl std::fmt::Display for GridRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, b) in self.boxes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", b)?;
        }
        write!(f, "}}")
    }
}

/// Greedily merge face-adjacent boxes until no merge applies.
fn merge_boxes(boxes: &mut Vec<GridBox>) {
    loop {
        let mut merged = None;
        'search: for i in 0..boxes.len() {
            for j in (i + 1)..boxes.len() {
                if let Some(m) = boxes[i].try_merge(&boxes[j]) {
                    merged = Some((i, j, m));
                    break 'search;
                }
            }
        }
        match merged {
            Some((i, j, m)) => {
                boxes[i] = m;
                boxes.remove(j);
            }
            None => break,
        }
    }
}
