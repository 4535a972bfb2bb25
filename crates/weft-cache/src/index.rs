//! Uniform-grid spatial index over 3-D coordinates.
//!
//! Nodes are bucketed by the grid cell containing their position. Sparse:
//! only occupied cells are stored. Queries are exact; the grid only prunes
//! the candidate set.

use std::collections::{BTreeSet, HashMap};

use weft_types::{Coordinates, DerivedState, EntityId};

use crate::error::CacheError;

/// Integer cell coordinates.
type CellKey = [i64; 3];

/// A cached node: the derived row plus the cell it is filed under.
#[derive(Debug, Clone, PartialEq)]
struct Node {
    state: DerivedState,
    position: Coordinates,
    cell: CellKey,
}

/// One query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// The entity.
    pub entity_id: EntityId,
    /// Its position.
    pub position: Coordinates,
    /// Euclidean distance to the query point.
    pub distance: f64,
}

/// Grid index keyed by entity id.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    cell_size: f64,
    nodes: HashMap<EntityId, Node>,
    cells: HashMap<CellKey, BTreeSet<EntityId>>,
}

impl SpatialIndex {
    /// An empty index with the given cell edge length.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] unless `cell_size` is finite and positive.
    pub fn new(cell_size: f64) -> Result<Self, CacheError> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(CacheError::Config(format!(
                "cell_size must be finite and positive, got {cell_size}"
            )));
        }
        Ok(Self {
            cell_size,
            nodes: HashMap::new(),
            cells: HashMap::new(),
        })
    }

    /// Cell edge length.
    pub const fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Number of indexed nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the index holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `entity_id` is indexed.
    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.nodes.contains_key(&entity_id)
    }

    /// The derived row stored for `entity_id`.
    pub fn get(&self, entity_id: EntityId) -> Option<&DerivedState> {
        self.nodes.get(&entity_id).map(|n| &n.state)
    }

    /// Every indexed derived row, in no particular order.
    pub fn all(&self) -> impl Iterator<Item = &DerivedState> {
        self.nodes.values().map(|n| &n.state)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn axis_cell(&self, value: f64) -> i64 {
        // Saturating float-to-int conversion; positions are finite.
        (value / self.cell_size).floor() as i64
    }

    fn cell_of(&self, point: &Coordinates) -> CellKey {
        let [x, y, z] = point.0;
        [self.axis_cell(x), self.axis_cell(y), self.axis_cell(z)]
    }

    /// Insert or replace `state`. Rows without a finite position are not
    /// indexed (and evict any previous node for the entity).
    ///
    /// Returns whether the entity is indexed afterwards.
    pub fn upsert(&mut self, state: DerivedState) -> bool {
        let position = match state.payload.position {
            Some(p) if p.is_finite() => p,
            _ => {
                self.remove(state.entity_id);
                return false;
            }
        };
        let cell = self.cell_of(&position);
        let entity_id = state.entity_id;
        if let Some(previous) = self.nodes.insert(
            entity_id,
            Node {
                state,
                position,
                cell,
            },
        ) {
            if previous.cell != cell {
                self.unfile(entity_id, previous.cell);
            }
        }
        self.cells.entry(cell).or_default().insert(entity_id);
        true
    }

    /// Remove `entity_id`, returning its derived row.
    pub fn remove(&mut self, entity_id: EntityId) -> Option<DerivedState> {
        let node = self.nodes.remove(&entity_id)?;
        self.unfile(entity_id, node.cell);
        Some(node.state)
    }

    fn unfile(&mut self, entity_id: EntityId, cell: CellKey) {
        if let Some(bucket) = self.cells.get_mut(&cell) {
            bucket.remove(&entity_id);
            if bucket.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.cells.clear();
    }

    fn neighbor(entity_id: EntityId, node: &Node, point: &Coordinates) -> Neighbor {
        Neighbor {
            entity_id,
            position: node.position,
            distance: node.position.distance(point),
        }
    }

    fn sort_hits(hits: &mut [Neighbor]) {
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
    }

    /// The `k` nodes closest to `point`, nearest first (ties by id).
    ///
    /// Searches cubic shells of cells around the query cell outward and
    /// stops once no unvisited cell can hold a closer node. Falls back to a
    /// linear scan when the next shell would touch more cells than are
    /// occupied.
    pub fn nearest(&self, point: &Coordinates, k: usize) -> Vec<Neighbor> {
        if k == 0 || self.nodes.is_empty() || !point.is_finite() {
            return Vec::new();
        }
        let center = self.cell_of(point);
        let mut hits: Vec<Neighbor> = Vec::new();
        let mut ring: i64 = 0;
        loop {
            let side = ring.saturating_mul(2).saturating_add(1);
            let shell_cells = side.saturating_mul(side).saturating_mul(side);
            if usize::try_from(shell_cells).map_or(true, |n| n > self.cells.len().saturating_mul(8)) {
                return self.scan_nearest(point, k);
            }
            for cell in shell(center, ring) {
                if let Some(bucket) = self.cells.get(&cell) {
                    for id in bucket {
                        if let Some(node) = self.nodes.get(id) {
                            hits.push(Self::neighbor(*id, node, point));
                        }
                    }
                }
            }
            if hits.len() == self.nodes.len() {
                break;
            }
            if hits.len() >= k {
                Self::sort_hits(&mut hits);
                // Anything outside shells 0..=ring is at least ring * cell_size away.
                #[allow(clippy::cast_precision_loss)]
                let covered = ring as f64 * self.cell_size;
                if hits.get(k.saturating_sub(1)).is_some_and(|h| h.distance <= covered) {
                    break;
                }
            }
            ring = ring.saturating_add(1);
        }
        Self::sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }

    fn scan_nearest(&self, point: &Coordinates, k: usize) -> Vec<Neighbor> {
        let mut hits: Vec<Neighbor> = self
            .nodes
            .iter()
            .map(|(id, node)| Self::neighbor(*id, node, point))
            .collect();
        Self::sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }

    /// Every node within `radius` of `point`, nearest first.
    pub fn within_radius(&self, point: &Coordinates, radius: f64) -> Vec<Neighbor> {
        if !point.is_finite() || !radius.is_finite() || radius < 0.0 {
            return Vec::new();
        }
        let [x, y, z] = point.0;
        let lo = [
            self.axis_cell(x - radius),
            self.axis_cell(y - radius),
            self.axis_cell(z - radius),
        ];
        let hi = [
            self.axis_cell(x + radius),
            self.axis_cell(y + radius),
            self.axis_cell(z + radius),
        ];
        let span = |axis: usize| {
            hi.get(axis)
                .zip(lo.get(axis))
                .map_or(0, |(h, l)| h.saturating_sub(*l).saturating_add(1))
        };
        let box_cells = span(0).saturating_mul(span(1)).saturating_mul(span(2));

        let mut hits: Vec<Neighbor> = Vec::new();
        let mut visit = |bucket: &BTreeSet<EntityId>| {
            for id in bucket {
                if let Some(node) = self.nodes.get(id) {
                    let hit = Self::neighbor(*id, node, point);
                    if hit.distance <= radius {
                        hits.push(hit);
                    }
                }
            }
        };
        if usize::try_from(box_cells).map_or(true, |n| n > self.cells.len()) {
            for (cell, bucket) in &self.cells {
                if in_box(cell, &lo, &hi) {
                    visit(bucket);
                }
            }
        } else {
            for cx in lo[0]..=hi[0] {
                for cy in lo[1]..=hi[1] {
                    for cz in lo[2]..=hi[2] {
                        if let Some(bucket) = self.cells.get(&[cx, cy, cz]) {
                            visit(bucket);
                        }
                    }
                }
            }
        }
        Self::sort_hits(&mut hits);
        hits
    }

    /// Check that the node map and the cell buckets agree.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Invariant`] describing the first disagreement.
    pub fn verify(&self) -> Result<(), CacheError> {
        for (id, node) in &self.nodes {
            self.verify_node(*id, node)?;
        }
        let mut filed: usize = 0;
        for (cell, bucket) in &self.cells {
            if bucket.is_empty() {
                return Err(CacheError::Invariant(format!("empty bucket at {cell:?}")));
            }
            for id in bucket {
                match self.nodes.get(id) {
                    Some(node) if node.cell == *cell => {}
                    _ => {
                        return Err(CacheError::Invariant(format!(
                            "bucket {cell:?} holds {id} which is not filed there"
                        )));
                    }
                }
            }
            filed = filed.saturating_add(bucket.len());
        }
        if filed != self.nodes.len() {
            return Err(CacheError::Invariant(format!(
                "{} nodes but {filed} bucket entries",
                self.nodes.len()
            )));
        }
        Ok(())
    }

    /// Check a single entity's bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Invariant`] if the entity's node and bucket disagree.
    pub fn verify_entity(&self, entity_id: EntityId) -> Result<(), CacheError> {
        match self.nodes.get(&entity_id) {
            Some(node) => self.verify_node(entity_id, node),
            None => Ok(()),
        }
    }

    fn verify_node(&self, id: EntityId, node: &Node) -> Result<(), CacheError> {
        if node.state.entity_id != id {
            return Err(CacheError::Invariant(format!(
                "node {id} carries state for {}",
                node.state.entity_id
            )));
        }
        if node.cell != self.cell_of(&node.position) {
            return Err(CacheError::Invariant(format!("node {id} filed in the wrong cell")));
        }
        if !self.cells.get(&node.cell).is_some_and(|b| b.contains(&id)) {
            return Err(CacheError::Invariant(format!("node {id} missing from its bucket")));
        }
        Ok(())
    }

    /// Drop `entity_id` from its bucket while keeping the node.
    #[cfg(test)]
    pub(crate) fn corrupt(&mut self, entity_id: EntityId) {
        if let Some(cell) = self.nodes.get(&entity_id).map(|n| n.cell) {
            self.unfile(entity_id, cell);
        }
    }
}

fn in_box(cell: &CellKey, lo: &CellKey, hi: &CellKey) -> bool {
    cell.iter()
        .zip(lo.iter().zip(hi.iter()))
        .all(|(c, (l, h))| c >= l && c <= h)
}

/// Cells at Chebyshev distance exactly `ring` from `center`.
fn shell(center: CellKey, ring: i64) -> impl Iterator<Item = CellKey> {
    let [cx, cy, cz] = center;
    (-ring..=ring).flat_map(move |dx| {
        (-ring..=ring).flat_map(move |dy| {
            (-ring..=ring).filter_map(move |dz| {
                let on_shell = dx.abs() == ring || dy.abs() == ring || dz.abs() == ring;
                on_shell.then(|| {
                    [
                        cx.saturating_add(dx),
                        cy.saturating_add(dy),
                        cz.saturating_add(dz),
                    ]
                })
            })
        })
    })
}
