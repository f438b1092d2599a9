//! Spatial index over (latitude, longitude) coordinates.
//!
//! Wraps an R*-tree bulk loaded in O(N log N). Distances are Euclidean in
//! coordinate-degree space, the same unit as the configured spatial
//! tolerance. The index is immutable: a changed row set means a new index.

use crate::models::MeasurementDataset;
use rstar::RTree;
use rstar::primitives::GeomWithData;

type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// Closest indexed row to a query coordinate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Row reference supplied when the index was built
    pub row: usize,
    /// Euclidean distance in degrees
    pub distance: f64,
}

/// Nearest-neighbour index mapping coordinates to row references.
///
/// An empty input builds no tree; queries against it return `None`.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    tree: Option<RTree<IndexedPoint>>,
}

impl SpatialIndex {
    /// Build from `(row, latitude, longitude)` triples
    pub fn build(points: impl IntoIterator<Item = (usize, f64, f64)>) -> Self {
        let points: Vec<IndexedPoint> = points
            .into_iter()
            .map(|(row, lat, lon)| GeomWithData::new([lat, lon], row))
            .collect();

        let tree = if points.is_empty() {
            None
        } else {
            Some(RTree::bulk_load(points))
        };

        Self { tree }
    }

    /// Index every row of a dataset
    pub fn from_dataset(dataset: &MeasurementDataset) -> Self {
        Self::build(
            dataset
                .observations()
                .iter()
                .enumerate()
                .map(|(row, obs)| (row, obs.latitude, obs.longitude)),
        )
    }

    /// Index a subset of a dataset's rows; row references stay dataset-relative
    pub fn from_rows(dataset: &MeasurementDataset, rows: &[usize]) -> Self {
        let observations = dataset.observations();
        Self::build(rows.iter().filter_map(|&row| {
            observations
                .get(row)
                .map(|obs| (row, obs.latitude, obs.longitude))
        }))
    }

    pub fn len(&self) -> usize {
        self.tree.as_ref().map_or(0, |tree| tree.size())
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_none()
    }

    /// k=1 query. Rows at the same minimal distance resolve to the lowest row.
    pub fn nearest(&self, latitude: f64, longitude: f64) -> Option<Neighbor> {
        let tree = self.tree.as_ref()?;
        let mut candidates = tree.nearest_neighbor_iter_with_distance_2(&[latitude, longitude]);

        let (first, best) = candidates.next()?;
        let mut row = first.data;
        for (candidate, distance_2) in candidates {
            if distance_2 > best {
                break;
            }
            row = row.min(candidate.data);
        }

        Some(Neighbor {
            row,
            distance: best.sqrt(),
        })
    }
}
