//! Unified record assembly.
//!
//! Turns one ground-truth observation into one fused record: exact
//! co-pollutant lookup, nearest-measurement resolution against every
//! auxiliary source, composite index computation, and the drop rules for
//! incomplete rows.

use crate::aqi;
use crate::config::{FusionConfig, IncompletePolicy, SourceConfig, SpatialPolicy, ValueSelection};
use crate::error::{FusionError, Result};
use crate::models::{
    FeatureGroup, FusedRecord, FusedTable, FusionStats, MeasurementDataset, Observation,
    TargetNames,
};
use crate::resolver::{MatchQuery, MatchedValues, NearestResolver, Tolerance};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

/// An auxiliary source paired with its loaded rows
#[derive(Debug, Clone)]
pub struct AuxiliarySource {
    pub config: SourceConfig,
    pub dataset: MeasurementDataset,
}

impl AuxiliarySource {
    pub fn new(config: SourceConfig, dataset: MeasurementDataset) -> Self {
        Self { config, dataset }
    }

    fn tolerance(&self) -> Tolerance {
        Tolerance {
            time_hours: self.config.time_tolerance_hours,
            spatial: self.config.spatial_tolerance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExactKey {
    timestamp: DateTime<Utc>,
    latitude: u64,
    longitude: u64,
}

impl ExactKey {
    fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        // +0.0 and -0.0 compare equal, so they must hash equal
        let bits = |v: f64| if v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() };
        Self {
            timestamp,
            latitude: bits(latitude),
            longitude: bits(longitude),
        }
    }
}

/// Co-pollutant values keyed by exact (time, latitude, longitude).
///
/// When several rows share a key the first row with a value wins.
#[derive(Debug, Clone, Default)]
pub struct CoPollutantIndex {
    values: HashMap<ExactKey, f64>,
}

impl CoPollutantIndex {
    pub fn build(dataset: &MeasurementDataset) -> Self {
        let mut values = HashMap::with_capacity(dataset.len());
        for (row, obs) in dataset.observations().iter().enumerate() {
            if let Some(value) = dataset.value(row, 0) {
                values
                    .entry(ExactKey::new(obs.timestamp, obs.latitude, obs.longitude))
                    .or_insert(value);
            }
        }
        Self { values }
    }

    pub fn lookup(&self, timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Option<f64> {
        self.values
            .get(&ExactKey::new(timestamp, latitude, longitude))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Read-only inputs shared by every fusion worker
#[derive(Debug, Clone)]
pub struct FusionInputs {
    pub primary: MeasurementDataset,
    pub co_pollutant: CoPollutantIndex,
    pub sources: Vec<AuxiliarySource>,
    pub targets: TargetNames,
    pub feature_columns: Vec<String>,
    pub incomplete_policy: IncompletePolicy,
    pub spatial_policy: SpatialPolicy,
    pub index_cache_capacity: usize,
    offsets: Vec<usize>,
    required_groups: BTreeSet<FeatureGroup>,
}

impl FusionInputs {
    /// Pair loaded datasets with the configuration that describes them.
    ///
    /// `sources` must follow `config.sources` order.
    pub fn new(
        config: &FusionConfig,
        primary: MeasurementDataset,
        co_pollutant: &MeasurementDataset,
        sources: Vec<MeasurementDataset>,
    ) -> Result<Self> {
        if sources.len() != config.sources.len() {
            return Err(FusionError::configuration(format!(
                "{} auxiliary sources configured but {} datasets supplied",
                config.sources.len(),
                sources.len()
            )));
        }

        let sources: Vec<AuxiliarySource> = config
            .sources
            .iter()
            .cloned()
            .zip(sources)
            .map(|(source, dataset)| AuxiliarySource::new(source, dataset))
            .collect();

        let mut offsets = Vec::with_capacity(sources.len());
        let mut next = 0;
        for source in &sources {
            offsets.push(next);
            next += source.config.feature_names().len();
        }

        let required_groups = sources.iter().map(|s| s.config.group).collect();

        Ok(Self {
            primary,
            co_pollutant: CoPollutantIndex::build(co_pollutant),
            sources,
            targets: config.targets.clone(),
            feature_columns: config.feature_layout(),
            incomplete_policy: config.incomplete_policy,
            spatial_policy: config.spatial_policy,
            index_cache_capacity: config.index_cache_capacity,
            offsets,
            required_groups,
        })
    }

    /// Groups that must contribute to every fused row
    pub fn required_groups(&self) -> &BTreeSet<FeatureGroup> {
        &self.required_groups
    }

    pub fn empty_table(&self) -> FusedTable {
        FusedTable::new(self.targets.clone(), self.feature_columns.clone())
    }
}

/// Outcome of assembling one ground-truth row
#[derive(Debug, Clone, PartialEq)]
pub enum Assembly {
    Fused(FusedRecord),
    MissingCoPollutant,
    /// The ground-truth row itself has no usable value
    MissingPrimary,
    Incomplete,
}

/// Records and counters produced for one chunk of ground-truth rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkOutput {
    pub records: Vec<FusedRecord>,
    pub stats: FusionStats,
}

/// Builds fused records for one worker.
pub struct RecordAssembler<'a> {
    inputs: &'a FusionInputs,
    resolver: NearestResolver,
}

impl<'a> RecordAssembler<'a> {
    pub fn new(inputs: &'a FusionInputs) -> Self {
        Self {
            inputs,
            resolver: NearestResolver::new(inputs.spatial_policy, inputs.index_cache_capacity),
        }
    }

    pub fn assemble(&mut self, row: &Observation) -> Assembly {
        let inputs = self.inputs;

        let co_pollutant = inputs
            .co_pollutant
            .lookup(row.timestamp, row.latitude, row.longitude);
        let Some(co_pollutant) = co_pollutant else {
            trace!(
                "no co-pollutant at ({}, {}, {})",
                row.timestamp, row.latitude, row.longitude
            );
            return Assembly::MissingCoPollutant;
        };

        let Some(primary) = row.values.first().copied().flatten().filter(|v| !v.is_nan()) else {
            return Assembly::MissingPrimary;
        };

        let query = MatchQuery {
            timestamp: row.timestamp,
            latitude: row.latitude,
            longitude: row.longitude,
        };

        let mut features = vec![None; inputs.feature_columns.len()];
        let mut contributed = BTreeSet::new();

        for (position, (source, &offset)) in inputs.sources.iter().zip(&inputs.offsets).enumerate() {
            let default = source.config.missing_default;
            let resolution = self.resolver.resolve(
                position,
                &source.dataset,
                &query,
                source.tolerance(),
                &source.config.values,
            );

            match (resolution, &source.config.values) {
                (Some(found), _) => {
                    match found.values {
                        MatchedValues::Single(value) => features[offset] = value.or(default),
                        MatchedValues::Many(values) => {
                            for (i, (_, value)) in values.into_iter().enumerate() {
                                features[offset + i] = value.or(default);
                            }
                        }
                    }
                    contributed.insert(source.config.group);
                }
                (None, ValueSelection::Column(_)) => {
                    features[offset] = default;
                    contributed.insert(source.config.group);
                }
                (None, ValueSelection::Columns(columns)) => {
                    if let Some(value) = default {
                        features[offset..offset + columns.len()].fill(Some(value));
                        contributed.insert(source.config.group);
                    }
                }
            }
        }

        if !inputs.required_groups.is_subset(&contributed) {
            return Assembly::Incomplete;
        }
        if inputs.incomplete_policy == IncompletePolicy::DropAnyMissing
            && features.iter().any(Option::is_none)
        {
            return Assembly::Incomplete;
        }

        Assembly::Fused(FusedRecord {
            timestamp: row.timestamp,
            latitude: row.latitude,
            longitude: row.longitude,
            place_name: row.place_name.clone(),
            primary,
            co_pollutant,
            composite_index: aqi::composite_index(primary, co_pollutant),
            features,
        })
    }

    /// Assemble a contiguous run of ground-truth rows, preserving their order
    pub fn assemble_rows(&mut self, rows: &[Observation]) -> ChunkOutput {
        let mut output = ChunkOutput::default();
        output.stats.ground_truth_rows = rows.len();

        for row in rows {
            match self.assemble(row) {
                Assembly::Fused(record) => output.records.push(record),
                Assembly::MissingCoPollutant => output.stats.dropped_missing_co_pollutant += 1,
                Assembly::MissingPrimary => output.stats.dropped_missing_primary += 1,
                Assembly::Incomplete => output.stats.dropped_incomplete += 1,
            }
        }

        output.stats.fused_rows = output.records.len();
        output
    }
}
