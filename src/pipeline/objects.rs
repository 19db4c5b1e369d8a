//! Particle objects, loaded generations and display-property backups.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;

use super::selection::ObjectIdentity;

/// How an object's particles are colored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    /// Single color for every particle.
    #[default]
    Uniform,
    /// Color mapped from speed.
    Velocity,
    /// Color mapped from local density.
    Density,
}

/// Bounded history of an object's center of mass across frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitTrace {
    pub enabled: bool,
    pub max_points: usize,
    #[serde(skip)]
    pub points: VecDeque<[f32; 3]>,
}

impl Default for OrbitTrace {
    fn default() -> Self {
        Self {
            enabled: false,
            max_points: 500,
            points: VecDeque::new(),
        }
    }
}

impl OrbitTrace {
    /// Append a point, dropping the oldest once `max_points` is reached.
    pub fn push(&mut self, point: [f32; 3]) {
        if self.max_points == 0 {
            return;
        }
        while self.points.len() >= self.max_points {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Mutable display state of one particle object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayProperties {
    pub visible: bool,
    pub show_points: bool,
    pub point_size: f32,
    pub show_texture: bool,
    pub texture_size: f32,
    pub texture_alpha: f32,
    /// RGB in `[0, 1]`.
    pub color: [f32; 3],
    pub color_mode: ColorMode,
    pub orbit: OrbitTrace,
}

impl Default for DisplayProperties {
    fn default() -> Self {
        Self {
            visible: true,
            show_points: true,
            point_size: 1.0,
            show_texture: false,
            texture_size: 0.1,
            texture_alpha: 0.5,
            color: [1.0, 1.0, 1.0],
            color_mode: ColorMode::Uniform,
            orbit: OrbitTrace::default(),
        }
    }
}

/// One visualised particle group.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticlesObject {
    pub identity: ObjectIdentity,
    /// Local slot -> index into the generation's particle arrays.
    pub index_table: Vec<u32>,
    pub properties: DisplayProperties,
}

impl ParticlesObject {
    pub fn new(identity: ObjectIdentity, index_table: Vec<u32>, properties: DisplayProperties) -> Self {
        Self {
            identity,
            index_table,
            properties,
        }
    }

    /// Number of particles in the object.
    #[inline]
    pub fn npart(&self) -> usize {
        self.index_table.len()
    }

    /// Sum of member positions, in `f64`.
    fn position_sum(&self, data: &ParticleData) -> [f64; 3] {
        self.index_table
            .par_iter()
            .map(|&i| {
                let p = data.position(i as usize);
                [p[0] as f64, p[1] as f64, p[2] as f64]
            })
            .reduce(|| [0.0; 3], add3)
    }

    /// Unweighted center of mass, `None` for an empty object.
    pub fn center_of_mass(&self, data: &ParticleData) -> Option<[f64; 3]> {
        if self.index_table.is_empty() {
            return None;
        }
        let sum = self.position_sum(data);
        let n = self.npart() as f64;
        Some([sum[0] / n, sum[1] / n, sum[2] / n])
    }
}

#[inline]
fn add3(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// Particle arrays of one loaded generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleData {
    /// Position of the frame in the session (0-based).
    pub frame_index: u64,
    pub time: f64,
    pub particle_count: usize,
    /// `3 * particle_count` interleaved values.
    pub positions: Vec<f32>,
    pub velocities: Option<Vec<f32>>,
    /// Original snapshot index of every particle when the arrays were
    /// compacted, `None` when they hold the whole snapshot.
    pub global_ids: Option<Vec<u32>>,
}

impl ParticleData {
    /// Keep every particle of `snapshot`.
    pub fn whole(frame_index: u64, snapshot: Snapshot) -> Self {
        Self {
            frame_index,
            time: snapshot.time,
            particle_count: snapshot.particle_count,
            positions: snapshot.positions,
            velocities: snapshot.velocities,
            global_ids: None,
        }
    }

    /// Keep only particles referenced by `objects`, rewriting their index
    /// tables to point into the compacted arrays.
    ///
    /// Index tables must already be bounded by `snapshot.particle_count`.
    pub fn compacted(frame_index: u64, snapshot: Snapshot, objects: &mut [ParticlesObject]) -> Self {
        let mut kept: Vec<u32> = objects
            .iter()
            .flat_map(|o| o.index_table.iter().copied())
            .collect();
        kept.par_sort_unstable();
        kept.dedup();

        let gather = |values: &[f32]| -> Vec<f32> {
            kept.par_iter()
                .flat_map_iter(|&g| {
                    let g = g as usize * 3;
                    values[g..g + 3].iter().copied()
                })
                .collect()
        };
        let positions = gather(&snapshot.positions);
        let velocities = snapshot.velocities.as_deref().map(gather);

        objects.par_iter_mut().for_each(|object| {
            for index in object.index_table.iter_mut() {
                // Present by construction of `kept`
                if let Ok(slot) = kept.binary_search(index) {
                    *index = slot as u32;
                }
            }
        });

        Self {
            frame_index,
            time: snapshot.time,
            particle_count: kept.len(),
            positions,
            velocities,
            global_ids: Some(kept),
        }
    }

    #[inline]
    pub fn position(&self, i: usize) -> [f32; 3] {
        [
            self.positions[i * 3],
            self.positions[i * 3 + 1],
            self.positions[i * 3 + 2],
        ]
    }

    /// Snapshot index of array slot `i`.
    #[inline]
    pub fn global_id(&self, i: usize) -> usize {
        match &self.global_ids {
            Some(ids) => ids[i] as usize,
            None => i,
        }
    }

    pub fn is_compacted(&self) -> bool {
        self.global_ids.is_some()
    }
}

/// One generation of loaded, displayable data.
///
/// Particle arrays are shared between clones; only the objects are owned.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectVector {
    pub data: Arc<ParticleData>,
    pub objects: Vec<ParticlesObject>,
}

impl ObjectVector {
    pub fn new(data: ParticleData, objects: Vec<ParticlesObject>) -> Self {
        Self {
            data: Arc::new(data),
            objects,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ParticlesObject> {
        self.objects.iter()
    }

    pub fn frame_index(&self) -> u64 {
        self.data.frame_index
    }

    pub fn time(&self) -> f64 {
        self.data.time
    }

    /// Object with the given identity.
    pub fn find(&self, identity: &ObjectIdentity) -> Option<&ParticlesObject> {
        self.objects.iter().find(|o| &o.identity == identity)
    }

    pub fn find_mut(&mut self, identity: &ObjectIdentity) -> Option<&mut ParticlesObject> {
        self.objects.iter_mut().find(|o| &o.identity == identity)
    }

    /// Total particles across objects (overlaps counted per object).
    pub fn selected_particles(&self) -> usize {
        self.objects.iter().map(ParticlesObject::npart).sum()
    }

    /// Center of mass over objects, optionally only visible ones.
    pub fn center_of_mass(&self, visible_only: bool) -> Option<[f64; 3]> {
        let (sum, count) = self
            .objects
            .iter()
            .filter(|o| !visible_only || o.properties.visible)
            .fold(([0.0; 3], 0usize), |(sum, count), object| {
                (add3(sum, object.position_sum(&self.data)), count + object.npart())
            });
        if count == 0 {
            return None;
        }
        let n = count as f64;
        Some([sum[0] / n, sum[1] / n, sum[2] / n])
    }

    /// Clear every history trace.
    pub fn clear_history(&mut self) {
        for object in &mut self.objects {
            object.properties.orbit.clear();
        }
    }

    /// Append each tracing object's center of mass to its trace.
    pub fn record_history(&mut self) {
        let data = &self.data;
        for object in &mut self.objects {
            if !object.properties.orbit.enabled {
                continue;
            }
            if let Some(com) = object.center_of_mass(data) {
                object
                    .properties
                    .orbit
                    .push([com[0] as f32, com[1] as f32, com[2] as f32]);
            }
        }
    }
}

/// Display properties captured by object identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBackup {
    properties: HashMap<ObjectIdentity, DisplayProperties>,
}

impl PropertyBackup {
    /// Capture the properties of every object in `vector`.
    pub fn capture(vector: &ObjectVector) -> Self {
        Self {
            properties: vector
                .objects
                .iter()
                .map(|o| (o.identity.clone(), o.properties.clone()))
                .collect(),
        }
    }

    /// Overwrite properties of objects present in the backup.
    ///
    /// Returns the number of objects restored.
    pub fn restore(&self, vector: &mut ObjectVector) -> usize {
        let mut restored = 0;
        for object in &mut vector.objects {
            if let Some(saved) = self.properties.get(&object.identity) {
                object.properties = saved.clone();
                restored += 1;
            }
        }
        restored
    }

    pub fn get(&self, identity: &ObjectIdentity) -> Option<&DisplayProperties> {
        self.properties.get(identity)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::IndexRange;
    use crate::snapshot::ComponentRange;
    use proptest::prelude::*;

    fn line_snapshot(n: usize) -> Snapshot {
        // Particle i sits at (i, 0, 0)
        let positions = (0..n).flat_map(|i| [i as f32, 0.0, 0.0]).collect();
        Snapshot::new(1.5, positions)
            .with_component(ComponentRange::contiguous("halo", 0, n / 2))
            .with_component(ComponentRange::contiguous("disk", n / 2, n - n / 2))
    }

    fn object(identity: ObjectIdentity, table: Vec<u32>) -> ParticlesObject {
        ParticlesObject::new(identity, table, DisplayProperties::default())
    }

    #[test]
    fn test_orbit_trace_is_bounded() {
        let mut trace = OrbitTrace {
            enabled: true,
            max_points: 3,
            points: VecDeque::new(),
        };
        for i in 0..5 {
            trace.push([i as f32, 0.0, 0.0]);
        }
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.points.front(), Some(&[2.0, 0.0, 0.0]));
    }

    #[test]
    fn test_center_of_mass() {
        let data = ParticleData::whole(0, line_snapshot(10));
        let vector = ObjectVector::new(
            data,
            vec![
                object(ObjectIdentity::Component("halo".into()), (0..5).collect()),
                object(ObjectIdentity::Component("disk".into()), (5..10).collect()),
            ],
        );
        assert_eq!(
            vector.objects[0].center_of_mass(&vector.data),
            Some([2.0, 0.0, 0.0])
        );
        assert_eq!(vector.center_of_mass(false), Some([4.5, 0.0, 0.0]));
        assert_eq!(vector.selected_particles(), 10);

        let mut hidden = vector.clone();
        hidden.objects[1].properties.visible = false;
        assert_eq!(hidden.center_of_mass(true), Some([2.0, 0.0, 0.0]));
        hidden.objects[0].properties.visible = false;
        assert_eq!(hidden.center_of_mass(true), None);
    }

    #[test]
    fn test_compaction_remaps_tables() {
        let snapshot = line_snapshot(100);
        let mut objects = vec![
            object(ObjectIdentity::Range(IndexRange::new(90, 95, 5)), vec![90, 95]),
            object(ObjectIdentity::Range(IndexRange::new(10, 12, 1)), vec![10, 11, 12]),
            object(ObjectIdentity::Range(IndexRange::new(11, 11, 1)), vec![11]),
        ];
        let data = ParticleData::compacted(3, snapshot, &mut objects);

        assert!(data.is_compacted());
        assert_eq!(data.frame_index, 3);
        assert_eq!(data.particle_count, 5);
        assert_eq!(data.global_ids, Some(vec![10, 11, 12, 90, 95]));
        assert_eq!(objects[0].index_table, vec![3, 4]);
        assert_eq!(objects[1].index_table, vec![0, 1, 2]);
        assert_eq!(objects[2].index_table, vec![1]);

        // Positions follow their particles
        assert_eq!(data.position(3), [90.0, 0.0, 0.0]);
        assert_eq!(data.global_id(4), 95);
    }

    #[test]
    fn test_history_recording() {
        let data = ParticleData::whole(0, line_snapshot(4));
        let mut traced = object(ObjectIdentity::All, vec![0, 1, 2, 3]);
        traced.properties.orbit.enabled = true;
        let single = object(ObjectIdentity::Range(IndexRange::new(0, 0, 1)), vec![0]);
        let mut vector = ObjectVector::new(data, vec![traced, single]);
        assert!(!vector.data.is_compacted());

        let single_id = ObjectIdentity::Range(IndexRange::new(0, 0, 1));
        if let Some(object) = vector.find_mut(&single_id) {
            object.properties.point_size = 2.0;
        }
        assert_eq!(vector.find(&single_id).map(|o| o.properties.point_size), Some(2.0));

        vector.record_history();
        vector.record_history();
        assert_eq!(vector.objects[0].properties.orbit.len(), 2);
        assert!(vector.objects[1].properties.orbit.is_empty());

        vector.clear_history();
        assert!(vector.objects[0].properties.orbit.is_empty());
    }

    fn arb_properties() -> impl Strategy<Value = DisplayProperties> {
        (any::<bool>(), 0.1f32..10.0, 0.0f32..1.0, 0.0f32..1.0, any::<bool>()).prop_map(
            |(visible, point_size, alpha, red, tracing)| DisplayProperties {
                visible,
                point_size,
                texture_alpha: alpha,
                color: [red, 0.5, 0.25],
                orbit: OrbitTrace {
                    enabled: tracing,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_backup_restore_roundtrip(
            props in prop::collection::vec(arb_properties(), 1..5),
            scramble in arb_properties(),
        ) {
            let data = ParticleData::whole(0, line_snapshot(10));
            let objects = props
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    ParticlesObject::new(
                        ObjectIdentity::Range(IndexRange::new(i, i, 1)),
                        vec![i as u32],
                        p.clone(),
                    )
                })
                .collect();
            let mut vector = ObjectVector::new(data, objects);
            let original = vector.clone();

            let backup = PropertyBackup::capture(&vector);
            for object in &mut vector.objects {
                object.properties = scramble.clone();
            }
            let restored = backup.restore(&mut vector);

            prop_assert_eq!(restored, props.len());
            prop_assert_eq!(vector, original);
        }
    }
}
