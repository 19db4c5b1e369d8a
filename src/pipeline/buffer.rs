//! Active/staging generation pair.
//!
//! The loader thread writes the staging slot, the control thread publishes
//! it with [`DoubleBuffer::swap`]. One mutex covers both slots and is held
//! only for staging, swapping and whole-generation reads, never across
//! source I/O. Readers receive an `Arc` of the active generation, so a
//! generation they hold never changes underneath them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::objects::{ObjectVector, PropertyBackup};
use super::selection::ObjectIdentity;

#[derive(Default)]
struct Slots {
    active: Option<Arc<ObjectVector>>,
    staging: Option<ObjectVector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropertyOrigin {
    Default,
    Carried,
    Restored,
}

/// How a swap treats display properties.
#[derive(Debug, Clone, Default)]
pub struct SwapOptions {
    /// Copy properties from same-identity objects of the outgoing generation.
    pub carry_over: bool,
    /// Properties captured before a reload; applied over the carried ones.
    pub backup: Option<PropertyBackup>,
    /// Keep orbit traces instead of clearing them.
    pub preserve_history: bool,
}

impl SwapOptions {
    /// Options for the first generation of a freshly opened session.
    pub fn initial() -> Self {
        Self::default()
    }

    /// Options for ordinary playback.
    pub fn playback() -> Self {
        Self {
            carry_over: true,
            backup: None,
            preserve_history: true,
        }
    }

    /// Options for the first generation after a reload.
    pub fn reload(backup: Option<PropertyBackup>) -> Self {
        Self {
            carry_over: true,
            backup,
            preserve_history: false,
        }
    }
}

/// What a swap did to the incoming objects' properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapReport {
    pub frame_index: u64,
    pub objects: usize,
    /// Objects whose properties came from the outgoing generation.
    pub carried: usize,
    /// Objects whose properties came from the reload backup.
    pub restored: usize,
    /// Objects left with configured defaults.
    pub defaulted: usize,
}

/// Double-buffered object vectors shared between loader and control thread.
#[derive(Default)]
pub struct DoubleBuffer {
    slots: Mutex<Slots>,
}

impl DoubleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place a fully built generation into the staging slot.
    ///
    /// Returns the generation it displaced, if any.
    pub fn stage(&self, vector: ObjectVector) -> Option<ObjectVector> {
        self.lock().staging.replace(vector)
    }

    /// Whether a generation is waiting to be published.
    pub fn has_staged(&self) -> bool {
        self.lock().staging.is_some()
    }

    /// Drop the staged generation. Returns whether there was one.
    pub fn discard_staged(&self) -> bool {
        self.lock().staging.take().is_some()
    }

    /// The generation currently published to readers.
    pub fn active(&self) -> Option<Arc<ObjectVector>> {
        self.lock().active.clone()
    }

    /// Publish the staged generation.
    ///
    /// Properties are resolved in order: configured defaults (already on the
    /// staged objects), then same-identity objects of the outgoing generation
    /// when `carry_over` is set, then the reload backup. Orbit traces are
    /// cleared unless `preserve_history`, and tracing objects then record
    /// their current center of mass.
    ///
    /// Returns `None` when nothing is staged.
    pub fn swap(&self, options: &SwapOptions) -> Option<SwapReport> {
        let mut slots = self.lock();
        let mut incoming = slots.staging.take()?;

        let mut origins = vec![PropertyOrigin::Default; incoming.objects.len()];
        if options.carry_over {
            if let Some(outgoing) = slots.active.as_deref() {
                let previous: HashMap<&ObjectIdentity, _> = outgoing
                    .objects
                    .iter()
                    .map(|o| (&o.identity, &o.properties))
                    .collect();
                for (object, origin) in incoming.objects.iter_mut().zip(origins.iter_mut()) {
                    if let Some(&properties) = previous.get(&object.identity) {
                        object.properties = properties.clone();
                        *origin = PropertyOrigin::Carried;
                    }
                }
            }
        }
        if let Some(backup) = &options.backup {
            for (object, origin) in incoming.objects.iter_mut().zip(origins.iter_mut()) {
                if let Some(saved) = backup.get(&object.identity) {
                    object.properties = saved.clone();
                    *origin = PropertyOrigin::Restored;
                }
            }
        }

        if !options.preserve_history {
            incoming.clear_history();
        }
        incoming.record_history();

        let count = |wanted: PropertyOrigin| origins.iter().filter(|&&o| o == wanted).count();
        let report = SwapReport {
            frame_index: incoming.frame_index(),
            objects: incoming.len(),
            carried: count(PropertyOrigin::Carried),
            restored: count(PropertyOrigin::Restored),
            defaulted: count(PropertyOrigin::Default),
        };

        slots.active = Some(Arc::new(incoming));
        Some(report)
    }

    /// Mutate the active generation's objects in place.
    ///
    /// Readers holding the previous `Arc` keep an unmodified copy.
    pub fn modify_active<R>(&self, f: impl FnOnce(&mut ObjectVector) -> R) -> Option<R> {
        let mut slots = self.lock();
        slots.active.as_mut().map(|active| f(Arc::make_mut(active)))
    }

    /// Center of mass of the active generation.
    pub fn center_of_mass(&self, visible_only: bool) -> Option<[f64; 3]> {
        let slots = self.lock();
        slots.active.as_ref()?.center_of_mass(visible_only)
    }

    /// Particles selected in the active generation.
    pub fn selected_particles(&self) -> usize {
        self.lock()
            .active
            .as_ref()
            .map_or(0, |active| active.selected_particles())
    }

    /// Drop both generations.
    pub fn clear(&self) {
        let mut slots = self.lock();
        slots.active = None;
        slots.staging = None;
    }
}
