//! Named variables shared between a group's parent and its contexts.
//!
//! A slot connects one parent value (owned by the [`ContextGroup`]) to one
//! child value per context. Two directed operations move data through the
//! slots: *initialize* fans the parent value out to every child, optionally
//! preceded by a broadcast from a master node so all nodes start from the
//! same parent; *reduce* folds the child values into the node-local parent
//! and then folds the parents across nodes, so every node ends up with the
//! same global value.
//!
//! The value contract is a capability record ([`SharedDef`]) of plain
//! function pointers: a neutral-element constructor and an associative,
//! commutative combiner. The byte form needed to cross node boundaries
//! comes from serde; images travel with little-endian length prefixes.
//!
//! [`ContextGroup`]: crate::ContextGroup

use std::any::Any;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{BspError, Result};

/// How a shared value resets and combines. Plain function pointers so slots
/// can be stamped out per context without dynamic dispatch on the hot path.
pub struct SharedDef<T> {
    /// Identity element of the reduction.
    pub make_neutral: fn() -> T,
    /// Fold `right` into `left`; must be associative and commutative.
    pub reduce_with: fn(&mut T, &T),
}

impl<T> SharedDef<T> {
    pub fn new(make_neutral: fn() -> T, reduce_with: fn(&mut T, &T)) -> Self {
        SharedDef {
            make_neutral,
            reduce_with,
        }
    }
}

impl<T> Clone for SharedDef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedDef<T> {}

macro_rules! numeric_defs {
    ($($t:ty => $zero:expr, $one:expr, $min_neutral:expr, $max_neutral:expr;)*) => {$(
        impl SharedDef<$t> {
            /// Sum reduction with neutral 0.
            pub fn sum() -> Self {
                fn neutral() -> $t { $zero }
                fn reduce(a: &mut $t, b: &$t) { *a += *b }
                SharedDef::new(neutral, reduce)
            }

            /// Product reduction with neutral 1.
            pub fn product() -> Self {
                fn neutral() -> $t { $one }
                fn reduce(a: &mut $t, b: &$t) { *a *= *b }
                SharedDef::new(neutral, reduce)
            }

            /// Minimum reduction.
            pub fn min() -> Self {
                fn neutral() -> $t { $min_neutral }
                fn reduce(a: &mut $t, b: &$t) { *a = (*a).min(*b) }
                SharedDef::new(neutral, reduce)
            }

            /// Maximum reduction.
            pub fn max() -> Self {
                fn neutral() -> $t { $max_neutral }
                fn reduce(a: &mut $t, b: &$t) { *a = (*a).max(*b) }
                SharedDef::new(neutral, reduce)
            }
        }
    )*};
}

numeric_defs! {
    i32 => 0, 1, i32::MAX, i32::MIN;
    i64 => 0, 1, i64::MAX, i64::MIN;
    u32 => 0, 1, u32::MAX, u32::MIN;
    u64 => 0, 1, u64::MAX, u64::MIN;
    usize => 0, 1, usize::MAX, usize::MIN;
    f32 => 0.0, 1.0, f32::INFINITY, f32::NEG_INFINITY;
    f64 => 0.0, 1.0, f64::INFINITY, f64::NEG_INFINITY;
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| BspError::Internal(format!("shared variable encoding: {e}")))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| BspError::Internal(format!("shared variable decoding: {e}")))
}

/// Type-erased slot operations. Parent and child slots share one concrete
/// implementation; the group moves values between them through this trait.
pub trait SharedSlot: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Reset to the reduction's identity.
    fn make_neutral(&mut self);
    /// Overwrite this slot's value with `other`'s (initialize fan-out).
    fn assign_from(&mut self, other: &dyn SharedSlot) -> Result<()>;
    /// Fold `other`'s value into this slot (child fold).
    fn reduce_from(&mut self, other: &dyn SharedSlot) -> Result<()>;
    /// Serialized image of the value.
    fn to_bytes(&self) -> Result<Vec<u8>>;
    /// Overwrite the value from an image.
    fn set_bytes(&mut self, bytes: &[u8]) -> Result<()>;
    /// Fold an image into the value (cross-node fold).
    fn merge_bytes(&mut self, bytes: &[u8]) -> Result<()>;
    fn boxed_clone(&self) -> Box<dyn SharedSlot>;
}

pub(crate) struct Slot<T> {
    pub value: T,
    def: SharedDef<T>,
}

impl<T> Slot<T> {
    pub fn new(def: SharedDef<T>) -> Self {
        Slot {
            value: (def.make_neutral)(),
            def,
        }
    }
}

impl<T> SharedSlot for Slot<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        &self.value
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        &mut self.value
    }

    fn make_neutral(&mut self) {
        self.value = (self.def.make_neutral)();
    }

    fn assign_from(&mut self, other: &dyn SharedSlot) -> Result<()> {
        let other = other
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| BspError::Internal("shared slot type mismatch".to_string()))?;
        self.value = other.clone();
        Ok(())
    }

    fn reduce_from(&mut self, other: &dyn SharedSlot) -> Result<()> {
        let other = other
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| BspError::Internal("shared slot type mismatch".to_string()))?;
        (self.def.reduce_with)(&mut self.value, other);
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(&self.value)
    }

    fn set_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.value = decode(bytes)?;
        Ok(())
    }

    fn merge_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let other: T = decode(bytes)?;
        (self.def.reduce_with)(&mut self.value, &other);
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn SharedSlot> {
        Box::new(Slot {
            value: self.value.clone(),
            def: self.def,
        })
    }
}

/// The parent side of a group's shared slots, ordered by name so every node
/// walks them identically.
pub(crate) struct SharedVariableSet {
    pub slots: BTreeMap<String, Box<dyn SharedSlot>>,
}

impl SharedVariableSet {
    pub fn new() -> Self {
        SharedVariableSet {
            slots: BTreeMap::new(),
        }
    }

    /// Serialized `(name, image)` list of all slots.
    pub fn images(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.slots
            .iter()
            .map(|(name, slot)| Ok((name.clone(), slot.to_bytes()?)))
            .collect()
    }

    /// Apply `(name, image)` pairs to matching slots; unknown names are
    /// tolerated (slot sets may differ across nodes).
    pub fn apply_images<F>(&mut self, images: Vec<(String, Vec<u8>)>, mut apply: F) -> Result<()>
    where
        F: FnMut(&mut Box<dyn SharedSlot>, &[u8]) -> Result<()>,
    {
        for (name, bytes) in images {
            match self.slots.get_mut(&name) {
                Some(slot) => apply(slot, &bytes)?,
                None => debug!(slot = %name, "shared slot not present on this node, skipped"),
            }
        }
        Ok(())
    }
}
