pub mod attribute;
pub mod keystate;
pub mod log;
pub mod metric;
pub mod span;

use std::collections::BTreeMap;

use crate::error::Result;
use keystate::KeyState;

/// Attribute-key map under one entity, ordered for deterministic output.
pub type KeyMap = BTreeMap<String, KeyState>;

/// service.name → sample count contributed by that service.
pub type ServicesMap = BTreeMap<String, u64>;

pub(crate) fn merge_key_maps(dst: &mut KeyMap, src: &KeyMap) -> Result<()> {
    for (key, state) in src {
        match dst.get_mut(key) {
            Some(existing) => existing.merge(state)?,
            None => {
                dst.insert(key.clone(), state.clone());
            }
        }
    }
    Ok(())
}

pub(crate) fn merge_services(dst: &mut ServicesMap, src: &ServicesMap) {
    for (service, count) in src {
        *dst.entry(service.clone()).or_insert(0) += count;
    }
}

pub(crate) fn refresh_percentages(map: &mut KeyMap, parent_sample_count: u64) {
    for state in map.values_mut() {
        state.set_parent_total(parent_sample_count);
    }
}
