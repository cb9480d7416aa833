use arcstr::ArcStr;

use crate::{
    line::{EraFuncFlags, EraLineId},
    types::*,
};

/// Priority groups of an event, in dispatch order.
pub const EVENT_GROUP_COUNT: usize = 3;
pub const EVENT_GROUP_PRI: usize = 0;
pub const EVENT_GROUP_NORMAL: usize = 1;
pub const EVENT_GROUP_LATER: usize = 2;

/// All contributions to one event function.
#[derive(Debug, Clone, Default)]
pub struct EraEventGroups {
    groups: [Vec<EraLineId>; EVENT_GROUP_COUNT],
    /// The first `#ONLY` contribution, which suppresses every other one.
    only: Option<EraLineId>,
}

impl EraEventGroups {
    pub fn group(&self, index: usize) -> &[EraLineId] {
        self.groups.get(index).map(|x| x.as_slice()).unwrap_or(&[])
    }

    pub fn only(&self) -> Option<EraLineId> {
        self.only
    }

    pub fn is_empty(&self) -> bool {
        self.only.is_none() && self.groups.iter().all(|x| x.is_empty())
    }

    /// Every contribution, each listed once.
    pub fn all(&self) -> impl Iterator<Item = EraLineId> + '_ {
        let mut seen = FxHashSet::default();
        self.only
            .into_iter()
            .chain(self.groups.iter().flatten().copied())
            .filter(move |x| seen.insert(*x))
    }

    fn add(&mut self, id: EraLineId, flags: EraFuncFlags) {
        if flags.contains(EraFuncFlags::IS_ONLY) {
            self.only.get_or_insert(id);
            self.groups[EVENT_GROUP_NORMAL].push(id);
            return;
        }
        let is_pri = flags.contains(EraFuncFlags::IS_PRI);
        let is_later = flags.contains(EraFuncFlags::IS_LATER);
        if is_pri {
            self.groups[EVENT_GROUP_PRI].push(id);
        }
        if is_later {
            self.groups[EVENT_GROUP_LATER].push(id);
        }
        if !is_pri && !is_later {
            self.groups[EVENT_GROUP_NORMAL].push(id);
        }
    }
}

/// Name resolution for functions and goto labels. Rebuilt on every load.
#[derive(Debug, Default)]
pub struct EraLabelDirectory {
    funcs: FxIndexMap<ArcStr, EraLineId>,
    events: FxIndexMap<ArcStr, EraEventGroups>,
    gotos: FxHashMap<(EraLineId, ArcStr), EraLineId>,
}

impl EraLabelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function label. Ordinary names must be unique, and a name
    /// cannot be both an event and an ordinary function.
    pub fn add_function(
        &mut self,
        name: &ArcStr,
        id: EraLineId,
        flags: EraFuncFlags,
    ) -> Result<(), String> {
        if flags.contains(EraFuncFlags::IS_EVENT) {
            if self.funcs.contains_key(name) {
                return Err(format!("`{name}` is already an ordinary function"));
            }
            self.events.entry(name.clone()).or_default().add(id, flags);
            return Ok(());
        }
        if self.events.contains_key(name) {
            return Err(format!("`{name}` is already an event function"));
        }
        if self.funcs.contains_key(name) {
            return Err(format!("function `{name}` is already defined"));
        }
        self.funcs.insert(name.clone(), id);
        Ok(())
    }

    pub fn add_goto(&mut self, func: EraLineId, name: &ArcStr, id: EraLineId) -> Result<(), String> {
        use hashbrown::hash_map::Entry;
        match self.gotos.entry((func, name.clone())) {
            Entry::Occupied(_) => Err(format!("label `${name}` is already defined in this function")),
            Entry::Vacant(e) => {
                e.insert(id);
                Ok(())
            }
        }
    }

    pub fn get_func(&self, name: &str) -> Option<EraLineId> {
        self.funcs.get(name).copied()
    }

    pub fn get_event(&self, name: &str) -> Option<&EraEventGroups> {
        self.events.get(name)
    }

    pub fn is_event(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    pub fn get_goto(&self, func: EraLineId, name: &str) -> Option<EraLineId> {
        self.gotos.get(&(func, ArcStr::from(name))).copied()
    }

    pub fn funcs(&self) -> impl Iterator<Item = (&ArcStr, EraLineId)> {
        self.funcs.iter().map(|(k, v)| (k, *v))
    }

    pub fn func_count(&self) -> usize {
        self.funcs.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}
