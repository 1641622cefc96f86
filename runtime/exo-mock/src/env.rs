//! Environment slots and identifier lookup

use std::collections::{BTreeMap, BTreeSet};

use exo_sdk::env::NENV;
use exo_sdk::{EnvId, EnvStatus, ExoError, Mailbox, Perm, Result, Trapframe};

/// Bit position of the generation number in an [`EnvId`]
pub const ENVGENSHIFT: u32 = 12;

/// One page table entry of a simulated address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pte {
    pub frame: usize,
    pub perm: Perm,
}

pub(crate) struct Env {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    pub tf: Trapframe,
    pub mailbox: Mailbox,
    /// Virtual page number -> mapping
    pub pages: BTreeMap<u32, Pte>,
    pub open_files: BTreeSet<usize>,
}

#[derive(Default)]
struct Slot {
    last_id: u32,
    env: Option<Env>,
}

/// The environment table
pub(crate) struct Envs {
    slots: Vec<Slot>,
}

impl Envs {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            slots: (0..count.min(NENV)).map(|_| Slot::default()).collect(),
        }
    }

    /// Claim the lowest free slot for a new environment
    ///
    /// The id carries a fresh generation so ids of destroyed environments
    /// stay invalid.
    pub(crate) fn alloc(&mut self, parent: EnvId, tf: Trapframe) -> Result<EnvId> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.env.is_none())
            .ok_or(ExoError::NoFreeEnv)?;

        let mut generation = slot.last_id.wrapping_add(1 << ENVGENSHIFT) & !(NENV as u32 - 1);
        if generation as i32 <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        let id = EnvId::new(generation | index as u32);

        slot.last_id = id.raw();
        slot.env = Some(Env {
            id,
            parent,
            status: EnvStatus::NotRunnable,
            tf,
            mailbox: Mailbox::default(),
            pages: BTreeMap::new(),
            open_files: BTreeSet::new(),
        });
        Ok(id)
    }

    /// Resolve `id` on behalf of `cur`
    ///
    /// Id `0` names `cur`. With `checkperm`, the target must be `cur` itself
    /// or one of its immediate children.
    pub(crate) fn resolve(&self, cur: EnvId, id: EnvId, checkperm: bool) -> Result<EnvId> {
        if id.is_self() {
            return self.get(cur).map(|env| env.id);
        }

        let env = self.get(id)?;
        if checkperm && env.id != cur && env.parent != cur {
            return Err(ExoError::BadEnv);
        }
        Ok(env.id)
    }

    /// Live environment with exactly this id
    pub(crate) fn get(&self, id: EnvId) -> Result<&Env> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.env.as_ref())
            .filter(|env| env.id == id)
            .ok_or(ExoError::BadEnv)
    }

    pub(crate) fn get_mut(&mut self, id: EnvId) -> Result<&mut Env> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.env.as_mut())
            .filter(|env| env.id == id)
            .ok_or(ExoError::BadEnv)
    }

    /// Free the slot of `id`, returning the environment that lived there
    pub(crate) fn remove(&mut self, id: EnvId) -> Result<Env> {
        self.get(id)?;
        self.slots[id.index()].env.take().ok_or(ExoError::BadEnv)
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().filter_map(|slot| slot.env.as_ref())
    }
}
