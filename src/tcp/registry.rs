use super::{PcbId, State};
use std::collections::VecDeque;
use thiserror::Error as ThisError;

/// The list a connection block is registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PcbList {
    Listen,
    Active,
    TimeWait,
}

/// The three lists partitioning every live connection block by state.
///
/// The registry does not look at states when registering; callers pick the
/// list that matches. [`Registry::check`] verifies that they did.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    listen: VecDeque<PcbId>,
    active: VecDeque<PcbId>,
    time_wait: VecDeque<PcbId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts `id` at the head of `list`.
    pub fn register(&mut self, list: PcbList, id: PcbId) {
        self.list_mut(list).push_front(id);
    }

    /// Takes `id` off whichever list holds it. Removing a block that is on no
    /// list does nothing.
    pub fn remove(&mut self, id: PcbId) -> Option<PcbList> {
        for list in [PcbList::Active, PcbList::TimeWait, PcbList::Listen] {
            let members = self.list_mut(list);
            if let Some(i) = members.iter().position(|&member| member == id) {
                members.remove(i);
                return Some(list);
            }
        }
        None
    }

    /// The list `id` is on, if any.
    pub fn which(&self, id: PcbId) -> Option<PcbList> {
        [PcbList::Active, PcbList::TimeWait, PcbList::Listen]
            .into_iter()
            .find(|&list| self.list(list).contains(&id))
    }

    /// The members of `list`, most recently registered first.
    pub fn iter(&self, list: PcbList) -> impl Iterator<Item = PcbId> + '_ {
        self.list(list).iter().copied()
    }

    /// A copy of the members of `list`, for walking it while the stack
    /// changes underneath.
    pub fn snapshot(&self, list: PcbList) -> Vec<PcbId> {
        self.iter(list).collect()
    }

    pub fn len(&self, list: PcbList) -> usize {
        self.list(list).len()
    }

    /// Verifies that no block is on two lists or twice on one, that every
    /// registered block exists and that the listen and time-wait lists only
    /// hold blocks in the matching state. `state` reports the current state
    /// of a block, or `None` for one that does not exist.
    pub fn check(&self, state: impl Fn(PcbId) -> Option<State>) -> Result<(), RegistryError> {
        let mut seen = Vec::new();
        for list in [PcbList::Listen, PcbList::Active, PcbList::TimeWait] {
            for id in self.iter(list) {
                if seen.contains(&id) {
                    return Err(RegistryError::Duplicate(id));
                }
                seen.push(id);
                let state = state(id).ok_or(RegistryError::Dangling(id))?;
                let fits = match list {
                    PcbList::Listen => state == State::Listen,
                    PcbList::TimeWait => state == State::TimeWait,
                    PcbList::Active => !matches!(
                        state,
                        State::Closed | State::Listen | State::TimeWait
                    ),
                };
                if !fits {
                    return Err(RegistryError::WrongList { id, list, state });
                }
            }
        }
        Ok(())
    }

    fn list(&self, list: PcbList) -> &VecDeque<PcbId> {
        match list {
            PcbList::Listen => &self.listen,
            PcbList::Active => &self.active,
            PcbList::TimeWait => &self.time_wait,
        }
    }

    fn list_mut(&mut self, list: PcbList) -> &mut VecDeque<PcbId> {
        match list {
            PcbList::Listen => &mut self.listen,
            PcbList::Active => &mut self.active,
            PcbList::TimeWait => &mut self.time_wait,
        }
    }
}

/// A broken registry invariant.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} is registered more than once")]
    Duplicate(PcbId),
    #[error("{0} is registered but does not exist")]
    Dangling(PcbId),
    #[error("{0} is live but on no list")]
    Unlisted(PcbId),
    #[error("{id} is on the {list:?} list in state {state}")]
    WrongList {
        id: PcbId,
        list: PcbList,
        state: State,
    },
}
