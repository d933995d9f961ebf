//! Per-adapter session slots with creation guard and generations

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::SessionError;

enum Slot<H> {
    /// A create is in flight
    Creating { generation: u64 },
    Running { generation: u64, handle: Arc<H> },
}

impl<H> Slot<H> {
    fn generation(&self) -> u64 {
        match self {
            Slot::Creating { generation } | Slot::Running { generation, .. } => *generation,
        }
    }
}

struct TableInner<H> {
    slots: HashMap<String, Slot<H>>,
    /// Bumped on every reserve and removal, kept after the slot is gone
    generations: HashMap<String, u64>,
}

impl<H> TableInner<H> {
    fn bump(&mut self, session_id: &str) -> u64 {
        let generation = self.generations.entry(session_id.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }
}

/// Result of [`SessionTable::reserve`]
pub(crate) struct Reservation<H> {
    pub generation: u64,
    /// Process that was running under the same id; the caller must stop it
    pub previous: Option<Arc<H>>,
}

/// Session id to handle map shared by an adapter and its PTY threads
pub(crate) struct SessionTable<H> {
    inner: Mutex<TableInner<H>>,
}

impl<H> SessionTable<H> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                slots: HashMap::new(),
                generations: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner<H>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the id for a new process.
    ///
    /// Fails while another create for the same id is in flight. A running
    /// handle is taken out and returned for the caller to stop.
    pub fn reserve(&self, session_id: &str) -> Result<Reservation<H>, SessionError> {
        let mut inner = self.lock();
        let previous = match inner.slots.remove(session_id) {
            Some(Slot::Creating { generation }) => {
                inner
                    .slots
                    .insert(session_id.to_string(), Slot::Creating { generation });
                return Err(SessionError::ConcurrentCreation(session_id.to_string()));
            }
            Some(Slot::Running { handle, .. }) => Some(handle),
            None => None,
        };
        let generation = inner.bump(session_id);
        inner
            .slots
            .insert(session_id.to_string(), Slot::Creating { generation });
        Ok(Reservation {
            generation,
            previous,
        })
    }

    /// Turn a reservation into a running session.
    ///
    /// Gives the handle back if the reservation was superseded meanwhile.
    pub fn install(&self, session_id: &str, generation: u64, handle: Arc<H>) -> Result<(), Arc<H>> {
        let mut inner = self.lock();
        match inner.slots.get(session_id) {
            Some(Slot::Creating { generation: g }) if *g == generation => {
                inner
                    .slots
                    .insert(session_id.to_string(), Slot::Running { generation, handle });
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Release a reservation after a failed create
    pub fn abandon(&self, session_id: &str, generation: u64) {
        let mut inner = self.lock();
        if matches!(
            inner.slots.get(session_id),
            Some(Slot::Creating { generation: g }) if *g == generation
        ) {
            inner.slots.remove(session_id);
        }
    }

    /// Remove a running session, returning its handle
    pub fn remove(&self, session_id: &str) -> Option<Arc<H>> {
        let mut inner = self.lock();
        match inner.slots.get(session_id) {
            Some(Slot::Running { .. }) => {
                inner.bump(session_id);
                match inner.slots.remove(session_id) {
                    Some(Slot::Running { handle, .. }) => Some(handle),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Called when the process of `generation` has exited.
    ///
    /// Removes the slot if it still belongs to that process. Returns false
    /// when a newer process owns the id, i.e. the exit is stale.
    pub fn finish(&self, session_id: &str, generation: u64) -> bool {
        let mut inner = self.lock();
        match inner.slots.get(session_id).map(Slot::generation) {
            Some(g) if g == generation => {
                inner.slots.remove(session_id);
                inner.bump(session_id);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<H>> {
        match self.lock().slots.get(session_id) {
            Some(Slot::Running { handle, .. }) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Handle of the process started under `generation`, if still current
    pub fn get_current(&self, session_id: &str, generation: u64) -> Option<Arc<H>> {
        match self.lock().slots.get(session_id) {
            Some(Slot::Running {
                generation: g,
                handle,
            }) if *g == generation => Some(handle.clone()),
            _ => None,
        }
    }

    /// True while the slot still belongs to `generation` (creating or running)
    pub fn is_current(&self, session_id: &str, generation: u64) -> bool {
        self.lock()
            .slots
            .get(session_id)
            .is_some_and(|slot| slot.generation() == generation)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        matches!(self.lock().slots.get(session_id), Some(Slot::Running { .. }))
    }

    pub fn generation(&self, session_id: &str) -> u64 {
        self.lock()
            .generations
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Take every running handle out, leaving the table empty
    pub fn drain(&self) -> Vec<(String, Arc<H>)> {
        let mut inner = self.lock();
        let ids: Vec<String> = inner.slots.keys().cloned().collect();
        let mut drained = Vec::new();
        for id in ids {
            inner.bump(&id);
            if let Some(Slot::Running { handle, .. }) = inner.slots.remove(&id) {
                drained.push((id, handle));
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_reserve_while_creating_fails() {
        let table: SessionTable<&'static str> = SessionTable::new();
        let first = table.reserve("s1").unwrap();
        assert!(matches!(
            table.reserve("s1"),
            Err(SessionError::ConcurrentCreation(id)) if id == "s1"
        ));

        table.install("s1", first.generation, Arc::new("proc")).unwrap();
        assert!(table.contains("s1"));
        assert_eq!(table.ids(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_abandon_releases_reservation() {
        let table: SessionTable<u32> = SessionTable::new();
        let r = table.reserve("s1").unwrap();
        table.abandon("s1", r.generation);
        assert!(!table.contains("s1"));
        assert!(table.reserve("s1").is_ok());
    }

    #[test]
    fn test_reserve_over_running_returns_previous() {
        let table: SessionTable<u32> = SessionTable::new();
        let r = table.reserve("s1").unwrap();
        table.install("s1", r.generation, Arc::new(1)).unwrap();

        let r2 = table.reserve("s1").unwrap();
        assert_eq!(r2.previous.as_deref(), Some(&1));
        assert!(r2.generation > r.generation);
        assert!(!table.contains("s1"));
    }

    #[test]
    fn test_install_after_remove_is_rejected() {
        let table: SessionTable<u32> = SessionTable::new();
        let r = table.reserve("s1").unwrap();
        let r2 = table.reserve("s1");
        assert!(r2.is_err());
        // someone removed and re-reserved in between
        table.abandon("s1", r.generation);
        let newer = table.reserve("s1").unwrap();
        assert_eq!(table.install("s1", r.generation, Arc::new(7)), Err(Arc::new(7)));
        assert!(table.install("s1", newer.generation, Arc::new(8)).is_ok());
    }

    #[test]
    fn test_stale_exit_is_ignored() {
        let table: SessionTable<u32> = SessionTable::new();
        let old = table.reserve("s1").unwrap();
        table.install("s1", old.generation, Arc::new(1)).unwrap();
        let new = table.reserve("s1").unwrap();
        table.install("s1", new.generation, Arc::new(2)).unwrap();

        assert!(!table.finish("s1", old.generation));
        assert_eq!(table.get("s1").as_deref(), Some(&2));

        assert!(table.finish("s1", new.generation));
        assert!(!table.contains("s1"));
        // exit after an explicit destroy still counts
        assert!(table.finish("s1", new.generation));
    }

    #[test]
    fn test_generation_changes_on_remove() {
        let table: SessionTable<u32> = SessionTable::new();
        let r = table.reserve("s1").unwrap();
        table.install("s1", r.generation, Arc::new(1)).unwrap();
        let before = table.generation("s1");
        assert!(table.remove("s1").is_some());
        assert!(table.generation("s1") > before);
        assert!(table.remove("s1").is_none());
        assert!(table.get_current("s1", r.generation).is_none());
    }

    #[test]
    fn test_drain_empties_table() {
        let table: SessionTable<u32> = SessionTable::new();
        for id in ["a", "b"] {
            let r = table.reserve(id).unwrap();
            table.install(id, r.generation, Arc::new(0)).unwrap();
        }
        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.ids().is_empty());
    }
}
