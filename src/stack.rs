//! Window registry: id lookup plus the totally ordered stack.
//!
//! Windows are stored under stable internal keys that are never reused, so a
//! DESTROYING window can linger in the stack after its X id has been removed
//! from the index (and handed to a newcomer). The order vector runs top of
//! stack first, bottom last.
//!
//! Every stack mutation invalidates the ignore-region cache of the moved
//! window and of its old and new lower neighbours; the preprocess pass
//! rebuilds lazily from the topmost invalid entry downward.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::win::{WinState, Window, Xid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WinKey(u64);

#[derive(Debug, Default)]
pub struct WindowStack {
    wins: HashMap<WinKey, Window>,
    /// Stacking order, `order[0]` is the top of the stack.
    order: Vec<WinKey>,
    /// X id to key, DESTROYING windows excluded.
    index: HashMap<Xid, WinKey>,
    next_key: u64,
}

impl WindowStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert a new window immediately above `prev` in stack order;
    /// `prev == 0` puts it at the bottom. Duplicate ids are a no-op.
    pub fn insert(&mut self, win: Window, prev: Xid) -> Option<WinKey> {
        let id = win.id;
        if let Some(&existing) = self.index.get(&id) {
            warn!(
                "Window {:#010x} inserted twice (recorded name: {:?})",
                id,
                self.wins.get(&existing).map(|w| w.name.as_str())
            );
            return None;
        }

        let key = WinKey(self.next_key);
        self.next_key += 1;

        let pos = if prev == 0 {
            self.order.len()
        } else if let Some(&pk) = self.index.get(&prev) {
            self.position(pk).expect("indexed window must be stacked")
        } else {
            warn!(
                "Window {:#010x} inserted above unknown window {:#010x}, placing at bottom",
                id, prev
            );
            self.order.len()
        };

        debug!("Adding window {:#010x}, above {:#010x}", id, prev);
        self.order.insert(pos, key);
        self.index.insert(id, key);
        self.wins.insert(key, win);
        self.invalidate_around(pos);
        Some(key)
    }

    /// Remove the window entirely: stack, index and storage.
    pub fn remove(&mut self, key: WinKey) -> Option<Window> {
        let pos = self.position(key)?;
        self.order.remove(pos);
        // The window that was right below loses its upper neighbour.
        if pos < self.order.len() {
            self.invalidate(self.order[pos]);
        }
        let win = self.wins.remove(&key)?;
        if self.index.get(&win.id) == Some(&key) {
            self.index.remove(&win.id);
        }
        Some(win)
    }

    /// Drop the id-index entry while keeping the window in the stack. Done
    /// when a window enters DESTROYING so a newcomer can reuse the id.
    pub fn detach_index(&mut self, key: WinKey) {
        if let Some(win) = self.wins.get(&key) {
            if self.index.get(&win.id) == Some(&key) {
                self.index.remove(&win.id);
            }
        }
    }

    pub fn find(&self, id: Xid) -> Option<WinKey> {
        self.index.get(&id).copied()
    }

    /// Find the toplevel whose client window is `client`.
    pub fn find_toplevel(&self, client: Xid) -> Option<WinKey> {
        self.order
            .iter()
            .copied()
            .find(|k| self.wins.get(k).is_some_and(|w| {
                w.client_win == client && w.state != WinState::Destroying
            }))
    }

    /// Move `key` so it sits immediately above `new_above`; zero means the
    /// bottom of the stack. Restacking onto the current position is a no-op,
    /// and a `new_above` that is not in the index (for instance a DESTROYING
    /// window) is reported and ignored.
    pub fn restack(&mut self, key: WinKey, new_above: Xid) {
        let Some(pos) = self.position(key) else {
            return;
        };
        let old_above = self
            .order
            .get(pos + 1)
            .and_then(|k| self.wins.get(k))
            .map_or(0, |w| w.id);
        if old_above == new_above {
            return;
        }

        let target = if new_above == 0 {
            None
        } else {
            match self.index.get(&new_above) {
                Some(&k) => Some(k),
                None => {
                    warn!(
                        "Failed to find window {:#010x} to restack {:#010x} above",
                        new_above,
                        self.wins.get(&key).map_or(0, |w| w.id)
                    );
                    return;
                }
            }
        };

        self.order.remove(pos);
        if pos < self.order.len() {
            self.invalidate(self.order[pos]);
        }
        let new_pos = match target {
            Some(tk) => self.position(tk).expect("indexed window must be stacked"),
            None => self.order.len(),
        };
        self.order.insert(new_pos, key);
        self.invalidate_around(new_pos);
    }

    pub fn get(&self, key: WinKey) -> Option<&Window> {
        self.wins.get(&key)
    }

    pub fn get_mut(&mut self, key: WinKey) -> Option<&mut Window> {
        self.wins.get_mut(&key)
    }

    pub fn top_to_bottom(&self) -> impl Iterator<Item = WinKey> + '_ {
        self.order.iter().copied()
    }

    pub fn bottom_to_top(&self) -> impl Iterator<Item = WinKey> + '_ {
        self.order.iter().rev().copied()
    }

    /// Snapshot of the order for traversals that mutate windows.
    pub fn order_snapshot(&self) -> Vec<WinKey> {
        self.order.clone()
    }

    pub fn position(&self, key: WinKey) -> Option<usize> {
        self.order.iter().position(|&k| k == key)
    }

    /// The id of the topmost window, if any.
    pub fn top_id(&self) -> Xid {
        self.order
            .first()
            .and_then(|k| self.wins.get(k))
            .map_or(0, |w| w.id)
    }

    fn invalidate(&mut self, key: WinKey) {
        if let Some(w) = self.wins.get_mut(&key) {
            w.reg_ignore = None;
            w.reg_ignore_valid = false;
        }
    }

    /// Invalidate the window at `pos` and its lower neighbour.
    fn invalidate_around(&mut self, pos: usize) {
        if let Some(&k) = self.order.get(pos) {
            self.invalidate(k);
        }
        if let Some(&k) = self.order.get(pos + 1) {
            self.invalidate(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::win::Geometry;

    fn win(id: Xid) -> Window {
        Window::new(id, Geometry::new(0, 0, 10, 10, 0))
    }

    fn order_ids(s: &WindowStack) -> Vec<Xid> {
        s.top_to_bottom()
            .map(|k| s.get(k).unwrap().id)
            .collect()
    }

    #[test]
    fn insert_above_and_at_bottom() {
        let mut s = WindowStack::new();
        s.insert(win(1), 0).unwrap();
        s.insert(win(2), 0).unwrap(); // below 1
        let _ = s.insert(win(3), 2).unwrap(); // directly above 2
        assert_eq!(order_ids(&s), vec![1, 3, 2]);
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let mut s = WindowStack::new();
        s.insert(win(7), 0).unwrap();
        assert!(s.insert(win(7), 0).is_none());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn restack_is_idempotent() {
        let mut s = WindowStack::new();
        s.insert(win(1), 0);
        s.insert(win(2), 0);
        s.insert(win(3), 0);
        let k1 = s.find(1).unwrap();
        s.restack(k1, 3);
        let after_first = order_ids(&s);
        s.restack(k1, 3);
        assert_eq!(order_ids(&s), after_first);
    }

    #[test]
    fn restack_to_bottom_and_top() {
        let mut s = WindowStack::new();
        s.insert(win(1), 0);
        s.insert(win(2), 0);
        s.insert(win(3), 0);
        assert_eq!(order_ids(&s), vec![1, 2, 3]);
        let k3 = s.find(3).unwrap();
        s.restack(k3, 1); // 3 goes directly above 1
        assert_eq!(order_ids(&s), vec![3, 1, 2]);
        let k1 = s.find(1).unwrap();
        s.restack(k1, 0); // 1 to the bottom
        assert_eq!(order_ids(&s), vec![3, 2, 1]);
    }

    #[test]
    fn restack_above_missing_window_is_reported_noop() {
        let mut s = WindowStack::new();
        s.insert(win(1), 0);
        s.insert(win(2), 0);
        let k2 = s.find(2).unwrap();
        s.restack(k2, 999);
        assert_eq!(order_ids(&s), vec![1, 2]);
    }

    #[test]
    fn stack_mutations_invalidate_neighbours() {
        let mut s = WindowStack::new();
        s.insert(win(1), 0);
        s.insert(win(2), 0);
        s.insert(win(3), 0);
        // Pretend a preprocess validated everything.
        for k in s.order_snapshot() {
            s.get_mut(k).unwrap().reg_ignore_valid = true;
        }
        let k3 = s.find(3).unwrap();
        s.restack(k3, 1);
        // Moved window and its new lower neighbour are dirty.
        assert!(!s.get(k3).unwrap().reg_ignore_valid);
        let k1 = s.find(1).unwrap();
        assert!(!s.get(k1).unwrap().reg_ignore_valid);
    }

    #[test]
    fn destroying_window_leaves_index_but_not_stack() {
        let mut s = WindowStack::new();
        let key = s.insert(win(0x10), 0).unwrap();
        s.get_mut(key).unwrap().state = WinState::Destroying;
        s.detach_index(key);
        assert_eq!(s.find(0x10), None);
        assert_eq!(s.len(), 1);

        // A newcomer may take over the id while the ghost fades out.
        let fresh = s.insert(win(0x10), 0).unwrap();
        assert_ne!(fresh, key);
        assert_eq!(s.find(0x10), Some(fresh));
        assert_eq!(s.len(), 2);

        // Full removal of the ghost does not disturb the newcomer's index.
        s.remove(key);
        assert_eq!(s.find(0x10), Some(fresh));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn find_toplevel_matches_client_window() {
        let mut s = WindowStack::new();
        let k = s.insert(win(0x20), 0).unwrap();
        s.get_mut(k).unwrap().client_win = 0x21;
        assert_eq!(s.find_toplevel(0x21), Some(k));
        assert_eq!(s.find_toplevel(0x22), None);
    }
}
