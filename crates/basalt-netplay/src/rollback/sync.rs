//! Bounded ring of per-frame machine snapshots.

use crate::machine::MachineSnapshot;

use super::{Frame, SessionHandler};

/// Machine state at the start of `frame`, plus the desync checksum the
/// session computed while saving it.
pub struct SavedFrame {
    pub frame: Frame,
    pub snapshot: Box<MachineSnapshot>,
    pub checksum: u32,
}

/// Ring indexed by frame number. A slot's previous occupant is returned
/// to the session through `free_snapshot` before the new save moves in,
/// so every buffer is either in exactly one slot or back in the pool.
pub struct SavedFrames {
    slots: Vec<Option<SavedFrame>>,
}

impl SavedFrames {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn store(&mut self, saved: SavedFrame, handler: &mut dyn SessionHandler) {
        let index = self.index_of(saved.frame);
        if let Some(old) = self.slots[index].take() {
            handler.free_snapshot(old.snapshot, old.frame);
        }
        self.slots[index] = Some(saved);
    }

    pub fn get(&self, frame: Frame) -> Option<&SavedFrame> {
        self.slots[self.index_of(frame)]
            .as_ref()
            .filter(|saved| saved.frame == frame)
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn index_of(&self, frame: Frame) -> usize {
        debug_assert!(frame >= 0);
        frame as usize % self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::NetInput;
    use crate::rollback::SessionEvent;
    use crate::{constants::MAX_PLAYERS, error::NetplayError};

    #[derive(Default)]
    struct CountingHandler {
        freed: Vec<Frame>,
    }

    impl SessionHandler for CountingHandler {
        fn save_frame(&mut self, _frame: Frame) -> Result<(Box<MachineSnapshot>, u32), NetplayError> {
            Ok((Box::default(), 0))
        }

        fn load_frame(
            &mut self,
            _snapshot: &MachineSnapshot,
            _rollback_frames: u32,
            _frame_to_load: Frame,
        ) -> Result<(), NetplayError> {
            Ok(())
        }

        fn advance_frame(&mut self, _inputs: &[NetInput; MAX_PLAYERS], _disconnect_flags: u32) {}

        fn free_snapshot(&mut self, _snapshot: Box<MachineSnapshot>, frame: Frame) {
            self.freed.push(frame);
        }

        fn on_event(&mut self, _event: SessionEvent) {}
    }

    fn saved(frame: Frame) -> SavedFrame {
        SavedFrame {
            frame,
            snapshot: Box::default(),
            checksum: frame as u32,
        }
    }

    #[test]
    fn eviction_frees_the_displaced_frame() {
        let mut handler = CountingHandler::default();
        let mut ring = SavedFrames::with_capacity(4);

        for frame in 0..4 {
            ring.store(saved(frame), &mut handler);
        }
        assert!(handler.freed.is_empty());
        assert_eq!(ring.live_count(), 4);

        ring.store(saved(4), &mut handler);
        assert_eq!(handler.freed, vec![0]);
        assert!(ring.get(0).is_none());
        assert_eq!(ring.get(4).unwrap().checksum, 4);
    }

    #[test]
    fn lookups_require_an_exact_frame_match() {
        let mut handler = CountingHandler::default();
        let mut ring = SavedFrames::with_capacity(4);
        ring.store(saved(2), &mut handler);

        assert!(ring.get(2).is_some());
        assert!(ring.get(6).is_none());
    }

    #[test]
    fn overwriting_same_frame_frees_old_buffer() {
        let mut handler = CountingHandler::default();
        let mut ring = SavedFrames::with_capacity(4);
        ring.store(saved(1), &mut handler);
        ring.store(saved(1), &mut handler);
        assert_eq!(handler.freed, vec![1]);
        assert_eq!(ring.live_count(), 1);
    }
}
