//! Per-player input history with repeat-last prediction.

use std::collections::BTreeMap;

use crate::input::NetInput;

use super::{Frame, NULL_FRAME};

/// Confirmed and predicted inputs for one player.
///
/// Confirmed inputs arrive from the local sampler (optionally shifted by
/// the frame delay) or from the wire. Any frame read before its confirmed
/// input exists is served a prediction (the most recent confirmed input),
/// and the prediction is remembered so a later confirmation can flag the
/// exact frame the simulation diverged on.
#[derive(Debug)]
pub struct InputQueue {
    confirmed: BTreeMap<Frame, NetInput>,
    predictions: BTreeMap<Frame, NetInput>,
    frame_delay: u32,
    /// Highest frame with a confirmed input.
    last_added_frame: Frame,
    last_added: NetInput,
    /// Confirmed inputs are contiguous for frames `0..=confirmed_through`.
    confirmed_through: Frame,
    disconnected: bool,
}

impl InputQueue {
    pub fn new() -> Self {
        Self {
            confirmed: BTreeMap::new(),
            predictions: BTreeMap::new(),
            frame_delay: 0,
            last_added_frame: NULL_FRAME,
            last_added: NetInput::default(),
            confirmed_through: NULL_FRAME,
            disconnected: false,
        }
    }

    pub fn set_frame_delay(&mut self, frames: u32) {
        self.frame_delay = frames;
    }

    pub fn confirmed_through(&self) -> Frame {
        self.confirmed_through
    }

    pub fn set_disconnected(&mut self) {
        self.disconnected = true;
    }

    /// Store a locally sampled input for `frame`, shifted by the frame
    /// delay. Gap frames (session start, delay changes) are filled with
    /// the same input so the confirmed range stays contiguous. Returns the
    /// frame the input actually landed on.
    pub fn add_local(&mut self, frame: Frame, input: NetInput) -> Frame {
        let target = frame + self.frame_delay as i32;
        let fill_from = if self.last_added_frame == NULL_FRAME {
            0
        } else {
            self.last_added_frame + 1
        };
        for f in fill_from..=target {
            self.insert_confirmed(f, input);
        }
        target
    }

    /// Store a remote player's confirmed input. Returns the frame number
    /// if this confirmation contradicts a prediction already used by the
    /// simulation.
    pub fn add_remote(&mut self, frame: Frame, input: NetInput) -> Option<Frame> {
        if frame < 0 || self.confirmed.contains_key(&frame) {
            return None;
        }
        let mispredicted = match self.predictions.get(&frame) {
            Some(&predicted) if predicted != input => Some(frame),
            _ => None,
        };
        self.insert_confirmed(frame, input);
        mispredicted
    }

    fn insert_confirmed(&mut self, frame: Frame, input: NetInput) {
        self.confirmed.insert(frame, input);
        if frame > self.last_added_frame {
            self.last_added_frame = frame;
            self.last_added = input;
        }
        while self.confirmed.contains_key(&(self.confirmed_through + 1)) {
            self.confirmed_through += 1;
        }
    }

    /// Input to simulate `frame` with, and whether it is confirmed.
    /// Disconnected players freeze on a neutral pad.
    pub fn input(&mut self, frame: Frame) -> (NetInput, bool) {
        if self.disconnected {
            return (NetInput::default(), true);
        }
        if let Some(&input) = self.confirmed.get(&frame) {
            return (input, true);
        }
        let predicted = self
            .confirmed
            .range(..=frame)
            .next_back()
            .map(|(_, &input)| input)
            .unwrap_or(self.last_added);
        self.predictions.insert(frame, predicted);
        (predicted, false)
    }

    /// Forget predictions from `frame` onward; the rollback replay will
    /// re-predict them against the latest confirmed data.
    pub fn reset_predictions(&mut self, frame: Frame) {
        self.predictions.retain(|&f, _| f < frame);
    }

    /// Discard history older than `frame`.
    pub fn prune(&mut self, frame: Frame) {
        self.confirmed.retain(|&f, _| f >= frame);
        self.predictions.retain(|&f, _| f >= frame);
    }

    /// Confirmed inputs in `range`, for building outgoing batches.
    pub fn confirmed_range(&self, from: Frame, to: Frame) -> Vec<(Frame, NetInput)> {
        self.confirmed
            .range(from..=to)
            .map(|(&f, &input)| (f, input))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_inputs_respect_frame_delay() {
        let mut queue = InputQueue::new();
        queue.set_frame_delay(2);

        assert_eq!(queue.add_local(0, NetInput(0x1)), 2);
        // The delay gap is filled so the confirmed range is contiguous.
        assert_eq!(queue.confirmed_through(), 2);
        assert_eq!(queue.input(0), (NetInput(0x1), true));
        assert_eq!(queue.input(2), (NetInput(0x1), true));

        assert_eq!(queue.add_local(1, NetInput(0x2)), 3);
        assert_eq!(queue.input(3), (NetInput(0x2), true));
    }

    #[test]
    fn prediction_repeats_last_confirmed() {
        let mut queue = InputQueue::new();
        queue.add_remote(0, NetInput(0xA));
        queue.add_remote(1, NetInput(0xB));

        let (input, confirmed) = queue.input(5);
        assert_eq!(input, NetInput(0xB));
        assert!(!confirmed);
    }

    #[test]
    fn misprediction_is_reported_once_confirmed() {
        let mut queue = InputQueue::new();
        queue.add_remote(0, NetInput(0));
        // Simulate frames 1 and 2 on predictions.
        assert_eq!(queue.input(1), (NetInput(0), false));
        assert_eq!(queue.input(2), (NetInput(0), false));

        // Frame 1 actually matched; frame 2 did not.
        assert_eq!(queue.add_remote(1, NetInput(0)), None);
        assert_eq!(queue.add_remote(2, NetInput(0x10)), Some(2));
    }

    #[test]
    fn future_confirmations_do_not_flag_rollbacks() {
        let mut queue = InputQueue::new();
        assert_eq!(queue.add_remote(10, NetInput(0xFF)), None);
    }

    #[test]
    fn confirmed_range_stops_at_holes() {
        let mut queue = InputQueue::new();
        queue.add_remote(0, NetInput(1));
        queue.add_remote(1, NetInput(1));
        queue.add_remote(3, NetInput(1));
        assert_eq!(queue.confirmed_through(), 1);

        queue.add_remote(2, NetInput(2));
        assert_eq!(queue.confirmed_through(), 3);
    }

    #[test]
    fn reset_predictions_allows_clean_replay() {
        let mut queue = InputQueue::new();
        queue.add_remote(0, NetInput(0));
        queue.input(1);
        queue.input(2);
        queue.reset_predictions(1);

        // The replay re-reads frame 1 with new confirmed data and no
        // stale misprediction report.
        assert_eq!(queue.add_remote(1, NetInput(0x4)), None);
        assert_eq!(queue.input(1), (NetInput(0x4), true));
    }

    #[test]
    fn disconnected_player_reads_neutral() {
        let mut queue = InputQueue::new();
        queue.add_remote(0, NetInput(0x7));
        queue.set_disconnected();
        assert_eq!(queue.input(3), (NetInput(0), true));
    }

    #[test]
    fn duplicate_remote_inputs_are_ignored() {
        let mut queue = InputQueue::new();
        queue.add_remote(0, NetInput(1));
        queue.input(0);
        assert_eq!(queue.add_remote(0, NetInput(2)), None);
        assert_eq!(queue.input(0), (NetInput(1), true));
    }
}
