//! Local controller sampling.

/// Digital pad buttons carried over the wire, one bit each.
pub const BUTTON_COUNT: usize = 14;

/// Bindings tracked per controller slot.
pub const MAX_BINDINGS: usize = 32;

/// Controller slots the collector accepts values for. Only slot 0 is
/// sampled for netplay in the current design.
pub const NUM_SLOTS: usize = 2;

/// A bind value at or above this is a pressed button.
const PRESS_THRESHOLD: f32 = 0.25;

/// One peer's buttons for one frame, immutable once sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetInput(pub u32);

impl NetInput {
    pub fn is_pressed(self, button: usize) -> bool {
        self.0 & (1 << button) != 0
    }
}

/// Latest analog values per slot and binding, written by the host's input
/// layer and sampled once per frame on the CPU thread.
#[derive(Debug)]
pub struct InputCollector {
    values: [[f32; MAX_BINDINGS]; NUM_SLOTS],
}

impl Default for InputCollector {
    fn default() -> Self {
        Self {
            values: [[0.0; MAX_BINDINGS]; NUM_SLOTS],
        }
    }
}

impl InputCollector {
    pub fn collect(&mut self, slot: usize, bind: usize, value: f32) {
        if slot < NUM_SLOTS && bind < MAX_BINDINGS {
            self.values[slot][bind] = value;
        }
    }

    /// Sample slot 0 into a button bitfield.
    pub fn read_local(&self) -> NetInput {
        let mut input = NetInput::default();
        for bind in 0..BUTTON_COUNT {
            if self.values[0][bind] >= PRESS_THRESHOLD {
                input.0 |= 1 << bind;
            }
        }
        input
    }
}
