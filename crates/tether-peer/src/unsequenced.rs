//! Duplicate suppression for unsequenced commands.
//!
//! Unsequenced commands carry a 16-bit group number instead of a sequence number. The
//! receiver remembers which groups of the current 1024-group window it has seen in a
//! bitmap. A group from a later window (up to [`PEER_FREE_UNSEQUENCED_WINDOWS`] windows
//! ahead) moves the window base there and forgets the bitmap; anything further ahead,
//! or already marked, is dropped.
//!
//! Group numbers wrap at 65536: a group below the base is treated as having wrapped.

use tether_core::constants::{PEER_FREE_UNSEQUENCED_WINDOWS, PEER_UNSEQUENCED_WINDOW_SIZE};

const WINDOW_WORDS: usize = (PEER_UNSEQUENCED_WINDOW_SIZE / 32) as usize;

/// Unsequenced group state of one peer, in both directions.
#[derive(Debug, Clone)]
pub struct UnsequencedWindow {
    incoming_group: u16,
    window: [u32; WINDOW_WORDS],
    outgoing_group: u16,
}

impl Default for UnsequencedWindow {
    fn default() -> Self {
        UnsequencedWindow { incoming_group: 0, window: [0; WINDOW_WORDS], outgoing_group: 0 }
    }
}

impl UnsequencedWindow {
    /// Advances and returns the group number for the next outgoing unsequenced command.
    pub fn next_outgoing_group(&mut self) -> u16 {
        self.outgoing_group = self.outgoing_group.wrapping_add(1);
        self.outgoing_group
    }

    /// Base of the incoming window.
    pub fn incoming_group(&self) -> u16 {
        self.incoming_group
    }

    /// Last group number handed out for sending.
    pub fn outgoing_group(&self) -> u16 {
        self.outgoing_group
    }

    /// Checks an incoming group, sliding the window when it belongs to a later window.
    ///
    /// Returns the bitmap index to [`mark`](Self::mark) once the command has been queued,
    /// or `None` when the group is a duplicate or too far ahead.
    pub fn admit(&mut self, group: u16) -> Option<usize> {
        let index = (group as u32 % PEER_UNSEQUENCED_WINDOW_SIZE) as usize;
        let base = self.incoming_group as u32;
        let mut unwrapped = group as u32;
        if unwrapped < base {
            unwrapped += 0x10000;
        }
        if unwrapped >= base + PEER_FREE_UNSEQUENCED_WINDOWS * PEER_UNSEQUENCED_WINDOW_SIZE {
            return None;
        }

        let window_base = group.wrapping_sub(index as u16);
        if window_base != self.incoming_group {
            self.incoming_group = window_base;
            self.window = [0; WINDOW_WORDS];
        } else if self.window[index / 32] & (1 << (index % 32)) != 0 {
            return None;
        }
        Some(index)
    }

    /// Records the group at `index` as received.
    pub fn mark(&mut self, index: usize) {
        self.window[index / 32] |= 1 << (index % 32);
    }

    /// Forgets all state.
    pub fn reset(&mut self) {
        *self = UnsequencedWindow::default();
    }
}
