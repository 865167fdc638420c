//! Per-channel sequencing state.
//!
//! Each channel keeps its own reliable and unreliable sequence numbers in both
//! directions. The 16-bit reliable sequence space is cut into
//! [`PEER_RELIABLE_WINDOWS`] windows of [`PEER_RELIABLE_WINDOW_SIZE`] numbers; a
//! sender may only keep a bounded band of windows in flight, and a receiver only
//! buffers commands from the windows just ahead of the one it is delivering.
//!
//! The incoming queues themselves live in the owning peer's command arena; a
//! channel only holds their handles.

use tether_core::{
    constants::{PEER_FREE_RELIABLE_WINDOWS, PEER_RELIABLE_WINDOWS, PEER_RELIABLE_WINDOW_SIZE},
    ordered_queue::{QueueArena, QueueId},
};

/// Sequencing state of one channel.
#[derive(Debug)]
pub struct Channel {
    /// Last reliable sequence number assigned to an outgoing command
    pub outgoing_reliable_sequence_number: u16,
    /// Last unreliable sequence number assigned since the last reliable command
    pub outgoing_unreliable_sequence_number: u16,
    /// Bitmap of reliable windows with commands in flight
    pub used_reliable_windows: u16,
    /// Commands in flight per reliable window
    pub reliable_windows: [u16; PEER_RELIABLE_WINDOWS as usize],
    /// Last reliable sequence number delivered in order
    pub incoming_reliable_sequence_number: u16,
    /// Last unreliable sequence number delivered
    pub incoming_unreliable_sequence_number: u16,
    pub(crate) incoming_reliable_commands: QueueId,
    pub(crate) incoming_unreliable_commands: QueueId,
}

impl Channel {
    /// Creates a channel whose incoming queues are allocated in `arena`.
    pub(crate) fn new<T>(arena: &mut QueueArena<T>) -> Self {
        Channel {
            outgoing_reliable_sequence_number: 0,
            outgoing_unreliable_sequence_number: 0,
            used_reliable_windows: 0,
            reliable_windows: [0; PEER_RELIABLE_WINDOWS as usize],
            incoming_reliable_sequence_number: 0,
            incoming_unreliable_sequence_number: 0,
            incoming_reliable_commands: arena.create_queue(),
            incoming_unreliable_commands: arena.create_queue(),
        }
    }

    /// Window of `sequence_number` and window of the last delivered sequence number.
    ///
    /// A sequence number below the delivered one is taken to have wrapped around, so its
    /// window is shifted up by a full cycle of windows.
    pub fn windows(&self, sequence_number: u16) -> (u16, u16) {
        let mut reliable_window = sequence_number / PEER_RELIABLE_WINDOW_SIZE;
        let current_window = self.incoming_reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE;
        if sequence_number < self.incoming_reliable_sequence_number {
            reliable_window += PEER_RELIABLE_WINDOWS;
        }
        (reliable_window, current_window)
    }

    /// True when an incoming command with this sequence number falls inside the receive band.
    pub fn accepts_incoming(&self, sequence_number: u16) -> bool {
        let (reliable_window, current_window) = self.windows(sequence_number);
        reliable_window >= current_window
            && reliable_window < current_window + PEER_FREE_RELIABLE_WINDOWS - 1
    }

    /// True when an acknowledgement for this sequence number must be withheld.
    ///
    /// Withholding acknowledgements for the last two free windows stalls a sender that has
    /// run too far ahead of what this side has delivered.
    pub fn withholds_acknowledgement(&self, sequence_number: u16) -> bool {
        let (reliable_window, current_window) = self.windows(sequence_number);
        reliable_window >= current_window + PEER_FREE_RELIABLE_WINDOWS - 1
            && reliable_window <= current_window + PEER_FREE_RELIABLE_WINDOWS
    }

    /// True when sending the first command of `sequence_number`'s window would overrun the
    /// windows still in flight.
    pub fn window_wraps(&self, sequence_number: u16) -> bool {
        if sequence_number % PEER_RELIABLE_WINDOW_SIZE != 0 {
            return false;
        }
        let window = (sequence_number / PEER_RELIABLE_WINDOW_SIZE) as u32;
        let windows = PEER_RELIABLE_WINDOWS as u32;
        let previous = ((window + windows - 1) % windows) as usize;
        if self.reliable_windows[previous] >= PEER_RELIABLE_WINDOW_SIZE {
            return true;
        }
        let band = (1u32 << (PEER_FREE_RELIABLE_WINDOWS as u32 + 2)) - 1;
        let mask = (band << window) | (band >> (windows - window));
        self.used_reliable_windows as u32 & mask != 0
    }

    /// Records a reliable command with `sequence_number` going out for the first time.
    pub fn occupy_window(&mut self, sequence_number: u16) {
        let window = sequence_number / PEER_RELIABLE_WINDOW_SIZE;
        self.used_reliable_windows |= 1 << window;
        self.reliable_windows[window as usize] += 1;
    }

    /// Records the acknowledgement of a reliable command with `sequence_number`.
    pub fn release_window(&mut self, sequence_number: u16) {
        let window = sequence_number / PEER_RELIABLE_WINDOW_SIZE;
        let count = &mut self.reliable_windows[window as usize];
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.used_reliable_windows &= !(1 << window);
            }
        }
    }
}
