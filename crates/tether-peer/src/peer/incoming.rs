use tether_core::{
    error::{ErrorKind, Result},
    ordered_queue::{NodeId, QueueId},
};
use tether_protocol::{Command, CommandKind, Packet, PacketFlags, PacketRef, ProtocolCommand};

use crate::{host_context::HostContext, peer_state::PeerState};

use super::{IncomingCommand, Peer};

/// What happened to a received command handed to the incoming queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// The command was queued; the handle stays valid until it is delivered or dropped.
    Queued(NodeId),
    /// The command was a duplicate, stale, or arrived while the peer was winding down.
    Discarded,
}

/// Payload of a command entering the incoming queues.
pub(crate) enum IncomingData<'a> {
    /// A complete payload.
    Complete(&'a [u8]),
    /// A reassembly buffer of the given total length, filled in fragment by fragment.
    Reassembly(usize),
}

impl Peer {
    /// Inserts a received data command into its channel queue and delivers whatever became
    /// deliverable.
    ///
    /// Reliable commands are kept sorted by reliable sequence number; unreliable ones by
    /// reliable then unreliable sequence number. Unsequenced commands jump the queue.
    pub(crate) fn queue_incoming_command(
        &mut self,
        context: &mut HostContext,
        command: &Command,
        data: IncomingData<'_>,
        flags: PacketFlags,
        fragment_count: u32,
    ) -> Result<QueueOutcome> {
        let channel_index = command.header.channel_id as usize;
        let kind = command.kind();

        let insert_after = match self.find_incoming_position(channel_index, command) {
            Some(position) if self.state != PeerState::DisconnectLater => position,
            _ => {
                if fragment_count > 0 {
                    return Err(ErrorKind::ProtocolViolation("fragment start discarded"));
                }
                return Ok(QueueOutcome::Discarded);
            }
        };

        if self.total_waiting_data >= context.maximum_waiting_data {
            tracing::warn!(peer = self.index, waiting = self.total_waiting_data, "waiting data limit reached");
            return Err(ErrorKind::WaitingDataExceeded);
        }

        let packet = match data {
            IncomingData::Complete(bytes) => Packet::new(bytes, flags),
            IncomingData::Reassembly(length) => Packet::zeroed(length, flags),
        };
        let unreliable_sequence_number = match command.body {
            ProtocolCommand::SendUnreliable { unreliable_sequence_number, .. } => unreliable_sequence_number,
            ProtocolCommand::SendUnreliableFragment(fragment) => fragment.start_sequence_number,
            _ => 0,
        };
        self.total_waiting_data += packet.len();
        let incoming = IncomingCommand {
            reliable_sequence_number: command.header.reliable_sequence_number,
            unreliable_sequence_number,
            command: *command,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments: vec![0; fragment_count.div_ceil(32) as usize],
            packet: PacketRef::new(&packet),
        };
        drop(packet);

        let before = self.incoming.next(insert_after);
        let node = self.incoming.insert(before, incoming);

        match kind {
            CommandKind::SendFragment | CommandKind::SendReliable => {
                self.dispatch_incoming_reliable_commands(context, channel_index, Some(node));
            }
            _ => self.dispatch_incoming_unreliable_commands(context, channel_index, Some(node)),
        }
        Ok(QueueOutcome::Queued(node))
    }

    /// Node after which `command` belongs, or `None` when it must be discarded.
    fn find_incoming_position(&self, channel_index: usize, command: &Command) -> Option<NodeId> {
        let channel = self.channels.get(channel_index)?;
        let kind = command.kind();
        let reliable_sequence_number = command.header.reliable_sequence_number;

        if kind != CommandKind::SendUnsequenced && !channel.accepts_incoming(reliable_sequence_number) {
            return None;
        }

        let incoming_reliable = channel.incoming_reliable_sequence_number;
        match kind {
            CommandKind::SendFragment | CommandKind::SendReliable => {
                if reliable_sequence_number == incoming_reliable {
                    return None;
                }
                let queue = channel.incoming_reliable_commands;
                let end = self.incoming.end(queue);
                let mut current = self.incoming.previous(end);
                while current != end {
                    let queued = self.incoming.get(current)?;
                    if reliable_sequence_number >= incoming_reliable {
                        if queued.reliable_sequence_number < incoming_reliable {
                            current = self.incoming.previous(current);
                            continue;
                        }
                    } else if queued.reliable_sequence_number >= incoming_reliable {
                        break;
                    }
                    if queued.reliable_sequence_number <= reliable_sequence_number {
                        if queued.reliable_sequence_number < reliable_sequence_number {
                            break;
                        }
                        return None;
                    }
                    current = self.incoming.previous(current);
                }
                Some(current)
            }
            CommandKind::SendUnreliable | CommandKind::SendUnreliableFragment => {
                let unreliable_sequence_number = match command.body {
                    ProtocolCommand::SendUnreliable { unreliable_sequence_number, .. } => {
                        unreliable_sequence_number
                    }
                    ProtocolCommand::SendUnreliableFragment(fragment) => fragment.start_sequence_number,
                    _ => 0,
                };
                if reliable_sequence_number == incoming_reliable
                    && unreliable_sequence_number <= channel.incoming_unreliable_sequence_number
                {
                    return None;
                }
                let queue = channel.incoming_unreliable_commands;
                let end = self.incoming.end(queue);
                let mut current = self.incoming.previous(end);
                while current != end {
                    let queued = self.incoming.get(current)?;
                    if queued.command.kind() == CommandKind::SendUnsequenced {
                        current = self.incoming.previous(current);
                        continue;
                    }
                    if reliable_sequence_number >= incoming_reliable {
                        if queued.reliable_sequence_number < incoming_reliable {
                            current = self.incoming.previous(current);
                            continue;
                        }
                    } else if queued.reliable_sequence_number >= incoming_reliable {
                        break;
                    }
                    if queued.reliable_sequence_number < reliable_sequence_number {
                        break;
                    }
                    if queued.reliable_sequence_number > reliable_sequence_number {
                        current = self.incoming.previous(current);
                        continue;
                    }
                    if queued.unreliable_sequence_number <= unreliable_sequence_number {
                        if queued.unreliable_sequence_number < unreliable_sequence_number {
                            break;
                        }
                        return None;
                    }
                    current = self.incoming.previous(current);
                }
                Some(current)
            }
            CommandKind::SendUnsequenced => Some(self.incoming.end(channel.incoming_unreliable_commands)),
            _ => None,
        }
    }

    /// Moves the in-order run of complete reliable commands to the dispatched queue.
    pub(crate) fn dispatch_incoming_reliable_commands(
        &mut self,
        context: &mut HostContext,
        channel_index: usize,
        queued: Option<NodeId>,
    ) {
        let Some(channel) = self.channels.get_mut(channel_index) else {
            return;
        };
        let queue = channel.incoming_reliable_commands;
        let begin = self.incoming.begin(queue);
        let end = self.incoming.end(queue);

        let mut current = begin;
        while current != end {
            let Some(incoming) = self.incoming.get(current) else {
                break;
            };
            if incoming.fragments_remaining > 0
                || incoming.reliable_sequence_number
                    != channel.incoming_reliable_sequence_number.wrapping_add(1)
            {
                break;
            }
            channel.incoming_reliable_sequence_number = incoming.reliable_sequence_number;
            if incoming.fragment_count > 0 {
                channel.incoming_reliable_sequence_number = channel
                    .incoming_reliable_sequence_number
                    .wrapping_add((incoming.fragment_count - 1) as u16);
            }
            current = self.incoming.next(current);
        }

        if current == begin {
            return;
        }

        channel.incoming_unreliable_sequence_number = 0;
        let unreliable_queue = channel.incoming_unreliable_commands;
        let last = self.incoming.previous(current);
        let dispatched_end = self.incoming.end(self.dispatched_commands);
        self.incoming.move_range(dispatched_end, begin, last);
        self.schedule_dispatch(context);

        if !self.incoming.is_empty(unreliable_queue) {
            self.dispatch_incoming_unreliable_commands(context, channel_index, queued);
        }
    }

    /// Delivers unreliable commands of the current reliable sequence and drops the ones that
    /// can no longer be delivered.
    pub(crate) fn dispatch_incoming_unreliable_commands(
        &mut self,
        context: &mut HostContext,
        channel_index: usize,
        queued: Option<NodeId>,
    ) {
        let Some(channel) = self.channels.get(channel_index) else {
            return;
        };
        let queue = channel.incoming_unreliable_commands;
        let end = self.incoming.end(queue);
        let dispatched_end = self.incoming.end(self.dispatched_commands);

        let mut dropped = self.incoming.begin(queue);
        let mut start = dropped;
        let mut current = dropped;
        let mut moved_any = false;

        while current != end {
            let Some(incoming) = self.incoming.get(current) else {
                break;
            };
            if incoming.command.kind() == CommandKind::SendUnsequenced {
                current = self.incoming.next(current);
                continue;
            }

            let channel = &mut self.channels[channel_index];
            if incoming.reliable_sequence_number == channel.incoming_reliable_sequence_number {
                if incoming.fragments_remaining == 0 {
                    channel.incoming_unreliable_sequence_number = incoming.unreliable_sequence_number;
                    current = self.incoming.next(current);
                    continue;
                }
                if start != current {
                    let last = self.incoming.previous(current);
                    self.incoming.move_range(dispatched_end, start, last);
                    moved_any = true;
                    dropped = current;
                } else if dropped != current {
                    dropped = self.incoming.previous(current);
                }
            } else {
                if channel.accepts_incoming(incoming.reliable_sequence_number) {
                    break;
                }
                dropped = self.incoming.next(current);
                if start != current {
                    let last = self.incoming.previous(current);
                    self.incoming.move_range(dispatched_end, start, last);
                    moved_any = true;
                }
            }

            start = self.incoming.next(current);
            current = start;
        }

        if start != current {
            let last = self.incoming.previous(current);
            self.incoming.move_range(dispatched_end, start, last);
            moved_any = true;
            dropped = current;
        }

        if moved_any {
            self.schedule_dispatch(context);
        }

        let begin = self.incoming.begin(queue);
        self.remove_incoming_commands(queue, begin, dropped, queued);
    }

    /// Drops the commands from `start` up to (not including) `end`, except `exclude`.
    pub(crate) fn remove_incoming_commands(
        &mut self,
        queue: QueueId,
        start: NodeId,
        end: NodeId,
        exclude: Option<NodeId>,
    ) {
        let sentinel = self.incoming.end(queue);
        let mut current = start;
        while current != end && current != sentinel {
            let next = self.incoming.next(current);
            if Some(current) != exclude {
                if let Some(incoming) = self.incoming.remove(current) {
                    self.total_waiting_data = self.total_waiting_data.saturating_sub(incoming.packet.len());
                }
            }
            current = next;
        }
    }

    /// Takes the next delivered packet and the channel it arrived on.
    pub fn receive(&mut self) -> Option<(u8, Packet)> {
        let incoming = self.incoming.pop_front(self.dispatched_commands)?;
        let channel_id = incoming.command.header.channel_id;
        let packet = incoming.packet.packet().clone();
        drop(incoming);
        self.total_waiting_data = self.total_waiting_data.saturating_sub(packet.len());
        Some((channel_id, packet))
    }
}
