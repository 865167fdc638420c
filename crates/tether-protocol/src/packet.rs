//! Application packets and the claims commands hold on them.
//!
//! A [`Packet`] is a cheap, clonable handle to an immutable payload. Every protocol
//! command that still has to transmit, acknowledge or deliver the payload holds a
//! [`PacketRef`]: creating one bumps the packet's reference count and dropping it is the
//! single place the count comes back down. The payload memory itself is released when the
//! last handle of any kind goes away, at which point an optional free callback runs.

use std::{
    fmt,
    ops::{BitOr, BitOrAssign, Deref},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};

/// Flags describing how a packet is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PacketFlags(u32);

impl PacketFlags {
    /// Must be received by the target peer and resent until it is.
    pub const RELIABLE: PacketFlags = PacketFlags(1 << 0);
    /// Delivered without sequencing; only meaningful without `RELIABLE`.
    pub const UNSEQUENCED: PacketFlags = PacketFlags(1 << 1);
    /// The payload was supplied by the application rather than copied.
    pub const NO_ALLOCATE: PacketFlags = PacketFlags(1 << 2);
    /// Oversized unreliable payloads are fragmented unreliably instead of reliably.
    pub const UNRELIABLE_FRAGMENT: PacketFlags = PacketFlags(1 << 3);
    /// Set once every reliable command carrying the packet has been acknowledged.
    pub const SENT: PacketFlags = PacketFlags(1 << 8);

    /// No flags.
    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    /// Raw flag bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds flags from raw bits, keeping unknown bits.
    pub const fn from_bits(bits: u32) -> Self {
        PacketFlags(bits)
    }

    /// True when every bit of `other` is set.
    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PacketFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

type FreeCallback = Box<dyn FnOnce(&[u8]) + Send + Sync>;

struct PacketData {
    data: Vec<u8>,
    flags: AtomicU32,
    references: AtomicUsize,
    free_callback: Option<FreeCallback>,
}

impl Drop for PacketData {
    fn drop(&mut self) {
        if let Some(callback) = self.free_callback.take() {
            callback(&self.data);
        }
    }
}

/// Shared handle to an application payload.
#[derive(Clone)]
pub struct Packet {
    inner: Arc<PacketData>,
}

impl Packet {
    /// Creates a packet owning `data`.
    pub fn new(data: impl Into<Vec<u8>>, flags: PacketFlags) -> Self {
        Self::build(data.into(), flags, None)
    }

    /// Creates a packet whose `callback` runs once, when the payload is finally released.
    pub fn with_free_callback<F>(data: impl Into<Vec<u8>>, flags: PacketFlags, callback: F) -> Self
    where
        F: FnOnce(&[u8]) + Send + Sync + 'static,
    {
        Self::build(data.into(), flags, Some(Box::new(callback)))
    }

    /// Creates a reliable packet.
    pub fn reliable(data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, PacketFlags::RELIABLE)
    }

    /// Creates an unreliable, sequenced packet.
    pub fn unreliable(data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, PacketFlags::empty())
    }

    /// Creates an unreliable, unsequenced packet.
    pub fn unsequenced(data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, PacketFlags::UNSEQUENCED)
    }

    /// Creates a zero-filled packet of `length` bytes, used as a reassembly target.
    pub fn zeroed(length: usize, flags: PacketFlags) -> Self {
        Self::build(vec![0; length], flags, None)
    }

    fn build(data: Vec<u8>, flags: PacketFlags, free_callback: Option<FreeCallback>) -> Self {
        Packet {
            inner: Arc::new(PacketData {
                data,
                flags: AtomicU32::new(flags.bits()),
                references: AtomicUsize::new(0),
                free_callback,
            }),
        }
    }

    /// The payload.
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Current flags.
    pub fn flags(&self) -> PacketFlags {
        PacketFlags(self.inner.flags.load(Ordering::Acquire))
    }

    /// Number of protocol commands still holding this packet.
    pub fn reference_count(&self) -> usize {
        self.inner.references.load(Ordering::Acquire)
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("flags", &self.flags())
            .field("reference_count", &self.reference_count())
            .finish()
    }
}

/// A protocol command's claim on a [`Packet`].
///
/// Counts toward [`Packet::reference_count`] from creation until drop.
pub struct PacketRef {
    packet: Packet,
    acknowledged: bool,
}

impl PacketRef {
    /// Claims `packet` on behalf of one command.
    pub fn new(packet: &Packet) -> Self {
        packet.inner.references.fetch_add(1, Ordering::AcqRel);
        PacketRef { packet: packet.clone(), acknowledged: false }
    }

    /// Releases the claim after the remote peer acknowledged it.
    ///
    /// If this was the last claim the packet is flagged [`PacketFlags::SENT`].
    pub fn acknowledge(mut self) {
        self.acknowledged = true;
    }

    /// Mutable access to the payload, available only while this claim is the sole handle.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.packet.inner).map(|inner| inner.data.as_mut_slice())
    }

    /// The claimed packet.
    pub fn packet(&self) -> &Packet {
        &self.packet
    }
}

impl Deref for PacketRef {
    type Target = Packet;

    fn deref(&self) -> &Self::Target {
        &self.packet
    }
}

impl Drop for PacketRef {
    fn drop(&mut self) {
        let inner = &self.packet.inner;
        if inner.references.fetch_sub(1, Ordering::AcqRel) == 1 && self.acknowledged {
            inner.flags.fetch_or(PacketFlags::SENT.bits(), Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for PacketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PacketRef").field(&self.packet).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_claims_track_reference_count() {
        let packet = Packet::reliable(vec![1, 2, 3]);
        assert_eq!(packet.reference_count(), 0);

        let first = PacketRef::new(&packet);
        let second = PacketRef::new(&packet);
        assert_eq!(packet.reference_count(), 2);

        drop(first);
        assert_eq!(packet.reference_count(), 1);
        drop(second);
        assert_eq!(packet.reference_count(), 0);
        assert!(!packet.flags().contains(PacketFlags::SENT));
    }

    #[test]
    fn test_last_acknowledged_claim_marks_sent() {
        let packet = Packet::reliable(vec![0; 16]);
        let first = PacketRef::new(&packet);
        let second = PacketRef::new(&packet);

        first.acknowledge();
        assert!(!packet.flags().contains(PacketFlags::SENT));
        second.acknowledge();
        assert!(packet.flags().contains(PacketFlags::SENT));
    }

    #[test]
    fn test_free_callback_runs_exactly_once() {
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = freed.clone();
        let packet = Packet::with_free_callback(vec![9; 4], PacketFlags::RELIABLE, move |data| {
            assert_eq!(data, &[9; 4]);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let claims: Vec<_> = (0..3).map(|_| PacketRef::new(&packet)).collect();
        drop(packet);
        assert_eq!(freed.load(Ordering::SeqCst), 0);

        drop(claims);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_data_mut_requires_sole_handle() {
        let packet = Packet::zeroed(4, PacketFlags::RELIABLE);
        let mut claim = PacketRef::new(&packet);
        assert!(claim.data_mut().is_none());

        drop(packet);
        claim.data_mut().unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(claim.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_flag_helpers() {
        let flags = PacketFlags::RELIABLE | PacketFlags::UNRELIABLE_FRAGMENT;
        assert!(flags.contains(PacketFlags::RELIABLE));
        assert!(!flags.contains(PacketFlags::UNSEQUENCED));
        assert_eq!(flags.bits(), 0b1001);
    }
}
