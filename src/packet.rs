
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The packet is delivered reliably: it will be resent until acknowledged,
/// and is delivered in order relative to other reliable packets on the same
/// channel.
pub const FLAG_RELIABLE: u32 = 1 << 0;
/// The packet bypasses channel ordering entirely, with at-most-once
/// delivery. Takes effect only if `FLAG_RELIABLE` is not set.
pub const FLAG_UNSEQUENCED: u32 = 1 << 1;
/// Advisory in this implementation: payload memory is always owned by the
/// packet. Retained for API compatibility.
pub const FLAG_NO_ALLOCATE: u32 = 1 << 2;
/// An unreliable packet larger than one fragment is sent as unreliable
/// fragments instead of being promoted to reliable delivery.
pub const FLAG_UNRELIABLE_FRAGMENT: u32 = 1 << 3;
/// Set by the transport once the packet has been transmitted at least once.
pub const FLAG_SENT: u32 = 1 << 8;

type FreeCallback = Box<dyn FnOnce(&[u8])>;

struct PacketData {
    data: Box<[u8]>,
    flags: Cell<u32>,
    free_callback: RefCell<Option<FreeCallback>>,
}

impl Drop for PacketData {
    fn drop(&mut self) {
        if let Some(callback) = self.free_callback.borrow_mut().take() {
            callback(&self.data);
        }
    }
}

/// An immutable payload buffer, shared by reference count.
///
/// A packet may simultaneously back several queued fragments and sit in a
/// receive queue; it is destroyed (and its free callback invoked) when the
/// last reference is dropped.
#[derive(Clone)]
pub struct Packet {
    inner: Rc<PacketData>,
}

impl Packet {
    /// Creates a packet by copying the provided payload.
    pub fn new(data: &[u8], flags: u32) -> Self {
        Self::from_box(data.into(), flags)
    }

    pub(crate) fn from_box(data: Box<[u8]>, flags: u32) -> Self {
        Self {
            inner: Rc::new(PacketData {
                data,
                flags: Cell::new(flags),
                free_callback: RefCell::new(None),
            }),
        }
    }

    /// The payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    /// The payload length in bytes.
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// Returns `true` for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// The packet's flags, including any set by the transport.
    pub fn flags(&self) -> u32 {
        self.inner.flags.get()
    }

    /// Installs a callback invoked with the payload when the last reference
    /// to this packet is dropped.
    pub fn set_free_callback<F: FnOnce(&[u8]) + 'static>(&self, callback: F) {
        *self.inner.free_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub(crate) fn mark_sent(&self) {
        self.inner.flags.set(self.inner.flags.get() | FLAG_SENT);
    }

    pub(crate) fn reference_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("flags", &self.flags())
            .field("references", &self.reference_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_sharing() {
        let packet = Packet::new(&[1, 2, 3], FLAG_RELIABLE);
        assert_eq!(packet.reference_count(), 1);

        let other = packet.clone();
        assert_eq!(packet.reference_count(), 2);
        assert_eq!(other.data(), &[1, 2, 3]);

        drop(other);
        assert_eq!(packet.reference_count(), 1);
    }

    #[test]
    fn test_free_callback_runs_once() {
        let count = Rc::new(Cell::new(0));

        let packet = Packet::new(&[0xAB; 16], 0);
        let count_ref = Rc::clone(&count);
        packet.set_free_callback(move |data| {
            assert_eq!(data.len(), 16);
            count_ref.set(count_ref.get() + 1);
        });

        let clone = packet.clone();
        drop(packet);
        assert_eq!(count.get(), 0);
        drop(clone);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_sent_flag() {
        let packet = Packet::new(b"x", FLAG_RELIABLE);
        assert_eq!(packet.flags() & FLAG_SENT, 0);
        packet.mark_sent();
        assert_eq!(packet.flags() & FLAG_SENT, FLAG_SENT);
        assert_eq!(packet.flags() & FLAG_RELIABLE, FLAG_RELIABLE);
    }
}
