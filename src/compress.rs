
use crate::address::Address;

/// A pluggable compressor for the command portion of outgoing datagrams.
///
/// `compress` writes the compressed form of `input` into `output` and
/// returns the compressed size, or `None` if the data is incompressible or
/// does not fit. Compression is only used on the wire when it is a strict
/// win. Any context the codec needs lives in the implementing type; it is
/// dropped when the host replaces or discards the compressor.
pub trait Compressor {
    fn compress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize>;
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize>;
}

/// Verdict returned by an intercept callback for a raw received datagram.
pub enum Intercept {
    /// Hand the datagram to the protocol as usual.
    Pass,
    /// The callback consumed the datagram; the protocol never sees it.
    Consume,
    /// Abort servicing with an error.
    Error,
}

/// Inspects raw datagrams before protocol processing, e.g. to implement
/// side-channel discovery traffic on the same socket.
pub type InterceptFn = Box<dyn FnMut(&Address, &[u8]) -> Intercept>;

/// Computes a 32-bit checksum over a fully assembled datagram.
pub type ChecksumFn = Box<dyn Fn(&[u8]) -> u32>;
