//! Serial peer interface.

/// The far end of a serial adapter: a tape recorder, a file, an audio
/// stream, or nothing at all.
///
/// The adapter does not know or care what backs the peer. A peer with no
/// data simply returns `None`; that is a normal poll result, not an error.
/// Peers translate their own I/O failures into `None`/end-of-stream rather
/// than surfacing them to the adapter.
pub trait SerialPeer: Send {
    /// Fetch the next received byte, or `None` if nothing has arrived.
    fn read_byte(&mut self) -> Option<u8>;

    /// Deliver a transmitted byte to the peer.
    fn write_byte(&mut self, value: u8);
}
