//! Durable storage for payloads that could not be transmitted

/// FIFO of unsent payloads, bounded by size on the medium
///
/// Backed by the SD card on hardware. Entries are opaque byte strings.
pub trait TransmitQueue {
    type Error: core::fmt::Debug;

    /// Append a payload to the tail
    fn push(&mut self, payload: &[u8]) -> Result<(), Self::Error>;

    /// Copy the oldest payload into `buf` without removing it.
    ///
    /// Returns the number of bytes copied, or `None` when the queue is empty.
    fn peek_oldest(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Self::Error>;

    /// Remove the oldest payload
    fn pop_oldest(&mut self) -> Result<(), Self::Error>;

    /// Total bytes held by the queue
    fn size_bytes(&mut self) -> Result<usize, Self::Error>;
}
