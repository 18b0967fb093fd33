//! Bounded FIFOs of descriptor indices.
//!
//! A FIFO is a pair of endpoints connected by two bounded crossbeam
//! channels, one per direction. Each endpoint writes into its peer's
//! receive queue, so a session and its client exchange ownership of
//! descriptors through a single object each. Dropping an endpoint closes
//! both directions for the peer.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::error::{Error, Result};

/// One end of a descriptor FIFO.
#[derive(Debug)]
pub struct FifoEnd {
    tx: Sender<u16>,
    rx: Receiver<u16>,
}

/// Create a connected FIFO pair with room for `depth` entries per direction.
pub fn fifo_pair(depth: usize) -> (FifoEnd, FifoEnd) {
    let (a_tx, b_rx) = crossbeam_channel::bounded(depth);
    let (b_tx, a_rx) = crossbeam_channel::bounded(depth);
    (FifoEnd { tx: a_tx, rx: a_rx }, FifoEnd { tx: b_tx, rx: b_rx })
}

impl FifoEnd {
    /// Write as many entries as fit. Returns the number written.
    ///
    /// Fails with `ShouldWait` if nothing could be written because the peer
    /// queue is full, and `PeerClosed` if the peer is gone.
    pub fn write(&self, entries: &[u16]) -> Result<usize> {
        for (written, entry) in entries.iter().enumerate() {
            match self.tx.try_send(*entry) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) if written > 0 => return Ok(written),
                Err(TrySendError::Full(_)) => return Err(Error::ShouldWait),
                Err(TrySendError::Disconnected(_)) => return Err(Error::PeerClosed),
            }
        }
        Ok(entries.len())
    }

    /// Write a single entry.
    pub fn write_one(&self, entry: u16) -> Result<()> {
        self.write(&[entry]).map(|_| ())
    }

    /// Read up to `buf.len()` entries without blocking.
    ///
    /// Fails with `ShouldWait` if nothing is queued, and `PeerClosed` if the
    /// queue is empty and the peer is gone.
    pub fn read(&self, buf: &mut [u16]) -> Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match self.rx.try_recv() {
                Ok(entry) => {
                    buf[read] = entry;
                    read += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) if read == 0 => return Err(Error::PeerClosed),
                Err(TryRecvError::Disconnected) => break,
            }
        }
        if read == 0 {
            return Err(Error::ShouldWait);
        }
        Ok(read)
    }

    /// Block until an entry arrives or `timeout` expires.
    pub fn read_timeout(&self, timeout: Duration) -> Result<u16> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::TimedOut,
            RecvTimeoutError::Disconnected => Error::PeerClosed,
        })
    }

    /// Number of entries waiting to be read.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Receiving side, for readiness selection.
    pub(crate) fn receiver(&self) -> &Receiver<u16> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read() {
        let (a, b) = fifo_pair(4);
        assert_eq!(a.write(&[1, 2, 3]).unwrap(), 3);
        let mut buf = [0u16; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        b.write_one(9).unwrap();
        assert_eq!(a.read_timeout(Duration::from_millis(10)).unwrap(), 9);
    }

    #[test]
    fn test_partial_write_when_full() {
        let (a, b) = fifo_pair(2);
        assert_eq!(a.write(&[1, 2, 3]).unwrap(), 2);
        assert_eq!(a.write(&[4]).unwrap_err(), Error::ShouldWait);
        assert_eq!(b.pending(), 2);
    }

    #[test]
    fn test_empty_read_should_wait() {
        let (a, _b) = fifo_pair(2);
        let mut buf = [0u16; 2];
        assert_eq!(a.read(&mut buf).unwrap_err(), Error::ShouldWait);
        assert_eq!(
            a.read_timeout(Duration::from_millis(5)).unwrap_err(),
            Error::TimedOut
        );
    }

    #[test]
    fn test_peer_closed() {
        let (a, b) = fifo_pair(2);
        b.write_one(5).unwrap();
        drop(b);
        let mut buf = [0u16; 2];
        // Queued entries are still delivered
        assert_eq!(a.read(&mut buf).unwrap(), 1);
        assert_eq!(a.read(&mut buf).unwrap_err(), Error::PeerClosed);
        assert_eq!(a.write_one(1).unwrap_err(), Error::PeerClosed);
    }
}
