//! An in-process [`Communicator`] group, used by this crate's own
//! multi-rank tests and by the `sandglass-demo` binary. Every rank's inbox
//! is an unbounded `crossbeam_channel`; `requeue_recv` pushes back onto the
//! same channel, so ordering among requeued messages is not preserved.

use crossbeam_channel::{Receiver, Sender};

use crate::comm::Communicator;

pub struct LoopbackCommunicator {
    rank: usize,
    peers: Vec<Sender<Vec<u8>>>,
    inbox: Receiver<Vec<u8>>,
}

impl LoopbackCommunicator {
    /// Builds a fully connected group of `size` loopback communicators,
    /// indexed by rank.
    pub fn new_group(size: usize) -> Vec<Self> {
        let channels: Vec<(Sender<Vec<u8>>, Receiver<Vec<u8>>)> =
            (0..size).map(|_| crossbeam_channel::unbounded()).collect();
        let senders: Vec<Sender<Vec<u8>>> = channels.iter().map(|(s, _)| s.clone()).collect();
        channels
            .into_iter()
            .enumerate()
            .map(|(rank, (_, inbox))| LoopbackCommunicator {
                rank,
                peers: senders.clone(),
                inbox,
            })
            .collect()
    }
}

impl Communicator for LoopbackCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        self.peers[rank].send(message).expect("peer inbox closed");
    }

    fn recv(&self) -> Vec<u8> {
        self.inbox.recv().expect("communicator group dropped")
    }

    fn requeue_recv(&self, bytes: Vec<u8>) {
        self.peers[self.rank].send(bytes).expect("own inbox closed");
    }
}
