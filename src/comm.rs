//! Minimal message-passing API used by [`crate::exchange`] and
//! [`crate::checkpoint`]: a `Communicator` trait with `send`/`recv`/
//! `requeue_recv` primitives, plus default binomial-tree `broadcast`/
//! `reduce`/`all_reduce` built on top of them. Concrete transports live
//! under [`crate::transport`].
//!
//! `recv` returns whatever message is next from any peer, with no sender
//! tag. [`crate::exchange`] needs to pull a message
//! from a *specific* peer, which it does with [`recv_from`], built on the
//! same `requeue_recv` escape hatch broadcast/reduce already rely on: messages
//! from the wrong peer get put back, in arrival order, for a later call to
//! claim.

/// Compute the log-base-two of the next power of two: 8 -> 3, 9 -> 4.
pub fn ceil_log2(x: usize) -> usize {
    let mut n = 0;
    while 1 << n < x {
        n += 1
    }
    n
}

/// An envelope tagging a payload with its sender, used only by
/// [`recv_from`] on top of the untagged `recv`/`requeue_recv` primitives.
#[derive(serde::Serialize, serde::Deserialize)]
struct Envelope {
    from: usize,
    bytes: Vec<u8>,
}

/// Interface for a group of processes that can exchange messages over a
/// network. The underlying transport can in principle be TCP, UDP, zmq, or
/// a higher-level abstraction like MPI.
pub trait Communicator {
    /// Rank of this process within the communicator.
    fn rank(&self) -> usize;

    /// Number of peer processes in this communicator.
    fn size(&self) -> usize;

    /// Sends a message to a peer. Must return immediately; it is not
    /// allowed to block until a matching receive is posted.
    fn send(&self, rank: usize, message: Vec<u8>);

    /// Receives a message from any peer. Allowed to block until one is
    /// ready.
    fn recv(&self) -> Vec<u8>;

    /// Requeues a received message that was not yet needed.
    fn requeue_recv(&self, bytes: Vec<u8>);

    /// Tags and sends a message to `rank`, recoverable by that peer's
    /// [`recv_from`] call regardless of what else is in flight.
    fn send_to(&self, rank: usize, bytes: Vec<u8>)
    where
        Self: Sized,
    {
        let envelope = Envelope {
            from: self.rank(),
            bytes,
        };
        let wire = rmp_serde::to_vec(&envelope).expect("envelope always serializes");
        self.send(rank, wire);
    }

    /// Blocks until a message tagged as sent from `peer` arrives, requeuing
    /// anything else encountered along the way so a later caller can still
    /// claim it.
    fn recv_from(&self, peer: usize) -> Vec<u8>
    where
        Self: Sized,
    {
        loop {
            let wire = self.recv();
            let envelope: Envelope = rmp_serde::from_slice(&wire).expect("malformed envelope");
            if envelope.from == peer {
                return envelope.bytes;
            }
            self.requeue_recv(wire);
        }
    }

    /// Binomial-tree broadcast from the root. `value` must be `Some` on the
    /// root and `None` everywhere else.
    fn broadcast(&self, value: Option<Vec<u8>>) -> Vec<u8> {
        let r = self.rank();
        let p = self.size();

        let value = match value {
            Some(value) => value,
            None => self.recv(),
        };
        for level in (0..ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 && r + one <= p {
                self.send(r + one, value.clone())
            }
        }
        value
    }

    /// Binomial-tree reduce. Every rank but the root returns `None`.
    fn reduce<F>(&self, f: F, mut value: Vec<u8>) -> Option<Vec<u8>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        let r = self.rank();
        let p = self.size();

        for level in (0..ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                value = f(value, self.recv())
            } else {
                self.send(r - one, value);
                return None;
            }
        }
        Some(value)
    }

    /// All-reduce: a reduce to the root followed by a broadcast back out.
    fn all_reduce<F>(&self, f: F, value: Vec<u8>) -> Vec<u8>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        self.broadcast(self.reduce(f, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_log2_matches_next_power_of_two() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }
}
