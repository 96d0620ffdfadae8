//! A zmq REQ/REP [`Communicator`]: one REP socket per rank accepts pushed
//! payloads and immediately acks them, while the outgoing side opens a REQ
//! socket per send and waits for that ack with a bounded retry/backoff
//! (`RETRY_LIMIT`/`POLL_TIMEOUT_MS`/`LINGER_PERIOD_MS`). Payloads crossing
//! this transport are already `Envelope`-tagged by
//! [`Communicator::send_to`](crate::comm::Communicator::send_to) upstream,
//! so this module only has to move bytes reliably between two ranks.

use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::backoff::ExponentialBackoff;
use crate::comm::Communicator;

const POLL_TIMEOUT_MS: i64 = 10_000;
const RETRY_LIMIT: usize = 3;
const LINGER_PERIOD_MS: i32 = 1_000;

#[derive(Serialize, Deserialize)]
enum Ack {
    Good,
    Bad,
}

type OutQueue = crossbeam_channel::Sender<(usize, Vec<u8>)>;

/// Owns the sender and listener threads backing a [`ZmqCommunicator`].
/// `endpoints[r]` is the `tcp://host:port` address rank `r`'s REP socket
/// binds to.
pub struct ZmqHost {
    send_thread: Option<thread::JoinHandle<()>>,
    listen_thread: Option<thread::JoinHandle<()>>,
}

impl ZmqHost {
    pub fn new(
        rank: usize,
        endpoints: Vec<String>,
    ) -> (Self, OutQueue, crossbeam_channel::Sender<Vec<u8>>, crossbeam_channel::Receiver<Vec<u8>>) {
        let (send_sink, send_src): (OutQueue, _) = crossbeam_channel::unbounded();
        let send_thread = Self::start_sender(endpoints.clone(), send_src);

        let (recv_sink, recv_src) = crossbeam_channel::unbounded();
        let listen_thread = Self::start_listener(endpoints[rank].clone(), recv_sink.clone());

        (
            ZmqHost {
                send_thread: Some(send_thread),
                listen_thread: Some(listen_thread),
            },
            send_sink,
            recv_sink,
            recv_src,
        )
    }

    pub fn join(&mut self) {
        self.send_thread.take().unwrap().join().unwrap();
        self.listen_thread.take().unwrap().join().unwrap();
    }

    fn start_sender(endpoints: Vec<String>, send_src: crossbeam_channel::Receiver<(usize, Vec<u8>)>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let context = zmq::Context::new();
            for (rank, message) in send_src {
                let mut backoff =
                    ExponentialBackoff::new(Duration::from_millis(250), Duration::from_millis(5000), 2, Some(RETRY_LIMIT));
                'attempt: loop {
                    let requester = context.socket(zmq::REQ).expect("zmq REQ socket");
                    requester.set_linger(LINGER_PERIOD_MS).unwrap();
                    if requester.connect(&endpoints[rank]).is_err() || requester.send(&message, 0).is_err() {
                        error!("send to rank {} failed", rank);
                        match backoff.next() {
                            Some(delay) => {
                                thread::sleep(delay);
                                continue 'attempt;
                            }
                            None => {
                                error!("giving up on rank {} after {} attempts", rank, RETRY_LIMIT);
                                break 'attempt;
                            }
                        }
                    }

                    match requester.poll(zmq::PollEvents::POLLIN, POLL_TIMEOUT_MS) {
                        Ok(n) if n > 0 => {
                            let mut reply = zmq::Message::new();
                            requester.recv(&mut reply, 0).expect("zmq recv ack");
                            let _ack: Ack = rmp_serde::from_slice(&reply).expect("malformed ack");
                            debug!("rank {} acked", rank);
                            break 'attempt;
                        }
                        _ => {
                            warn!("timed out waiting for rank {}'s ack", rank);
                            match backoff.next() {
                                Some(delay) => thread::sleep(delay),
                                None => {
                                    error!("giving up on rank {}", rank);
                                    break 'attempt;
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    fn start_listener(endpoint: String, recv_sink: crossbeam_channel::Sender<Vec<u8>>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let context = zmq::Context::new();
            let responder = context.socket(zmq::REP).expect("zmq REP socket");
            responder.bind(&endpoint).expect("bind zmq REP socket");
            info!("listening on {}", endpoint);

            let mut msg = zmq::Message::new();
            loop {
                if responder.recv(&mut msg, 0).is_err() {
                    continue;
                }
                let ack = if recv_sink.send(msg.to_vec()).is_ok() { Ack::Good } else { Ack::Bad };
                let wire = rmp_serde::to_vec(&ack).expect("ack always serializes");
                responder.send(&wire, 0).expect("zmq send ack");
            }
        })
    }
}

pub struct ZmqCommunicator {
    rank: usize,
    num_peers: usize,
    send_sink: OutQueue,
    recv_sink: crossbeam_channel::Sender<Vec<u8>>,
    recv_src: crossbeam_channel::Receiver<Vec<u8>>,
}

impl ZmqCommunicator {
    pub fn new(
        rank: usize,
        num_peers: usize,
        send_sink: OutQueue,
        recv_sink: crossbeam_channel::Sender<Vec<u8>>,
        recv_src: crossbeam_channel::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            rank,
            num_peers,
            send_sink,
            recv_sink,
            recv_src,
        }
    }
}

impl Communicator for ZmqCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.num_peers
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        self.send_sink.send((rank, message)).unwrap()
    }

    fn recv(&self) -> Vec<u8> {
        self.recv_src.recv().unwrap()
    }

    fn requeue_recv(&self, bytes: Vec<u8>) {
        self.recv_sink.send(bytes).unwrap();
    }
}
