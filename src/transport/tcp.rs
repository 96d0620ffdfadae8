//! A pure-Rust TCP [`Communicator`]: one background thread drains an
//! outgoing queue and dials peers with exponential backoff on connection
//! failure, another listens and forwards whatever arrives into the local
//! inbox.

use std::io::prelude::*;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use log::{error, info};

use crate::comm::Communicator;

fn read_bytes_into<R: Read>(stream: &mut R, buffer: &mut [u8]) {
    let mut cursor = 0;
    while cursor < buffer.len() {
        cursor += stream.read(&mut buffer[cursor..]).unwrap();
    }
}

fn read_usize<R: Read>(stream: &mut R) -> usize {
    let mut buffer = [0u8; std::mem::size_of::<usize>()];
    read_bytes_into(stream, &mut buffer);
    usize::from_le_bytes(buffer)
}

fn read_bytes_vec<R: Read>(stream: &mut R, size: usize) -> Vec<u8> {
    let mut buffer = vec![0; size];
    read_bytes_into(stream, &mut buffer);
    buffer
}

type OutQueue = crossbeam_channel::Sender<(usize, Vec<u8>)>;

pub struct TcpHost {
    send_thread: Option<thread::JoinHandle<()>>,
    listen_thread: Option<thread::JoinHandle<()>>,
}

impl TcpHost {
    pub fn new(
        rank: usize,
        peers: Vec<SocketAddr>,
    ) -> (Self, OutQueue, crossbeam_channel::Sender<Vec<u8>>, crossbeam_channel::Receiver<Vec<u8>>) {
        let (send_sink, send_src): (OutQueue, _) = crossbeam_channel::unbounded();
        let send_thread = Self::start_sender(peers.clone(), send_src);

        let (recv_sink, recv_src) = crossbeam_channel::unbounded();
        let listen_thread = Self::start_listener(peers[rank], recv_sink.clone());

        (
            TcpHost {
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

    fn start_sender(
        peers: Vec<SocketAddr>,
        send_src: crossbeam_channel::Receiver<(usize, Vec<u8>)>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for (rank, message) in send_src {
                let mut backoff = crate::backoff::ExponentialBackoff::new(
                    Duration::from_millis(250),
                    Duration::from_millis(5000),
                    2,
                    None,
                );
                loop {
                    match TcpStream::connect(peers[rank]) {
                        Ok(mut stream) => {
                            stream.write_all(&message.len().to_le_bytes()).unwrap();
                            stream.write_all(&message).unwrap();
                            break;
                        }
                        Err(msg) => {
                            let delay = backoff.next().unwrap();
                            error!("send to rank {} failed: {}", rank, msg);
                            info!("retrying in {:?}", delay);
                            thread::sleep(delay);
                        }
                    }
                }
            }
        })
    }

    fn start_listener(
        addr: SocketAddr,
        recv_sink: crossbeam_channel::Sender<Vec<u8>>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!("listening on {}", addr);
            let listener = TcpListener::bind(addr).unwrap();
            loop {
                let (mut stream, _) = listener.accept().unwrap();
                Self::handle_connection(&mut stream, recv_sink.clone());
            }
        })
    }

    fn handle_connection(stream: &mut TcpStream, recv_sink: crossbeam_channel::Sender<Vec<u8>>) {
        loop {
            let size = read_usize(stream);
            let bytes = read_bytes_vec(stream, size);
            if recv_sink.send(bytes).is_err() {
                error!("connection closed: receiver dropped");
                break;
            }
        }
    }
}

pub struct TcpCommunicator {
    rank: usize,
    num_peers: usize,
    send_sink: OutQueue,
    recv_sink: crossbeam_channel::Sender<Vec<u8>>,
    recv_src: crossbeam_channel::Receiver<Vec<u8>>,
}

impl TcpCommunicator {
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

impl Communicator for TcpCommunicator {
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
