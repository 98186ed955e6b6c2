use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace};
use parking_lot::{Condvar, Mutex};
use serde_derive::Deserialize;

use crate::broadcast::BroadcastFrame;

pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 12, 255, 254);
pub const DEFAULT_PORT: u16 = 9522;
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);
const BUFFER_SIZE: usize = 1024;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MulticastConfig {
    pub group: Option<Ipv4Addr>,
    pub port: Option<u16>,
}

impl MulticastConfig {
    pub fn group(&self) -> Ipv4Addr {
        self.group.unwrap_or(DEFAULT_GROUP)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

pub trait DatagramSource {
    /// Receives one datagram into `buf`. `Ok(None)` means nothing arrived
    /// within the source's own timeout, so the caller can check for shutdown.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

pub struct MulticastSocket {
    socket: UdpSocket,
}

impl MulticastSocket {
    pub fn bind(config: &MulticastConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port()))?;
        socket.join_multicast_v4(&config.group(), &Ipv4Addr::UNSPECIFIED)?;
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        Ok(Self { socket })
    }
}

impl DatagramSource for MulticastSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(len) => Ok(Some(len)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Default)]
struct Shared {
    latest: Mutex<Option<BroadcastFrame>>,
    first_frame: Condvar,
    stop: AtomicBool,
}

/// Keeps the most recent frame broadcast by a Home Manager.
///
/// A background thread replaces the frame whenever a valid datagram
/// arrives; there is no queue, readers only ever see the latest frame.
pub struct BroadcastListener {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl BroadcastListener {
    /// Joins the multicast group and starts listening.
    pub fn start(config: &MulticastConfig) -> io::Result<Self> {
        info!(
            "listening for energy meter broadcasts on {}:{}",
            config.group(),
            config.port()
        );
        let socket = MulticastSocket::bind(config)?;
        Self::spawn(socket)
    }

    pub fn spawn<S>(source: S) -> io::Result<Self>
    where
        S: DatagramSource + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let handle = thread::Builder::new()
            .name("broadcast-listener".into())
            .spawn({
                let shared = shared.clone();
                move || receive(source, &shared)
            })?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn latest(&self) -> Option<BroadcastFrame> {
        *self.shared.latest.lock()
    }

    /// Blocks until a first frame was received or `timeout` elapsed.
    pub fn wait_for_first_frame(&self, timeout: Duration) -> bool {
        let mut latest = self.shared.latest.lock();
        if latest.is_none() {
            self.shared.first_frame.wait_for(&mut latest, timeout);
        }
        latest.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("broadcast listener thread panicked");
            }
        }
    }
}

impl Drop for BroadcastListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive<S: DatagramSource>(mut source: S, shared: &Shared) {
    let mut buf = [0_u8; BUFFER_SIZE];
    while !shared.stop.load(Ordering::SeqCst) {
        match source.recv(&mut buf) {
            Ok(Some(len)) => match BroadcastFrame::parse(&buf[..len]) {
                Some(frame) => {
                    let mut latest = shared.latest.lock();
                    let first = latest.is_none();
                    *latest = Some(frame);
                    if first {
                        debug!("first energy meter frame received");
                        shared.first_frame.notify_all();
                    }
                }
                None => trace!("ignoring datagram of {len} bytes"),
            },
            Ok(None) => {}
            Err(e) => {
                error!("energy meter socket failed: {e}");
                *shared.latest.lock() = None;
                break;
            }
        }
    }
}
