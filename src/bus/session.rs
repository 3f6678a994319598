//! Publish/subscribe session on the OD4 UDP multicast bus

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::wire::Envelope;
use crate::source::Timestamp;

pub const OD4_PORT: u16 = 12175;
const MAX_DATAGRAM: usize = 65_535;
const DISPATCH_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("session id {0} is outside 1..=254")]
    InvalidCid(u8),
    #[error("failed to set up the multicast socket: {0}")]
    Socket(#[from] nix::Error),
    #[error("bus I/O: {0}")]
    Io(#[from] io::Error),
}

type DataTrigger = Box<dyn Fn(Envelope) + Send + 'static>;
type Triggers = Arc<Mutex<HashMap<i32, DataTrigger>>>;

/// Session on one conference id. Received envelopes are handed to the
/// registered data triggers on a dedicated dispatcher thread.
pub struct EventBus {
    cid: Option<u8>,
    triggers: Triggers,
    injector: flume::Sender<Envelope>,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl EventBus {
    /// Join the multicast group 225.0.0.<cid>
    pub async fn join(cid: u8) -> Result<Self, BusError> {
        if cid == 0 || cid == 255 {
            return Err(BusError::InvalidCid(cid));
        }
        let socket = tokio::net::UdpSocket::from_std(multicast_socket(cid)?)?;
        let mut bus = Self::detached()?;
        bus.cid = Some(cid);

        let tx = bus.injector.clone();
        bus.receiver = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let len = match socket.recv(&mut buf).await {
                    Ok(len) => len,
                    Err(e) => {
                        warn!("Bus receive failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };
                match Envelope::from_datagram(&buf[..len]) {
                    Ok(mut envelope) => {
                        envelope.received = Timestamp::now();
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => trace!("Dropping {} byte datagram: {}", len, e),
                }
            }
        }));

        info!("Joined OD4 session {} on {}:{}", cid, group(cid), OD4_PORT);
        Ok(bus)
    }

    /// Session without network access. Envelopes only arrive through
    /// [`Self::injector`].
    pub fn detached() -> Result<Self, BusError> {
        Self::with_dispatcher(thread::Builder::new().name("bus-dispatch".into()))
    }

    fn with_dispatcher(builder: thread::Builder) -> Result<Self, BusError> {
        let (injector, inbox) = flume::unbounded::<Envelope>();
        let triggers: Triggers = Arc::default();
        let running = Arc::new(AtomicBool::new(true));

        let dispatcher = {
            let triggers = triggers.clone();
            let running = running.clone();
            builder.spawn(move || dispatch(inbox, triggers, running))?
        };

        Ok(Self {
            cid: None,
            triggers,
            injector,
            running,
            receiver: None,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn cid(&self) -> Option<u8> {
        self.cid
    }

    /// Invoke `handler` for every envelope of `data_type`. A later
    /// registration for the same type replaces the earlier one.
    pub fn data_trigger<F>(&self, data_type: i32, handler: F)
    where
        F: Fn(Envelope) + Send + 'static,
    {
        self.triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(data_type, Box::new(handler));
    }

    /// Feed envelopes into the dispatcher as if they came off the wire
    pub fn injector(&self) -> flume::Sender<Envelope> {
        self.injector.clone()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
    }
}

fn dispatch(inbox: flume::Receiver<Envelope>, triggers: Triggers, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        let envelope = match inbox.recv_timeout(DISPATCH_POLL) {
            Ok(envelope) => envelope,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        };
        let triggers = triggers.lock().unwrap_or_else(PoisonError::into_inner);
        match triggers.get(&envelope.data_type) {
            Some(trigger) => trigger(envelope),
            None => trace!("No trigger for data type {}", envelope.data_type),
        }
    }
    debug!("Bus dispatcher stopped");
}

fn group(cid: u8) -> Ipv4Addr {
    Ipv4Addr::new(225, 0, 0, cid)
}

fn multicast_socket(cid: u8) -> Result<UdpSocket, BusError> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    // Other participants of the session listen on the same port
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;

    socket::bind(fd.as_raw_fd(), &SockaddrIn::new(0, 0, 0, 0, OD4_PORT))?;

    let socket = UdpSocket::from(fd);
    socket.join_multicast_v4(&group(cid), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
