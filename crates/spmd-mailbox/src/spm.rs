//! SPM side of the mailbox
//!
//! The SPM owns every host's mailbox. Each pass reads the whole request
//! region in one transfer, compares it slot by slot with the previous pass
//! and hands new requests to a dispatch pool. A worker runs the handler and
//! writes the reply into the same slot of the host's reply mailbox.
//!
//! Locks are always taken in the order `incoming`, then `outgoing`.

use crate::dispatch::DispatchPool;
use crate::mailbox::{MAILBOX_SIZE, MESSAGES_PER_MAILBOX, seal, slot_range, stored_checksum, verify};
use crate::message::{
    CLEAN_MESSAGE, EXTEND_OPCODE, ExtendRequest, HEADER_LEN, MESSAGE_SIZE, RawMessage, is_clean,
    is_empty_slot, opcode,
};
use parking_lot::{Condvar, Mutex};
use spmd_common::config::MailboxConfig;
use spmd_common::{Error, HostId, PoolId, Result};
use spmd_storage::{ByteRange, VolumeBackend};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Performs one kind of request and builds its reply
pub trait MessageHandler: Send + Sync {
    fn handle(&self, pool: PoolId, payload: &RawMessage) -> RawMessage;
}

/// Handler of `xtnd` requests
pub struct ExtendHandler {
    backend: Arc<dyn VolumeBackend>,
}

impl ExtendHandler {
    pub fn new(backend: Arc<dyn VolumeBackend>) -> Self {
        Self { backend }
    }
}

impl MessageHandler for ExtendHandler {
    fn handle(&self, pool: PoolId, payload: &RawMessage) -> RawMessage {
        let request = match ExtendRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                error!("cannot decode extend request: {}", e);
                // Size 0 with the request header kept
                let mut reply = *payload;
                reply[HEADER_LEN..].fill(b'0');
                return reply;
            }
        };
        info!(
            "extending volume {} in domain {} of pool {} to {} MiB",
            request.volume, request.domain, pool, request.size_mb
        );
        match self.backend.extend(
            request.domain,
            pool,
            None,
            request.volume,
            request.size_bytes(),
        ) {
            Ok(()) => request.encode(),
            Err(e) => {
                error!(
                    "extend of volume {} in domain {} failed: {}",
                    request.volume, request.domain, e
                );
                request.with_size(0).encode()
            }
        }
    }
}

struct Incoming {
    num_hosts: u32,
    mail: Vec<u8>,
}

/// Reply side, shared with dispatch workers
struct Outgoing {
    outbox: Arc<dyn ByteRange>,
    mail: Mutex<Vec<u8>>,
}

impl Outgoing {
    fn send_reply(&self, host: usize, slot: usize, reply: &RawMessage) -> Result<()> {
        let mut mail = self.mail.lock();
        let base = host * MAILBOX_SIZE;
        if base + MAILBOX_SIZE > mail.len() {
            return Err(Error::invalid_parameter("host", host));
        }
        let mailbox = &mut mail[base..base + MAILBOX_SIZE];
        mailbox[slot_range(slot)].copy_from_slice(reply);
        seal(mailbox);
        self.outbox.write_range(base as u64, mailbox)
    }

    fn write_mailboxes(&self, hosts: &BTreeSet<usize>) -> Result<()> {
        let mut mail = self.mail.lock();
        for &host in hosts {
            let base = host * MAILBOX_SIZE;
            let mailbox = &mut mail[base..base + MAILBOX_SIZE];
            seal(mailbox);
            self.outbox.write_range(base as u64, mailbox)?;
        }
        Ok(())
    }
}

struct Shared {
    pool: PoolId,
    inbox: Arc<dyn ByteRange>,
    handlers: HashMap<[u8; 4], Arc<dyn MessageHandler>>,
    incoming: Mutex<Incoming>,
    outgoing: Arc<Outgoing>,
    dispatch: DispatchPool,
    interval: Duration,
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Serving end of the mailbox
pub struct SpmMailbox {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SpmMailbox {
    /// Create the mailbox without a monitor thread and clear the reply region.
    ///
    /// `inbox` is the region hosts write requests into, `outbox` the one
    /// replies go to.
    pub fn new(
        pool: PoolId,
        inbox: Arc<dyn ByteRange>,
        outbox: Arc<dyn ByteRange>,
        backend: Arc<dyn VolumeBackend>,
        config: &MailboxConfig,
        max_hosts: u32,
    ) -> Result<Self> {
        let len = max_hosts as usize * MAILBOX_SIZE;
        let outgoing = vec![0u8; len];
        if let Err(e) = outbox.write_range(0, &outgoing) {
            warn!("cannot clear reply region of pool {}: {}", pool, e);
        }

        let mut handlers: HashMap<[u8; 4], Arc<dyn MessageHandler>> = HashMap::new();
        handlers.insert(EXTEND_OPCODE, Arc::new(ExtendHandler::new(backend)));

        let dispatch = DispatchPool::new(
            "spm-mail",
            config.dispatch_workers,
            config.dispatch_queue_depth,
        )?;

        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                inbox,
                handlers,
                incoming: Mutex::new(Incoming {
                    num_hosts: max_hosts,
                    mail: vec![0u8; len],
                }),
                outgoing: Arc::new(Outgoing {
                    outbox,
                    mail: Mutex::new(outgoing),
                }),
                dispatch,
                interval: config.monitor_interval(),
                stopped: Mutex::new(false),
                wake: Condvar::new(),
            }),
            monitor: Mutex::new(None),
        })
    }

    /// Create the mailbox and start its monitor thread
    pub fn start(
        pool: PoolId,
        inbox: Arc<dyn ByteRange>,
        outbox: Arc<dyn ByteRange>,
        backend: Arc<dyn VolumeBackend>,
        config: &MailboxConfig,
        max_hosts: u32,
    ) -> Result<Self> {
        let mailbox = Self::new(pool, inbox, outbox, backend, config, max_hosts)?;
        let shared = Arc::clone(&mailbox.shared);
        let handle = thread::Builder::new()
            .name("spm-mail-monitor".to_string())
            .spawn(move || run_monitor(&shared))?;
        *mailbox.monitor.lock() = Some(handle);
        info!("SPM mailbox started for pool {} with {} hosts", pool, max_hosts);
        Ok(mailbox)
    }

    /// Scan every host's mailbox once.
    ///
    /// Returns the number of requests handed to the dispatch pool.
    pub fn poll_once(&self) -> Result<usize> {
        poll(&self.shared)
    }

    /// Write `reply` into `slot` of `host`'s reply mailbox
    pub fn send_reply(&self, host: HostId, slot: usize, reply: &RawMessage) -> Result<()> {
        self.shared.outgoing.send_reply(host as usize, slot, reply)
    }

    #[must_use]
    pub fn max_host_id(&self) -> u32 {
        self.shared.incoming.lock().num_hosts
    }

    /// Grow or shrink the scanned region
    pub fn set_max_host_id(&self, max_hosts: u32) {
        let mut incoming = self.shared.incoming.lock();
        let mut outgoing = self.shared.outgoing.mail.lock();
        let len = max_hosts as usize * MAILBOX_SIZE;
        incoming.mail.resize(len, 0);
        outgoing.resize(len, 0);
        info!(
            "SPM mailbox of pool {} now serves {} hosts (was {})",
            self.shared.pool, max_hosts, incoming.num_hosts
        );
        incoming.num_hosts = max_hosts;
    }

    /// Block until every dispatched request has been answered
    pub fn wait_idle(&self) {
        self.shared.dispatch.wait_idle();
    }

    /// Stop the monitor and wait for in-flight requests
    pub fn stop(&self) {
        {
            let mut stopped = self.shared.stopped.lock();
            if *stopped {
                return;
            }
            *stopped = true;
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.monitor.lock().take()
            && handle.join().is_err()
        {
            error!("SPM mailbox monitor panicked");
        }
        self.shared.dispatch.shutdown();
        info!("SPM mailbox stopped for pool {}", self.shared.pool);
    }
}

impl Drop for SpmMailbox {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll(shared: &Shared) -> Result<usize> {
    let mut incoming = shared.incoming.lock();
    let num_hosts = incoming.num_hosts as usize;
    let mut mail = shared.inbox.read_range(0, num_hosts * MAILBOX_SIZE)?;
    let mut dirty = BTreeSet::new();
    let mut dispatched = 0;

    for host in 0..num_hosts {
        let base = host * MAILBOX_SIZE;
        let mut validated = false;

        for slot in 0..MESSAGES_PER_MAILBOX {
            let range = {
                let r = slot_range(slot);
                base + r.start..base + r.end
            };
            if is_empty_slot(&mail[range.clone()]) {
                continue;
            }

            // Most mailboxes are empty, so validate only once something is found
            if !validated {
                let mailbox = &mail[base..base + MAILBOX_SIZE];
                if !verify(mailbox) || stored_checksum(mailbox) == 0 {
                    error!("mailbox of host {} failed its checksum, ignoring it", host);
                    mail[base..base + MAILBOX_SIZE].fill(0);
                    break;
                }
                validated = true;
            }

            if is_clean(&mail[range.clone()]) {
                let mut outgoing = shared.outgoing.mail.lock();
                if outgoing[range.clone()] != CLEAN_MESSAGE {
                    outgoing[range].copy_from_slice(&CLEAN_MESSAGE);
                    dirty.insert(host);
                }
                continue;
            }

            if mail[range.clone()] == incoming.mail[range.clone()] {
                continue;
            }

            let mut payload: RawMessage = [0u8; MESSAGE_SIZE];
            payload.copy_from_slice(&mail[range.clone()]);
            let Some(handler) = opcode(&payload).and_then(|op| shared.handlers.get(&op)) else {
                error!(
                    "unknown message type {:?} from host {}",
                    String::from_utf8_lossy(&payload[1..5]),
                    host
                );
                continue;
            };

            debug!("dispatching request in slot {} of host {}", slot, host);
            let handler = Arc::clone(handler);
            let outgoing = Arc::clone(&shared.outgoing);
            let pool = shared.pool;
            let job = move || {
                let reply = handler.handle(pool, &payload);
                if let Err(e) = outgoing.send_reply(host, slot, &reply) {
                    error!("cannot reply to host {} slot {}: {}", host, slot, e);
                }
            };
            match shared.dispatch.try_submit(job) {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    // Keep the old bytes so the request looks new next pass
                    warn!(
                        "cannot dispatch request from host {} slot {}: {}",
                        host, slot, e
                    );
                    mail[range.clone()].copy_from_slice(&incoming.mail[range]);
                }
            }
        }
    }

    incoming.mail = mail;
    if !dirty.is_empty() {
        shared.outgoing.write_mailboxes(&dirty)?;
    }
    Ok(dispatched)
}

fn run_monitor(shared: &Shared) {
    loop {
        if *shared.stopped.lock() {
            break;
        }
        if let Err(e) = poll(shared) {
            error!("SPM mailbox poll of pool {} failed: {}", shared.pool, e);
        }
        let mut stopped = shared.stopped.lock();
        if !*stopped {
            shared.wake.wait_for(&mut stopped, shared.interval);
        }
    }
    debug!("SPM mailbox monitor of pool {} exiting", shared.pool);
}
