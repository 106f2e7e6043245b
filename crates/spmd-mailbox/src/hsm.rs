//! Host side of the mailbox
//!
//! A host posts requests into its own mailbox of the SPM's inbox region and
//! polls its mailbox in the SPM's outbox region for replies. Every slot goes
//! through the same cycle:
//!
//! ```text
//! free ──send──► pending ──reply──► consumed ──CLEAN echoed──► free
//!                  │                   │
//!                  │                   └─ our slot rewritten to CLEAN
//!                  └─ identical payload: extra waiter, same slot
//! ```

use crate::dispatch::DispatchPool;
use crate::mailbox::{MAILBOX_SIZE, MESSAGES_PER_MAILBOX, Mailbox};
use crate::message::{CLEAN_MESSAGE, ExtendRequest, RawMessage, is_clean, is_empty_slot, reply_matches};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::{Condvar, Mutex};
use spmd_common::config::MailboxConfig;
use spmd_common::{Error, HostId, PoolId, Result};
use spmd_storage::ByteRange;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Completion callback, run on a dispatch worker with the original request
/// and the granted size in MiB. When the dispatch queue is full it runs on
/// the polling thread instead.
pub type ExtendCallback = Box<dyn FnOnce(ExtendRequest, Result<u64>) + Send + 'static>;

/// Handle on one submitted request
#[derive(Debug)]
pub struct ExtendTicket {
    slot: usize,
    request: ExtendRequest,
    receiver: Receiver<Result<u64>>,
}

impl ExtendTicket {
    /// Mailbox slot carrying the request
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub const fn request(&self) -> &ExtendRequest {
        &self.request
    }

    /// Block until the SPM replies; yields the granted size in MiB
    pub fn wait(self) -> Result<u64> {
        self.receiver.recv().unwrap_or(Err(Error::MailboxNotRunning))
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<u64>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Error::MailboxNotRunning)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    Consumed,
}

struct Waiter {
    ticket: Sender<Result<u64>>,
    callback: Option<ExtendCallback>,
}

struct ActiveRequest {
    payload: RawMessage,
    request: ExtendRequest,
    state: SlotState,
    waiters: Vec<Waiter>,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Granted(u64),
    Failed,
    Mismatch,
    Malformed,
}

impl Outcome {
    fn of(active: &ActiveRequest, reply: &[u8]) -> Self {
        if !reply_matches(&active.payload, reply) {
            return Self::Mismatch;
        }
        match ExtendRequest::decode(reply) {
            Ok(granted) if granted.size_mb > 0 || active.request.size_mb == 0 => {
                Self::Granted(granted.size_mb)
            }
            Ok(_) => Self::Failed,
            Err(_) => Self::Malformed,
        }
    }

    fn to_result(self, slot: usize, request: &ExtendRequest) -> Result<u64> {
        match self {
            Self::Granted(size_mb) => Ok(size_mb),
            Self::Failed => Err(Error::ExtendFailed(format!(
                "volume {} of domain {} to {} MiB",
                request.volume, request.domain, request.size_mb
            ))),
            Self::Mismatch => Err(Error::ReplyMismatch { slot }),
            Self::Malformed => Err(Error::invalid_message(format!("reply in slot {slot}"))),
        }
    }
}

struct HsmState {
    primed: bool,
    stopped: bool,
    flush: bool,
    dirty: bool,
    active: Vec<Option<ActiveRequest>>,
    outgoing: Mailbox,
    incoming: Mailbox,
}

impl HsmState {
    fn has_active(&self) -> bool {
        self.active.iter().any(Option::is_some)
    }

    fn wants_io(&self) -> bool {
        !self.primed || self.dirty || self.flush
    }
}

struct Shared {
    host_id: HostId,
    pool: PoolId,
    inbox: Arc<dyn ByteRange>,
    outbox: Arc<dyn ByteRange>,
    config: MailboxConfig,
    state: Mutex<HsmState>,
    wake: Condvar,
    dispatch: DispatchPool,
}

impl Shared {
    fn offset(&self) -> u64 {
        u64::from(self.host_id) * MAILBOX_SIZE as u64
    }

    /// Sleep for `duration` unless stopped first
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        while !state.stopped && !self.wake.wait_until(&mut state, deadline).timed_out() {}
    }
}

struct Completion {
    slot: usize,
    request: ExtendRequest,
    outcome: Outcome,
    waiters: Vec<Waiter>,
}

/// Requesting end of the mailbox for one host
pub struct HsmMailbox {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl HsmMailbox {
    /// Create the mailbox without a monitor thread.
    ///
    /// `inbox` is the region the SPM writes replies into, `outbox` the one
    /// it reads requests from. Nothing can be sent until the first
    /// [`poll_once`](Self::poll_once) has primed the mailbox.
    pub fn new(
        host_id: HostId,
        pool: PoolId,
        inbox: Arc<dyn ByteRange>,
        outbox: Arc<dyn ByteRange>,
        config: &MailboxConfig,
    ) -> Result<Self> {
        let dispatch = DispatchPool::new(
            &format!("hsm-mail-{host_id}"),
            config.dispatch_workers,
            config.dispatch_queue_depth,
        )?;
        let state = HsmState {
            primed: false,
            stopped: false,
            flush: false,
            dirty: false,
            active: (0..MESSAGES_PER_MAILBOX).map(|_| None).collect(),
            outgoing: Mailbox::empty(),
            incoming: Mailbox::empty(),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                host_id,
                pool,
                inbox,
                outbox,
                config: config.clone(),
                state: Mutex::new(state),
                wake: Condvar::new(),
                dispatch,
            }),
            monitor: Mutex::new(None),
        })
    }

    /// Create the mailbox and start its monitor thread
    pub fn start(
        host_id: HostId,
        pool: PoolId,
        inbox: Arc<dyn ByteRange>,
        outbox: Arc<dyn ByteRange>,
        config: &MailboxConfig,
    ) -> Result<Self> {
        let mailbox = Self::new(host_id, pool, inbox, outbox, config)?;
        let shared = Arc::clone(&mailbox.shared);
        let handle = thread::Builder::new()
            .name(format!("hsm-mail-monitor-{host_id}"))
            .spawn(move || run_monitor(&shared))?;
        *mailbox.monitor.lock() = Some(handle);
        info!("HSM mailbox of host {} started for pool {}", host_id, pool);
        Ok(mailbox)
    }

    #[must_use]
    pub fn host_id(&self) -> HostId {
        self.shared.host_id
    }

    /// Post an extend request.
    ///
    /// Blocks until the mailbox is primed. An identical request that is
    /// still waiting for its reply shares that request's slot.
    pub fn send_extend(
        &self,
        request: ExtendRequest,
        callback: Option<ExtendCallback>,
    ) -> Result<ExtendTicket> {
        let shared = &self.shared;
        let payload = request.encode();
        let (sender, receiver) = bounded(1);
        let waiter = Waiter {
            ticket: sender,
            callback,
        };

        let mut state = shared.state.lock();
        while !state.primed && !state.stopped {
            shared.wake.wait(&mut state);
        }
        if state.stopped {
            return Err(Error::MailboxNotRunning);
        }

        let duplicate = state.active.iter().position(|entry| {
            entry
                .as_ref()
                .is_some_and(|a| a.state == SlotState::Pending && a.payload == payload)
        });
        let slot = if let Some(slot) = duplicate {
            debug!("request for volume {} already in slot {}", request.volume, slot);
            if let Some(active) = state.active[slot].as_mut() {
                active.waiters.push(waiter);
            }
            slot
        } else {
            let Some(slot) = state.active.iter().position(Option::is_none) else {
                warn!(
                    "mailbox of host {} is full, rejecting extend of volume {}",
                    shared.host_id, request.volume
                );
                return Err(Error::MailboxFull(shared.host_id));
            };
            state.active[slot] = Some(ActiveRequest {
                payload,
                request,
                state: SlotState::Pending,
                waiters: vec![waiter],
            });
            state.outgoing.set_slot(slot, &payload);
            state.dirty = true;
            debug!(
                "posted extend of volume {} to {} MiB in slot {}",
                request.volume, request.size_mb, slot
            );
            slot
        };
        drop(state);
        shared.wake.notify_all();

        Ok(ExtendTicket {
            slot,
            request,
            receiver,
        })
    }

    /// Write pending changes and check for replies.
    ///
    /// Returns the number of requests completed by this pass.
    pub fn poll_once(&self) -> Result<usize> {
        poll(&self.shared)
    }

    /// Ask the monitor for an immediate pass
    pub fn flush(&self) {
        self.shared.state.lock().flush = true;
        self.shared.wake.notify_all();
    }

    /// Requests not yet freed by the SPM
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .active
            .iter()
            .filter(|a| a.is_some())
            .count()
    }

    /// Stop the monitor and clear this host's outgoing mailbox.
    ///
    /// Requests still waiting fail with `MailboxNotRunning`.
    pub fn stop(&self) {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        shared.wake.notify_all();

        if let Some(handle) = self.monitor.lock().take()
            && handle.join().is_err()
        {
            error!("HSM mailbox monitor of host {} panicked", shared.host_id);
        }

        let mut state = shared.state.lock();
        state.outgoing = Mailbox::empty();
        if let Err(e) = shared.outbox.write_range(shared.offset(), state.outgoing.as_bytes()) {
            error!("cannot clear mailbox of host {}: {}", shared.host_id, e);
        }
        let abandoned = state.active.iter_mut().filter_map(Option::take).count();
        drop(state);
        shared.dispatch.shutdown();
        info!(
            "HSM mailbox of host {} stopped for pool {}, {} requests abandoned",
            shared.host_id, shared.pool, abandoned
        );
    }
}

impl Drop for HsmMailbox {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll(shared: &Shared) -> Result<usize> {
    let offset = shared.offset();
    let mut state = shared.state.lock();

    if !state.primed {
        let incoming = Mailbox::from_bytes(shared.inbox.read_range(offset, MAILBOX_SIZE)?)?;
        let outgoing = Mailbox::empty();
        shared.outbox.write_range(offset, outgoing.as_bytes())?;
        state.incoming = incoming;
        state.outgoing = outgoing;
        state.primed = true;
        drop(state);
        shared.wake.notify_all();
        debug!("mailbox of host {} primed", shared.host_id);
        return Ok(0);
    }

    let mut changed = false;
    let mut completions = Vec::new();
    let inbox = Mailbox::from_bytes(shared.inbox.read_range(offset, MAILBOX_SIZE)?)?;
    if inbox.is_valid() {
        let HsmState {
            active,
            outgoing,
            incoming,
            ..
        } = &mut *state;
        for (slot, entry) in active.iter_mut().enumerate() {
            let Some(request) = entry.as_mut() else {
                continue;
            };
            let new = inbox.slot(slot);
            if new == incoming.slot(slot) || is_empty_slot(new) {
                continue;
            }
            if is_clean(new) {
                if request.state == SlotState::Consumed {
                    *entry = None;
                    outgoing.clear_slot(slot);
                    changed = true;
                } else {
                    warn!("CLEAN in slot {} before any reply, ignoring", slot);
                }
                continue;
            }
            if request.state == SlotState::Consumed {
                debug!("slot {} changed after its reply was consumed", slot);
                continue;
            }
            let outcome = Outcome::of(request, new);
            request.state = SlotState::Consumed;
            outgoing.set_slot(slot, &CLEAN_MESSAGE);
            changed = true;
            completions.push(Completion {
                slot,
                request: request.request,
                outcome,
                waiters: std::mem::take(&mut request.waiters),
            });
        }
        state.incoming = inbox;
    } else {
        warn!("mailbox of host {} failed its checksum, ignoring it", shared.host_id);
    }

    if changed || state.dirty || state.flush {
        state.outgoing.seal();
        shared.outbox.write_range(offset, state.outgoing.as_bytes())?;
        state.dirty = false;
        state.flush = false;
    }
    drop(state);

    let completed = completions.len();
    for completion in completions {
        complete(shared, completion);
    }
    Ok(completed)
}

fn complete(shared: &Shared, completion: Completion) {
    let Completion {
        slot,
        request,
        outcome,
        waiters,
    } = completion;
    match outcome {
        Outcome::Granted(size_mb) => {
            info!("volume {} extended to {} MiB", request.volume, size_mb);
        }
        other => warn!("extend of volume {} in slot {}: {:?}", request.volume, slot, other),
    }
    for waiter in waiters {
        let _ = waiter.ticket.send(outcome.to_result(slot, &request));
        if let Some(callback) = waiter.callback {
            let job = Arc::new(Mutex::new(Some((callback, outcome.to_result(slot, &request)))));
            let queued = Arc::clone(&job);
            let submitted = shared.dispatch.try_submit(move || {
                let taken = queued.lock().take();
                if let Some((callback, result)) = taken {
                    callback(request, result);
                }
            });
            if let Err(e) = submitted {
                warn!("running callback for volume {} on the monitor: {}", request.volume, e);
                let taken = job.lock().take();
                if let Some((callback, result)) = taken {
                    callback(request, result);
                }
            }
        }
    }
}

fn run_monitor(shared: &Shared) {
    let interval = shared.config.monitor_interval();
    let mut failures = 0u32;
    loop {
        let should_poll = {
            let mut state = shared.state.lock();
            if !state.stopped && !state.wants_io() {
                shared.wake.wait_for(&mut state, interval);
            }
            if state.stopped {
                break;
            }
            state.wants_io() || state.has_active()
        };
        if !should_poll {
            continue;
        }
        match poll(shared) {
            Ok(_) => failures = 0,
            Err(e) => {
                failures += 1;
                error!("mailbox poll of host {} failed: {}", shared.host_id, e);
                if failures > shared.config.max_consecutive_failures {
                    warn!(
                        "{} consecutive mailbox failures, backing off for {:?}",
                        failures,
                        shared.config.failure_backoff()
                    );
                    shared.pause(shared.config.failure_backoff());
                    failures = 0;
                } else {
                    shared.pause(interval);
                }
            }
        }
    }
    debug!("HSM mailbox monitor of host {} exiting", shared.host_id);
}
