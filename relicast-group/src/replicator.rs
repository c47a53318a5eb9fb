//! The threaded application facade.
//!
//! One driver thread owns the core pump; `send` blocks the calling thread
//! until its action is globally ordered (or fails), `recv` blocks on the
//! ordered item channel. This is the scheduling model the library promises:
//! sends from arbitrary threads, one receive thread per consumer, the
//! engine isolated behind its lock.

use crate::core::{GroupCore, RecvItem};
use crate::{ActionType, GroupError};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use relicast_proto::{Seqno, TimeProvider};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Capacity of the delivery channel; back-pressure beyond it accumulates
/// in the core receive queue where flow control watches it.
const RECV_CHANNEL_CAP: usize = 1024;

/// Tick between driver iterations when no timer is due sooner.
const DRIVER_TICK: Duration = Duration::from_millis(1);

type SendResult = Result<Seqno, GroupError>;

struct Shared {
    core: Mutex<GroupCore>,
    waiters: Mutex<HashMap<u64, Sender<SendResult>>>,
    send_gate: Condvar,
    time: Arc<dyn TimeProvider>,
}

/// A connected group handle.
pub struct Replicator {
    shared: Arc<Shared>,
    recv_rx: Receiver<RecvItem>,
    driver: Option<JoinHandle<()>>,
}

impl Replicator {
    /// Wrap a core and start the driver thread. The core should already be
    /// connected (or be about to be, via [`GroupCore::connect`]).
    pub fn start(mut core: GroupCore, time: Arc<dyn TimeProvider>) -> Self {
        core.connect(time.now_instant());
        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            waiters: Mutex::new(HashMap::new()),
            send_gate: Condvar::new(),
            time,
        });
        let (recv_tx, recv_rx) = bounded(RECV_CHANNEL_CAP);
        let driver = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("relicast-driver".into())
                .spawn(move || driver_loop(shared, recv_tx))
                .expect("spawning driver thread")
        };
        Replicator {
            shared,
            recv_rx,
            driver: Some(driver),
        }
    }

    /// Replicate an action: blocks until it is globally ordered everywhere
    /// and returns its global seqno.
    pub fn send(&self, buf: Vec<u8>, act_type: ActionType) -> SendResult {
        let buf = Arc::new(buf);
        let (tx, rx) = bounded(1);
        {
            // Submit under the core lock and register the waiter before
            // releasing it, so the driver cannot deliver first.
            let mut core = self.shared.core.lock();
            loop {
                match core.submit(Arc::clone(&buf), act_type, self.shared.time.now_instant()) {
                    Ok(act_id) => {
                        self.shared.waiters.lock().insert(act_id, tx);
                        break;
                    }
                    Err(GroupError::WouldBlock) => {
                        // Flow control: sleep on the gate until the driver
                        // signals drained queues.
                        self.shared
                            .send_gate
                            .wait_for(&mut core, Duration::from_millis(100));
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        rx.recv().map_err(|_| GroupError::ConnAborted)?
    }

    /// Block for the next ordered item.
    pub fn recv(&self) -> Result<RecvItem, GroupError> {
        self.recv_rx.recv().map_err(|_| GroupError::ConnAborted)
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<RecvItem> {
        self.recv_rx.try_recv().ok()
    }

    /// Announce the highest locally applied action seqno.
    pub fn set_last_applied(&self, seqno: Seqno) {
        let mut core = self.shared.core.lock();
        let now = self.shared.time.now_instant();
        core.set_last_applied(seqno, now);
    }

    /// Adjust the fragmentation packet size; returns the effective size.
    pub fn set_pkt_size(&self, bytes: usize) -> usize {
        self.shared.core.lock().set_pkt_size(bytes)
    }

    pub fn is_primary(&self) -> bool {
        self.shared.core.lock().is_primary()
    }

    /// Leave the group. Blocks until the departure is safely delivered and
    /// the driver has wound down; consumers see a final [`RecvItem::Closed`].
    pub fn close(mut self) -> Result<(), GroupError> {
        {
            let mut core = self.shared.core.lock();
            let now = self.shared.time.now_instant();
            core.close(now);
        }
        if let Some(driver) = self.driver.take() {
            driver.join().map_err(|_| {
                GroupError::InvariantViolation("driver thread panicked".into())
            })?;
        }
        Ok(())
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            {
                let mut core = self.shared.core.lock();
                let now = self.shared.time.now_instant();
                core.close(now);
            }
            let _ = driver.join();
        }
    }
}

fn driver_loop(shared: Arc<Shared>, recv_tx: Sender<RecvItem>) {
    let mut backlog: VecDeque<RecvItem> = VecDeque::new();
    loop {
        let now = shared.time.now_instant();
        let closed = {
            let mut core = shared.core.lock();
            match core.step(now) {
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "driver step failed; shutting down");
                    backlog.push_back(RecvItem::Closed);
                    drop(core);
                    distribute(&shared, &recv_tx, &mut backlog);
                    return;
                }
            }
            while backlog.len() < RECV_CHANNEL_CAP {
                match core.poll_recv() {
                    Some(item) => backlog.push_back(item),
                    None => break,
                }
            }
            let closed = core.is_closed();
            if closed {
                // Final flush: nothing new will arrive past this point.
                while let Some(item) = core.poll_recv() {
                    backlog.push_back(item);
                }
            }
            closed
        };
        shared.send_gate.notify_all();
        distribute(&shared, &recv_tx, &mut backlog);
        if closed {
            // A consumer that stopped reading must not wedge the shutdown;
            // whatever it did not drain is dropped with the channel.
            if !backlog.is_empty() {
                debug!(dropped = backlog.len(), "discarding undelivered items at shutdown");
            }
            debug!("driver wound down");
            return;
        }
        std::thread::sleep(DRIVER_TICK);
    }
}

/// Route items: send results to their waiters, everything else (local
/// action deliveries included) to the consumer channel. Items that do not
/// fit stay in the backlog for the next round.
fn distribute(shared: &Arc<Shared>, recv_tx: &Sender<RecvItem>, backlog: &mut VecDeque<RecvItem>) {
    while let Some(item) = backlog.pop_front() {
        match &item {
            RecvItem::Action {
                is_local: true,
                act_id,
                global_seqno,
                ..
            } => {
                // Removing the waiter is idempotent; a re-queued item will
                // not signal twice.
                if let Some(tx) = shared.waiters.lock().remove(act_id) {
                    let _ = tx.send(Ok(*global_seqno));
                }
            }
            RecvItem::SendFailed { act_id, error } => {
                if let Some(tx) = shared.waiters.lock().remove(act_id) {
                    let _ = tx.send(Err(clone_error(error)));
                }
                continue;
            }
            _ => {}
        }
        match recv_tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                backlog.push_front(item);
                return;
            }
            Err(TrySendError::Disconnected(_)) => {
                // Consumer went away; keep pumping so close() can finish.
            }
        }
    }
}

/// The error taxonomy is clonable in spirit but carries io variants that
/// are not; send failures only ever use the clonable kinds.
fn clone_error(err: &GroupError) -> GroupError {
    match err {
        GroupError::WouldBlock => GroupError::WouldBlock,
        GroupError::NotConnected => GroupError::NotConnected,
        GroupError::ConnReset => GroupError::ConnReset,
        GroupError::ConnAborted => GroupError::ConnAborted,
        GroupError::OutOfRange => GroupError::OutOfRange,
        GroupError::Protocol(msg) => GroupError::Protocol(msg.clone()),
        GroupError::InvariantViolation(msg) => GroupError::InvariantViolation(msg.clone()),
        GroupError::Config(msg) => GroupError::Config(msg.clone()),
        other => GroupError::Protocol(other.to_string()),
    }
}
