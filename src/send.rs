//! The send pipeline: classify by active provider, schedule timestamped
//! local deliveries, enqueue remote traffic, and guard against handler
//! re-entry with a pending queue.

use tracing::debug;

use crate::dispatch::{self, Route};
use crate::ensemble::Ensemble;
use crate::error::{CanSend, Error, Result};
use crate::message::Msg;

impl Ensemble {
    /// Send a finished message: deliver, schedule, or transmit according to
    /// the active provider of its service. Non-blocking: remote TCP frames
    /// are queued if the stream would block (see
    /// [`can_send`](Self::can_send)).
    pub fn message_send(&mut self, msg: Msg) -> Result<()> {
        self.send_sched(msg, true)
    }

    /// Like [`message_send`](Self::message_send), but when the destination
    /// peer already has queued frames, drain them synchronously first.
    pub fn message_send_blocking(&mut self, msg: Msg) -> Result<()> {
        let service = msg.data.service().to_owned();
        if let Some(Route::Remote(pid)) = dispatch::route_for(self, &service) {
            if msg.tcp {
                let sock = self.procs.get(pid).ok_or(Error::ProcessGone)?.sock;
                if self.net.queue_is_empty(sock) == Some(false) {
                    self.net.flush_blocking(sock)?;
                }
            }
        }
        self.send_sched(msg, true)
    }

    /// Internal send. `schedulable` is false when the message was just
    /// dispatched by a scheduler: its timestamp has been observed and must
    /// not be re-scheduled.
    pub(crate) fn send_sched(&mut self, msg: Msg, schedulable: bool) -> Result<()> {
        let service = msg.data.service().to_owned();
        match dispatch::route_for(self, &service) {
            None => {
                self.warn_drop(dispatch::DROP_NO_SERVICE, &msg.data);
                Err(Error::ServiceNotFound)
            }
            Some(Route::Remote(pid)) => self.send_remote(msg, pid),
            Some(Route::Bridge(b)) => {
                let mut cb = match self.bridges.get_mut(b).and_then(Option::take) {
                    Some(cb) => cb,
                    None => return Err(Error::ServiceNotFound),
                };
                cb(&msg.data, msg.tcp);
                if let Some(slot) = self.bridges.get_mut(b) {
                    *slot = Some(cb);
                }
                Ok(())
            }
            Some(Route::LocalTree) | Some(Route::LocalMethod(_)) => {
                let ts = msg.data.timestamp();
                if schedulable && ts > 0.0 && ts > self.gtsched.last_time {
                    return self.schedule_global(msg);
                }
                if self.reenter > 0 {
                    // a delivery is in progress; preserve arrival order
                    self.pending.push_back(msg);
                    return Ok(());
                }
                self.reenter += 1;
                dispatch::deliver(self, &msg.data, msg.tcp);
                self.reenter -= 1;
                Ok(())
            }
        }
    }

    /// Schedule on the global wheel; requires clock sync.
    pub(crate) fn schedule_global(&mut self, msg: Msg) -> Result<()> {
        let ts = msg.data.timestamp();
        if ts <= 0.0 || ts < self.gtsched.last_time {
            self.reenter += 1;
            dispatch::deliver(self, &msg.data, msg.tcp);
            self.reenter -= 1;
            return Ok(());
        }
        if !self.gtsched.started {
            self.warn_drop(dispatch::DROP_NO_CLOCK, &msg.data);
            return Err(Error::NoClock);
        }
        self.gtsched.insert(msg);
        Ok(())
    }

    /// Schedule on the local wheel (timers, pre-sync self-messages).
    pub(crate) fn schedule_local(&mut self, msg: Msg) {
        let ts = msg.data.timestamp();
        if ts <= 0.0 || ts < self.ltsched.last_time {
            self.reenter += 1;
            dispatch::deliver(self, &msg.data, msg.tcp);
            self.reenter -= 1;
            return;
        }
        self.ltsched.insert(msg);
    }

    fn send_remote(&mut self, msg: Msg, pid: crate::proc::ProcId) -> Result<()> {
        let (sock, udp_addr) = {
            let proc = self.procs.get(pid).ok_or(Error::ProcessGone)?;
            (proc.sock, proc.udp_addr)
        };
        let frame = msg.to_wire()?;
        if msg.tcp {
            self.net.enqueue(sock, frame)
        } else {
            match udp_addr {
                Some(addr) => {
                    self.net.send_udp(self.udp_send, addr, &frame);
                    Ok(())
                }
                None => {
                    debug!(service = msg.data.service(), "peer has no udp address yet");
                    Err(Error::ProcessGone)
                }
            }
        }
    }

    /// Send a control message straight to a peer's TCP stream, bypassing
    /// service resolution (the address names a handler on the receiving
    /// side, e.g. `!_o2/sv`).
    pub(crate) fn send_direct_tcp(&mut self, pid: crate::proc::ProcId, msg: Msg) -> Result<()> {
        let sock = self.procs.get(pid).ok_or(Error::ProcessGone)?.sock;
        let frame = msg.to_wire()?;
        self.net.enqueue(sock, frame)
    }

    /// Drain sends that arrived while a delivery was in progress.
    pub(crate) fn deliver_pending(&mut self) {
        while let Some(msg) = self.pending.pop_front() {
            let _ = self.send_sched(msg, true);
        }
    }

    /// Backpressure probe: `Ready` when a message to `service` would be
    /// handed to the kernel immediately, `Blocked` when earlier frames are
    /// still queued on the peer's stream.
    pub fn can_send(&self, service: &str) -> Result<CanSend> {
        match dispatch::route_for(self, service) {
            None => Err(Error::ServiceNotFound),
            Some(Route::Remote(pid)) => {
                let sock = self.procs.get(pid).ok_or(Error::ProcessGone)?.sock;
                match self.net.queue_is_empty(sock) {
                    Some(true) => Ok(CanSend::Ready),
                    Some(false) => Ok(CanSend::Blocked),
                    None => Err(Error::ProcessGone),
                }
            }
            Some(_) => Ok(CanSend::Ready),
        }
    }
}
