//! Ensemble clock synchronization.
//!
//! One process calls [`crate::Ensemble::clock_set`] and becomes the
//! reference; it creates the `_cs` service and answers pings with the
//! ensemble time. Every other process pings `/_cs/get`, keeps the five most
//! recent round trips, and once the ring is full adopts the offset whose
//! round trip was smallest. Later samples adjust the local-to-global
//! mapping by rate-limited slewing: at most 10% fast or slow, with a
//! scheduled catch-up callback restoring rate 1.0, guarded by a generation
//! id so a newer adjustment cancels older restores. A follower more than a
//! second ahead freezes its clock until the reference catches up; more than
//! a second behind, it jumps.

use tracing::{debug, info};

use crate::args::Arg;
use crate::ensemble::Ensemble;
use crate::error::{Result, Status};
use crate::message::{Msg, MsgData};

pub(crate) const CLOCK_SYNC_HISTORY_LEN: usize = 5;

pub(crate) struct ClockSync {
    pub is_ref: bool,
    pub synced: bool,
    local_time_base: f64,
    global_time_base: f64,
    rate: f64,
    /// Generation id for pending rate-restore callbacks.
    rate_id: i32,
    found_cs: bool,
    handlers_installed: bool,
    start_sync_time: f64,
    ping_id: i32,
    ping_send_time: f64,
    pub reply_to: String,
    count: usize,
    rtts: [f64; CLOCK_SYNC_HISTORY_LEN],
    offsets: [f64; CLOCK_SYNC_HISTORY_LEN],
    pub mean_rtt: f64,
    pub min_rtt: f64,
}

impl ClockSync {
    pub fn new() -> ClockSync {
        ClockSync {
            is_ref: false,
            synced: false,
            local_time_base: 0.0,
            global_time_base: -1.0,
            rate: 0.0,
            rate_id: 0,
            found_cs: false,
            handlers_installed: false,
            start_sync_time: 0.0,
            ping_id: 0,
            ping_send_time: 0.0,
            reply_to: String::new(),
            count: 0,
            rtts: [0.0; CLOCK_SYNC_HISTORY_LEN],
            offsets: [0.0; CLOCK_SYNC_HISTORY_LEN],
            mean_rtt: 0.0,
            min_rtt: 0.0,
        }
    }

    /// Estimate ensemble time for a local time, using the tracked mapping.
    pub fn local_to_global(&self, local: f64) -> f64 {
        if self.is_ref {
            local
        } else {
            self.global_time_base + (local - self.local_time_base) * self.rate
        }
    }

    /// Record a ping sample; returns the best offset once the ring is full.
    fn add_sample(&mut self, rtt: f64, offset: f64) -> Option<f64> {
        let i = self.count % CLOCK_SYNC_HISTORY_LEN;
        self.rtts[i] = rtt;
        self.offsets[i] = offset;
        self.count += 1;
        if self.count < CLOCK_SYNC_HISTORY_LEN {
            return None;
        }
        let mut best = 0;
        let mut mean = 0.0;
        for j in 0..CLOCK_SYNC_HISTORY_LEN {
            mean += self.rtts[j];
            if self.rtts[j] < self.rtts[best] {
                best = j;
            }
        }
        self.mean_rtt = mean / CLOCK_SYNC_HISTORY_LEN as f64;
        self.min_rtt = self.rtts[best];
        Some(self.offsets[best])
    }

    /// Apply a new reference estimate at `local_now`. Returns the delay
    /// after which a rate-restore callback should run, if one is needed.
    fn adjust(&mut self, local_now: f64, new_global: f64) -> Option<f64> {
        self.global_time_base = self.local_to_global(local_now);
        self.local_time_base = local_now;
        let advance = new_global - self.global_time_base;
        self.rate_id += 1; // cancel any pending restore
        if advance > 1.0 {
            // way behind: jump
            self.rate = 1.0;
            self.global_time_base = new_global;
            None
        } else if advance > 0.0 {
            self.rate = 1.1;
            Some(advance * 10.0)
        } else if advance > -1.0 {
            self.rate = 0.9;
            Some(-advance * 10.0)
        } else {
            // way ahead: stand still until the reference catches up
            self.rate = 0.0;
            None
        }
    }
}

// ------------------------------------------------------------ ensemble ops

impl Ensemble {
    /// Become the ensemble's clock reference: export the `_cs` service,
    /// start the global scheduler, and announce synchronization. Local time
    /// (from the configured time provider) becomes ensemble time.
    pub fn clock_set(&mut self) -> Result<()> {
        if self.clock.is_ref {
            return Ok(());
        }
        let now = self.local_time();
        self.clock.is_ref = true;
        clock_synchronized(self, now, now);
        self.service_new("_cs")?;
        self.method_new("/_cs/get", Some("is"), false, cs_get_handler)?;
        info!(time = now, "established as clock reference");
        Ok(())
    }

    /// Ensemble time, available once synchronized.
    pub fn time_get(&self) -> Result<f64> {
        if !self.clock.synced {
            return Err(crate::error::Error::NoClock);
        }
        Ok(self.clock.local_to_global(self.local_time()))
    }

    /// Mean and minimum clock-ping round trips, once synchronized.
    pub fn roundtrip(&self) -> Result<(f64, f64)> {
        if !self.clock.synced {
            return Err(crate::error::Error::NoClock);
        }
        Ok((self.clock.mean_rtt, self.clock.min_rtt))
    }
}

/// First lock: fix the mapping, start the global scheduler, tell every peer,
/// and report newly synchronized services.
pub(crate) fn clock_synchronized(ens: &mut Ensemble, local: f64, global: f64) {
    if ens.clock.synced {
        return;
    }
    ens.clock.synced = true;
    ens.gtsched.start(global);
    if !ens.clock.is_ref {
        ens.clock.local_time_base = local;
        ens.clock.global_time_base = global;
        ens.clock.rate = 1.0;
    }
    announce_synchronized(ens);
    debug!(global, "clock synchronized");
}

fn announce_synchronized(ens: &mut Ensemble) {
    let own = ens.proc_name.clone();
    for pid in ens.procs.ids() {
        if let Ok(msg) = Msg::build("!_o2/cs/cs", 0.0, true, &[Arg::Str(own.clone())]) {
            let _ = ens.send_direct_tcp(pid, msg);
        }
        if ens.procs.get(pid).is_some_and(|p| p.synced) {
            clock_status_change(ens, Some(pid), Status::Remote);
        }
    }
    clock_status_change(ens, None, Status::Local);
}

/// Report a status change for every service whose active provider belongs
/// to `owner` (`None` = this process).
pub(crate) fn clock_status_change(ens: &mut Ensemble, owner: Option<crate::proc::ProcId>, status: Status) {
    if !ens.clock.synced {
        return;
    }
    let mut updates: Vec<(String, String, String)> = Vec::new();
    for (key, entry) in ens.dir.services.iter() {
        let service = key.as_str();
        if service.starts_with(|c: char| c.is_ascii_digit()) {
            continue; // process-name services are not reported
        }
        let active_owned = match (entry.active(), owner) {
            (Some(p), None) if p.is_local() => true,
            (Some(crate::services::Provider::Remote(pid)), Some(o)) => *pid == o,
            _ => false,
        };
        if !active_owned {
            continue;
        }
        let (name, props) = match owner {
            None => (
                ens.proc_name.clone(),
                ens.local_service_properties(service).unwrap_or_default(),
            ),
            Some(o) => match ens.procs.get(o) {
                Some(p) => (
                    p.name.as_str().to_owned(),
                    p.services
                        .iter()
                        .find(|s| s.service == service)
                        .map(|s| s.properties.clone())
                        .unwrap_or_default(),
                ),
                None => continue,
            },
        };
        updates.push((service.to_owned(), name, props));
    }
    for (service, proc_name, props) in updates {
        ens.send_si(&service, status.to_i32(), &proc_name, &props);
    }
}

// ---------------------------------------------------------------- handlers

/// `/_o2/ps`: the self-scheduled ping timer. Watches for the `_cs` service,
/// sends pings at the protocol cadence, and reschedules itself.
pub(crate) fn ps_handler(
    ens: &mut Ensemble,
    _msg: &MsgData,
    _args: &mut crate::args::ArgReader<'_>,
) -> Result<()> {
    if ens.clock.is_ref {
        ens.clock.synced = true;
        return Ok(()); // the reference does not ping
    }
    let now = ens.local_time();
    ens.clock.ping_send_time = now;
    let status = ens.status("_cs").ok();
    if !ens.clock.found_cs {
        if status.is_some() {
            ens.clock.found_cs = true;
            ens.clock.start_sync_time = now;
            if !ens.clock.handlers_installed {
                ens.clock.handlers_installed = true;
                let name = ens.proc_name.clone();
                ens.method_new(
                    &format!("/{name}/cs/get-reply"),
                    Some("it"),
                    false,
                    cs_reply_handler,
                )?;
                ens.method_new(&format!("/{name}/cs/rt"), Some("s"), false, rt_handler)?;
                ens.clock.reply_to = format!("!{name}/cs");
            }
        }
    } else if status.is_none() {
        // lost the clock service; resume looking for it
        ens.clock.found_cs = false;
    }
    let mut when = now + 0.1;
    if ens.clock.found_cs {
        ens.clock.ping_id += 1;
        let id = ens.clock.ping_id;
        let reply_to = ens.clock.reply_to.clone();
        let _ = ens.send("!_cs/get", 0.0, &[Arg::Int32(id), Arg::Str(reply_to)]);
        // every 0.1 s for the first burst, then 0.5 s until 5 s in, then 10 s
        let elapsed = now - ens.clock.start_sync_time;
        if elapsed > CLOCK_SYNC_HISTORY_LEN as f64 * 0.1 - 0.01 {
            when += 0.4;
        }
        if elapsed > 5.0 {
            when += 9.5;
        }
    }
    schedule_ping(ens, when);
    Ok(())
}

pub(crate) fn schedule_ping(ens: &mut Ensemble, when: f64) {
    if let Ok(msg) = Msg::build("!_o2/ps", when, false, &[]) {
        ens.schedule_local(msg);
    }
}

/// `/_cs/get` on the reference: reply with the serial number and the
/// ensemble time at `<reply-prefix>/get-reply`.
fn cs_get_handler(
    ens: &mut Ensemble,
    _msg: &MsgData,
    args: &mut crate::args::ArgReader<'_>,
) -> Result<()> {
    let serial = args.get_i32()?;
    let reply_to = args.get_str()?;
    if reply_to.len() > 1000 {
        return Ok(()); // ignore absurd reply addresses
    }
    let t = ens.time_get().unwrap_or(0.0);
    let addr = format!("{reply_to}/get-reply");
    let _ = ens.send(&addr, 0.0, &[Arg::Int32(serial), Arg::Time(t)]);
    Ok(())
}

/// `/<name>/cs/get-reply` on a follower: fold the sample into the filter
/// and adjust or lock the clock.
fn cs_reply_handler(
    ens: &mut Ensemble,
    _msg: &MsgData,
    args: &mut crate::args::ArgReader<'_>,
) -> Result<()> {
    let id = args.get_i32()?;
    if id != ens.clock.ping_id {
        return Ok(()); // stale reply
    }
    let ref_time = args.get_time()?;
    let now = ens.local_time();
    let rtt = now - ens.clock.ping_send_time;
    // estimate the reference's current time as its reply plus half the trip
    let est = ref_time + rtt * 0.5;
    debug!(ref_time, rtt, "clock reply");
    if let Some(offset) = ens.clock.add_sample(rtt, est - now) {
        let new_global = now + offset;
        if !ens.clock.synced {
            clock_synchronized(ens, now, new_global);
        } else {
            if let Some(delay) = ens.clock.adjust(now, new_global) {
                will_catch_up_after(ens, delay);
            }
            debug!(rate = ens.clock.rate, "clock adjusted");
        }
    }
    Ok(())
}

/// Schedule the `/_o2/cu` rate-restore callback on local time.
fn will_catch_up_after(ens: &mut Ensemble, delay: f64) {
    let at = ens.clock.local_time_base + delay;
    let id = ens.clock.rate_id;
    if let Ok(msg) = Msg::build("!_o2/cu", at, false, &[Arg::Int32(id)]) {
        ens.schedule_local(msg);
    }
}

/// `/_o2/cu`: restore rate 1.0 if this callback has not been superseded.
pub(crate) fn cu_handler(
    ens: &mut Ensemble,
    msg: &MsgData,
    args: &mut crate::args::ArgReader<'_>,
) -> Result<()> {
    let id = args.get_i32()?;
    if id != ens.clock.rate_id {
        return Ok(()); // superseded by a newer adjustment
    }
    let t = msg.timestamp();
    ens.clock.global_time_base = ens.clock.local_to_global(t);
    ens.clock.local_time_base = t;
    ens.clock.rate = 1.0;
    Ok(())
}

/// `/_o2/cs/cs`: a peer announces it has synchronized.
pub(crate) fn cs_announce_handler(
    ens: &mut Ensemble,
    _msg: &MsgData,
    args: &mut crate::args::ArgReader<'_>,
) -> Result<()> {
    let name = args.get_str()?;
    if let Some(pid) = ens.procs.find_by_name(&name) {
        if let Some(p) = ens.procs.get_mut(pid) {
            p.synced = true;
        }
        clock_status_change(ens, Some(pid), Status::Remote);
    }
    Ok(())
}

/// `/<name>/cs/rt`: answer a round-trip statistics query.
fn rt_handler(
    ens: &mut Ensemble,
    _msg: &MsgData,
    args: &mut crate::args::ArgReader<'_>,
) -> Result<()> {
    let reply_to = args.get_str()?;
    if reply_to.len() > 1000 {
        return Ok(());
    }
    let addr = format!("{reply_to}/get-reply");
    let name = ens.proc_name.clone();
    let (mean, min) = (ens.clock.mean_rtt, ens.clock.min_rtt);
    let _ = ens.send(
        &addr,
        0.0,
        &[
            Arg::Str(name),
            Arg::Float(mean as f32),
            Arg::Float(min as f32),
        ],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_ignores_until_ring_fills() {
        let mut c = ClockSync::new();
        for i in 0..CLOCK_SYNC_HISTORY_LEN - 1 {
            assert!(c.add_sample(0.01, 5.0 + i as f64).is_none());
        }
        assert!(c.add_sample(0.01, 9.0).is_some());
    }

    #[test]
    fn filter_picks_min_rtt_offset() {
        let mut c = ClockSync::new();
        c.add_sample(0.030, 100.0);
        c.add_sample(0.020, 200.0);
        c.add_sample(0.005, 300.0); // fastest round trip
        c.add_sample(0.040, 400.0);
        let offset = c.add_sample(0.050, 500.0).unwrap();
        assert_eq!(offset, 300.0);
        assert_eq!(c.min_rtt, 0.005);
    }

    #[test]
    fn adjust_small_advance_speeds_up() {
        let mut c = ClockSync::new();
        c.local_time_base = 100.0;
        c.global_time_base = 100.0;
        c.rate = 1.0;
        let delay = c.adjust(101.0, 101.3);
        assert_eq!(c.rate, 1.1);
        // advance 0.3 -> catch up over 3 seconds
        assert!((delay.unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn adjust_small_lag_slows_down() {
        let mut c = ClockSync::new();
        c.local_time_base = 100.0;
        c.global_time_base = 100.0;
        c.rate = 1.0;
        let delay = c.adjust(101.0, 100.5);
        assert_eq!(c.rate, 0.9);
        assert!((delay.unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn adjust_big_jump_and_freeze() {
        let mut c = ClockSync::new();
        c.local_time_base = 0.0;
        c.global_time_base = 0.0;
        c.rate = 1.0;
        assert!(c.adjust(1.0, 10.0).is_none());
        assert_eq!(c.rate, 1.0);
        assert_eq!(c.local_to_global(1.0), 10.0);

        assert!(c.adjust(2.0, 2.0).is_none());
        assert_eq!(c.rate, 0.0);
        // time stands still while frozen
        assert_eq!(c.local_to_global(2.0), c.local_to_global(50.0));
    }

    #[test]
    fn rate_id_cancels_older_restores() {
        let mut c = ClockSync::new();
        c.rate = 1.0;
        let before = c.rate_id;
        c.adjust(1.0, 1.5);
        assert_eq!(c.rate_id, before + 1);
        c.adjust(2.0, 2.5);
        assert_eq!(c.rate_id, before + 2);
    }
}
