//! Timestamped message scheduling: a timing wheel of 128 bins, 10 ms each.
//!
//! `bin(t) = floor(t * 100)`; a bin holds a time-ordered list of messages.
//! Dispatch scans bins from the last visited one up to the current time's
//! bin. If time has jumped more than one second, the scan advances in one
//! second steps so the wheel cannot wrap around and reorder messages. After
//! each pass the cursor rewinds one bin, because the current bin may still
//! hold messages with timestamps later in the same 10 ms window.

use crate::message::Msg;

pub(crate) const SCHED_TABLE_LEN: usize = 128;

pub(crate) struct Wheel {
    bins: Vec<Vec<Msg>>,
    pub last_bin: i64,
    pub last_time: f64,
    pub started: bool,
}

fn bin_of(t: f64) -> i64 {
    (t * 100.0).floor() as i64
}

fn index_of(b: i64) -> usize {
    (b & (SCHED_TABLE_LEN as i64 - 1)) as usize
}

impl Wheel {
    pub fn new() -> Wheel {
        let mut bins = Vec::with_capacity(SCHED_TABLE_LEN);
        bins.resize_with(SCHED_TABLE_LEN, Vec::new);
        Wheel {
            bins,
            last_bin: 0,
            last_time: 0.0,
            started: false,
        }
    }

    pub fn start(&mut self, t: f64) {
        for b in &mut self.bins {
            b.clear();
        }
        self.last_bin = bin_of(t);
        self.last_time = t;
        self.started = true;
    }

    pub fn clear(&mut self) {
        for b in &mut self.bins {
            b.clear();
        }
        self.started = false;
    }

    /// Splice `msg` into its bin, keeping the bin sorted by timestamp with
    /// ties in insertion order. The caller has already ruled out past
    /// timestamps.
    pub fn insert(&mut self, msg: Msg) {
        let ts = msg.data.timestamp();
        let bin = &mut self.bins[index_of(bin_of(ts))];
        let at = bin.partition_point(|m| m.data.timestamp() <= ts);
        bin.insert(at, msg);
    }

    /// Remove and return the next message due at or before `now`, advancing
    /// the wheel cursor. Returns `None` once everything due has been
    /// dispatched; the caller re-enters the send path per message, which may
    /// insert new messages mid-scan.
    pub fn pop_due(&mut self, now: f64) -> Option<Msg> {
        if !self.started {
            return None;
        }
        loop {
            // bound each pass to one second so the scan never laps the wheel
            let run_until = if self.last_time + 1.0 < now {
                self.last_time + 1.0
            } else {
                now
            };
            let target = bin_of(run_until);
            while self.last_bin <= target {
                let bin = &mut self.bins[index_of(self.last_bin)];
                if let Some(first) = bin.first() {
                    if first.data.timestamp() <= run_until {
                        return Some(bin.remove(0));
                    }
                }
                self.last_bin += 1;
            }
            self.last_bin = target; // revisit the current bin next pass
            self.last_time = run_until;
            if run_until >= now {
                return None;
            }
        }
    }

    #[cfg(test)]
    fn scheduled_count(&self) -> usize {
        self.bins.iter().map(Vec::len).sum()
    }
}
