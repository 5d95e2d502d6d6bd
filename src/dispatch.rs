//! Local delivery: bundle splitting, service resolution, full-path and
//! tree dispatch, tap fan-out, and drop warnings.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::args::ArgReader;
use crate::ensemble::Ensemble;
use crate::error::Error;
use crate::message::{Msg, MsgData};
use crate::path::MethodEntry;
use crate::proc::ProcId;
use crate::services::{Provider, TapMode};

pub(crate) const DROP_NO_SERVICE: &str = "dropping message because service was not found";
pub(crate) const DROP_TYPE_MISMATCH: &str = "dropping message because of type mismatch";
pub(crate) const DROP_NO_HANDLER: &str = "dropping message because it has no handler";
pub(crate) const DROP_NO_CLOCK: &str =
    "dropping message because the global clock is not synchronized";
pub(crate) const DROP_HANDLER_FAILED: &str = "dropping message because its handler failed";
pub(crate) const DROP_HANDLER_PANIC: &str = "dropping message because its handler panicked";

/// Where a message is headed, resolved from its service name.
pub(crate) enum Route {
    LocalTree,
    LocalMethod(MethodEntry),
    Remote(ProcId),
    Bridge(usize),
}

/// Resolve the active provider for `service`. A name that begins with a
/// digit and is not in the directory is interpreted as a process name and
/// resolved by scanning the process list.
pub(crate) fn route_for(ens: &Ensemble, service: &str) -> Option<Route> {
    if let Some(entry) = ens.dir.find(service) {
        return match entry.active()? {
            Provider::Tree(_) => Some(Route::LocalTree),
            Provider::Method(m) => Some(Route::LocalMethod(m.clone())),
            Provider::Remote(pid) => Some(Route::Remote(*pid)),
            Provider::Bridge(b) => Some(Route::Bridge(*b)),
        };
    }
    if service.starts_with(|c: char| c.is_ascii_digit()) {
        if let Some(pid) = ens.procs.find_by_name(service) {
            return Some(Route::Remote(pid));
        }
    }
    None
}

/// Deliver a message locally and immediately, then fan out to taps.
pub(crate) fn deliver(ens: &mut Ensemble, msg: &MsgData, tcp: bool) {
    if msg.is_bundle() {
        deliver_embedded(ens, msg, tcp);
        return;
    }

    let service = msg.service().to_owned();
    let address = msg.address().to_owned();

    match route_for(ens, &service) {
        Some(Route::LocalMethod(m)) => call_method(ens, m, msg),
        Some(Route::LocalTree) => {
            let methods = if address.starts_with('!') {
                // a literal address: one full-path lookup
                let mut literal = String::with_capacity(address.len());
                literal.push('/');
                literal.push_str(&address[1..]);
                match ens.dir.full_paths.get_str(&literal) {
                    Some(m) => vec![m.clone()],
                    None => Vec::new(),
                }
            } else {
                let mut found = Vec::new();
                if let Some(rest) = address[1..].split_once('/').map(|(_, r)| r) {
                    if let Some(entry) = ens.dir.find(&service) {
                        if let Some(Provider::Tree(root)) = entry.active() {
                            root.collect_matches(rest, &mut found);
                        }
                    }
                }
                found
            };
            if methods.is_empty() {
                ens.warn_drop(DROP_NO_HANDLER, msg);
            }
            for m in methods {
                call_method(ens, m, msg);
            }
        }
        // the caller routes remote and bridge traffic before delivery; a
        // residual case here means the directory changed underneath us
        Some(Route::Remote(_)) | Some(Route::Bridge(_)) => {
            debug!(%service, "service moved during delivery, dropped");
        }
        None => ens.warn_drop(DROP_NO_SERVICE, msg),
    }

    fan_out_taps(ens, &service, msg, tcp);
}

/// Split a bundle: each element becomes its own message inheriting the
/// outer transport class, re-entering the send path so remote-addressed
/// elements route correctly.
pub(crate) fn deliver_embedded(ens: &mut Ensemble, msg: &MsgData, tcp: bool) {
    let elements: Vec<_> = msg.bundle_elements().collect();
    for elem in elements {
        match elem {
            Ok(data) => {
                let _ = ens.send_sched(Msg { tcp, data }, true);
            }
            Err(_) => {
                ens.warn_drop("dropping malformed bundle element", msg);
                return;
            }
        }
    }
}

fn fan_out_taps(ens: &mut Ensemble, service: &str, msg: &MsgData, tcp: bool) {
    let taps: Vec<(String, TapMode)> = match ens.dir.find(service) {
        Some(entry) => entry
            .taps
            .iter()
            .map(|t| (t.tapper.clone(), t.mode))
            .collect(),
        None => return,
    };
    for (tapper, mode) in taps {
        let data = retarget(msg, &tapper);
        let tcp = match mode {
            TapMode::Keep => tcp,
            TapMode::Reliable => true,
            TapMode::Best => false,
        };
        let _ = ens.send_sched(Msg { tcp, data }, false);
    }
}

/// Copy `msg` with the service name in its address replaced by `tapper`.
pub(crate) fn retarget(msg: &MsgData, tapper: &str) -> MsgData {
    let addr = msg.address();
    let prefix = addr.as_bytes().first().copied().unwrap_or(b'/') as char;
    let rest = addr[1..].find('/').map(|i| &addr[1 + i..]).unwrap_or("");
    let new_addr = format!("{prefix}{tapper}{rest}");

    let old_padded = crate::key::padded_len(addr);
    let new_padded = crate::key::padded_len(&new_addr);
    let old = msg.as_bytes();
    let mut bytes = Vec::with_capacity(old.len() - old_padded + new_padded);
    bytes.extend_from_slice(&old[..8]);
    let a = bytes.len();
    bytes.resize(a + new_padded, 0);
    bytes[a..a + new_addr.len()].copy_from_slice(new_addr.as_bytes());
    bytes.extend_from_slice(&old[8 + old_padded..]);
    MsgData::from_bytes(bytes)
}

/// Type-check against the handler's typespec, then invoke it. A handler
/// failure or panic becomes a drop warning; it never unwinds the poll loop.
pub(crate) fn call_method(ens: &mut Ensemble, method: MethodEntry, msg: &MsgData) {
    if let Some(spec) = &method.typespec {
        if !method.coerce && msg.types() != spec.as_str() {
            ens.warn_drop(DROP_TYPE_MISMATCH, msg);
            return;
        }
    }
    let mut reader = ArgReader::new(msg);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        (method.handler)(ens, msg, &mut reader)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(Error::TypeMismatch)) => ens.warn_drop(DROP_TYPE_MISMATCH, msg),
        Ok(Err(e)) => {
            debug!(error = %e, address = msg.address(), "handler returned error");
            ens.warn_drop(DROP_HANDLER_FAILED, msg);
        }
        Err(_) => {
            warn!(address = msg.address(), "handler panicked");
            ens.warn_drop(DROP_HANDLER_PANIC, msg);
        }
    }
}
