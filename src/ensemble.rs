//! The ensemble handle: process identity, public API, and the poll loop
//! that everything else runs inside.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mio::Token;
use tracing::{debug, info, trace, warn};

use crate::args::{Arg, ArgReader};
use crate::builder::MsgBuilder;
use crate::clock::{self, ClockSync};
use crate::discovery::{self, Discovery, PORT_LIST};
use crate::error::{Error, Result, Status, STATUS_GONE};
use crate::handoff::{HandoffStack, Injector};
use crate::key::Key;
use crate::message::{Msg, MsgData};
use crate::net::{NetEvent, NetPoller};
use crate::path::{collect_full_paths, MethodEntry, PathNode};
use crate::proc::{ProcId, ProcService, ProcTap, Procs};
use crate::sched::Wheel;
use crate::services::{self, Directory, Provider, ServiceTap, TapMode};
use crate::time::{SystemTimeProvider, TimeProvider};

/// Longest accepted service name.
pub(crate) const MAX_SERVICE_LEN: usize = 64;

/// Startup options. `Ensemble::join` covers the defaults.
pub struct Options {
    name: String,
    discovery: bool,
    discovery_period: f64,
    time: Option<Arc<dyn TimeProvider>>,
}

impl Options {
    pub fn new(ensemble_name: &str) -> Options {
        Options {
            name: ensemble_name.to_owned(),
            discovery: true,
            discovery_period: discovery::DEFAULT_PERIOD,
            time: None,
        }
    }

    /// Disable or enable UDP broadcast discovery (it is enabled by
    /// default; `hub` disables it at runtime).
    pub fn discovery(mut self, enabled: bool) -> Options {
        self.discovery = enabled;
        self
    }

    /// Cap for the discovery broadcast period, seconds.
    pub fn discovery_period(mut self, period: f64) -> Options {
        self.discovery_period = period.max(0.1);
        self
    }

    /// Replace the local time source (deterministic tests, audio clocks).
    pub fn time_provider(mut self, tp: Arc<dyn TimeProvider>) -> Options {
        self.time = Some(tp);
        self
    }

    pub fn build(self) -> Result<Ensemble> {
        Ensemble::from_options(self)
    }
}

/// One row of a [`Ensemble::services_list`] snapshot.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub service: String,
    pub kind: ServiceKind,
    /// Name of the process providing the service (or asserting the tap).
    pub process: String,
    pub properties: String,
    pub tapper: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Local,
    Remote,
    Tap,
}

/// A process's membership in a named ensemble.
///
/// All activity is cooperative: nothing happens outside [`poll`](Self::poll)
/// (or [`run`](Self::run), which calls it). Handlers run on the polling
/// thread and may send; sends issued while a delivery is in progress are
/// queued and drained when the outermost delivery returns.
pub struct Ensemble {
    name: String,
    time: Arc<dyn TimeProvider>,
    pub(crate) net: NetPoller,
    pub(crate) procs: Procs,
    pub(crate) dir: Directory,
    pub(crate) ltsched: Wheel,
    pub(crate) gtsched: Wheel,
    pub(crate) clock: ClockSync,
    pub(crate) disc: Discovery,
    pub(crate) builder: MsgBuilder,
    pub(crate) local_now: f64,
    pub(crate) global_now: f64,
    pub(crate) reenter: u32,
    pub(crate) pending: VecDeque<Msg>,
    inbox: Arc<HandoffStack>,
    /// Socket that produced the message currently being delivered.
    pub(crate) message_source: Option<Token>,
    drop_warning: Option<Box<dyn FnMut(&str, &MsgData)>>,
    pub(crate) bridges: Vec<Option<Box<dyn FnMut(&MsgData, bool)>>>,
    /// `pubIP:localIP:tcpPort`, fixed once the listener is bound.
    pub(crate) proc_name: String,
    pub(crate) local_ip: Ipv4Addr,
    pub(crate) local_services: Vec<ProcService>,
    pub(crate) local_taps: Vec<ProcTap>,
    pub(crate) udp_recv: Token,
    pub(crate) udp_send: Token,
    pub(crate) listener: Token,
    pub(crate) tcp_port: u16,
    pub(crate) udp_port: u16,
    stop: bool,
}

impl Ensemble {
    /// Join `ensemble_name` with default options.
    pub fn join(ensemble_name: &str) -> Result<Ensemble> {
        Options::new(ensemble_name).build()
    }

    fn from_options(opts: Options) -> Result<Ensemble> {
        if opts.name.is_empty() || opts.name.len() > MAX_SERVICE_LEN {
            return Err(Error::BadName);
        }
        let mut net = NetPoller::new()?;
        let udp_send = net.udp_send_new()?;
        let (listener, tcp_port) = net.tcp_listen_new()?;

        // claim the first free discovery port; its index caps our
        // broadcast fan-out
        let mut claimed = None;
        for (i, &port) in PORT_LIST.iter().enumerate() {
            match net.udp_recv_new(port) {
                Ok(token) => {
                    claimed = Some((i, port, token));
                    break;
                }
                Err(e) => trace!(port, error = %e, "discovery port taken"),
            }
        }
        let Some((port_index, udp_port, udp_recv)) = claimed else {
            return Err(Error::NoPort);
        };

        let local_ip = detect_local_ip();
        let proc_name = format!(
            "00000000:{}:{}",
            discovery::ip_to_hex(local_ip),
            tcp_port
        );
        info!(
            name = %proc_name,
            ensemble = %opts.name,
            udp_port,
            "joining ensemble"
        );

        let time = opts
            .time
            .unwrap_or_else(|| Arc::new(SystemTimeProvider::new()));
        let mut disc = Discovery::new(opts.discovery);
        disc.port_index = port_index;
        disc.period = opts.discovery_period;

        let mut ens = Ensemble {
            name: opts.name,
            time,
            net,
            procs: Procs::new(),
            dir: Directory::new(),
            ltsched: Wheel::new(),
            gtsched: Wheel::new(),
            clock: ClockSync::new(),
            disc,
            builder: MsgBuilder::new(),
            local_now: 0.0,
            global_now: -1.0,
            reenter: 0,
            pending: VecDeque::new(),
            inbox: Arc::new(HandoffStack::new()),
            message_source: None,
            drop_warning: None,
            bridges: Vec::new(),
            proc_name,
            local_ip,
            local_services: Vec::new(),
            local_taps: Vec::new(),
            udp_recv,
            udp_send,
            listener,
            tcp_port,
            udp_port,
            stop: false,
        };

        ens.local_now = ens.time.now();
        ens.ltsched.start(ens.local_now);

        ens.internal_service_new("_o2")?;
        let own = ens.proc_name.clone();
        ens.internal_service_new(&own)?;

        ens.method_new("/_o2/dy", Some("sssiii"), false, discovery::dy_handler)?;
        ens.method_new("/_o2/sv", None, false, discovery::sv_handler)?;
        ens.method_new("/_o2/ds", None, false, discovery::ds_handler)?;
        ens.method_new("/_o2/hub", None, false, discovery::hub_handler)?;
        ens.method_new("/_o2/ps", None, false, clock::ps_handler)?;
        ens.method_new("/_o2/cu", Some("i"), false, clock::cu_handler)?;
        ens.method_new("/_o2/cs/cs", Some("s"), false, clock::cs_announce_handler)?;

        // leave the first instant to the caller (e.g. a hub() call) before
        // any broadcast goes out
        let t0 = ens.local_now + 0.01;
        if ens.disc.enabled {
            discovery::schedule_discovery_send(&mut ens, t0);
        }
        clock::schedule_ping(&mut ens, t0);
        Ok(ens)
    }

    // ------------------------------------------------------------- identity

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This process's name: `pubIP:localIP:tcpPort` (IPs in 8-hex-digit
    /// form; the public field is zero until something like STUN fills it).
    pub fn process_name(&self) -> &str {
        &self.proc_name
    }

    pub fn local_tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn version(&self) -> &'static str {
        crate::VERSION
    }

    /// Local (unsynchronized) time from the configured provider.
    pub fn local_time(&self) -> f64 {
        self.time.now()
    }

    /// Cloneable handle for injecting messages from other threads.
    pub fn injector(&self) -> Injector {
        Injector::new(self.inbox.clone())
    }

    /// Install the routing-failure callback: invoked with a short reason
    /// string and the dropped message.
    pub fn set_drop_warning(&mut self, cb: impl FnMut(&str, &MsgData) + 'static) {
        self.drop_warning = Some(Box::new(cb));
    }

    pub(crate) fn warn_drop(&mut self, why: &str, msg: &MsgData) {
        warn!(address = msg.address(), why, "dropping message");
        if let Some(cb) = self.drop_warning.as_mut() {
            cb(why, msg);
        }
    }

    // ----------------------------------------------------------------- poll

    /// One cooperative cycle: update the clocks, dispatch due scheduled
    /// messages, process socket readiness, drain injected messages, and
    /// deliver anything queued by re-entrant sends.
    pub fn poll(&mut self) -> Result<()> {
        self.local_now = self.time.now();
        self.global_now = if self.clock.synced {
            self.clock.local_to_global(self.local_now)
        } else {
            -1.0
        };

        while let Some(m) = self.ltsched.pop_due(self.local_now) {
            let _ = self.send_sched(m, false);
        }
        if self.gtsched.started {
            self.global_now = if self.clock.synced {
                self.clock.local_to_global(self.time.now())
            } else {
                -1.0
            };
            let now = self.global_now;
            while let Some(m) = self.gtsched.pop_due(now) {
                let _ = self.send_sched(m, false);
            }
        }

        self.net.poll_io(Duration::ZERO)?;
        while let Some(ev) = self.net.next_event() {
            self.handle_net_event(ev);
        }

        for m in self.inbox.grab() {
            let _ = self.send_sched(m, true);
        }

        self.deliver_pending();
        Ok(())
    }

    /// Poll at roughly `rate_hz` until [`stop`](Self::stop) is called.
    pub fn run(&mut self, rate_hz: u32) -> Result<()> {
        let rate = if rate_hz == 0 { 1000 } else { rate_hz };
        let sleep = Duration::from_micros(1_000_000 / rate as u64);
        self.stop = false;
        while !self.stop {
            self.poll()?;
            std::thread::sleep(sleep);
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    fn handle_net_event(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::Received { token, frame } => match Msg::from_wire(&frame) {
                Ok(msg) => {
                    self.message_source = Some(token);
                    let _ = self.send_sched(msg, true);
                    self.message_source = None;
                }
                Err(_) => debug!(token = token.0, "malformed frame dropped"),
            },
            NetEvent::Accepted { conn, addr, .. } => {
                trace!(conn = conn.0, %addr, "connection accepted; awaiting hello");
            }
            NetEvent::Connected { token } => {
                trace!(token = token.0, "outgoing connection established");
            }
            NetEvent::Closed { token } => self.on_socket_closed(token),
        }
    }

    fn on_socket_closed(&mut self, token: Token) {
        if token == self.listener || token == self.udp_recv {
            // only happens at shutdown, or if the network stack failed out
            // from under us
            warn!(token = token.0, "core socket closed");
            return;
        }
        if let Some(pid) = self.procs.find_by_sock(token) {
            self.teardown_proc(pid);
        }
    }

    /// A peer's TCP channel went away: remove every service it provided,
    /// every tap it asserted, and finally the process record itself.
    fn teardown_proc(&mut self, pid: ProcId) {
        let Some(entry) = self.procs.get(pid) else {
            return;
        };
        let name = entry.name.as_str().to_owned();
        let services: Vec<ProcService> = entry.services.iter().cloned().collect();
        let taps: Vec<ProcTap> = entry.taps.iter().cloned().collect();
        for s in services {
            let _ = self.remove_provider(&s.service, Some(pid));
        }
        for t in taps {
            let _ = self.remove_tap_entry(&t.tappee, &t.tapper, Some(pid));
        }
        if !name.is_empty() {
            // the process-name pseudo-service
            let _ = self.remove_provider(&name, Some(pid));
        }
        self.procs.free(pid);
        if self.disc.hub_name.as_deref() == Some(name.as_str()) {
            self.disc.hub_name = None;
        }
        info!(peer = %name, "peer disconnected");
    }

    // ------------------------------------------------------------- services

    /// Offer a service from this process. The new provider becomes active
    /// if its (our) process name is the greatest among providers.
    pub fn service_new(&mut self, service: &str) -> Result<()> {
        check_service_name(service)?;
        if self.local_services.iter().any(|s| s.service == service) {
            return Err(Error::ServiceConflict);
        }
        self.install_local_provider(service, Provider::Tree(PathNode::new()))?;
        self.local_services.push(ProcService {
            service: service.to_owned(),
            properties: String::new(),
        });
        self.notify_others(service, true, true, "", TapMode::Keep);
        Ok(())
    }

    /// A service for internal plumbing: not announced, not listed.
    pub(crate) fn internal_service_new(&mut self, service: &str) -> Result<()> {
        self.install_local_provider(service, Provider::Tree(PathNode::new()))
    }

    fn install_local_provider(&mut self, service: &str, provider: Provider) -> Result<()> {
        let entry = self.dir.must_get(service);
        if entry.providers.iter().any(|p| p.is_ours()) {
            return Err(Error::ServiceConflict);
        }
        entry.providers.push(provider);
        self.reorder_providers(service);
        self.announce_active(service);
        Ok(())
    }

    /// Withdraw a locally offered service; drops its handler tree.
    pub fn service_free(&mut self, service: &str) -> Result<()> {
        check_service_name(service)?;
        if !self.local_services.iter().any(|s| s.service == service) {
            return Err(Error::ServiceNotFound);
        }
        self.remove_provider(service, None)
    }

    /// Register `cb` as the provider of `service` over a non-IP transport.
    /// Every message routed to the service is handed to the callback with
    /// its transport hint.
    pub fn bridge_new(
        &mut self,
        service: &str,
        cb: Box<dyn FnMut(&MsgData, bool)>,
    ) -> Result<usize> {
        check_service_name(service)?;
        if self.local_services.iter().any(|s| s.service == service) {
            return Err(Error::ServiceConflict);
        }
        let id = self.bridges.len();
        self.bridges.push(Some(cb));
        self.install_local_provider(service, Provider::Bridge(id))?;
        self.local_services.push(ProcService {
            service: service.to_owned(),
            properties: String::new(),
        });
        self.notify_others(service, true, true, "", TapMode::Keep);
        Ok(id)
    }

    /// Install a handler. `path` is `/service` (handle everything under the
    /// service) or `/service/a/b...` (one leaf; also entered in the
    /// full-path table). A declared `typespec` is matched exactly unless
    /// `coerce` allows per-argument conversion. Replacing a whole-service
    /// handler with a path tree, or the reverse, tears the old structure
    /// down first.
    pub fn method_new<F>(
        &mut self,
        path: &str,
        typespec: Option<&str>,
        coerce: bool,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&mut Ensemble, &MsgData, &mut ArgReader<'_>) -> Result<()> + 'static,
    {
        let stripped = path
            .strip_prefix('/')
            .or_else(|| path.strip_prefix('!'))
            .ok_or(Error::BadName)?;
        let (service, rest) = match stripped.split_once('/') {
            Some((s, r)) => (s, Some(r)),
            None => (stripped, None),
        };
        if service.is_empty() || rest.is_some_and(str::is_empty) {
            return Err(Error::BadName);
        }
        let method = MethodEntry {
            handler: Rc::new(handler),
            typespec: typespec.map(str::to_owned),
            coerce,
            full_path: None,
        };

        let mut purged = Vec::new();
        {
            let entry = self
                .dir
                .services
                .get_str_mut(service)
                .ok_or(Error::ServiceNotFound)?;
            let idx = entry
                .providers
                .iter()
                .position(|p| p.is_local())
                .ok_or(Error::ServiceNotFound)?;
            match rest {
                None => {
                    // whole-service handler replaces whatever we had
                    if let Provider::Tree(root) = &entry.providers[idx] {
                        for (_, child) in root.children.iter() {
                            collect_full_paths(child, &mut purged);
                        }
                    }
                    entry.providers[idx] = Provider::Method(method.clone());
                }
                Some(rest) => {
                    if !matches!(entry.providers[idx], Provider::Tree(_)) {
                        entry.providers[idx] = Provider::Tree(PathNode::new());
                    }
                    let full = format!("/{stripped}");
                    let mut leaf = method.clone();
                    leaf.full_path = Some(full.clone());
                    if let Provider::Tree(root) = &mut entry.providers[idx] {
                        root.insert_method(rest, leaf, &mut purged);
                    }
                    self.dir.full_paths.insert(Key::new(&full), method);
                }
            }
        }
        self.dir.purge_full_paths(&purged);
        Ok(())
    }

    /// Remove the handler at `path` (a tree leaf or interior subtree).
    pub fn method_free(&mut self, path: &str) -> Result<()> {
        let stripped = path
            .strip_prefix('/')
            .or_else(|| path.strip_prefix('!'))
            .ok_or(Error::BadName)?;
        let (service, rest) = stripped.split_once('/').ok_or(Error::BadName)?;
        let mut purged = Vec::new();
        let removed = {
            let entry = self
                .dir
                .services
                .get_str_mut(service)
                .ok_or(Error::ServiceNotFound)?;
            match entry.providers.iter_mut().find(|p| p.is_local()) {
                Some(Provider::Tree(root)) => root.remove_path(rest, &mut purged),
                _ => false,
            }
        };
        self.dir.purge_full_paths(&purged);
        if removed {
            Ok(())
        } else {
            Err(Error::NoHandler)
        }
    }

    // -------------------------------------------------------- send frontend

    /// Build and send a best-effort (UDP-class) message.
    pub fn send(&mut self, path: &str, time: f64, args: &[Arg]) -> Result<()> {
        let msg = Msg::build(path, time, false, args)?;
        self.message_send(msg)
    }

    /// Build and send a reliable (TCP-class) message.
    pub fn send_cmd(&mut self, path: &str, time: f64, args: &[Arg]) -> Result<()> {
        let msg = Msg::build(path, time, true, args)?;
        self.message_send(msg)
    }

    /// Start a message on the shared builder; finish with
    /// [`send_finish`](Self::send_finish). The builder is not re-entrant:
    /// finish one message before starting the next.
    pub fn send_start(&mut self) -> &mut MsgBuilder {
        self.builder.start();
        &mut self.builder
    }

    pub fn builder(&mut self) -> &mut MsgBuilder {
        &mut self.builder
    }

    /// Finish the message on the shared builder and send it.
    pub fn send_finish(&mut self, time: f64, path: &str, tcp: bool) -> Result<()> {
        let msg = self.builder.finish(time, path, tcp)?;
        self.message_send(msg)
    }

    // --------------------------------------------------------------- status

    pub fn status(&self, service: &str) -> Result<Status> {
        use crate::dispatch::{route_for, Route};
        match route_for(self, service) {
            None => Err(Error::ServiceNotFound),
            Some(Route::LocalTree) | Some(Route::LocalMethod(_)) => Ok(if self.clock.synced {
                Status::Local
            } else {
                Status::LocalNoTime
            }),
            Some(Route::Remote(pid)) => {
                let synced = self.procs.get(pid).is_some_and(|p| p.synced);
                Ok(if self.clock.synced && synced {
                    Status::Remote
                } else {
                    Status::RemoteNoTime
                })
            }
            Some(Route::Bridge(_)) => Ok(if self.clock.synced {
                Status::Bridge
            } else {
                Status::BridgeNoTime
            }),
        }
    }

    // ----------------------------------------------------------------- taps

    /// Forward a copy of every message accepted by `tappee` to `tapper`.
    pub fn tap(&mut self, tappee: &str, tapper: &str, mode: TapMode) -> Result<()> {
        check_service_name(tappee)?;
        check_service_name(tapper)?;
        let entry = self.dir.must_get(tappee);
        if entry
            .taps
            .iter()
            .any(|t| t.tapper == tapper && t.proc.is_none())
        {
            return Err(Error::ServiceConflict);
        }
        entry.taps.push(ServiceTap {
            tapper: tapper.to_owned(),
            proc: None,
            mode,
        });
        self.local_taps.push(ProcTap {
            tappee: tappee.to_owned(),
            tapper: tapper.to_owned(),
            mode,
        });
        self.notify_others(tappee, true, false, tapper, mode);
        Ok(())
    }

    pub fn untap(&mut self, tappee: &str, tapper: &str) -> Result<()> {
        self.remove_tap_entry(tappee, tapper, None)
    }

    pub(crate) fn remove_tap_entry(
        &mut self,
        tappee: &str,
        tapper: &str,
        owner: Option<ProcId>,
    ) -> Result<()> {
        let found = {
            let Some(entry) = self.dir.find_mut(tappee) else {
                return Err(Error::ServiceNotFound);
            };
            let before = entry.taps.len();
            entry.taps.retain(|t| !(t.tapper == tapper && t.proc == owner));
            before != entry.taps.len()
        };
        if !found {
            return Err(Error::ServiceNotFound);
        }
        self.dir.remove_if_empty(tappee);
        match owner {
            None => {
                self.local_taps
                    .retain(|t| !(t.tappee == tappee && t.tapper == tapper));
                self.notify_others(tappee, false, false, tapper, TapMode::Keep);
            }
            Some(pid) => {
                if let Some(p) = self.procs.get_mut(pid) {
                    p.taps
                        .retain(|t| !(t.tappee == tappee && t.tapper == tapper));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------ directory

    /// Add a remote process's offer of `service`.
    pub(crate) fn add_remote_provider(&mut self, service: &str, pid: ProcId, properties: String) {
        let already = {
            let entry = self.dir.must_get(service);
            entry
                .providers
                .iter()
                .any(|p| matches!(p, Provider::Remote(other) if *other == pid))
        };
        if already {
            // a property refresh for an existing offer
            if let Some(p) = self.procs.get_mut(pid) {
                if let Some(s) = p.services.iter_mut().find(|s| s.service == service) {
                    s.properties = properties;
                }
            }
            self.announce_active(service);
            return;
        }
        self.dir
            .must_get(service)
            .providers
            .push(Provider::Remote(pid));
        self.reorder_providers(service);
        if let Some(p) = self.procs.get_mut(pid) {
            p.services.push(ProcService {
                service: service.to_owned(),
                properties,
            });
        }
        self.announce_active(service);
    }

    pub(crate) fn add_remote_tap(
        &mut self,
        tappee: &str,
        tapper: &str,
        pid: ProcId,
        mode: TapMode,
    ) {
        let entry = self.dir.must_get(tappee);
        if entry
            .taps
            .iter()
            .any(|t| t.tapper == tapper && t.proc == Some(pid))
        {
            return;
        }
        entry.taps.push(ServiceTap {
            tapper: tapper.to_owned(),
            proc: Some(pid),
            mode,
        });
        if let Some(p) = self.procs.get_mut(pid) {
            p.taps.push(ProcTap {
                tappee: tappee.to_owned(),
                tapper: tapper.to_owned(),
                mode,
            });
        }
    }

    /// Remove one provider of `service` (`owner` `None` = this process),
    /// notify listeners, promote a successor, and drop an entry left with
    /// neither providers nor taps.
    pub(crate) fn remove_provider(&mut self, service: &str, owner: Option<ProcId>) -> Result<()> {
        let mut purged = Vec::new();
        let (was_active, owner_name) = {
            let Some(entry) = self.dir.services.get_str_mut(service) else {
                return Err(Error::ServiceNotFound);
            };
            let idx = entry
                .providers
                .iter()
                .position(|p| match owner {
                    Some(o) => matches!(p, Provider::Remote(pid) if *pid == o),
                    None => p.is_ours(),
                })
                .ok_or(Error::ServiceNotFound)?;
            let removed = entry.providers.remove(idx);
            match &removed {
                Provider::Tree(root) => {
                    for (_, child) in root.children.iter() {
                        collect_full_paths(child, &mut purged);
                    }
                }
                Provider::Method(m) => {
                    if let Some(p) = &m.full_path {
                        purged.push(p.clone());
                    }
                }
                Provider::Remote(_) | Provider::Bridge(_) => {}
            }
            if let Provider::Bridge(b) = removed {
                if let Some(slot) = self.bridges.get_mut(b) {
                    *slot = None;
                }
            }
            let owner_name = match owner {
                None => self.proc_name.clone(),
                Some(pid) => self
                    .procs
                    .get(pid)
                    .map(|p| p.name.as_str().to_owned())
                    .unwrap_or_default(),
            };
            (idx == 0, owner_name)
        };
        self.dir.purge_full_paths(&purged);

        self.send_si(service, STATUS_GONE, &owner_name, "");
        if was_active {
            self.reorder_providers(service);
            self.announce_active(service);
        }
        self.dir.remove_if_empty(service);

        match owner {
            None => {
                self.local_services.retain(|s| s.service != service);
                self.notify_others(service, false, true, "", TapMode::Keep);
            }
            Some(pid) => {
                if let Some(p) = self.procs.get_mut(pid) {
                    p.services.retain(|s| s.service != service);
                }
            }
        }
        Ok(())
    }

    /// Move the provider with the greatest owning-process name to the
    /// front. Deterministic on both ends of a removal race.
    fn reorder_providers(&mut self, service: &str) {
        let names: Vec<String> = match self.dir.services.get_str(service) {
            Some(entry) => entry
                .providers
                .iter()
                .map(|p| match p {
                    Provider::Remote(pid) => self
                        .procs
                        .get(*pid)
                        .map(|e| e.name.as_str().to_owned())
                        .unwrap_or_default(),
                    _ => self.proc_name.clone(),
                })
                .collect(),
            None => return,
        };
        if let Some(entry) = self.dir.services.get_str_mut(service) {
            entry.pick_provider(&names);
        }
    }

    /// Report the current active provider of `service` through `/_o2/si`.
    fn announce_active(&mut self, service: &str) {
        let Some((status, proc_name, props)) = ({
            let entry = self.dir.find(service);
            entry.and_then(|e| e.active()).map(|p| match p {
                Provider::Remote(pid) => {
                    let (name, props, synced) = self
                        .procs
                        .get(*pid)
                        .map(|e| {
                            (
                                e.name.as_str().to_owned(),
                                e.services
                                    .iter()
                                    .find(|s| s.service == service)
                                    .map(|s| s.properties.clone())
                                    .unwrap_or_default(),
                                e.synced,
                            )
                        })
                        .unwrap_or_default();
                    let status = if self.clock.synced && synced {
                        Status::Remote
                    } else {
                        Status::RemoteNoTime
                    };
                    (status, name, props)
                }
                Provider::Bridge(_) => (
                    if self.clock.synced {
                        Status::Bridge
                    } else {
                        Status::BridgeNoTime
                    },
                    self.proc_name.clone(),
                    String::new(),
                ),
                _ => (
                    if self.clock.synced {
                        Status::Local
                    } else {
                        Status::LocalNoTime
                    },
                    self.proc_name.clone(),
                    self.local_service_properties(service).unwrap_or_default(),
                ),
            })
        }) else {
            return;
        };
        self.send_si(service, status.to_i32(), &proc_name, &props);
    }

    /// Deliver `/_o2/si` (service, status, process, properties) locally if
    /// anyone registered a handler for it.
    pub(crate) fn send_si(&mut self, service: &str, status: i32, proc_name: &str, props: &str) {
        if self.dir.full_paths.get_str("/_o2/si").is_none() {
            return;
        }
        let _ = self.send(
            "!_o2/si",
            0.0,
            &[
                Arg::Str(service.to_owned()),
                Arg::Int32(status),
                Arg::Str(proc_name.to_owned()),
                Arg::Str(props.to_owned()),
            ],
        );
    }

    /// Tell every connected peer about a service or tap change.
    fn notify_others(
        &mut self,
        service: &str,
        added: bool,
        is_service: bool,
        prop_or_tapper: &str,
        mode: TapMode,
    ) {
        let own = self.proc_name.clone();
        let args = [
            Arg::Str(own),
            Arg::Str(service.to_owned()),
            Arg::Int32(added as i32),
            Arg::Bool(is_service),
            Arg::Str(prop_or_tapper.to_owned()),
            Arg::Int32(mode.to_i32()),
        ];
        for pid in self.procs.ids() {
            if self.procs.get(pid).is_some_and(|p| p.name.is_empty()) {
                continue; // handshake still in progress
            }
            match Msg::build("!_o2/sv", 0.0, true, &args) {
                Ok(msg) => {
                    let _ = self.send_direct_tcp(pid, msg);
                }
                Err(e) => warn!(error = %e, "could not build service update"),
            }
        }
    }

    // ----------------------------------------------------------- properties

    pub(crate) fn local_service_properties(&self, service: &str) -> Option<String> {
        self.local_services
            .iter()
            .find(|s| s.service == service)
            .map(|s| s.properties.clone())
    }

    /// Set one property on a locally offered service; replicated to peers.
    pub fn set_property(&mut self, service: &str, attr: &str, value: &str) -> Result<()> {
        check_attr_name(attr)?;
        let props = {
            let entry = self
                .local_services
                .iter_mut()
                .find(|s| s.service == service)
                .ok_or(Error::ServiceNotFound)?;
            services::property_set(&mut entry.properties, attr, value);
            entry.properties.clone()
        };
        let stripped = props.strip_prefix(';').unwrap_or(&props).to_owned();
        self.notify_others(service, true, true, &stripped, TapMode::Keep);
        Ok(())
    }

    /// Remove one property from a locally offered service.
    pub fn remove_property(&mut self, service: &str, attr: &str) -> Result<()> {
        let props = {
            let entry = self
                .local_services
                .iter_mut()
                .find(|s| s.service == service)
                .ok_or(Error::ServiceNotFound)?;
            if !services::property_remove(&mut entry.properties, attr) {
                return Ok(());
            }
            entry.properties.clone()
        };
        let stripped = props.strip_prefix(';').unwrap_or(&props).to_owned();
        self.notify_others(service, true, true, &stripped, TapMode::Keep);
        Ok(())
    }

    /// Read one property of the service's *active* provider.
    pub fn property(&self, service: &str, attr: &str) -> Option<String> {
        let entry = self.dir.find(service)?;
        match entry.active()? {
            Provider::Remote(pid) => {
                let p = self.procs.get(*pid)?;
                let s = p.services.iter().find(|s| s.service == service)?;
                services::property_get(&s.properties, attr)
            }
            _ => services::property_get(&self.local_service_properties(service)?, attr),
        }
    }

    /// Snapshot of every known service and tap.
    pub fn services_list(&self) -> Vec<ServiceInfo> {
        let mut out = Vec::new();
        for (key, entry) in self.dir.services.iter() {
            let service = key.as_str();
            if service.starts_with(|c: char| c.is_ascii_digit()) {
                continue; // process-name pseudo-services
            }
            if let Some(active) = entry.active() {
                let (kind, process, properties) = match active {
                    Provider::Remote(pid) => match self.procs.get(*pid) {
                        Some(p) => (
                            ServiceKind::Remote,
                            p.name.as_str().to_owned(),
                            p.services
                                .iter()
                                .find(|s| s.service == service)
                                .map(|s| s.properties.clone())
                                .unwrap_or_default(),
                        ),
                        None => continue,
                    },
                    _ => (
                        ServiceKind::Local,
                        self.proc_name.clone(),
                        self.local_service_properties(service).unwrap_or_default(),
                    ),
                };
                out.push(ServiceInfo {
                    service: service.to_owned(),
                    kind,
                    process,
                    properties,
                    tapper: None,
                });
            }
            for t in &entry.taps {
                let process = match t.proc {
                    None => self.proc_name.clone(),
                    Some(pid) => self
                        .procs
                        .get(pid)
                        .map(|p| p.name.as_str().to_owned())
                        .unwrap_or_default(),
                };
                out.push(ServiceInfo {
                    service: service.to_owned(),
                    kind: ServiceKind::Tap,
                    process,
                    properties: String::new(),
                    tapper: Some(t.tapper.clone()),
                });
            }
        }
        out
    }

    /// Find services whose `attr` property contains `needle` (scans the
    /// escaped value, like the wire representation).
    pub fn search_property(&self, attr: &str, needle: &str) -> Vec<String> {
        let mut out = Vec::new();
        for info in self.services_list() {
            if info.kind != ServiceKind::Tap
                && services::property_search(&info.properties, attr, needle)
            {
                out.push(info.service);
            }
        }
        out
    }

    // ------------------------------------------------------------- shutdown

    /// Close every socket and drop all scheduled messages. The handle is
    /// unusable afterwards; `Drop` calls this too.
    pub fn shutdown(&mut self) {
        self.ltsched.clear();
        self.gtsched.clear();
        self.pending.clear();
        self.net.close_all();
        self.stop = true;
    }
}

impl Drop for Ensemble {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Provider {
    /// Provided by this process (including bridges).
    pub(crate) fn is_ours(&self) -> bool {
        matches!(
            self,
            Provider::Tree(_) | Provider::Method(_) | Provider::Bridge(_)
        )
    }
}

fn check_service_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_SERVICE_LEN
        || name.contains('/')
        || name.contains('!')
        || name.starts_with(|c: char| c.is_ascii_digit())
    {
        return Err(Error::BadName);
    }
    Ok(())
}

fn check_attr_name(attr: &str) -> Result<()> {
    if attr.is_empty() || attr.contains([';', ':', '\\']) {
        return Err(Error::BadName);
    }
    Ok(())
}

/// Best local IPv4 guess: the interface a default route would use, falling
/// back to loopback on isolated machines.
fn detect_local_ip() -> Ipv4Addr {
    if let Ok(sock) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if sock.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = sock.local_addr() {
                if let IpAddr::V4(ip) = addr.ip() {
                    if !ip.is_unspecified() {
                        return ip;
                    }
                }
            }
        }
    }
    Ipv4Addr::LOCALHOST
}
