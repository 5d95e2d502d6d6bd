//! Peer discovery and connection management.
//!
//! Every process claims the first free port from a fixed 16-entry UDP port
//! list and broadcasts `!_o2/dy` announcements round-robin over ports
//! 0..=N, where N is its own index. Between any pair of processes the one
//! with the higher index reaches the other's port, and one direction
//! suffices: the receiver compares process names and the greater name
//! becomes the TCP server. The server connects back only to deliver a
//! CALLBACK telling the smaller-named side to connect in the proper
//! direction; the client connects and identifies itself with CONNECT,
//! followed by its service table and clock state.
//!
//! With a hub (`hub()`), broadcasting is disabled: the caller connects to
//! the named peer, sends HUB, and the hub introduces every known pair by
//! sending INFO to the smaller-named side.
//!
//! A duplicate INFO for an already known peer name is ignored, including
//! while a reconnection is in progress; the periodic broadcast retries
//! cover genuinely half-open connections.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tracing::{debug, info, warn};

use crate::args::Arg;
use crate::ensemble::Ensemble;
use crate::error::{Error, Result};
use crate::message::{Msg, MsgData};
use crate::proc::ProcId;
use crate::services::TapMode;

/// Fixed discovery ports, all from the dynamic/private range.
pub(crate) const PORT_LIST: [u16; 16] = [
    64541, 60238, 57143, 55764, 56975, 62711, 57571, 53472, 51779, 63714, 53304, 61696, 50665,
    49404, 64828, 54859,
];

pub(crate) const DY_INFO: i32 = 50;
pub(crate) const DY_HUB: i32 = 51;
pub(crate) const DY_REPLY: i32 = 52;
pub(crate) const DY_CALLBACK: i32 = 53;
pub(crate) const DY_CONNECT: i32 = 54;

/// Initial broadcast period; multiplied by 1.1 each round up to the cap.
pub(crate) const INITIAL_SEND_INTERVAL: f64 = 0.133;
pub(crate) const DEFAULT_PERIOD: f64 = 4.0;

pub(crate) struct Discovery {
    pub enabled: bool,
    /// Our index into [`PORT_LIST`].
    pub port_index: usize,
    next_send_index: usize,
    send_interval: f64,
    pub period: f64,
    /// Name of the hub once its REPLY arrives.
    pub hub_name: Option<String>,
}

impl Discovery {
    pub fn new(enabled: bool) -> Discovery {
        Discovery {
            enabled,
            port_index: 0,
            next_send_index: 0,
            send_interval: INITIAL_SEND_INTERVAL,
            period: DEFAULT_PERIOD,
            hub_name: None,
        }
    }
}

/// Format an IPv4 address as the 8-hex-digit field used in process names.
pub(crate) fn ip_to_hex(ip: Ipv4Addr) -> String {
    format!("{:08x}", u32::from(ip))
}

pub(crate) fn hex_to_ip(hex: &str) -> Result<Ipv4Addr> {
    let v = u32::from_str_radix(hex, 16).map_err(|_| Error::BadName)?;
    Ok(Ipv4Addr::from(v))
}

/// Build the `!_o2/dy` announcement describing this process.
pub(crate) fn make_dy_msg(ens: &Ensemble, flag: i32, tcp: bool) -> Result<Msg> {
    Msg::build(
        "!_o2/dy",
        0.0,
        tcp,
        &[
            Arg::Str(ens.name().to_owned()),
            Arg::Str("00000000".to_owned()),
            Arg::Str(ip_to_hex(ens.local_ip)),
            Arg::Int32(ens.tcp_port as i32),
            Arg::Int32(ens.udp_port as i32),
            Arg::Int32(flag),
        ],
    )
}

/// Build an announcement describing a known peer (hub fan-out).
fn make_dy_msg_for(ens: &Ensemble, pid: ProcId) -> Result<Msg> {
    let proc = ens.procs.get(pid).ok_or(Error::ProcessGone)?;
    let name = proc.name.as_str();
    let mut fields = name.split(':');
    let pub_ip = fields.next().ok_or(Error::BadName)?;
    let int_ip = fields.next().ok_or(Error::BadName)?;
    let tcp_port: i32 = fields
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(Error::BadName)?;
    let udp_port = proc.udp_addr.map(|a| a.port()).unwrap_or(0) as i32;
    Msg::build(
        "!_o2/dy",
        0.0,
        true,
        &[
            Arg::Str(ens.name().to_owned()),
            Arg::Str(pub_ip.to_owned()),
            Arg::Str(int_ip.to_owned()),
            Arg::Int32(tcp_port),
            Arg::Int32(udp_port),
            Arg::Int32(DY_INFO),
        ],
    )
}

/// `/_o2/ds`: one broadcast round, then reschedule with backoff.
pub(crate) fn ds_handler(
    ens: &mut Ensemble,
    _msg: &MsgData,
    _args: &mut crate::args::ArgReader<'_>,
) -> Result<()> {
    if !ens.disc.enabled {
        return Ok(());
    }
    ens.disc.next_send_index = (ens.disc.next_send_index + 1) % (ens.disc.port_index + 1);
    let port = PORT_LIST[ens.disc.next_send_index];
    broadcast_dy(ens, port)?;
    let interval = ens.disc.send_interval;
    ens.disc.send_interval = (interval * 1.1).min(ens.disc.period);
    let when = ens.local_time() + interval;
    schedule_discovery_send(ens, when);
    Ok(())
}

fn broadcast_dy(ens: &mut Ensemble, port: u16) -> Result<()> {
    let msg = make_dy_msg(ens, DY_INFO, false)?;
    let frame = msg.to_wire()?;
    let bcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
    ens.net.send_udp(ens.udp_send, bcast, &frame);
    // broadcasts are not reliably looped back to this machine, so also
    // cover processes on the local host (our own port excluded: we own it)
    if port != ens.udp_port {
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        ens.net.send_udp(ens.udp_send, local, &frame);
    }
    debug!(port, "discovery broadcast");
    Ok(())
}

pub(crate) fn schedule_discovery_send(ens: &mut Ensemble, when: f64) {
    if let Ok(msg) = Msg::build("!_o2/ds", when, false, &[]) {
        ens.schedule_local(msg);
    }
}

/// `/_o2/dy`: the discovery handshake state machine.
pub(crate) fn dy_handler(
    ens: &mut Ensemble,
    _msg: &MsgData,
    args: &mut crate::args::ArgReader<'_>,
) -> Result<()> {
    let ensemble = args.get_str()?;
    let pub_ip = args.get_str()?;
    let int_ip = args.get_str()?;
    let tcp_port = args.get_i32()? as u16;
    let udp_port = args.get_i32()? as u16;
    let flag = args.get_i32()?;
    if ensemble != ens.name() {
        debug!(%ensemble, "ignoring discovery for foreign ensemble");
        return Ok(());
    }
    let name = format!("{pub_ip}:{int_ip}:{tcp_port}");
    discovered_remote(ens, &name, &int_ip, tcp_port, udp_port, flag)
}

pub(crate) fn discovered_remote(
    ens: &mut Ensemble,
    name: &str,
    int_ip: &str,
    tcp_port: u16,
    udp_port: u16,
    mut flag: i32,
) -> Result<()> {
    let source = ens.message_source;
    let ip = hex_to_ip(int_ip)?;
    let tcp_addr = SocketAddr::new(IpAddr::V4(ip), tcp_port);
    let udp_addr = SocketAddr::new(IpAddr::V4(ip), udp_port);

    if flag == DY_CALLBACK {
        // the greater-named side reached us over a throwaway connection;
        // drop it and reconnect in the proper direction
        if let Some(token) = source {
            ens.net.mark_close(token);
        }
        flag = DY_INFO;
    }

    match flag {
        DY_INFO => {
            if name == ens.proc_name {
                return Ok(()); // our own broadcast
            }
            if ens.procs.find_by_name(name).is_some() {
                return Ok(()); // already known (or reconnection in progress)
            }
            if ens.proc_name.as_str() > name {
                // we are the server: tell the peer to connect to us
                let token = ens.net.tcp_connect(tcp_addr)?;
                let msg = make_dy_msg(ens, DY_CALLBACK, true)?;
                let frame = msg.to_wire()?;
                ens.net.enqueue(token, frame)?;
                debug!(peer = name, "sent discovery callback");
            } else {
                // we are the client: connect and identify ourselves
                let token = ens.net.tcp_connect(tcp_addr)?;
                let pid = bind_proc(ens, token, name, udp_addr);
                let msg = make_dy_msg(ens, DY_CONNECT, true)?;
                ens.send_direct_tcp(pid, msg)?;
                send_clocksync_to(ens, pid);
                send_services_to(ens, pid)?;
                info!(peer = name, "connecting as client");
            }
        }
        DY_HUB => {
            // sender wants us as its hub; it connected to us over TCP
            if ens.procs.find_by_name(name).is_some() {
                return Ok(());
            }
            let token = source.ok_or(Error::InvalidMsg)?;
            let pid = bind_proc(ens, token, name, udp_addr);
            let msg = make_dy_msg(ens, DY_REPLY, true)?;
            ens.send_direct_tcp(pid, msg)?;
            send_clocksync_to(ens, pid);
            send_services_to(ens, pid)?;
            info!(peer = name, "acting as hub");
        }
        DY_REPLY => {
            // first message from our hub on the connection we opened
            if ens.procs.find_by_name(name).is_some() {
                return Ok(());
            }
            let token = source.ok_or(Error::InvalidMsg)?;
            let pid = bind_proc(ens, token, name, udp_addr);
            ens.disc.hub_name = Some(name.to_owned());
            let msg = Msg::build("!_o2/hub", 0.0, true, &[])?;
            ens.send_direct_tcp(pid, msg)?;
            send_clocksync_to(ens, pid);
            send_services_to(ens, pid)?;
            info!(peer = name, "hub acknowledged");
        }
        DY_CONNECT => {
            // a client completed the handshake on our accepted socket
            if ens.procs.find_by_name(name).is_some() {
                return Ok(());
            }
            let token = source.ok_or(Error::InvalidMsg)?;
            let pid = bind_proc(ens, token, name, udp_addr);
            send_clocksync_to(ens, pid);
            send_services_to(ens, pid)?;
            info!(peer = name, "client connected");
        }
        other => warn!(flag = other, "unknown discovery tag ignored"),
    }
    Ok(())
}

/// Create the process record and make its name addressable as a service.
fn bind_proc(ens: &mut Ensemble, token: mio::Token, name: &str, udp_addr: SocketAddr) -> ProcId {
    let pid = ens.procs.alloc(token);
    {
        let p = ens.procs.get_mut(pid).unwrap();
        p.name = crate::key::Key::new(name);
        p.udp_addr = Some(udp_addr);
    }
    let entry = ens.dir.must_get(name);
    entry.providers.push(crate::services::Provider::Remote(pid));
    pid
}

fn send_clocksync_to(ens: &mut Ensemble, pid: ProcId) {
    if !ens.clock.synced {
        return;
    }
    let own = ens.proc_name.clone();
    if let Ok(msg) = Msg::build("!_o2/cs/cs", 0.0, true, &[Arg::Str(own)]) {
        let _ = ens.send_direct_tcp(pid, msg);
    }
}

/// Send our service table (services with properties, then taps) to a peer.
pub(crate) fn send_services_to(ens: &mut Ensemble, pid: ProcId) -> Result<()> {
    let mut args: Vec<Arg> = vec![Arg::Str(ens.proc_name.clone())];
    for s in &ens.local_services {
        args.push(Arg::Str(s.service.clone()));
        args.push(Arg::Int32(1));
        args.push(Arg::Bool(true));
        args.push(Arg::Str(
            s.properties.strip_prefix(';').unwrap_or("").to_owned(),
        ));
        args.push(Arg::Int32(0));
    }
    for t in &ens.local_taps {
        args.push(Arg::Str(t.tappee.clone()));
        args.push(Arg::Int32(1));
        args.push(Arg::Bool(false));
        args.push(Arg::Str(t.tapper.clone()));
        args.push(Arg::Int32(t.mode.to_i32()));
    }
    let msg = Msg::build("!_o2/sv", 0.0, true, &args)?;
    ens.send_direct_tcp(pid, msg)
}

/// `/_o2/sv`: a peer's service table changed. Entries are
/// (service, exists, is-service, properties-or-tapper, tap-mode) after the
/// sender's name.
pub(crate) fn sv_handler(
    ens: &mut Ensemble,
    _msg: &MsgData,
    args: &mut crate::args::ArgReader<'_>,
) -> Result<()> {
    let sender = args.get_str()?;
    let Some(pid) = ens.procs.find_by_name(&sender) else {
        debug!(%sender, "service update from unknown process dropped");
        return Ok(());
    };
    loop {
        let service = match args.get_str() {
            Ok(s) => s,
            Err(_) => break, // end of batch
        };
        let added = args.get_i32()? != 0;
        let is_service = args.get_bool()?;
        let prop_or_tapper = args.get_str()?;
        let mode = TapMode::from_i32(args.get_i32()?);
        if service.contains('/') {
            warn!(%service, "bad service name in update");
            continue;
        }
        if added {
            if is_service {
                let props = if prop_or_tapper.is_empty() {
                    String::new()
                } else {
                    format!(";{prop_or_tapper}")
                };
                if !crate::services::property_string_valid(&props) {
                    warn!(%service, "malformed property string in update");
                    continue;
                }
                ens.add_remote_provider(&service, pid, props);
            } else {
                ens.add_remote_tap(&service, &prop_or_tapper, pid, mode);
            }
        } else if is_service {
            ens.remove_provider(&service, Some(pid));
        } else {
            ens.remove_tap_entry(&service, &prop_or_tapper, Some(pid));
        }
    }
    Ok(())
}

/// `/_o2/hub`: the sender designates us as its hub; introduce it to every
/// other known pair, sending INFO to the smaller-named side.
pub(crate) fn hub_handler(
    ens: &mut Ensemble,
    _msg: &MsgData,
    _args: &mut crate::args::ArgReader<'_>,
) -> Result<()> {
    let source = ens.message_source.ok_or(Error::InvalidMsg)?;
    let Some(new_client) = ens.procs.find_by_sock(source) else {
        return Ok(());
    };
    debug!("acting as hub for a new client");
    hub_fan_out(ens, new_client);
    Ok(())
}

fn hub_fan_out(ens: &mut Ensemble, new_client: ProcId) {
    let nc_name = match ens.procs.get(new_client) {
        Some(p) => p.name.as_str().to_owned(),
        None => return,
    };
    let others: Vec<ProcId> = ens
        .procs
        .ids()
        .into_iter()
        .filter(|&id| id != new_client)
        .collect();
    for other in others {
        let other_name = match ens.procs.get(other) {
            Some(p) if !p.name.is_empty() => p.name.as_str().to_owned(),
            _ => continue,
        };
        // introduce the pair through its client side (smaller name)
        let (client, server) = if other_name.as_str() > nc_name.as_str() {
            (new_client, other)
        } else {
            (other, new_client)
        };
        match make_dy_msg_for(ens, server) {
            Ok(msg) => {
                if ens.send_direct_tcp(client, msg).is_err() {
                    warn!("hub introduction failed");
                }
            }
            Err(e) => warn!(error = %e, "could not describe peer for hub fan-out"),
        }
    }
}

impl Ensemble {
    /// Bootstrap through a known peer instead of broadcasting. Disables
    /// discovery broadcasts, connects to `ip:port`, and asks that process
    /// to act as our hub: it will introduce us to every peer it knows.
    pub fn hub(&mut self, ip: IpAddr, tcp_port: u16) -> Result<()> {
        self.disc.enabled = false;
        let token = self.net.tcp_connect(SocketAddr::new(ip, tcp_port))?;
        let msg = make_dy_msg(self, DY_HUB, true)?;
        let frame = msg.to_wire()?;
        self.net.enqueue(token, frame)?;
        info!(%ip, tcp_port, "hub requested");
        Ok(())
    }

    /// Adjust the broadcast period cap (seconds, minimum 0.1). Returns the
    /// previous value.
    pub fn set_discovery_period(&mut self, period: f64) -> f64 {
        let old = self.disc.period;
        self.disc.period = period.max(0.1);
        old
    }
}
