//! Service directory.
//!
//! The top level of the address space maps service names to a *services
//! entry*: an ordered provider list (the first provider is active) plus the
//! service's tap list. An entry with no providers and no taps is removed.
//! When the active provider goes away, the provider whose owning process
//! has the lexicographically greatest name takes over, so both ends of a
//! removal race settle on the same choice.
//!
//! Property strings have the form `;attr1:value1;attr2:value2;` with `;`,
//! `:`, and `\` escaped by a preceding backslash; updates splice out the
//! old attribute and prepend the new one.

use smallvec::SmallVec;

use crate::key::{Key, KeyTable};
use crate::path::{MethodEntry, PathNode};
use crate::proc::ProcId;

/// How a tap forwards copies: keep the tapped message's transport class,
/// force the reliable path, or force best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TapMode {
    #[default]
    Keep,
    Reliable,
    Best,
}

impl TapMode {
    pub(crate) fn to_i32(self) -> i32 {
        match self {
            TapMode::Keep => 0,
            TapMode::Reliable => 1,
            TapMode::Best => 2,
        }
    }

    pub(crate) fn from_i32(v: i32) -> TapMode {
        match v {
            1 => TapMode::Reliable,
            2 => TapMode::Best,
            _ => TapMode::Keep,
        }
    }
}

/// One offer of a service.
pub(crate) enum Provider {
    /// Local tree of path nodes with handlers at the leaves.
    Tree(PathNode),
    /// Local single handler for every path under the service.
    Method(MethodEntry),
    /// The service lives on a remote process.
    Remote(ProcId),
    /// Delegate to a registered non-IP bridge callback.
    Bridge(usize),
}

impl Provider {
    pub fn is_local(&self) -> bool {
        matches!(self, Provider::Tree(_) | Provider::Method(_))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServiceTap {
    pub tapper: String,
    /// Tapping process; `None` means this process.
    pub proc: Option<ProcId>,
    pub mode: TapMode,
}

pub(crate) struct ServicesEntry {
    pub providers: Vec<Provider>,
    pub taps: SmallVec<[ServiceTap; 1]>,
}

impl ServicesEntry {
    pub fn new() -> ServicesEntry {
        ServicesEntry {
            providers: Vec::new(),
            taps: SmallVec::new(),
        }
    }

    pub fn active(&self) -> Option<&Provider> {
        self.providers.first()
    }

    /// Move the provider with the greatest owner name to the front; `names`
    /// is parallel to `providers`. Called when the provider set changes so
    /// both ends of a removal race settle on the same active provider.
    pub fn pick_provider(&mut self, names: &[String]) {
        if self.providers.len() < 2 || names.len() != self.providers.len() {
            return;
        }
        let mut top = 0;
        for i in 1..names.len() {
            if names[i] > names[top] {
                top = i;
            }
        }
        self.providers.swap(0, top);
    }
}

pub(crate) struct Directory {
    pub services: KeyTable<ServicesEntry>,
    pub full_paths: KeyTable<MethodEntry>,
}

impl Directory {
    pub fn new() -> Directory {
        Directory {
            services: KeyTable::new(),
            full_paths: KeyTable::new(),
        }
    }

    pub fn find(&self, service: &str) -> Option<&ServicesEntry> {
        self.services.get_str(service)
    }

    pub fn find_mut(&mut self, service: &str) -> Option<&mut ServicesEntry> {
        self.services.get_str_mut(service)
    }

    /// Existing entry, or a fresh empty one.
    pub fn must_get(&mut self, service: &str) -> &mut ServicesEntry {
        let key = Key::new(service);
        if self.services.get(&key).is_none() {
            self.services.insert(key.clone(), ServicesEntry::new());
        }
        self.services.get_mut(&key).unwrap()
    }

    /// Drop the entry when it holds neither providers nor taps.
    pub fn remove_if_empty(&mut self, service: &str) {
        if let Some(entry) = self.services.get_str(service) {
            if entry.providers.is_empty() && entry.taps.is_empty() {
                self.services.remove_str(service);
            }
        }
    }

    pub fn purge_full_paths(&mut self, paths: &[String]) {
        for p in paths {
            self.full_paths.remove_str(p);
        }
    }
}

// ---------------------------------------------------------------- properties

fn escaped(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ':' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescaped(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(n) = chars.next() {
                out.push(n);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Find `;attr:` in `props`, returning the byte range of the (escaped)
/// value. Matches whole attribute names only.
fn find_attr(props: &str, attr: &str) -> Option<(usize, usize)> {
    let needle = format!(";{attr}:");
    let mut from = 0;
    while let Some(rel) = props[from..].find(&needle) {
        let at = from + rel;
        // a match preceded by a backslash is part of an escaped value
        if at > 0 && props.as_bytes()[at - 1] == b'\\' {
            from = at + 1;
            continue;
        }
        let vstart = at + needle.len();
        let mut end = vstart;
        let bytes = props.as_bytes();
        while end < bytes.len() && bytes[end] != b';' {
            if bytes[end] == b'\\' {
                end += 1;
            }
            end += 1;
        }
        return Some((vstart, end.min(bytes.len())));
    }
    None
}

/// Read one attribute, unescaped.
pub(crate) fn property_get(props: &str, attr: &str) -> Option<String> {
    find_attr(props, attr).map(|(s, e)| unescaped(&props[s..e]))
}

/// Remove `attr` if present; returns whether the string changed.
pub(crate) fn property_remove(props: &mut String, attr: &str) -> bool {
    if let Some((vstart, vend)) = find_attr(props, attr) {
        // splice out ";attr:value" keeping the following ';' as the lead
        // separator of the remainder
        let astart = vstart - attr.len() - 2;
        props.replace_range(astart..vend.min(props.len()), "");
        if props == ";" || props.is_empty() {
            props.clear();
        }
        true
    } else {
        false
    }
}

/// Remove any existing `attr` and prepend `;attr:escaped-value;`.
pub(crate) fn property_set(props: &mut String, attr: &str, value: &str) {
    property_remove(props, attr);
    let rest = props.strip_prefix(';').unwrap_or(props);
    let mut out = String::with_capacity(props.len() + attr.len() + value.len() + 3);
    out.push(';');
    out.push_str(attr);
    out.push(':');
    out.push_str(&escaped(value));
    out.push(';');
    out.push_str(rest);
    *props = out;
}

/// True when the attribute's escaped value contains `needle`.
pub(crate) fn property_search(props: &str, attr: &str, needle: &str) -> bool {
    match find_attr(props, attr) {
        Some((s, e)) => props[s..e].contains(needle),
        None => false,
    }
}

/// A property string is either empty or `;`-led with a trailing `;`.
pub(crate) fn property_string_valid(props: &str) -> bool {
    props.is_empty() || (props.starts_with(';') && props.ends_with(';'))
}
