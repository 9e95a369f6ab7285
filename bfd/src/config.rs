// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keyword-directed configuration loader. The only recognized root keyword is
//! `bfd_instance <name>`, opening a braced block of per-session parameters:
//!
//! ```text
//! bfd_instance lab {
//!     neighbor_ip 192.0.2.1
//!     source_ip 192.0.2.2
//!     min_rx 50        # ms
//!     min_tx 50        # ms
//!     idle_tx 1000     # ms
//!     multiplier 3
//! }
//! ```
//!
//! Configuration problems never abort the load: a malformed or conflicting
//! value logs and either disables the instance or leaves the default in
//! place, exactly one of the two per keyword.

use crate::session::Session;
use crate::store::SessionStore;
use crate::{to_canonical, Diag, SessionState, BFD_INAME_MAX};
use slog::{error, warn, Logger};
use std::iter::Peekable;
use std::net::IpAddr;

pub const MINRX_MIN_MS: u64 = 1;
pub const MINRX_MAX_MS: u64 = 1000;

pub const MINTX_MIN_MS: u64 = 1;
pub const MINTX_MAX_MS: u64 = 1000;

pub const IDLETX_MIN_MS: u64 = 1000;
pub const IDLETX_MAX_MS: u64 = 10000;

pub const MULTIPLIER_MIN: u8 = 1;
pub const MULTIPLIER_MAX: u8 = 10;

/// Parse a configuration text into a session store. Every instance ends up
/// in the store; broken ones are disabled rather than dropped so that the
/// operator sees them in state dumps.
pub fn load(text: &str, log: &Logger) -> SessionStore {
    let mut store = SessionStore::new();
    let tokens = tokenize(text);
    let mut it = tokens.iter().peekable();

    while let Some(tok) = it.next() {
        if tok != "bfd_instance" {
            warn!(log, "unknown configuration keyword {tok}, skipping");
            continue;
        }
        let Some(name) = it.next() else {
            error!(log, "bfd_instance without a name at end of input");
            break;
        };
        let mut session = open_instance(&store, name, log);
        if it.peek().map(|t| t.as_str()) == Some("{") {
            it.next();
            parse_block(&mut it, &mut session, &store, log);
        }
        finish_instance(&mut store, session, log);
    }

    store
}

/// Split the text into whitespace-separated tokens, dropping `#` and `!`
/// comments to end of line.
fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = match line.find(['#', '!']) {
            Some(i) => &line[..i],
            None => line,
        };
        out.extend(line.split_whitespace().map(|w| w.to_string()));
    }
    out
}

/// Allocate a session for an instance block, applying the name rules: names
/// longer than 31 bytes are truncated and the instance disabled; duplicate
/// names are renamed `<DUP-n>` and the instance disabled.
fn open_instance(store: &SessionStore, raw: &str, log: &Logger) -> Session {
    let mut name = raw.to_string();
    let mut disabled = false;

    if name.len() > BFD_INAME_MAX {
        name = String::from_utf8_lossy(&raw.as_bytes()[..BFD_INAME_MAX])
            .into_owned();
        error!(
            log,
            "instance {raw} name was truncated to {name} (maximum length \
             is {BFD_INAME_MAX} bytes), disabling instance"
        );
        disabled = true;
    }

    if store.get(&name).is_some() {
        let renamed = format!("<DUP-{}>", store.len() + 1);
        error!(
            log,
            "instance {name} was renamed to {renamed} due to a duplicate \
             name, disabling instance"
        );
        name = renamed;
        disabled = true;
    }

    let mut s = Session::new(&name);
    s.disabled = disabled;
    s
}

fn parse_block<'a, I: Iterator<Item = &'a String>>(
    it: &mut Peekable<I>,
    s: &mut Session,
    store: &SessionStore,
    log: &Logger,
) {
    while let Some(tok) = it.next() {
        match tok.as_str() {
            "}" => return,
            "neighbor_ip" => {
                let Some(arg) = it.next() else { break };
                match arg.parse::<IpAddr>() {
                    Ok(addr) => {
                        let addr = to_canonical(addr);
                        if store.find_by_neighbor(addr).is_some() {
                            error!(
                                log,
                                "instance {} has duplicate neighbor address \
                                 {arg}, disabling instance",
                                s.name
                            );
                            s.disabled = true;
                        } else {
                            s.neighbor = Some(addr);
                        }
                    }
                    Err(_) => {
                        error!(
                            log,
                            "instance {} has malformed neighbor address \
                             {arg}, disabling instance",
                            s.name
                        );
                        s.disabled = true;
                    }
                }
            }
            "source_ip" => {
                let Some(arg) = it.next() else { break };
                match arg.parse::<IpAddr>() {
                    Ok(addr) => s.source = Some(to_canonical(addr)),
                    Err(_) => error!(
                        log,
                        "instance {} has malformed source address {arg}, \
                         ignoring",
                        s.name
                    ),
                }
            }
            "min_rx" => {
                if let Some(v) =
                    int_arg(it, s, "min_rx", MINRX_MIN_MS, MINRX_MAX_MS, log)
                {
                    s.local_min_rx_intv = v * 1000;
                }
            }
            "min_tx" => {
                if let Some(v) =
                    int_arg(it, s, "min_tx", MINTX_MIN_MS, MINTX_MAX_MS, log)
                {
                    s.local_min_tx_intv = v * 1000;
                }
            }
            "idle_tx" => {
                if let Some(v) = int_arg(
                    it,
                    s,
                    "idle_tx",
                    IDLETX_MIN_MS,
                    IDLETX_MAX_MS,
                    log,
                ) {
                    s.local_idle_tx_intv = v * 1000;
                }
            }
            "multiplier" => {
                if let Some(v) = int_arg(
                    it,
                    s,
                    "multiplier",
                    MULTIPLIER_MIN as u64,
                    MULTIPLIER_MAX as u64,
                    log,
                ) {
                    s.local_detect_mult = v as u8;
                }
            }
            "disabled" => s.disabled = true,
            other => {
                warn!(
                    log,
                    "instance {} has unknown keyword {other}, skipping",
                    s.name
                );
            }
        }
    }
    warn!(log, "instance {} block was not closed", s.name);
}

/// Fetch and range-check an integer argument. Out-of-range or malformed
/// values log and leave the default untouched.
fn int_arg<'a, I: Iterator<Item = &'a String>>(
    it: &mut Peekable<I>,
    s: &Session,
    keyword: &str,
    min: u64,
    max: u64,
    log: &Logger,
) -> Option<u64> {
    let arg = it.next()?;
    match arg.parse::<u64>() {
        Ok(v) if (min..=max).contains(&v) => Some(v),
        _ => {
            error!(
                log,
                "instance {} {keyword} value {arg} is not valid (must be in \
                 range [{min}-{max}]), ignoring",
                s.name
            );
            None
        }
    }
}

/// Seal an instance: disable it if it never got a neighbor address, settle
/// the initial state, and assign a unique discriminator.
fn finish_instance(store: &mut SessionStore, mut s: Session, log: &Logger) {
    if s.neighbor.is_none() && !s.disabled {
        error!(
            log,
            "instance {} has no neighbor address, disabling instance", s.name
        );
        s.disabled = true;
    }
    if s.disabled {
        s.local_state = SessionState::AdminDown;
        s.local_diag = Diag::AdminDown;
    }
    s.local_tx_intv = s.local_idle_tx_intv;
    s.local_discr = store.alloc_discr();
    store.push(s);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_logger;
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> SessionStore {
        load(text, &test_logger())
    }

    #[test]
    fn test_full_block() {
        let store = parse(
            r#"
            # primary uplink
            bfd_instance lab {
                neighbor_ip 192.0.2.1
                source_ip 192.0.2.2
                min_rx 50
                min_tx 50
                idle_tx 2000
                multiplier 3
            }
            "#,
        );
        assert_eq!(store.len(), 1);
        let s = store.get("lab").unwrap();
        assert!(!s.disabled);
        assert_eq!(s.neighbor, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(s.source, Some("192.0.2.2".parse().unwrap()));
        assert_eq!(s.local_min_rx_intv, 50_000);
        assert_eq!(s.local_min_tx_intv, 50_000);
        assert_eq!(s.local_idle_tx_intv, 2_000_000);
        assert_eq!(s.local_tx_intv, 2_000_000);
        assert_eq!(s.local_detect_mult, 3);
        assert_ne!(s.local_discr, 0);
        assert_eq!(s.local_state, SessionState::Down);
    }

    #[test]
    fn test_range_boundaries() {
        let store = parse(
            "bfd_instance a {
                neighbor_ip 192.0.2.1
                min_tx 1000
            }
            bfd_instance b {
                neighbor_ip 192.0.2.2
                min_tx 1001
                multiplier 11
                idle_tx 999
            }",
        );
        assert_eq!(store.get("a").unwrap().local_min_tx_intv, 1_000_000);
        // out-of-range values leave the defaults in place
        let b = store.get("b").unwrap();
        assert_eq!(b.local_min_tx_intv, 10_000);
        assert_eq!(b.local_detect_mult, 5);
        assert_eq!(b.local_idle_tx_intv, 1_000_000);
        assert!(!b.disabled);
    }

    #[test]
    fn test_name_truncation_disables() {
        let name = "a".repeat(32);
        let store = parse(&format!(
            "bfd_instance {name} {{ neighbor_ip 192.0.2.1 }}"
        ));
        assert_eq!(store.len(), 1);
        let s = store.iter().next().unwrap();
        assert_eq!(s.name, "a".repeat(31));
        assert!(s.disabled);
        assert_eq!(s.local_state, SessionState::AdminDown);
    }

    #[test]
    fn test_duplicate_name_renamed_and_disabled() {
        let store = parse(
            "bfd_instance foo { neighbor_ip 192.0.2.1 }
             bfd_instance foo { neighbor_ip 192.0.2.2 }",
        );
        assert_eq!(store.len(), 2);
        assert!(!store.get("foo").unwrap().disabled);
        let dup = store.get("<DUP-2>").unwrap();
        assert!(dup.disabled);
        assert_eq!(dup.local_state, SessionState::AdminDown);
    }

    #[test]
    fn test_duplicate_neighbor_disables() {
        let store = parse(
            "bfd_instance a { neighbor_ip 192.0.2.1 }
             bfd_instance b { neighbor_ip 192.0.2.1 }",
        );
        assert!(!store.get("a").unwrap().disabled);
        assert!(store.get("b").unwrap().disabled);
    }

    #[test]
    fn test_malformed_addresses() {
        let store = parse(
            "bfd_instance a {
                neighbor_ip not-an-address
            }
            bfd_instance b {
                neighbor_ip 192.0.2.1
                source_ip bogus
            }",
        );
        assert!(store.get("a").unwrap().disabled);
        let b = store.get("b").unwrap();
        assert!(!b.disabled);
        assert_eq!(b.source, None);
    }

    #[test]
    fn test_missing_neighbor_disables() {
        let store = parse("bfd_instance a { min_rx 50 }");
        assert!(store.get("a").unwrap().disabled);
    }

    #[test]
    fn test_disabled_keyword() {
        let store = parse(
            "bfd_instance a {
                neighbor_ip 192.0.2.1
                disabled
            }",
        );
        let s = store.get("a").unwrap();
        assert!(s.disabled);
        assert_eq!(s.local_state, SessionState::AdminDown);
        assert_eq!(s.local_diag, Diag::AdminDown);
    }

    #[test]
    fn test_unique_discriminators() {
        let store = parse(
            "bfd_instance a { neighbor_ip 192.0.2.1 }
             bfd_instance b { neighbor_ip 192.0.2.2 }
             bfd_instance c { neighbor_ip 192.0.2.3 }",
        );
        let mut discrs: Vec<u32> =
            store.iter().map(|s| s.local_discr).collect();
        assert!(discrs.iter().all(|d| *d != 0));
        discrs.sort_unstable();
        discrs.dedup();
        assert_eq!(discrs.len(), 3);
    }
}
