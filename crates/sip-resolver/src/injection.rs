//! Injected DNS records.
//!
//! Records can be injected per user id or globally. A user with no
//! injected records of a kind sees the global ones. Each record carries an
//! [`InjectAction`] that decides how it combines with live DNS for the same
//! name.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::records::{ARecord, SrvRecord, normalize_name};

const GLOBAL: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InjectAction {
    /// The name resolves to nothing
    Block,
    /// Only injected records are returned for the name
    Replace,
    /// Injected records go in front of the live ones
    Prepend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Injected<R> {
    pub record: R,
    pub action: InjectAction,
}

impl<R> Injected<R> {
    pub fn new(record: R, action: InjectAction) -> Self {
        Self { record, action }
    }
}

pub type InjectedSrv = Injected<SrvRecord>;
pub type InjectedA = Injected<ARecord>;

/// What the injection table says about one name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Override<R> {
    /// Nothing injected; use live DNS
    None,
    Block,
    Replace(Vec<R>),
    Prepend(Vec<R>),
}

impl<R: Clone> Override<R> {
    fn from_matches(matches: Vec<&Injected<R>>) -> Self {
        if matches.is_empty() {
            return Override::None;
        }
        if matches.iter().any(|m| m.action == InjectAction::Block) {
            return Override::Block;
        }
        let replace = matches.iter().any(|m| m.action == InjectAction::Replace);
        let records = matches.into_iter().map(|m| m.record.clone()).collect();
        if replace {
            Override::Replace(records)
        } else {
            Override::Prepend(records)
        }
    }
}

/// In-memory injection table
#[derive(Default)]
pub struct DnsInjectionService {
    srv: RwLock<HashMap<String, Vec<InjectedSrv>>>,
    a: RwLock<HashMap<String, Vec<InjectedA>>>,
}

fn user_key(user: Option<&str>) -> String {
    match user {
        Some(user) if !user.is_empty() => user.to_lowercase(),
        _ => GLOBAL.to_string(),
    }
}

impl DnsInjectionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the SRV records injected for `user` (`None` = global)
    pub fn inject_srv(&self, user: Option<&str>, records: Vec<InjectedSrv>) {
        let records: Vec<InjectedSrv> = records
            .into_iter()
            .map(|mut r| {
                r.record.name = normalize_name(&r.record.name);
                r.record.target = normalize_name(&r.record.target);
                r
            })
            .collect();
        warn!(user = %user_key(user), count = records.len(), "injecting SRV records");
        self.srv.write().insert(user_key(user), records);
    }

    /// Replaces the A records injected for `user` (`None` = global)
    pub fn inject_a(&self, user: Option<&str>, records: Vec<InjectedA>) {
        let records: Vec<InjectedA> = records
            .into_iter()
            .map(|mut r| {
                r.record.name = normalize_name(&r.record.name);
                r
            })
            .collect();
        warn!(user = %user_key(user), count = records.len(), "injecting A records");
        self.a.write().insert(user_key(user), records);
    }

    pub fn clear(&self, user: Option<&str>) {
        let key = user_key(user);
        self.srv.write().remove(&key);
        self.a.write().remove(&key);
    }

    pub fn injected_srv(&self, user: Option<&str>) -> Vec<InjectedSrv> {
        lookup(&self.srv.read(), user)
    }

    pub fn injected_a(&self, user: Option<&str>) -> Vec<InjectedA> {
        lookup(&self.a.read(), user)
    }

    /// Override for the SRV query `name`
    pub fn srv_override(&self, user: Option<&str>, name: &str) -> Override<SrvRecord> {
        let name = normalize_name(name);
        let injected = self.injected_srv(user);
        Override::from_matches(injected.iter().filter(|r| r.record.name == name).collect())
    }

    /// Override for the A query `name`
    pub fn a_override(&self, user: Option<&str>, name: &str) -> Override<ARecord> {
        let name = normalize_name(name);
        let injected = self.injected_a(user);
        Override::from_matches(injected.iter().filter(|r| r.record.name == name).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.srv.read().is_empty() && self.a.read().is_empty()
    }
}

fn lookup<R: Clone>(map: &HashMap<String, Vec<R>>, user: Option<&str>) -> Vec<R> {
    let key = user_key(user);
    match map.get(&key) {
        Some(records) if !records.is_empty() => records.clone(),
        _ if key != GLOBAL => map.get(GLOBAL).cloned().unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(name: &str, ip: &str, action: InjectAction) -> InjectedA {
        Injected::new(ARecord::new(name, 60, ip.parse().unwrap()), action)
    }

    #[test]
    fn user_records_fall_back_to_global() {
        let service = DnsInjectionService::new();
        service.inject_a(None, vec![a("global.example.com", "1.1.1.1", InjectAction::Replace)]);
        service.inject_a(
            Some("Alice"),
            vec![a("alice.example.com", "2.2.2.2", InjectAction::Replace)],
        );

        assert_eq!(service.injected_a(Some("alice")).len(), 1);
        assert_eq!(service.injected_a(Some("ALICE"))[0].record.name, "alice.example.com.");
        assert_eq!(service.injected_a(Some("bob"))[0].record.name, "global.example.com.");

        service.clear(Some("alice"));
        assert_eq!(service.injected_a(Some("alice"))[0].record.name, "global.example.com.");
        service.clear(None);
        assert!(service.injected_a(Some("alice")).is_empty());
        assert!(service.is_empty());
    }

    #[test]
    fn overrides_by_action() {
        let service = DnsInjectionService::new();
        service.inject_a(
            None,
            vec![
                a("blocked.example.com", "1.1.1.1", InjectAction::Block),
                a("replaced.example.com", "2.2.2.2", InjectAction::Replace),
                a("Prepended.example.com.", "3.3.3.3", InjectAction::Prepend),
            ],
        );
        assert_eq!(service.a_override(None, "blocked.example.com"), Override::Block);
        assert!(matches!(
            service.a_override(None, "replaced.example.com."),
            Override::Replace(r) if r.len() == 1
        ));
        assert!(matches!(
            service.a_override(None, "prepended.example.com"),
            Override::Prepend(r) if r.len() == 1
        ));
        assert_eq!(service.a_override(None, "other.example.com"), Override::None);
    }
}
