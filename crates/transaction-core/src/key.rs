//! # Transaction keys
//!
//! A [`TransactionKey`] holds every component a message contributes to
//! transaction matching:
//!
//! * the base identity `B`: Call-ID, From tag and CSeq number, optionally
//!   extended with the To tag (`BT`)
//! * the Via component `V`: top Via branch and sent-by
//! * the role `N`/`C`/`A`/`P`: Normal, Cancel, Ack or Prack
//!
//! Which components take part in equality depends on where the key is used.
//! A [`KeyContext`] selects the active components and produces a [`MapKey`],
//! the value actually hashed into the transaction table:
//!
//! | context  | layout        |
//! |----------|---------------|
//! | client   | `V-B-N` / `V-BT-N` |
//! | server   | `B-N`         |
//! | merged   | `V-B-N`       |
//! | cancel   | `V-B-C`       |
//! | prack    | `V-B-P`       |
//!
//! Hosts compare case-insensitively and a missing sent-by port equals the
//! transport's default port.

use std::fmt;

use rvoip_sip_transport::Transport;

use crate::error::{Error, Result};
use crate::message::{Method, SipMessage, Via};

/// Role discriminator; picks which map a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    Normal,
    Cancel,
    Ack,
    Prack,
}

impl KeyRole {
    pub fn for_method(method: &Method) -> Self {
        match method {
            Method::Cancel => KeyRole::Cancel,
            Method::Ack => KeyRole::Ack,
            Method::Prack => KeyRole::Prack,
            _ => KeyRole::Normal,
        }
    }

    fn suffix(self) -> char {
        match self {
            KeyRole::Normal => 'N',
            KeyRole::Cancel => 'C',
            KeyRole::Ack => 'A',
            KeyRole::Prack => 'P',
        }
    }
}

/// Normalised top-Via component
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViaPart {
    pub branch: String,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

impl ViaPart {
    pub fn from_via(via: &Via) -> Self {
        Self {
            branch: via.branch.clone().unwrap_or_default(),
            host: via.host.to_ascii_lowercase(),
            port: via.effective_port(),
            transport: via.transport,
        }
    }

    /// Compares sent-by only, ignoring the branch
    pub fn same_sent_by(&self, other: &ViaPart) -> bool {
        self.host == other.host && self.port == other.port && self.transport == other.transport
    }
}

impl fmt::Display for ViaPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.branch, self.host, self.port, self.transport)
    }
}

/// Which key components are active for a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyContext {
    pub use_via: bool,
    pub use_to_tag: bool,
}

impl KeyContext {
    pub const CLIENT: KeyContext = KeyContext { use_via: true, use_to_tag: false };
    pub const CLIENT_WITH_TO_TAG: KeyContext = KeyContext { use_via: true, use_to_tag: true };
    pub const SERVER: KeyContext = KeyContext { use_via: false, use_to_tag: false };
    pub const VIA_INCLUSIVE: KeyContext = KeyContext { use_via: true, use_to_tag: false };
}

/// Full key of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionKey {
    pub call_id: String,
    pub from_tag: String,
    pub cseq: u32,
    pub method: Method,
    pub to_tag: Option<String>,
    pub via: Option<ViaPart>,
    pub role: KeyRole,
}

impl TransactionKey {
    /// Extracts the key from a request or response
    pub fn from_message(message: &SipMessage) -> Result<Self> {
        let call_id = message.call_id().ok_or(Error::MissingHeader("Call-ID"))?;
        let (cseq, cseq_method) = message.cseq().ok_or(Error::MissingHeader("CSeq"))?;
        let method = match message.method() {
            Some(method) => {
                if *method != cseq_method {
                    return Err(Error::InvalidMessage(format!(
                        "CSeq method {} does not match request method {}",
                        cseq_method, method
                    )));
                }
                method.clone()
            }
            None => cseq_method,
        };
        Ok(Self {
            call_id: call_id.to_string(),
            from_tag: message.from_tag().unwrap_or_default().to_string(),
            cseq,
            role: KeyRole::for_method(&method),
            method,
            to_tag: message.to_tag().map(str::to_string),
            via: message.top_via().map(|v| ViaPart::from_via(&v)),
        })
    }

    pub fn is_invite(&self) -> bool {
        self.method == Method::Invite
    }

    /// Table key with the components `context` selects
    pub fn map_key(&self, context: KeyContext) -> MapKey {
        MapKey {
            call_id: self.call_id.clone(),
            from_tag: self.from_tag.clone(),
            cseq: self.cseq,
            role: self.role,
            to_tag: if context.use_to_tag { self.to_tag.clone() } else { None },
            via: if context.use_via { self.via.clone() } else { None },
        }
    }

    /// Key of the transaction a CANCEL or ACK refers to
    pub fn target_base(&self) -> TransactionKey {
        TransactionKey {
            role: KeyRole::Normal,
            method: Method::Invite,
            to_tag: None,
            ..self.clone()
        }
    }

    /// Key of the INVITE a PRACK acknowledges, taken from its RAck
    pub fn prack_target(&self, message: &SipMessage) -> Result<TransactionKey> {
        let (_, cseq, method) = message.rack().ok_or(Error::MissingHeader("RAck"))?;
        Ok(TransactionKey {
            cseq,
            method,
            role: KeyRole::Normal,
            to_tag: None,
            ..self.clone()
        })
    }

    pub fn via_equals(&self, other: &TransactionKey) -> bool {
        self.via == other.via
    }

    pub fn sent_by_equals(&self, other: &TransactionKey) -> bool {
        match (&self.via, &other.via) {
            (Some(a), Some(b)) => a.same_sent_by(b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Call-ID, From tag and CSeq equal; Via and role ignored
    pub fn base_equals(&self, other: &TransactionKey) -> bool {
        self.call_id == other.call_id && self.from_tag == other.from_tag && self.cseq == other.cseq
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(via) = &self.via {
            write!(f, "{}-", via)?;
        }
        write!(f, "{}:{}:{}", self.call_id, self.from_tag, self.cseq)?;
        if let Some(tag) = &self.to_tag {
            write!(f, ":{}", tag)?;
        }
        write!(f, "-{}", self.role.suffix())
    }
}

/// The hashed form of a key; only active components are present
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapKey {
    call_id: String,
    from_tag: String,
    cseq: u32,
    role: KeyRole,
    to_tag: Option<String>,
    via: Option<ViaPart>,
}

impl MapKey {
    pub fn role(&self) -> KeyRole {
        self.role
    }

    pub fn has_via(&self) -> bool {
        self.via.is_some()
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(via) = &self.via {
            write!(f, "{}-", via)?;
        }
        write!(f, "{}:{}:{}", self.call_id, self.from_tag, self.cseq)?;
        if let Some(tag) = &self.to_tag {
            write!(f, ":{}", tag)?;
        }
        write!(f, "-{}", self.role.suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(method: &str, branch: &str, sent_by: &str, extra: &str) -> SipMessage {
        let raw = format!(
            "{m} sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP {sent_by};branch={branch}\r\n\
             From: <sip:alice@example.com>;tag=ft\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: call-1\r\n\
             CSeq: 7 {m}\r\n{extra}\r\n",
            m = method
        );
        SipMessage::parse(raw.as_bytes()).unwrap()
    }

    fn key(method: &str, branch: &str, sent_by: &str) -> TransactionKey {
        TransactionKey::from_message(&request(method, branch, sent_by, "")).unwrap()
    }

    #[test]
    fn role_follows_method() {
        assert_eq!(key("INVITE", "z9hG4bK1", "a").role, KeyRole::Normal);
        assert_eq!(key("CANCEL", "z9hG4bK1", "a").role, KeyRole::Cancel);
        assert_eq!(key("ACK", "z9hG4bK1", "a").role, KeyRole::Ack);
        assert_eq!(key("PRACK", "z9hG4bK1", "a").role, KeyRole::Prack);
    }

    #[test]
    fn server_key_ignores_via_but_merged_key_does_not() {
        let a = key("INVITE", "z9hG4bK1", "a.example.com");
        let b = key("INVITE", "z9hG4bK2", "a.example.com");
        assert_eq!(a.map_key(KeyContext::SERVER), b.map_key(KeyContext::SERVER));
        assert_ne!(a.map_key(KeyContext::VIA_INCLUSIVE), b.map_key(KeyContext::VIA_INCLUSIVE));
        assert!(a.base_equals(&b));
        assert!(!a.via_equals(&b));
    }

    #[test]
    fn default_port_and_host_case_are_normalised() {
        let a = key("INVITE", "z9hG4bK1", "Host.Example.com");
        let b = key("INVITE", "z9hG4bK1", "host.example.com:5060");
        assert!(a.via_equals(&b));
        assert_eq!(a.map_key(KeyContext::CLIENT), b.map_key(KeyContext::CLIENT));

        let c = key("INVITE", "z9hG4bK1", "host.example.com:5070");
        assert!(!a.via_equals(&c));
    }

    #[test]
    fn cancel_and_ack_target_the_invite() {
        let invite = key("INVITE", "z9hG4bK1", "a");
        let cancel = key("CANCEL", "z9hG4bK1", "a");
        let target = cancel.target_base();
        assert_eq!(target.map_key(KeyContext::SERVER), invite.map_key(KeyContext::SERVER));
        assert_eq!(
            target.map_key(KeyContext::VIA_INCLUSIVE),
            invite.map_key(KeyContext::VIA_INCLUSIVE)
        );
        // a CANCEL keyed on its own never collides with the INVITE
        assert_ne!(
            cancel.map_key(KeyContext::VIA_INCLUSIVE),
            invite.map_key(KeyContext::VIA_INCLUSIVE)
        );
    }

    #[test]
    fn prack_target_comes_from_rack() {
        let msg = request("PRACK", "z9hG4bK9", "a", "RAck: 1 3 INVITE\r\n");
        let prack = TransactionKey::from_message(&msg).unwrap();
        let target = prack.prack_target(&msg).unwrap();
        assert_eq!(target.cseq, 3);
        assert_eq!(target.role, KeyRole::Normal);
        assert!(target.sent_by_equals(&key("INVITE", "z9hG4bK1", "a")));

        let bare = request("PRACK", "z9hG4bK9", "a", "");
        assert!(matches!(
            prack.prack_target(&bare),
            Err(Error::MissingHeader("RAck"))
        ));
    }

    #[test]
    fn to_tag_only_counts_in_its_context() {
        let mut tagged = key("INVITE", "z9hG4bK1", "a");
        tagged.to_tag = Some("tt".to_string());
        let plain = key("INVITE", "z9hG4bK1", "a");
        assert_eq!(tagged.map_key(KeyContext::CLIENT), plain.map_key(KeyContext::CLIENT));
        assert_ne!(
            tagged.map_key(KeyContext::CLIENT_WITH_TO_TAG),
            plain.map_key(KeyContext::CLIENT_WITH_TO_TAG)
        );
    }

    #[test]
    fn mismatched_cseq_method_is_rejected() {
        let raw = "BYE sip:b@x SIP/2.0\r\nVia: SIP/2.0/UDP a;branch=z9hG4bK1\r\n\
                   Call-ID: c\r\nCSeq: 1 INVITE\r\n\r\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert!(matches!(TransactionKey::from_message(&msg), Err(Error::InvalidMessage(_))));

        let no_call_id = "BYE sip:b@x SIP/2.0\r\nCSeq: 1 BYE\r\n\r\n";
        let msg = SipMessage::parse(no_call_id.as_bytes()).unwrap();
        assert!(matches!(TransactionKey::from_message(&msg), Err(Error::MissingHeader("Call-ID"))));
    }

    fn arb_key() -> impl Strategy<Value = TransactionKey> {
        (
            "[a-z0-9]{1,8}",
            "[a-z0-9]{0,4}",
            1u32..5,
            "z9hG4bK[a-z0-9]{1,4}",
            "[a-z]{1,3}",
            prop::option::of(5060u16..5063),
            prop::sample::select(vec![KeyRole::Normal, KeyRole::Cancel, KeyRole::Prack]),
        )
            .prop_map(|(call_id, from_tag, cseq, branch, host, port, role)| TransactionKey {
                call_id,
                from_tag,
                cseq,
                method: Method::Invite,
                to_tag: None,
                via: Some(ViaPart {
                    branch,
                    host,
                    port: port.unwrap_or(5060),
                    transport: Transport::Udp,
                }),
                role,
            })
    }

    proptest! {
        #[test]
        fn server_equality_is_base_and_role_equality(a in arb_key(), b in arb_key()) {
            let same = a.map_key(KeyContext::SERVER) == b.map_key(KeyContext::SERVER);
            prop_assert_eq!(same, a.base_equals(&b) && a.role == b.role);
        }

        #[test]
        fn via_inclusive_equality_adds_via(a in arb_key(), b in arb_key()) {
            let same = a.map_key(KeyContext::VIA_INCLUSIVE) == b.map_key(KeyContext::VIA_INCLUSIVE);
            prop_assert_eq!(same, a.base_equals(&b) && a.role == b.role && a.via_equals(&b));
        }

        #[test]
        fn equal_map_keys_hash_equal(a in arb_key()) {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let b = a.clone();
            for ctx in [KeyContext::SERVER, KeyContext::CLIENT, KeyContext::CLIENT_WITH_TO_TAG] {
                let mut ha = DefaultHasher::new();
                let mut hb = DefaultHasher::new();
                a.map_key(ctx).hash(&mut ha);
                b.map_key(ctx).hash(&mut hb);
                prop_assert_eq!(ha.finish(), hb.finish());
            }
        }
    }
}
