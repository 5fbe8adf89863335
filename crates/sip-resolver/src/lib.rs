//! RFC 3263 server location for the rvoip stack
//!
//! [`ServerLocator`] resolves a SIP destination into ordered candidate
//! [`Hop`]s using SRV and A lookups, with RFC 2782 weighted selection
//! among SRV targets. DNS answers come from a [`DnsLookup`] backend
//! (hickory in production) and can be overridden per user through the
//! [`DnsInjectionService`].

pub mod config;
pub mod error;
pub mod hop;
pub mod injection;
pub mod locator;
pub mod lookup;
pub mod records;
pub mod srv_order;

pub use config::ResolverConfig;
pub use error::{Error, Result};
pub use hop::{Hop, TransportLookup, srv_prefix};
pub use injection::{DnsInjectionService, InjectAction, Injected, InjectedA, InjectedSrv, Override};
pub use locator::{LocateResponse, ResolveType, ServerLocator};
pub use lookup::{DnsLookup, HickoryLookup, StaticLookup};
pub use records::{ARecord, Matched, MatchedA, MatchedSrv, RecordSource, SrvRecord};
pub use srv_order::order_srv;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        DnsInjectionService, DnsLookup, Hop, InjectAction, LocateResponse, ResolveType,
        ResolverConfig, ServerLocator, TransportLookup,
    };
}
