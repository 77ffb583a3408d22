// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Turning a service domain into connection candidates.

use core::fmt;
use core::future::Future;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::net::IpAddr;

use log::debug;
use rand::{thread_rng, Rng};

use crate::config::{ChannelEncryption, ConnectionConfiguration};

/// SRV service name for STARTTLS-style client connections
pub const SRV_CLIENT: &str = "_xmpp-client._tcp";

/// SRV service name for direct-TLS client connections (XEP-0368)
pub const SRV_CLIENT_DIRECT_TLS: &str = "_xmpps-client._tcp";

/// Error from a [`Resolver`]. Resolution errors are never fatal, so no
/// further structure is needed.
pub type ResolveError = Box<dyn StdError + Send + Sync>;

/// One SRV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    /// Target host. `"."` means the service is decidedly not available.
    pub target: String,
    /// Target port.
    pub port: u16,
    /// Priority; lower values are tried first.
    pub priority: u16,
    /// Relative weight among records of the same priority.
    pub weight: u16,
}

impl SrvRecord {
    /// Whether this record says "no service here" (RFC 2782).
    pub fn is_root(&self) -> bool {
        self.target.is_empty() || self.target == "."
    }
}

/// DNS collaborator.
pub trait Resolver: Send + Sync + 'static {
    /// Look up SRV records of `name`.
    fn lookup_srv(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<SrvRecord>, ResolveError>> + Send;

    /// Look up TXT records of `name`, each parsed into `key=value`
    /// attributes.
    fn lookup_txt(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<HashMap<String, String>>, ResolveError>> + Send;
}

/// Parse the strings of one TXT record into attributes. Strings without
/// `=` are ignored.
pub fn parse_txt_attributes<'a, I: IntoIterator<Item = &'a [u8]>>(
    strings: I,
) -> HashMap<String, String> {
    strings
        .into_iter()
        .filter_map(|s| {
            let s = String::from_utf8_lossy(s);
            let (key, value) = s.split_once('=')?;
            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}

/// One connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// SRV priority (0 for targets not obtained via SRV).
    pub priority: u16,
    /// SRV weight (0 for targets not obtained via SRV).
    pub weight: u16,
    /// Whether TLS must be established right after connecting.
    pub direct_tls: bool,
}

impl Candidate {
    /// A target which did not come from an SRV lookup.
    pub fn plain(host: &str, port: u16, direct_tls: bool) -> Self {
        Self {
            host: host.to_owned(),
            port,
            priority: 0,
            weight: 0,
            direct_tls,
        }
    }

    fn from_srv(record: SrvRecord, direct_tls: bool) -> Self {
        let host = match record.target.strip_suffix('.') {
            Some(host) => host.to_owned(),
            None => record.target,
        };
        Self {
            host,
            port: record.port,
            priority: record.priority,
            weight: record.weight,
            direct_tls,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)?;
        } else {
            write!(f, "{}:{}", self.host, self.port)?;
        }
        if self.direct_tls {
            write!(f, " (direct TLS)")?;
        }
        Ok(())
    }
}

/// The single target to use when DNS is not consulted or yields nothing.
pub fn fallback_candidate(config: &ConnectionConfiguration) -> Candidate {
    Candidate::plain(
        config.hostname().unwrap_or(config.domain()),
        config.port(),
        config.channel_encryption() == ChannelEncryption::Direct,
    )
}

/// Whether the configuration pins a single target, bypassing DNS.
pub fn has_fixed_target(config: &ConnectionConfiguration) -> bool {
    config.hostname().is_some() || config.domain().parse::<IpAddr>().is_ok()
}

/// The ASCII form of `domain` for DNS queries.
#[cfg(feature = "dns")]
pub(crate) fn ascii_domain(domain: &str) -> Option<String> {
    match idna::domain_to_ascii(domain) {
        Ok(domain) => Some(domain),
        Err(e) => {
            debug!("Cannot convert {} to ASCII: {:?}", domain, e);
            None
        }
    }
}

#[cfg(not(feature = "dns"))]
pub(crate) fn ascii_domain(domain: &str) -> Option<String> {
    Some(domain.to_owned())
}

async fn lookup_family<R: Resolver>(
    resolver: &R,
    service: &str,
    domain: &str,
    direct_tls: bool,
) -> Vec<Candidate> {
    let name = format!("{}.{}.", service, domain);
    let records = match resolver.lookup_srv(&name).await {
        Ok(records) => records,
        Err(e) => {
            debug!("SRV lookup of {} failed: {}", name, e);
            return Vec::new();
        }
    };
    if records.iter().any(SrvRecord::is_root) {
        debug!("{} announces that the service is not available", name);
        return Vec::new();
    }
    debug!("{} has {} SRV records", name, records.len());
    records
        .into_iter()
        .map(|record| Candidate::from_srv(record, direct_tls))
        .collect()
}

/// Resolve the SRV candidates of the configured domain, in the order they
/// are to be tried.
///
/// Does not include the final fallback to the domain itself; see
/// [`fallback_candidate`]. Resolution errors yield no candidates.
pub async fn resolve_candidates<R: Resolver>(
    resolver: &R,
    config: &ConnectionConfiguration,
) -> Vec<Candidate> {
    let Some(domain) = ascii_domain(config.domain()) else {
        return Vec::new();
    };

    let mode = config.channel_encryption();
    let mut candidates = Vec::new();
    if mode != ChannelEncryption::Direct {
        candidates.extend(lookup_family(resolver, SRV_CLIENT, &domain, false).await);
    }
    if mode != ChannelEncryption::Disabled {
        candidates.extend(lookup_family(resolver, SRV_CLIENT_DIRECT_TLS, &domain, true).await);
    }
    let ordered = order_candidates(candidates, &mut thread_rng());
    for candidate in &ordered {
        debug!(
            "Candidate {} (priority {}, weight {})",
            candidate, candidate.priority, candidate.weight
        );
    }
    ordered
}

/// Order candidates per RFC 2782: ascending priority; within a priority,
/// repeated weighted random selection.
pub fn order_candidates<G: Rng + ?Sized>(mut candidates: Vec<Candidate>, rng: &mut G) -> Vec<Candidate> {
    candidates.sort_by_key(|c| c.priority);
    let mut result = Vec::with_capacity(candidates.len());
    let mut rest = candidates.into_iter().peekable();
    while let Some(first) = rest.next() {
        let mut group = vec![first];
        while let Some(next) = rest.next_if(|c| c.priority == group[0].priority) {
            group.push(next);
        }
        // Zero-weight records go first in the running-sum list.
        group.sort_by_key(|c| c.weight != 0);
        while !group.is_empty() {
            let total: u32 = group.iter().map(|c| u32::from(c.weight)).sum();
            let threshold = rng.gen_range(0..=total);
            let mut running = 0;
            let mut chosen = group.len() - 1;
            for (i, c) in group.iter().enumerate() {
                running += u32::from(c.weight);
                if running >= threshold {
                    chosen = i;
                    break;
                }
            }
            result.push(group.remove(chosen));
        }
    }
    result
}

#[cfg(feature = "dns")]
pub use self::hickory::HickoryResolver;

/// The resolver used by default.
#[cfg(feature = "dns")]
pub type DefaultResolver = HickoryResolver;

/// The resolver used by default.
#[cfg(not(feature = "dns"))]
pub type DefaultResolver = NoResolver;

/// [`Resolver`] which finds nothing, so that only the fallback target is
/// tried.
#[derive(Debug, Default)]
pub struct NoResolver;

impl Resolver for NoResolver {
    async fn lookup_srv(&self, _name: &str) -> Result<Vec<SrvRecord>, ResolveError> {
        Err("DNS support not compiled in".into())
    }

    async fn lookup_txt(&self, _name: &str) -> Result<Vec<HashMap<String, String>>, ResolveError> {
        Err("DNS support not compiled in".into())
    }
}

#[cfg(feature = "dns")]
mod hickory {
    use std::collections::HashMap;

    use hickory_resolver::TokioAsyncResolver;
    use tokio::sync::OnceCell;

    use super::{parse_txt_attributes, ResolveError, Resolver, SrvRecord};

    /// [`Resolver`] using the system DNS configuration.
    #[derive(Default)]
    pub struct HickoryResolver {
        inner: OnceCell<TokioAsyncResolver>,
    }

    impl HickoryResolver {
        /// Create a resolver; the system configuration is read on first
        /// use.
        pub fn new() -> Self {
            Self::default()
        }

        async fn resolver(&self) -> Result<&TokioAsyncResolver, ResolveError> {
            self.inner
                .get_or_try_init(|| async { TokioAsyncResolver::tokio_from_system_conf() })
                .await
                .map_err(|e| Box::new(e) as ResolveError)
        }
    }

    impl Resolver for HickoryResolver {
        async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, ResolveError> {
            let lookup = self.resolver().await?.srv_lookup(name).await?;
            Ok(lookup
                .iter()
                .map(|srv| SrvRecord {
                    target: if srv.target().is_root() {
                        ".".to_owned()
                    } else {
                        srv.target().to_ascii()
                    },
                    port: srv.port(),
                    priority: srv.priority(),
                    weight: srv.weight(),
                })
                .collect())
        }

        async fn lookup_txt(&self, name: &str) -> Result<Vec<HashMap<String, String>>, ResolveError> {
            let lookup = self.resolver().await?.txt_lookup(name).await?;
            Ok(lookup
                .iter()
                .map(|txt| parse_txt_attributes(txt.txt_data().iter().map(|s| &s[..])))
                .collect())
        }
    }
}
