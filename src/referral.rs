//! Referral URLs and the referral follower
//!
//! A referral result carries `ldap://host:port/base-dn` URIs. When referral
//! following is enabled, the operation rebuilds itself against the URL's
//! host, port and (when present) base DN, obtains a fresh connection, and
//! re-issues. A hop limit bounds the chain.

use crate::connection::LdapConnection;
use crate::error::Error;
use crate::ldap::LdapString;
use log::debug;
use percent_encoding::percent_decode_str;

const DEFAULT_LDAP_PORT: u16 = 389;
const DEFAULT_LDAPS_PORT: u16 = 636;

/// The parts of an LDAP URL the follower uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Percent-decoded DN from the URL path; empty when the URL names none
    pub base_dn: String,
}

impl LdapUrl {
    /// Parse an `ldap://` or `ldaps://` URL, ignoring the query portion
    /// (attributes, scope, filter)
    pub fn parse(spec: &str) -> Result<LdapUrl, Error> {
        let url = url::Url::parse(spec)
            .map_err(|e| Error::invalid_text("LDAP URL", format!("{}: {}", spec, e)))?;
        let scheme = url.scheme().to_ascii_lowercase();
        if scheme != "ldap" && scheme != "ldaps" {
            return Err(Error::invalid_text(
                "LDAP URL",
                format!("unsupported scheme in {}", spec),
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_text("LDAP URL", format!("missing host in {}", spec)))?
            .to_string();
        let port = url.port().unwrap_or(if scheme == "ldaps" {
            DEFAULT_LDAPS_PORT
        } else {
            DEFAULT_LDAP_PORT
        });
        let path = url.path().trim_start_matches('/');
        let base_dn = percent_decode_str(path)
            .decode_utf8()
            .map_err(|_| Error::invalid_text("LDAP URL", format!("bad DN encoding in {}", spec)))?
            .into_owned();
        Ok(LdapUrl {
            scheme,
            host,
            port,
            base_dn,
        })
    }
}

/// How a referral chase ended
pub(crate) enum FollowOutcome<T> {
    /// A referral target produced a result
    Followed(T),
    /// The chain is longer than the hop limit allows
    HopLimit,
    /// No usable referral URL; the original result stands
    NotFollowed,
}

/// Chase a referral one hop: try each URL in order, re-issuing through
/// `reissue` on a connection to the target. Connection or operation failures
/// fall through to the next URL.
pub(crate) fn follow<T>(
    conn: &LdapConnection,
    urls: &[LdapString],
    depth: u32,
    reissue: impl Fn(&LdapConnection, &LdapUrl, u32) -> Result<T, Error>,
) -> FollowOutcome<T> {
    let limit = conn.options().referral_hop_limit;
    if depth >= limit {
        debug!("referral hop limit {} reached", limit);
        return FollowOutcome::HopLimit;
    }
    for raw in urls {
        let url = match LdapUrl::parse(&raw.0) {
            Ok(url) => url,
            Err(e) => {
                debug!("skipping unparseable referral {:?}: {}", raw.0, e);
                continue;
            }
        };
        let target = match conn.referral_connection(&url) {
            Ok(target) => target,
            Err(e) => {
                debug!("referral connection to {}:{} failed: {}", url.host, url.port, e);
                continue;
            }
        };
        match reissue(&target, &url, depth + 1) {
            Ok(result) => {
                target.unbind();
                return FollowOutcome::Followed(result);
            }
            Err(e) => {
                debug!("referral re-issue against {}:{} failed: {}", url.host, url.port, e);
                target.unbind();
            }
        }
    }
    FollowOutcome::NotFollowed
}
