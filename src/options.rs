//! Connection options

use std::time::Duration;

/// Per-connection configuration toggles.
///
/// The defaults match common directory-client behavior: referral chasing and
/// auto-reconnect are opt-in, socket keepalive/no-delay are on, and inbound
/// frames are capped at 20 MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// On unexpected close, transparently reopen the transport before the
    /// next request. Rebinding is the caller's job.
    pub auto_reconnect: bool,
    /// On a referral result, rebuild and retry the request against the
    /// referral URL
    pub follow_referrals: bool,
    /// Cap on referral chain depth
    pub referral_hop_limit: u32,
    /// SO_KEEPALIVE on new sockets
    pub use_keepalive: bool,
    /// TCP_NODELAY on new sockets
    pub use_tcp_no_delay: bool,
    /// SO_REUSEADDR on new sockets
    pub use_reuse_address: bool,
    /// SO_LINGER with the given timeout, when set
    pub linger: Option<Duration>,
    /// TCP connect cap
    pub connect_timeout: Duration,
    /// Default per-operation response cap
    pub response_timeout: Duration,
    /// Inbound-frame size cap; an oversized frame terminates the connection
    pub max_message_size: usize,
    /// Collapse reader and sender into the calling thread. Must be set
    /// before connecting; concurrent operations are rejected.
    pub use_synchronous_mode: bool,
    /// Reject simple binds that carry a DN but no password
    pub bind_dn_requires_password: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            auto_reconnect: false,
            follow_referrals: false,
            referral_hop_limit: 5,
            use_keepalive: true,
            use_tcp_no_delay: true,
            use_reuse_address: true,
            linger: Some(Duration::from_secs(5)),
            connect_timeout: Duration::from_millis(60_000),
            response_timeout: Duration::from_millis(300_000),
            max_message_size: 20 * 1024 * 1024,
            use_synchronous_mode: false,
            bind_dn_requires_password: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::default();
        assert!(!options.auto_reconnect);
        assert!(!options.follow_referrals);
        assert_eq!(options.referral_hop_limit, 5);
        assert_eq!(options.connect_timeout, Duration::from_secs(60));
        assert_eq!(options.response_timeout, Duration::from_secs(300));
        assert_eq!(options.max_message_size, 20 * 1024 * 1024);
        assert_eq!(options.linger, Some(Duration::from_secs(5)));
    }
}
