use std::net::IpAddr;

/// Loopback forms that are always admitted by the server's listeners.
pub const LOOPBACK_ADDRESSES: [&str; 3] = ["::ffff:127.0.0.1", "::1", "127.0.0.1"];

/// Remote addresses permitted to keep a connection open past accept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    entries: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Loopback forms followed by `extra`.
    pub fn with_loopback<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries: Vec<String> = LOOPBACK_ADDRESSES.iter().map(|s| s.to_string()).collect();
        entries.extend(extra.into_iter().map(Into::into));
        Self { entries }
    }

    /// Admit everything.
    pub fn any() -> Self {
        Self::new(["*"])
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// `*` matches unconditionally; other entries compare ignoring ASCII case.
    pub fn is_allowed(&self, ip: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry == "*" || entry.eq_ignore_ascii_case(ip))
    }

    /// Check a peer address in both its literal and canonical form, so an
    /// IPv4-mapped peer on a dual-stack listener matches either spelling.
    pub fn is_allowed_addr(&self, ip: IpAddr) -> bool {
        self.is_allowed(&ip.to_string()) || self.is_allowed(&ip.to_canonical().to_string())
    }
}
