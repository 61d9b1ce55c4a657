//! Port mapping value type and its lifetime policy

use super::types::{NatError, Protocol};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// Lease window applied to session mappings, renewed while the process runs
pub const SESSION_LEASE_SECS: u32 = 10 * 60;

/// How a mapping's lease is managed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    /// Never expires, never renewed (lifetime 0)
    Permanent,
    /// Fixed 10 minute window, renewed by the scheduler
    Session,
    /// Expires after the requested lifetime, never renewed
    Manual,
    /// Router only accepted a permanent lease for what was requested as a
    /// session or manual mapping. Never expires locally, never renewed.
    ForcedSession,
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Permanent => "permanent",
            Self::Session => "session",
            Self::Manual => "manual",
            Self::ForcedSession => "forced-session",
        };
        f.write_str(name)
    }
}

/// Identity of a mapping inside a device's owned set
pub type MappingKey = (u16, u16);

/// A port forwarding rule on the gateway.
///
/// Equality and hashing only consider `(public_port, private_port)`.
#[derive(Debug, Clone)]
pub struct Mapping {
    protocol: Protocol,
    private_ip: Option<IpAddr>,
    private_port: u16,
    public_ip: Option<IpAddr>,
    public_port: u16,
    description: String,
    lifetime_secs: u32,
    expiration: DateTime<Utc>,
    kind: MappingKind,
}

impl Mapping {
    /// Lifetime value requesting a session mapping
    pub const SESSION_LIFETIME: i32 = i32::MAX;

    /// Create a mapping.
    ///
    /// `lifetime` selects the kind: [`Mapping::SESSION_LIFETIME`] gives a
    /// session mapping, `0` a permanent one, anything else positive a manual
    /// lease of that many seconds. A `None` private IP is filled with the
    /// device's local address when the mapping is created.
    pub fn new(
        protocol: Protocol,
        private_ip: Option<IpAddr>,
        private_port: u16,
        public_port: u16,
        lifetime: i32,
        description: impl Into<String>,
    ) -> Result<Self, NatError> {
        Self::new_at(
            protocol,
            private_ip,
            private_port,
            public_port,
            lifetime,
            description,
            Utc::now(),
        )
    }

    /// Same as [`Mapping::new`] with an explicit creation instant
    pub fn new_at(
        protocol: Protocol,
        private_ip: Option<IpAddr>,
        private_port: u16,
        public_port: u16,
        lifetime: i32,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, NatError> {
        if lifetime < 0 {
            return Err(NatError::InvalidArgument(format!(
                "lifetime must not be negative, got {}",
                lifetime
            )));
        }

        let (kind, lifetime_secs, expiration) = match lifetime {
            Self::SESSION_LIFETIME => (
                MappingKind::Session,
                SESSION_LEASE_SECS,
                now + ChronoDuration::seconds(SESSION_LEASE_SECS as i64),
            ),
            0 => (MappingKind::Permanent, 0, DateTime::<Utc>::MAX_UTC),
            secs => (
                MappingKind::Manual,
                secs as u32,
                now + ChronoDuration::seconds(secs as i64),
            ),
        };

        Ok(Self {
            protocol,
            private_ip,
            private_port,
            public_ip: None,
            public_port,
            description: description.into(),
            lifetime_secs,
            expiration,
            kind,
        })
    }

    /// Build a mapping from unchecked values (router responses, command line).
    ///
    /// Fails with [`NatError::InvalidArgument`] when a port does not fit in
    /// 16 bits, the lifetime is negative or out of range, or the protocol is
    /// neither TCP nor UDP.
    pub fn from_raw(
        protocol: &str,
        private_ip: Option<IpAddr>,
        private_port: i64,
        public_port: i64,
        lifetime: i64,
        description: impl Into<String>,
    ) -> Result<Self, NatError> {
        let protocol: Protocol = protocol.parse()?;
        let private_port = checked_port("private", private_port)?;
        let public_port = checked_port("public", public_port)?;
        let lifetime = i32::try_from(lifetime).map_err(|_| {
            NatError::InvalidArgument(format!("lifetime {} is out of range", lifetime))
        })?;
        Self::new(
            protocol,
            private_ip,
            private_port,
            public_port,
            lifetime,
            description,
        )
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn private_ip(&self) -> Option<IpAddr> {
        self.private_ip
    }

    pub fn private_port(&self) -> u16 {
        self.private_port
    }

    /// Remote host restriction; `None` is the wildcard
    pub fn public_ip(&self) -> Option<IpAddr> {
        self.public_ip
    }

    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Lease duration sent to the gateway, in seconds
    pub fn lifetime_secs(&self) -> u32 {
        self.lifetime_secs
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    pub fn kind(&self) -> MappingKind {
        self.kind
    }

    pub fn key(&self) -> MappingKey {
        (self.public_port, self.private_port)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !matches!(
            self.kind,
            MappingKind::Permanent | MappingKind::ForcedSession
        ) && self.expiration < now
    }

    pub fn should_renew(&self) -> bool {
        self.should_renew_at(Utc::now())
    }

    pub fn should_renew_at(&self, now: DateTime<Utc>) -> bool {
        self.kind == MappingKind::Session && self.is_expired_at(now)
    }

    /// Copy with the expiration pushed `lifetime_secs` past `now`
    pub fn renewed_at(&self, now: DateTime<Utc>) -> Self {
        let mut renewed = self.clone();
        renewed.expiration = now + ChronoDuration::seconds(self.lifetime_secs as i64);
        renewed
    }

    pub fn with_expiration(&self, expiration: DateTime<Utc>) -> Self {
        let mut mapping = self.clone();
        mapping.expiration = expiration;
        mapping
    }

    pub fn with_private_ip(&self, private_ip: IpAddr) -> Self {
        let mut mapping = self.clone();
        mapping.private_ip = Some(private_ip);
        mapping
    }

    pub fn with_public_ip(&self, public_ip: Option<IpAddr>) -> Self {
        let mut mapping = self.clone();
        mapping.public_ip = public_ip;
        mapping
    }

    pub fn with_public_port(&self, public_port: u16) -> Self {
        let mut mapping = self.clone();
        mapping.public_port = public_port;
        mapping
    }

    /// Copy with a different lease. A zero lease never expires locally.
    pub fn with_lease(&self, lifetime_secs: u32, kind: MappingKind) -> Self {
        let mut mapping = self.clone();
        mapping.lifetime_secs = lifetime_secs;
        mapping.kind = kind;
        if lifetime_secs == 0 {
            mapping.expiration = DateTime::<Utc>::MAX_UTC;
        }
        mapping
    }
}

fn checked_port(which: &str, port: i64) -> Result<u16, NatError> {
    u16::try_from(port).map_err(|_| {
        NatError::InvalidArgument(format!(
            "{} port {} does not fit in 16 bits",
            which, port
        ))
    })
}

impl PartialEq for Mapping {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Mapping {}

impl Hash for Mapping {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let private_ip = self
            .private_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "local".to_string());
        let public_ip = self
            .public_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "*".to_string());
        write!(
            f,
            "{} {}:{} -> {}:{} '{}' ({}",
            self.protocol,
            public_ip,
            self.public_port,
            private_ip,
            self.private_port,
            self.description,
            self.kind
        )?;
        match self.kind {
            MappingKind::Session | MappingKind::Manual => {
                write!(f, ", expires {})", self.expiration.format("%H:%M:%S"))
            }
            MappingKind::Permanent | MappingKind::ForcedSession => f.write_str(")"),
        }
    }
}
