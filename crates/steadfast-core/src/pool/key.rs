use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Logical category of calls that gets its own connection capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficClass {
    Session,
    Training,
    Sampling,
    Futures,
    Telemetry,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 5] = [
        TrafficClass::Session,
        TrafficClass::Training,
        TrafficClass::Sampling,
        TrafficClass::Futures,
        TrafficClass::Telemetry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficClass::Session => "session",
            TrafficClass::Training => "training",
            TrafficClass::Sampling => "sampling",
            TrafficClass::Futures => "futures",
            TrafficClass::Telemetry => "telemetry",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrafficClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrafficClass::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown traffic class: {s}"))
    }
}

/// Key used to index pools.
///
/// The base address is normalized to `scheme://host:port/path` with the
/// default port made explicit, trailing slashes removed, and query and
/// fragment dropped. `destination` is the `scheme://host:port` part and is
/// what circuit and rate-limit state are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    base: String,
    destination: String,
    class: TrafficClass,
}

impl PoolKey {
    /// Key for `base` (path kept) in `class`.
    pub fn new(base: &str, class: TrafficClass) -> Result<Self, CoreError> {
        let (destination, path) = normalize(base)?;
        Ok(Self {
            base: format!("{destination}{path}"),
            destination,
            class,
        })
    }

    /// Key for the origin of `url` in `class`; the path is not part of it.
    pub fn for_origin(url: &str, class: TrafficClass) -> Result<Self, CoreError> {
        let (destination, _) = normalize(url)?;
        Ok(Self {
            base: destination.clone(),
            destination,
            class,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn class(&self) -> TrafficClass {
        self.class
    }

    /// String form used for per-pool counters: "class@base".
    pub fn to_string_key(&self) -> String {
        format!("{}@{}", self.class, self.base)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.class, self.base)
    }
}

/// Returns `(scheme://host:port, path-without-trailing-slash)`.
fn normalize(address: &str) -> Result<(String, String), CoreError> {
    let invalid = |reason: String| CoreError::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    let parsed = url::Url::parse(address.trim()).map_err(|e| invalid(e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| invalid("missing host".into()))?
        .to_ascii_lowercase();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port and unknown default".into()))?;
    let path = parsed.path().trim_end_matches('/').to_string();
    Ok((format!("{}://{}:{}", parsed.scheme(), host, port), path))
}

/// Destination (`scheme://host:port`) of `url`.
pub(crate) fn destination_of(url: &str) -> Result<String, CoreError> {
    normalize(url).map(|(destination, _)| destination)
}
