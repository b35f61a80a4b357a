/// Number of lock-guarded cache buckets. Requests hashing to the same
/// bucket serialize their origin round trips.
pub const CACHE_BUCKETS: usize = 997;

/// Worker tasks pulling from the dispatch queue when the config does not
/// say otherwise.
pub const DEFAULT_WORKERS: usize = 64;

/// Protocol stamped on responses the proxy synthesizes itself.
pub const SYNTH_PROTOCOL: &str = "HTTP/1.1";

pub const FORBIDDEN_PAYLOAD: &str = "Forbidden Content";
pub const GATEWAY_TIMEOUT_PAYLOAD: &str = "Gateway Timeout";

pub const XFF_HEADER: &str = "x-forwarded-for";
