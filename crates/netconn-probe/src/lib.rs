//! Connectivity probes for network validation.
//!
//! A probe is one classifying HTTP or HTTPS fetch of a well-known
//! "generate 204" endpoint, issued either through a proxy or pinned to
//! explicitly resolved addresses:
//!
//! - **[`NetHttpProbe`]** — Issues the fetch(es) for one [`ProbeType`] and
//!   returns a [`ProbeOutcome`] carrying one [`ProbeResult`] per scheme.
//! - **[`ProbeResult`]** — Status code, redirect target and the
//!   success / needs-portal / failed classification.
//! - **[`DnsResolver`]** — Resolution seam used for address pinning;
//!   [`SystemResolver`] is the default.
//! - **[`HttpProxy`]** — Proxy configuration shared with the core crate.

pub mod error;
pub mod probe;
pub mod proxy;
pub mod resolve;
pub mod transport;

pub use error::Error;
pub use probe::{
    NetHttpProbe, NO_CONTENT, ProbeOptions, ProbeOutcome, ProbeResult, ProbeScheme, ProbeTarget,
    ProbeType, ProbeVerdict,
};
pub use proxy::HttpProxy;
pub use resolve::{DnsResolver, ResolvedAddrs, StaticResolver, SystemResolver};
pub use transport::ProbeTransport;
