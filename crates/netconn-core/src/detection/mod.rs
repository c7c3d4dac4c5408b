// ── Network validation ──
//
// Probe threads run detached and report through countdown latches. A
// monitor turns a batch of probe results into one verdict per cycle and
// owns the retry policy; the dual-stack probe answers a one-off
// "which address families work" question.

pub mod dual_stack;
pub mod latch;
pub mod monitor;
pub mod probe_thread;

pub use dual_stack::{DualStackOutcome, DualStackProbe};
pub use latch::CountDownLatch;
pub use monitor::{DetectionSink, MonitorContext, MonitorVerdict, NetMonitor};
pub use probe_thread::{ProbeLatches, ProbeThread};
