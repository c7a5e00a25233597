//! Software model of the accelerator card.
//!
//! [`SimCard`] implements the full [`Driver`](axon_core::Driver) contract in
//! process: group/channel tables, bounded per-group buffer pools with real
//! reference counts, hardware link forwarding, decode → scale → encode
//! emulation, select/wake poll semantics, and end-of-stream propagation.
//! The same binary therefore builds and tests on any host with no
//! accelerator installed or vendor runtime linked.
//!
//! The card is deliberately strict: unknown handles, double-enabled
//! channels, and unbalanced pool releases are driver errors, so layer bugs
//! surface in tests instead of leaking.  Test suites additionally get
//! failure injection ([`SimCard::queue_failure`]) and lifecycle inspectors
//! ([`SimCard::outstanding_blocks`] and friends).

mod card;

pub use card::{SimCard, SimOp};
