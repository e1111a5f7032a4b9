//! Outbound SMTP probing: connect to a recipient's MX and read back enough
//! of the envelope dialogue to classify deliverability (§4.3).

pub mod classify;
pub mod dialogue;
pub mod prober;

pub use prober::{ProbeOutcome, Prober};
