pub mod antigreylist;
pub mod archive;
pub mod config;
pub mod controller;
pub mod dns;
pub mod enrich;
pub mod queue;
pub mod recovery;
pub mod smtp;
pub mod webhook;
pub mod worker;

pub use antigreylist::AntiGreylistStore;
pub use archive::ArchiveStore;
pub use config::CoreConfig;
pub use controller::Controller;
pub use dns::{DnsResolver, TrustDnsResolver};
pub use queue::Queue;
pub use smtp::{ProbeOutcome, Prober};
pub use worker::{Worker, WorkerMessage};
