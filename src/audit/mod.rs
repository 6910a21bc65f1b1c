//! Audit Ledger Core
//!
//! Hash-chained events per tenant, serialized sequence allocation, signed
//! checkpoints, chain verification and verifiable exports.

pub mod allocator;
pub mod checkpoint;
pub mod clock;
pub mod event;
pub mod export;
pub mod verify;
pub mod writer;

pub use allocator::{Allocation, Backoff, SequenceAllocator, TenantLocks};
pub use checkpoint::{AuditCheckpoint, CheckpointHealth, CheckpointManager};
pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{AuditEvent, NewEvent, GENESIS_HASH};
pub use export::{verify_bundle, ExportBundle, ExportGateway, ExportHeader, ExportRecord};
pub use verify::{ChainVerifier, EntryVerification, FailureKind, IntegrityFailure, VerificationReport};
pub use writer::ChainWriter;
