//! Chain Verification
//!
//! Replays a tenant's chain over a sequence range and reports the first
//! point where stored history stops being the history that was written:
//! a missing or repeated sequence, a broken link, a forged hash, or a
//! checkpoint that no longer matches the events it sealed.
//!
//! The same replay core serves the live store and exported bundles, so a
//! bundle verified offline yields exactly the report the live ledger does.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::audit::checkpoint::{digest_events, AuditCheckpoint};
use crate::audit::event::{AuditEvent, GENESIS_HASH};
use crate::crypto::{LedgerKeys, SigningKey};
use crate::error::{LedgerError, LedgerResult};
use crate::store::LedgerStore;

/// Kinds of integrity failure, in the order they are detected for a
/// single sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    SequenceGap,
    DuplicateSequence,
    ChainBreak,
    HashMismatch,
    CheckpointMismatch,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SequenceGap => "SequenceGap",
            Self::DuplicateSequence => "DuplicateSequence",
            Self::ChainBreak => "ChainBreak",
            Self::HashMismatch => "HashMismatch",
            Self::CheckpointMismatch => "CheckpointMismatch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityFailure {
    pub sequence: u64,
    pub kind: FailureKind,
    pub detail: String,
}

impl IntegrityFailure {
    pub fn new(sequence: u64, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            sequence,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at sequence {}: {}", self.kind, self.sequence, self.detail)
    }
}

/// Outcome of verifying `[from, to]` for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub tenant_id: String,
    pub from: u64,
    pub to: u64,
    pub verified: bool,
    /// Rows replayed.
    pub checked: u64,
    pub checkpoints_checked: u64,
    /// The earliest failure, if any.
    pub failure: Option<IntegrityFailure>,
    /// Every failure found, ordered by sequence.
    pub findings: Vec<IntegrityFailure>,
}

impl VerificationReport {
    fn build(tenant_id: &str, from: u64, to: u64, outcome: SegmentOutcome) -> Self {
        let mut findings = outcome.findings;

        // A hole followed by a row whose link no longer holds is reported
        // as that ChainBreak; the gap stays in the findings.
        let mut bridged = Vec::new();
        for (start, end) in coalesce_gaps(outcome.gaps) {
            if findings
                .iter()
                .any(|f| f.kind == FailureKind::ChainBreak && f.sequence == end + 1)
            {
                bridged.push(start);
            }
            findings.push(gap_failure(start, end));
        }

        findings.sort_by(|a, b| (a.sequence, a.kind).cmp(&(b.sequence, b.kind)));
        findings.dedup();

        let failure = findings
            .iter()
            .find(|f| !(f.kind == FailureKind::SequenceGap && bridged.contains(&f.sequence)))
            .cloned();

        Self {
            tenant_id: tenant_id.to_string(),
            from,
            to,
            verified: findings.is_empty(),
            checked: outcome.checked,
            checkpoints_checked: outcome.checkpoints_checked,
            failure,
            findings,
        }
    }

    /// `Ok` when the range verified, else `ChainIntegrity` with the first
    /// failure.
    pub fn into_result(self) -> LedgerResult<Self> {
        match &self.failure {
            Some(failure) => Err(LedgerError::ChainIntegrity(failure.clone())),
            None => Ok(self),
        }
    }
}

/// A run of stored rows to replay, with what it must link to.
#[derive(Debug, Clone, Copy)]
pub struct ChainSegment<'a> {
    pub from: u64,
    pub to: u64,
    /// `event_hash` of the nearest stored row below `from`. `None` when
    /// there is none, in which case the first link is not checked.
    pub anchor_hash: Option<&'a str>,
    /// Rows as stored, ascending by sequence.
    pub events: &'a [AuditEvent],
    pub checkpoints: &'a [AuditCheckpoint],
}

#[derive(Debug, Clone, Default)]
pub struct SegmentOutcome {
    pub checked: u64,
    pub checkpoints_checked: u64,
    pub findings: Vec<IntegrityFailure>,
    /// Missing sequences as inclusive runs. Kept apart from `findings` so
    /// runs cut by a chunk boundary join up again.
    pub gaps: Vec<(u64, u64)>,
}

impl SegmentOutcome {
    fn merge(&mut self, other: SegmentOutcome) {
        self.checked += other.checked;
        self.checkpoints_checked += other.checkpoints_checked;
        self.findings.extend(other.findings);
        self.gaps.extend(other.gaps);
    }
}

fn coalesce_gaps(mut gaps: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    gaps.sort_unstable();
    let mut runs: Vec<(u64, u64)> = Vec::with_capacity(gaps.len());
    for (start, end) in gaps {
        match runs.last_mut() {
            Some(last) if start <= last.1 + 1 => last.1 = last.1.max(end),
            _ => runs.push((start, end)),
        }
    }
    runs
}

fn gap_failure(start: u64, end: u64) -> IntegrityFailure {
    let detail = if start == end {
        format!("sequence {} missing", start)
    } else {
        format!("sequences {}..={} missing", start, end)
    };
    IntegrityFailure::new(start, FailureKind::SequenceGap, detail)
}

/// Replay a segment: contiguity, then links, then hashes, then the
/// checkpoints that lie entirely inside it.
pub fn verify_segment(keys: &LedgerKeys, segment: &ChainSegment<'_>) -> SegmentOutcome {
    let mut outcome = SegmentOutcome::default();
    let mut expected = segment.from;
    let mut last_seen: Option<u64> = None;
    let mut link: Option<&str> = if segment.from == 1 {
        Some(GENESIS_HASH)
    } else {
        segment.anchor_hash
    };

    for event in segment.events {
        outcome.checked += 1;

        if let Some(last) = last_seen {
            if event.sequence == last {
                outcome.findings.push(IntegrityFailure::new(
                    event.sequence,
                    FailureKind::DuplicateSequence,
                    "sequence stored more than once",
                ));
                continue;
            }
            if event.sequence < last {
                outcome.findings.push(IntegrityFailure::new(
                    event.sequence,
                    FailureKind::ChainBreak,
                    format!("sequence {} stored after {}", event.sequence, last),
                ));
                continue;
            }
        }

        if event.sequence > expected {
            outcome.gaps.push((expected, event.sequence - 1));
        }

        if let Some(expected_prev) = link {
            if event.prev_hash != expected_prev {
                outcome.findings.push(IntegrityFailure::new(
                    event.sequence,
                    FailureKind::ChainBreak,
                    format!(
                        "prevHash {} does not match predecessor hash {}",
                        short(&event.prev_hash),
                        short(expected_prev)
                    ),
                ));
            }
        }

        if !event.verify_hash(&keys.event) {
            outcome.findings.push(IntegrityFailure::new(
                event.sequence,
                FailureKind::HashMismatch,
                "eventHash does not match event content",
            ));
        }

        link = Some(event.event_hash.as_str());
        last_seen = Some(event.sequence);
        expected = event.sequence + 1;
    }

    if expected <= segment.to {
        outcome.gaps.push((expected, segment.to));
    }

    for checkpoint in segment
        .checkpoints
        .iter()
        .filter(|c| c.within(segment.from, segment.to))
    {
        outcome.checkpoints_checked += 1;
        if let Some(failure) = check_checkpoint(&keys.checkpoint, checkpoint, segment.events) {
            outcome.findings.push(failure);
        }
    }

    outcome
}

/// Re-derive one checkpoint from the events it covers.
pub fn check_checkpoint(
    key: &SigningKey,
    checkpoint: &AuditCheckpoint,
    events: &[AuditEvent],
) -> Option<IntegrityFailure> {
    if !checkpoint.verify_signature(key) {
        return Some(IntegrityFailure::new(
            checkpoint.upto_sequence,
            FailureKind::CheckpointMismatch,
            "checkpoint signature invalid",
        ));
    }

    let covered: Vec<AuditEvent> = events
        .iter()
        .filter(|e| e.sequence >= checkpoint.from_sequence && e.sequence <= checkpoint.upto_sequence)
        .cloned()
        .collect();

    if covered.len() as u64 != checkpoint.entry_count {
        return Some(IntegrityFailure::new(
            checkpoint.upto_sequence,
            FailureKind::CheckpointMismatch,
            format!(
                "checkpoint sealed {} events, {} present",
                checkpoint.entry_count,
                covered.len()
            ),
        ));
    }

    if digest_events(&checkpoint.prev_digest, &covered) != checkpoint.digest {
        return Some(IntegrityFailure::new(
            checkpoint.upto_sequence,
            FailureKind::CheckpointMismatch,
            "checkpoint digest does not match events",
        ));
    }

    None
}

/// Links between consecutive checkpoints inside `[from, to]`.
pub fn checkpoint_chain_findings(checkpoints: &[AuditCheckpoint], from: u64, to: u64) -> Vec<IntegrityFailure> {
    let mut inside: Vec<&AuditCheckpoint> = checkpoints.iter().filter(|c| c.within(from, to)).collect();
    inside.sort_by_key(|c| c.upto_sequence);

    let mut findings = Vec::new();
    for (i, checkpoint) in inside.iter().enumerate() {
        if checkpoint.from_sequence == 1 && checkpoint.prev_digest != GENESIS_HASH {
            findings.push(IntegrityFailure::new(
                checkpoint.upto_sequence,
                FailureKind::CheckpointMismatch,
                "first checkpoint does not start from the genesis digest",
            ));
        }

        if i == 0 {
            continue;
        }
        let previous = inside[i - 1];
        if checkpoint.from_sequence != previous.upto_sequence + 1 {
            findings.push(IntegrityFailure::new(
                checkpoint.upto_sequence,
                FailureKind::CheckpointMismatch,
                format!(
                    "checkpoint starts at {} but previous ends at {}",
                    checkpoint.from_sequence, previous.upto_sequence
                ),
            ));
        } else if checkpoint.prev_digest != previous.digest {
            findings.push(IntegrityFailure::new(
                checkpoint.upto_sequence,
                FailureKind::CheckpointMismatch,
                "checkpoint does not link to previous digest",
            ));
        }
    }
    findings
}

/// Verify a fully materialized range. Used for bundles, and by tests as the
/// sequential reference for the chunked live path.
pub fn verify_range(
    keys: &LedgerKeys,
    tenant_id: &str,
    segment: &ChainSegment<'_>,
) -> VerificationReport {
    let mut outcome = verify_segment(keys, segment);
    outcome
        .findings
        .extend(checkpoint_chain_findings(segment.checkpoints, segment.from, segment.to));
    VerificationReport::build(tenant_id, segment.from, segment.to, outcome)
}

/// Result of checking a single stored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryVerification {
    pub tenant_id: String,
    pub sequence: u64,
    pub valid: bool,
    pub failure: Option<IntegrityFailure>,
}

/// Verifies ranges against the live store.
#[derive(Clone)]
pub struct ChainVerifier {
    store: Arc<dyn LedgerStore>,
    keys: LedgerKeys,
}

impl ChainVerifier {
    pub fn new(store: Arc<dyn LedgerStore>, keys: LedgerKeys) -> Self {
        Self { store, keys }
    }

    /// Verify `[from, to]`.
    ///
    /// The range is cut at checkpoint boundaries and the chunks are replayed
    /// concurrently. Each chunk reads its own anchor row, so the findings
    /// match a single sequential replay.
    pub async fn verify(&self, tenant_id: &str, from: u64, to: u64) -> LedgerResult<VerificationReport> {
        if from == 0 || from > to {
            return Err(LedgerError::InvalidRange(format!(
                "invalid range {}..={}",
                from, to
            )));
        }

        let checkpoints = self.store.checkpoints_overlapping(tenant_id, from, to).await?;
        let chunks = chunk_bounds(&checkpoints, from, to);
        debug!(
            "Verifying {} {}..={} in {} chunks",
            tenant_id,
            from,
            to,
            chunks.len()
        );

        let mut tasks = JoinSet::new();
        for (index, (chunk_from, chunk_to)) in chunks.into_iter().enumerate() {
            let store = self.store.clone();
            let keys = self.keys.clone();
            let tenant = tenant_id.to_string();
            let chunk_checkpoints: Vec<AuditCheckpoint> = checkpoints
                .iter()
                .filter(|c| c.within(chunk_from, chunk_to))
                .cloned()
                .collect();

            tasks.spawn(async move {
                let outcome =
                    verify_chunk(store, keys, &tenant, chunk_from, chunk_to, &chunk_checkpoints).await;
                (index, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = joined
                .map_err(|e| LedgerError::Storage(format!("verification task failed: {}", e)))?;
            results.push((index, outcome?));
        }
        results.sort_by_key(|(index, _)| *index);

        let mut outcome = SegmentOutcome::default();
        for (_, chunk) in results {
            outcome.merge(chunk);
        }
        outcome
            .findings
            .extend(checkpoint_chain_findings(&checkpoints, from, to));

        let report = VerificationReport::build(tenant_id, from, to, outcome);
        match &report.failure {
            None => info!(
                "Verified {} {}..={}: {} events, {} checkpoints",
                tenant_id, from, to, report.checked, report.checkpoints_checked
            ),
            Some(failure) => warn!(
                "Integrity failure in {} {}..={}: {} ({} findings)",
                tenant_id,
                from,
                to,
                failure,
                report.findings.len()
            ),
        }
        Ok(report)
    }

    /// Check one event's hash and its link to the stored predecessor.
    pub async fn verify_entry(&self, tenant_id: &str, sequence: u64) -> LedgerResult<EntryVerification> {
        let event = self
            .store
            .get_event(tenant_id, sequence)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("event {}#{}", tenant_id, sequence)))?;

        let expected_prev = if sequence == 1 {
            Some(GENESIS_HASH.to_string())
        } else {
            self.store
                .get_event(tenant_id, sequence - 1)
                .await?
                .map(|e| e.event_hash)
        };

        let failure = match expected_prev {
            None => Some(IntegrityFailure::new(
                sequence - 1,
                FailureKind::SequenceGap,
                format!("sequence {} missing", sequence - 1),
            )),
            Some(prev) if prev != event.prev_hash => Some(IntegrityFailure::new(
                sequence,
                FailureKind::ChainBreak,
                "prevHash does not match predecessor hash",
            )),
            Some(_) if !event.verify_hash(&self.keys.event) => Some(IntegrityFailure::new(
                sequence,
                FailureKind::HashMismatch,
                "eventHash does not match event content",
            )),
            Some(_) => None,
        };

        Ok(EntryVerification {
            tenant_id: tenant_id.to_string(),
            sequence,
            valid: failure.is_none(),
            failure,
        })
    }
}

async fn verify_chunk(
    store: Arc<dyn LedgerStore>,
    keys: LedgerKeys,
    tenant_id: &str,
    from: u64,
    to: u64,
    checkpoints: &[AuditCheckpoint],
) -> LedgerResult<SegmentOutcome> {
    let anchor = if from > 1 {
        store.event_before(tenant_id, from).await?
    } else {
        None
    };
    let events = store.events_in_range(tenant_id, from, to).await?;

    let segment = ChainSegment {
        from,
        to,
        anchor_hash: anchor.as_ref().map(|e| e.event_hash.as_str()),
        events: &events,
        checkpoints,
    };
    Ok(verify_segment(&keys, &segment))
}

/// Split `[from, to]` after every checkpoint end that falls inside it.
fn chunk_bounds(checkpoints: &[AuditCheckpoint], from: u64, to: u64) -> Vec<(u64, u64)> {
    let mut cuts: Vec<u64> = checkpoints
        .iter()
        .map(|c| c.upto_sequence)
        .filter(|upto| *upto >= from && *upto < to)
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut bounds = Vec::with_capacity(cuts.len() + 1);
    let mut start = from;
    for cut in cuts {
        bounds.push((start, cut));
        start = cut + 1;
    }
    bounds.push((start, to));
    bounds
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
