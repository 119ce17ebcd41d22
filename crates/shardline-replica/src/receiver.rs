//! Replica Receiver
//!
//! The remote end of a replication stream. For every inbound stream the
//! receiver looks up the [`Sequence`] of `(database, shard, source)`,
//! applies new records through a [`ReplicaSink`], and answers each batch.
//!
//! ## Batch Handling
//!
//! ```text
//! entry.seq <  head   duplicate, skipped
//! entry.seq == head   applied, head += 1
//! entry.seq >  head   gap: stop, reply Reset(head)
//! ```
//!
//! Two cases move `head` forward without data:
//!
//! - a sequence with no state on disk adopts the first sequence it sees,
//!   since the sender starts new targets at its current head
//! - `batch.tail_seq > head` means the sender has already reclaimed the
//!   missing records, so asking for them again would loop forever
//!
//! After applying, the sink is flushed and the sequence synced before
//! `Ack(head)` goes back, so an ack always describes durable state.

use async_trait::async_trait;
use bytes::Bytes;
use shardline_storage::{Sequence, SequenceManager};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::transport::{ReplicaBatch, ReplicaConnection, ReplicaResponse};

/// Destination for replicated records
#[async_trait]
pub trait ReplicaSink: Send + Sync {
    async fn apply(&self, seq: i64, payload: Bytes) -> Result<()>;

    /// Make everything applied so far durable
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-stream state kept across batches
#[derive(Debug, Default)]
struct StreamState {
    /// Head we last asked the sender to rewind to
    pending_reset: Option<i64>,
}

pub struct ReplicaReceiver {
    sequences: Arc<SequenceManager>,
    sink: Arc<dyn ReplicaSink>,
}

impl ReplicaReceiver {
    pub fn new(sequences: Arc<SequenceManager>, sink: Arc<dyn ReplicaSink>) -> Self {
        Self { sequences, sink }
    }

    pub fn sequences(&self) -> &Arc<SequenceManager> {
        &self.sequences
    }

    /// Handle one inbound stream until the sender goes away
    pub async fn serve(&self, connection: Arc<dyn ReplicaConnection>) -> Result<()> {
        let target = connection.target().clone();
        let sequence =
            self.sequences
                .get_or_create(&target.database, target.shard, &target.source)?;

        info!(
            database = %target.database,
            shard = target.shard,
            source = %target.source,
            head_seq = sequence.head_seq(),
            "Accepted replication stream"
        );

        let mut state = StreamState::default();
        while let Some(batch) = connection.recv().await? {
            for response in self.handle_batch(&sequence, batch, &mut state).await? {
                connection.send(response).await?;
            }
        }

        info!(
            database = %target.database,
            shard = target.shard,
            source = %target.source,
            ack_seq = sequence.ack_seq(),
            "Replication stream closed"
        );
        Ok(())
    }

    async fn handle_batch(
        &self,
        sequence: &Sequence,
        batch: ReplicaBatch,
        state: &mut StreamState,
    ) -> Result<Vec<ReplicaResponse>> {
        let Some(first) = batch.first_seq() else {
            return Ok(Vec::new());
        };

        let start = sequence.head_seq();
        let mut head = start;
        if sequence.is_fresh() && first > head {
            debug!(from = head, to = first, "Adopting sender position");
            head = first;
        }
        if batch.tail_seq > head {
            warn!(
                from = head,
                to = batch.tail_seq,
                lost = batch.tail_seq - head,
                "Sender no longer retains missing records, skipping ahead"
            );
            head = batch.tail_seq;
        }

        let mut gap = false;
        for entry in batch.entries {
            if entry.seq < head {
                continue;
            }
            if entry.seq > head {
                gap = true;
                break;
            }
            self.sink.apply(entry.seq, entry.payload).await?;
            head += 1;
            sequence.set_head_seq(head);
        }

        let mut responses = Vec::with_capacity(2);
        if head != sequence.ack_seq() || sequence.is_fresh() {
            self.sink.flush().await?;
            sequence.set_head_seq(head);
            sequence.set_ack_seq(head);
            sequence.sync()?;
        }
        if head > start || !gap {
            responses.push(ReplicaResponse::Ack(head));
        }

        if gap {
            // One reset per gap; stale batches already in flight are dropped
            if state.pending_reset != Some(head) {
                debug!(head, first, "Gap in replication stream, requesting resend");
                state.pending_reset = Some(head);
                responses.push(ReplicaResponse::Reset(head));
            }
        } else {
            state.pending_reset = None;
        }
        Ok(responses)
    }
}
