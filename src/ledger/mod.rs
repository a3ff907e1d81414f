mod backend;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use self::backend::{ApiEnvironment, BackendConfig, HttpBackend, LedgerBackend};
use crate::offline::SessionValue;

/// Log responses collected from one lock session.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct UploadBatch {
    pub session: SessionValue,
    /// Raw 20-byte responses as lowercase hex, in arrival order.
    pub responses: Vec<String>,
    pub mac: String,
    /// Unix seconds when the batch was last extended.
    pub received_time: i64,
}

/// Session-keyed batches waiting for upload.
#[derive(Debug, Default)]
pub struct UploadLedger {
    batches: Vec<UploadBatch>,
    flush_in_flight: bool,
}

impl UploadLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a response to its session's batch.
    ///
    /// An existing batch is moved to the back with the response appended, so
    /// batches stay ordered by their latest activity.
    pub fn add_entry(
        &mut self,
        response: String,
        session: SessionValue,
        mac: &str,
        received_time: i64,
    ) {
        let mut batch = match self
            .batches
            .iter()
            .position(|batch| batch.session == session)
        {
            Some(index) => self.batches.remove(index),
            None => UploadBatch {
                session,
                responses: Vec::new(),
                mac: mac.to_string(),
                received_time,
            },
        };
        batch.responses.push(response);
        batch.received_time = received_time;
        trace!(%session, responses = batch.responses.len(), "recorded lock response");
        self.batches.push(batch);
    }

    #[must_use]
    pub fn batches(&self) -> &[UploadBatch] {
        &self.batches
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }

    /// Merges previously persisted batches back in, preserving their order.
    pub fn load(&mut self, batches: Vec<UploadBatch>) {
        for batch in batches {
            for response in batch.responses {
                self.add_entry(response, batch.session, &batch.mac, batch.received_time);
            }
        }
    }

    /// Snapshots the batches for upload. `None` when there is nothing to send
    /// or another flush has not finished yet.
    pub(crate) fn begin_flush(&mut self) -> Option<Vec<UploadBatch>> {
        if self.batches.is_empty() || self.flush_in_flight {
            return None;
        }
        self.flush_in_flight = true;
        Some(self.batches.clone())
    }

    /// Completes a flush started with `begin_flush`.
    ///
    /// On success only the responses that were actually sent are dropped;
    /// anything appended while the request was in flight stays queued.
    pub(crate) fn finish_flush(&mut self, sent: &[UploadBatch], accepted: bool) {
        self.flush_in_flight = false;
        if !accepted {
            return;
        }

        for uploaded in sent {
            let Some(batch) = self
                .batches
                .iter_mut()
                .find(|batch| batch.session == uploaded.session)
            else {
                continue;
            };
            if batch.responses.starts_with(&uploaded.responses) {
                batch.responses.drain(..uploaded.responses.len());
            }
        }
        self.batches.retain(|batch| !batch.responses.is_empty());
        debug!(remaining = self.batches.len(), "upload acknowledged");
    }
}
