//! The `"single-proto"` queue: already-encoded protobuf payloads addressed
//! to one destination, sent on a single serial lane with the common
//! request-error policy applied.
//!
//! Used for work like out-of-band sync messages where the payload was built
//! (and saved) at enqueue time, so re-execution after a restart sends the
//! exact same bytes.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{BoxError, SendError};
use crate::job::ParsedJob;
use crate::queue::{JobRunContext, JobRunner};
use crate::retry::{handle_common_job_request_error, should_job_continue, ErrorAction};

/// Queue type tag for single-proto jobs.
pub const SINGLE_PROTO_QUEUE_TYPE: &str = "single-proto";

/// Transport seam for raw proto sends.
#[async_trait]
pub trait ProtoSender: Send + Sync {
    async fn send_proto(
        &self,
        destination_id: &str,
        proto: &[u8],
        timestamp: i64,
        urgent: bool,
    ) -> Result<(), SendError>;
}

/// A saved, already-encoded proto destined for a single recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleProtoJobData {
    pub destination_id: String,
    pub proto_base64: String,
    /// Timestamp baked into the proto, in epoch milliseconds.
    pub timestamp: i64,
    pub urgent: bool,
}

/// Runner for the `"single-proto"` queue.
pub struct SingleProtoJobRunner<S> {
    sender: Arc<S>,
}

impl<S> SingleProtoJobRunner<S> {
    pub fn new(sender: Arc<S>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<S: ProtoSender + 'static> JobRunner for SingleProtoJobRunner<S> {
    type Data = SingleProtoJobData;

    fn queue_type(&self) -> &'static str {
        SINGLE_PROTO_QUEUE_TYPE
    }

    async fn run(&self, job: &ParsedJob<Self::Data>, ctx: &JobRunContext) -> Result<(), BoxError> {
        let should_continue =
            should_job_continue(ctx.attempt, ctx.time_remaining, false, &ctx.sleeper).await;
        if !should_continue {
            return Err(format!(
                "proto send to {} ran out of time",
                job.data.destination_id
            )
            .into());
        }
        if ctx.is_shutting_down() {
            return Err("shutting down; not sending".into());
        }

        let proto = BASE64.decode(job.data.proto_base64.as_bytes())?;

        match self
            .sender
            .send_proto(
                &job.data.destination_id,
                &proto,
                job.data.timestamp,
                job.data.urgent,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(error) => {
                if ctx.is_final_attempt {
                    return Err(error.into());
                }
                match handle_common_job_request_error(error, &ctx.sleeper, ctx.time_remaining)
                    .await
                {
                    Ok(ErrorAction::Retry(error)) => Err(error.into()),
                    Ok(ErrorAction::Abandon) => Ok(()),
                    Err(error) => Err(error.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpError;
    use crate::job::StoredJob;
    use crate::queue::{JobQueue, JobQueueOptions};
    use crate::store::memory::InMemoryStore;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        fail_with_508_once: Mutex<bool>,
    }

    #[async_trait]
    impl ProtoSender for RecordingSender {
        async fn send_proto(
            &self,
            destination_id: &str,
            proto: &[u8],
            _timestamp: i64,
            _urgent: bool,
        ) -> Result<(), SendError> {
            let mut fail = self.fail_with_508_once.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(SendError::Http(HttpError::new(508)));
            }
            self.sent
                .lock()
                .unwrap()
                .push((destination_id.to_string(), proto.to_vec()));
            Ok(())
        }
    }

    fn spawn_queue(sender: Arc<RecordingSender>) -> (JobQueue<SingleProtoJobRunner<RecordingSender>>, InMemoryStore) {
        let store = InMemoryStore::new();
        let queue = JobQueue::with_options(
            store.clone(),
            SingleProtoJobRunner::new(sender),
            JobQueueOptions::new().max_attempts(3),
        );
        {
            let queue = queue.clone();
            tokio::spawn(async move {
                let _ = queue.stream_jobs().await;
            });
        }
        (queue, store)
    }

    fn proto_job(destination_id: &str, payload: &[u8]) -> SingleProtoJobData {
        SingleProtoJobData {
            destination_id: destination_id.to_string(),
            proto_base64: BASE64.encode(payload),
            timestamp: 1_700_000_000_000,
            urgent: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn decodes_and_delivers_the_saved_proto() {
        let sender = Arc::new(RecordingSender::default());
        let (queue, store) = spawn_queue(Arc::clone(&sender));

        let job = queue.add(proto_job("contact-1", b"sync bytes")).await.unwrap();
        job.completion.wait().await.unwrap().unwrap();

        assert_eq!(
            *sender.sent.lock().unwrap(),
            vec![("contact-1".to_string(), b"sync bytes".to_vec())]
        );
        assert!(store.stored_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn a_508_response_drops_the_job_without_an_error() {
        let sender = Arc::new(RecordingSender {
            fail_with_508_once: Mutex::new(true),
            ..Default::default()
        });
        let (queue, store) = spawn_queue(Arc::clone(&sender));

        let job = queue.add(proto_job("contact-1", b"sync bytes")).await.unwrap();
        job.completion.wait().await.unwrap().unwrap();

        assert!(sender.sent.lock().unwrap().is_empty(), "no retry after 508");
        assert!(store.stored_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_payloads_exhaust_their_attempts_and_fail() {
        let sender = Arc::new(RecordingSender::default());
        let (queue, _store) = spawn_queue(Arc::clone(&sender));

        let job = queue
            .add(SingleProtoJobData {
                destination_id: "contact-1".to_string(),
                proto_base64: "not base64!!!".to_string(),
                timestamp: 1_700_000_000_000,
                urgent: false,
            })
            .await
            .unwrap();

        let error = job.completion.wait().await.unwrap().unwrap_err();
        assert!(error.to_string().starts_with("Job failed. Last error:"));
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn stored_form_round_trips() {
        let data = proto_job("contact-1", b"bytes");
        let stored = StoredJob {
            id: "job-1".to_string(),
            timestamp: Utc::now(),
            queue_type: SINGLE_PROTO_QUEUE_TYPE.to_string(),
            data: serde_json::to_value(&data).unwrap(),
        };
        let back: SingleProtoJobData = serde_json::from_value(stored.data).unwrap();
        assert_eq!(back.destination_id, "contact-1");
        assert_eq!(BASE64.decode(back.proto_base64).unwrap(), b"bytes");
    }
}
