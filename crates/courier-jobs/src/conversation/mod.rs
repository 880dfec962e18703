//! The conversation job runtime: delivers receipts and pin-state changes,
//! at most one job in flight per conversation.
//!
//! Jobs carry a conversation id, which doubles as the queue key, so sends
//! for one conversation happen strictly in the order they were enqueued
//! while different conversations proceed in parallel. Each attempt
//! revalidates the recipient list against the directory, so contacts that
//! became blocked or unregistered while the job waited are dropped rather
//! than sent to.

mod helpers;
pub mod payload;
pub mod recipients;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BoxError, SendError};
use crate::job::ParsedJob;
use crate::queue::{JobRunContext, JobRunner};
use crate::retry::should_job_continue;

use helpers::JobBundle;
pub use payload::{
    ConversationJobData, PinMessageJobData, Receipt, ReceiptType, ReceiptsJobData,
    UnpinMessageJobData,
};
pub use recipients::{
    are_all_errors_unregistered, get_valid_recipients, Contact, ContactDirectory, Conversation,
    ConversationKind,
};

/// Queue type tag for conversation jobs.
pub const CONVERSATION_QUEUE_TYPE: &str = "conversation";

/// The transport seam: how conversation payloads actually reach the
/// network. Implementations own encryption, sealed-sender decisions, and
/// whatever else delivery entails.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_receipts(
        &self,
        conversation: &Conversation,
        recipients: &[String],
        receipts_type: ReceiptType,
        receipts: &[Receipt],
    ) -> Result<(), SendError>;

    async fn send_pin_message(
        &self,
        conversation: &Conversation,
        recipients: &[String],
        pin: &PinMessageJobData,
    ) -> Result<(), SendError>;

    async fn send_unpin_message(
        &self,
        conversation: &Conversation,
        recipients: &[String],
        unpin: &UnpinMessageJobData,
    ) -> Result<(), SendError>;
}

/// Runner for the `"conversation"` queue, generic over the transport and
/// directory so tests can substitute fakes.
pub struct ConversationJobRunner<S, D> {
    sender: Arc<S>,
    directory: Arc<D>,
}

impl<S, D> ConversationJobRunner<S, D> {
    pub fn new(sender: Arc<S>, directory: Arc<D>) -> Self {
        Self { sender, directory }
    }
}

#[async_trait]
impl<S, D> JobRunner for ConversationJobRunner<S, D>
where
    S: MessageSender + 'static,
    D: ContactDirectory + 'static,
{
    type Data = ConversationJobData;

    fn queue_type(&self) -> &'static str {
        CONVERSATION_QUEUE_TYPE
    }

    fn queue_key(&self, data: &Self::Data) -> String {
        data.conversation_id().to_string()
    }

    async fn run(&self, job: &ParsedJob<Self::Data>, ctx: &JobRunContext) -> Result<(), BoxError> {
        let should_continue = should_job_continue(
            ctx.attempt,
            ctx.time_remaining,
            false,
            &ctx.sleeper,
        )
        .await;

        if ctx.is_shutting_down() {
            return Err("shutting down; not sending".into());
        }

        let conversation_id = job.data.conversation_id();
        let conversation = self
            .directory
            .conversation(conversation_id)
            .ok_or_else(|| format!("failed to find conversation {conversation_id}"))?;

        // Recompute after the backoff sleep: the budget shrank while we
        // waited.
        let time_remaining = ctx
            .time_remaining
            .saturating_sub(elapsed_backoff(ctx.time_remaining, ctx.attempt));

        let bundle = JobBundle {
            is_final_attempt: ctx.is_final_attempt,
            should_continue,
            time_remaining,
            sleeper: &ctx.sleeper,
        };

        match &job.data {
            ConversationJobData::Receipts(data) => {
                helpers::send_receipts(
                    self.sender.as_ref(),
                    self.directory.as_ref(),
                    &conversation,
                    &bundle,
                    data,
                )
                .await
            }
            ConversationJobData::PinMessage(data) => {
                helpers::send_pin_message(
                    self.sender.as_ref(),
                    self.directory.as_ref(),
                    &conversation,
                    &bundle,
                    data,
                )
                .await
            }
            ConversationJobData::UnpinMessage(data) => {
                helpers::send_unpin_message(
                    self.sender.as_ref(),
                    self.directory.as_ref(),
                    &conversation,
                    &bundle,
                    data,
                )
                .await
            }
        }
    }
}

fn elapsed_backoff(time_remaining: Duration, attempt: u32) -> Duration {
    crate::retry::exponential_backoff_sleep_time(attempt).min(time_remaining)
}
