//! One send helper per conversation job type, plus the failure
//! classification they share.

use std::time::Duration;

use courier_sync::Sleeper;

use super::payload::{PinMessageJobData, ReceiptsJobData, UnpinMessageJobData};
use super::recipients::{
    are_all_errors_unregistered, get_valid_recipients, Conversation, ContactDirectory,
};
use super::MessageSender;
use crate::error::{BoxError, SendError};
use crate::retry::{handle_common_job_request_error, ErrorAction};

/// Everything a send helper needs to know about the attempt in flight.
pub(crate) struct JobBundle<'a> {
    pub is_final_attempt: bool,
    pub should_continue: bool,
    pub time_remaining: Duration,
    pub sleeper: &'a Sleeper,
}

pub(crate) async fn send_receipts(
    sender: &dyn MessageSender,
    directory: &dyn ContactDirectory,
    conversation: &Conversation,
    bundle: &JobBundle<'_>,
    data: &ReceiptsJobData,
) -> Result<(), BoxError> {
    if data.receipts.is_empty() {
        tracing::info!("no receipts in batch; nothing to send");
        return Ok(());
    }
    // Receipts are best-effort: running out of time is not a failure.
    if !bundle.should_continue {
        tracing::info!("ran out of time; giving up on sending receipts");
        return Ok(());
    }

    let recipients = get_valid_recipients(directory, &conversation.recipients, "send_receipts");
    if recipients.is_empty() {
        tracing::info!("no valid recipients; dropping receipt batch");
        return Ok(());
    }

    match sender
        .send_receipts(conversation, &recipients, data.receipts_type, &data.receipts)
        .await
    {
        Ok(()) => Ok(()),
        Err(error) => handle_send_failure(conversation, error, bundle).await,
    }
}

pub(crate) async fn send_pin_message(
    sender: &dyn MessageSender,
    directory: &dyn ContactDirectory,
    conversation: &Conversation,
    bundle: &JobBundle<'_>,
    data: &PinMessageJobData,
) -> Result<(), BoxError> {
    if !bundle.should_continue {
        return Err(format!("pinning message {} ran out of time", data.message_id).into());
    }

    let recipients = get_valid_recipients(directory, &conversation.recipients, "send_pin_message");

    match sender.send_pin_message(conversation, &recipients, data).await {
        Ok(()) => Ok(()),
        Err(error) => handle_send_failure(conversation, error, bundle).await,
    }
}

pub(crate) async fn send_unpin_message(
    sender: &dyn MessageSender,
    directory: &dyn ContactDirectory,
    conversation: &Conversation,
    bundle: &JobBundle<'_>,
    data: &UnpinMessageJobData,
) -> Result<(), BoxError> {
    if !bundle.should_continue {
        return Err(format!("unpinning message {} ran out of time", data.message_id).into());
    }

    // A sync-only unpin goes to our own devices; the conversation's members
    // are not contacted.
    let recipients = if data.sync_only {
        Vec::new()
    } else {
        get_valid_recipients(directory, &conversation.recipients, "send_unpin_message")
    };

    match sender
        .send_unpin_message(conversation, &recipients, data)
        .await
    {
        Ok(()) => Ok(()),
        Err(error) => handle_send_failure(conversation, error, bundle).await,
    }
}

/// Shared failure classification for conversation sends. A partial group
/// failure made up entirely of unregistered members counts as success;
/// otherwise the common request-error policy runs, and whatever it does not
/// absorb travels up into the queue's retry loop.
pub(crate) async fn handle_send_failure(
    conversation: &Conversation,
    error: SendError,
    bundle: &JobBundle<'_>,
) -> Result<(), BoxError> {
    if are_all_errors_unregistered(conversation, &error) {
        tracing::info!(
            conversation_id = %conversation.id,
            "all send failures were unregistered users; treating the send as successful"
        );
        return Ok(());
    }

    // Sleeping out a rate limit is pointless when no attempt follows.
    if bundle.is_final_attempt || !bundle.should_continue {
        return Err(error.into());
    }

    match handle_common_job_request_error(error, bundle.sleeper, bundle.time_remaining).await {
        Ok(ErrorAction::Retry(error)) => Err(error.into()),
        Ok(ErrorAction::Abandon) => Ok(()),
        Err(error) => Err(error.into()),
    }
}
