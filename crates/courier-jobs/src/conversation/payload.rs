//! Payload shapes for conversation jobs.
//!
//! The runtime reads only what it needs for routing and bookkeeping
//! (conversation id, timestamps); everything else is interpreted by the
//! transport.

use serde::{Deserialize, Serialize};

/// Kind of receipt being reported back to a message's sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiptType {
    Delivery,
    Read,
    Viewed,
}

/// One receipt to deliver, keyed by the message it acknowledges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: String,
    /// The sender of the message being acknowledged.
    pub sender_id: String,
    /// Sent timestamp of the acknowledged message, in epoch milliseconds.
    pub timestamp: i64,
}

/// A batch of receipts of one kind, for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptsJobData {
    pub conversation_id: String,
    pub receipts_type: ReceiptType,
    pub receipts: Vec<Receipt>,
}

/// Pin a message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinMessageJobData {
    pub conversation_id: String,
    pub message_id: String,
    pub target_author: String,
    /// Sent timestamp of the message being pinned, in epoch milliseconds.
    pub target_sent_timestamp: i64,
    /// How long the pin lasts, in milliseconds. `None` pins until it is
    /// explicitly removed.
    pub pin_duration_ms: Option<u64>,
}

/// Unpin a message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpinMessageJobData {
    pub conversation_id: String,
    pub message_id: String,
    pub target_author: String,
    pub target_sent_timestamp: i64,
    /// Only notify our own linked devices; the conversation was already
    /// told, or never needs to be.
    pub sync_only: bool,
    /// When the unpin happened locally, in epoch milliseconds.
    pub unpinned_at: i64,
}

/// Work items the conversation queue knows how to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConversationJobData {
    Receipts(ReceiptsJobData),
    PinMessage(PinMessageJobData),
    UnpinMessage(UnpinMessageJobData),
}

impl ConversationJobData {
    /// The queue key: jobs for one conversation run strictly in order.
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Receipts(data) => &data.conversation_id,
            Self::PinMessage(data) => &data.conversation_id,
            Self::UnpinMessage(data) => &data.conversation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_round_trip_through_the_stored_form() {
        let data = ConversationJobData::Receipts(ReceiptsJobData {
            conversation_id: "conv-1".to_string(),
            receipts_type: ReceiptType::Read,
            receipts: vec![Receipt {
                message_id: "msg-1".to_string(),
                sender_id: "contact-1".to_string(),
                timestamp: 1_700_000_000_000,
            }],
        });

        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["type"], "Receipts");
        assert_eq!(value["receipts_type"], "read");

        let back: ConversationJobData = serde_json::from_value(value).unwrap();
        assert_eq!(back.conversation_id(), "conv-1");
    }
}
