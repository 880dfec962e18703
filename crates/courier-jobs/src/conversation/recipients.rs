//! Recipient validation and group-failure classification.

use crate::error::SendError;

/// Whether a conversation is a 1:1 thread or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Direct,
    Group,
}

/// The slice of conversation state the job runtime needs.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    /// Current member ids, not yet validated for sendability.
    pub recipients: Vec<String>,
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }
}

/// A known contact, as resolved by the application's directory.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: String,
    pub registered: bool,
    pub blocked: bool,
}

/// Resolves conversations and contacts; implemented by the application.
pub trait ContactDirectory: Send + Sync {
    fn conversation(&self, conversation_id: &str) -> Option<Conversation>;
    fn contact(&self, recipient_id: &str) -> Option<Contact>;
}

/// Filters `recipient_ids` down to targets a send can actually reach.
/// Unknown, unregistered, and blocked entries are dropped — each drop is
/// logged — and relative order is preserved.
pub fn get_valid_recipients(
    directory: &dyn ContactDirectory,
    recipient_ids: &[String],
    log_id: &str,
) -> Vec<String> {
    recipient_ids
        .iter()
        .filter(|id| match directory.contact(id) {
            None => {
                tracing::warn!(log_id, recipient_id = %id, "dropping unknown recipient");
                false
            }
            Some(contact) if !contact.registered => {
                tracing::warn!(log_id, recipient_id = %id, "dropping unregistered recipient");
                false
            }
            Some(contact) if contact.blocked => {
                tracing::warn!(log_id, recipient_id = %id, "dropping blocked recipient");
                false
            }
            Some(_) => true,
        })
        .cloned()
        .collect()
}

/// True only when a group send failed solely because some members no longer
/// have accounts. Those targets are unreachable by design rather than
/// transiently, so the send counts as delivered to everyone reachable.
pub fn are_all_errors_unregistered(conversation: &Conversation, error: &SendError) -> bool {
    if !conversation.is_group() {
        return false;
    }
    match error {
        SendError::Proto(proto) => proto.errors.iter().all(|e| e.error.is_unregistered()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HttpError, ProtoSendError, RecipientError};
    use std::collections::HashMap;

    struct FixedDirectory {
        contacts: HashMap<String, Contact>,
    }

    impl FixedDirectory {
        fn new(contacts: Vec<Contact>) -> Self {
            Self {
                contacts: contacts.into_iter().map(|c| (c.id.clone(), c)).collect(),
            }
        }
    }

    impl ContactDirectory for FixedDirectory {
        fn conversation(&self, _conversation_id: &str) -> Option<Conversation> {
            None
        }

        fn contact(&self, recipient_id: &str) -> Option<Contact> {
            self.contacts.get(recipient_id).cloned()
        }
    }

    fn contact(id: &str, registered: bool, blocked: bool) -> Contact {
        Contact {
            id: id.to_string(),
            registered,
            blocked,
        }
    }

    fn group(id: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            kind: ConversationKind::Group,
            recipients: Vec::new(),
        }
    }

    fn unregistered(recipient_id: &str) -> RecipientError {
        RecipientError {
            recipient_id: recipient_id.to_string(),
            error: SendError::UnregisteredUser {
                recipient_id: recipient_id.to_string(),
                http: HttpError::new(404),
            },
        }
    }

    #[test]
    fn keeps_only_sendable_recipients_in_order() {
        let directory = FixedDirectory::new(vec![
            contact("valid-1", true, false),
            contact("unregistered", false, false),
            contact("blocked", true, true),
            contact("valid-2", true, false),
        ]);
        let ids = [
            "valid-1".to_string(),
            "unregistered".to_string(),
            "blocked".to_string(),
            "unknown".to_string(),
            "valid-2".to_string(),
        ];

        let valid = get_valid_recipients(&directory, &ids, "test");
        assert_eq!(valid, vec!["valid-1".to_string(), "valid-2".to_string()]);
    }

    #[test]
    fn all_unregistered_in_a_group_is_recognized() {
        let error = SendError::Proto(ProtoSendError {
            errors: vec![unregistered("a"), unregistered("b")],
        });
        assert!(are_all_errors_unregistered(&group("g"), &error));
    }

    #[test]
    fn direct_conversations_never_qualify() {
        let error = SendError::Proto(ProtoSendError {
            errors: vec![unregistered("a")],
        });
        let direct = Conversation {
            id: "d".to_string(),
            kind: ConversationKind::Direct,
            recipients: Vec::new(),
        };
        assert!(!are_all_errors_unregistered(&direct, &error));
    }

    #[test]
    fn a_single_other_failure_kind_disqualifies() {
        let error = SendError::Proto(ProtoSendError {
            errors: vec![
                unregistered("a"),
                RecipientError {
                    recipient_id: "b".to_string(),
                    error: SendError::Transport("socket closed".to_string()),
                },
            ],
        });
        assert!(!are_all_errors_unregistered(&group("g"), &error));
    }

    #[test]
    fn non_proto_errors_never_qualify() {
        let error = SendError::Http(HttpError::new(500));
        assert!(!are_all_errors_unregistered(&group("g"), &error));
    }
}
