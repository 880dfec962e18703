use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_jobs::conversation::{
    Contact, ContactDirectory, Conversation, ConversationJobData, ConversationJobRunner,
    ConversationKind, MessageSender, PinMessageJobData, Receipt, ReceiptType, ReceiptsJobData,
    UnpinMessageJobData,
};
use courier_jobs::{
    HttpError, InMemoryStore, JobQueue, JobQueueOptions, ProtoSendError, RecipientError, SendError,
};
use http::header::{HeaderValue, RETRY_AFTER};

struct FakeDirectory {
    conversations: HashMap<String, Conversation>,
    contacts: HashMap<String, Contact>,
}

impl FakeDirectory {
    fn new(conversations: Vec<Conversation>, contacts: Vec<Contact>) -> Self {
        Self {
            conversations: conversations
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
            contacts: contacts.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }
}

impl ContactDirectory for FakeDirectory {
    fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.get(conversation_id).cloned()
    }

    fn contact(&self, recipient_id: &str) -> Option<Contact> {
        self.contacts.get(recipient_id).cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SendCall {
    Receipts {
        recipients: Vec<String>,
        count: usize,
    },
    Pin {
        recipients: Vec<String>,
    },
    Unpin {
        recipients: Vec<String>,
        sync_only: bool,
    },
}

/// Scripted transport: pops one failure per call until the script runs dry,
/// then succeeds.
#[derive(Default)]
struct FakeSender {
    failures: Mutex<VecDeque<SendError>>,
    calls: Mutex<Vec<SendCall>>,
}

impl FakeSender {
    fn failing_with(failures: Vec<SendError>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<SendCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next_outcome(&self) -> Result<(), SendError> {
        match self.failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MessageSender for FakeSender {
    async fn send_receipts(
        &self,
        _conversation: &Conversation,
        recipients: &[String],
        _receipts_type: ReceiptType,
        receipts: &[Receipt],
    ) -> Result<(), SendError> {
        self.calls.lock().unwrap().push(SendCall::Receipts {
            recipients: recipients.to_vec(),
            count: receipts.len(),
        });
        self.next_outcome()
    }

    async fn send_pin_message(
        &self,
        _conversation: &Conversation,
        recipients: &[String],
        _pin: &PinMessageJobData,
    ) -> Result<(), SendError> {
        self.calls.lock().unwrap().push(SendCall::Pin {
            recipients: recipients.to_vec(),
        });
        self.next_outcome()
    }

    async fn send_unpin_message(
        &self,
        _conversation: &Conversation,
        recipients: &[String],
        unpin: &UnpinMessageJobData,
    ) -> Result<(), SendError> {
        self.calls.lock().unwrap().push(SendCall::Unpin {
            recipients: recipients.to_vec(),
            sync_only: unpin.sync_only,
        });
        self.next_outcome()
    }
}

fn group_conversation(id: &str, recipients: &[&str]) -> Conversation {
    Conversation {
        id: id.to_string(),
        kind: ConversationKind::Group,
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
    }
}

fn direct_conversation(id: &str, recipient: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        kind: ConversationKind::Direct,
        recipients: vec![recipient.to_string()],
    }
}

fn contact(id: &str, registered: bool, blocked: bool) -> Contact {
    Contact {
        id: id.to_string(),
        registered,
        blocked,
    }
}

fn receipts_job(conversation_id: &str) -> ConversationJobData {
    ConversationJobData::Receipts(ReceiptsJobData {
        conversation_id: conversation_id.to_string(),
        receipts_type: ReceiptType::Read,
        receipts: vec![Receipt {
            message_id: "msg-1".to_string(),
            sender_id: "contact-1".to_string(),
            timestamp: 1_700_000_000_000,
        }],
    })
}

fn pin_job(conversation_id: &str) -> ConversationJobData {
    ConversationJobData::PinMessage(PinMessageJobData {
        conversation_id: conversation_id.to_string(),
        message_id: "msg-1".to_string(),
        target_author: "contact-1".to_string(),
        target_sent_timestamp: 1_700_000_000_000,
        pin_duration_ms: None,
    })
}

fn unpin_job(conversation_id: &str, sync_only: bool) -> ConversationJobData {
    ConversationJobData::UnpinMessage(UnpinMessageJobData {
        conversation_id: conversation_id.to_string(),
        message_id: "msg-1".to_string(),
        target_author: "contact-1".to_string(),
        target_sent_timestamp: 1_700_000_000_000,
        sync_only,
        unpinned_at: 1_700_000_100_000,
    })
}

fn queue_with(
    sender: Arc<FakeSender>,
    directory: FakeDirectory,
    options: JobQueueOptions,
) -> (JobQueue<ConversationJobRunner<FakeSender, FakeDirectory>>, InMemoryStore) {
    let store = InMemoryStore::new();
    let runner = ConversationJobRunner::new(sender, Arc::new(directory));
    let queue = JobQueue::with_options(store.clone(), runner, options);
    {
        let queue = queue.clone();
        tokio::spawn(async move {
            let _ = queue.stream_jobs().await;
        });
    }
    (queue, store)
}

fn unregistered_error(recipient_id: &str) -> SendError {
    SendError::UnregisteredUser {
        recipient_id: recipient_id.to_string(),
        http: HttpError::new(404),
    }
}

#[tokio::test(start_paused = true)]
async fn receipts_go_only_to_valid_recipients() {
    let sender = Arc::new(FakeSender::default());
    let directory = FakeDirectory::new(
        vec![group_conversation(
            "conv-1",
            &["valid-1", "unregistered", "blocked", "valid-2"],
        )],
        vec![
            contact("valid-1", true, false),
            contact("unregistered", false, false),
            contact("blocked", true, true),
            contact("valid-2", true, false),
        ],
    );
    let (queue, store) = queue_with(Arc::clone(&sender), directory, JobQueueOptions::new());

    let job = queue.add(receipts_job("conv-1")).await.unwrap();
    job.completion.wait().await.unwrap().unwrap();

    assert_eq!(
        sender.calls(),
        vec![SendCall::Receipts {
            recipients: vec!["valid-1".to_string(), "valid-2".to_string()],
            count: 1,
        }]
    );
    assert!(store.stored_jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rate_limited_sends_wait_out_the_server_hint_and_retry() {
    let rate_limited = SendError::Http(
        HttpError::new(429).with_header(RETRY_AFTER, HeaderValue::from_static("2")),
    );
    let sender = Arc::new(FakeSender::failing_with(vec![rate_limited]));
    let directory = FakeDirectory::new(
        vec![direct_conversation("conv-1", "contact-1")],
        vec![contact("contact-1", true, false)],
    );
    let (queue, _store) = queue_with(Arc::clone(&sender), directory, JobQueueOptions::new());

    let started = tokio::time::Instant::now();
    let job = queue.add(receipts_job("conv-1")).await.unwrap();
    job.completion.wait().await.unwrap().unwrap();

    assert_eq!(sender.calls().len(), 2, "the send must be attempted again");
    // 2s server-directed wait, then the 2s attempt-two backoff.
    assert_eq!(started.elapsed(), Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn an_overloaded_server_giving_up_drops_the_job_silently() {
    let sender = Arc::new(FakeSender::failing_with(vec![SendError::Http(
        HttpError::new(508),
    )]));
    let directory = FakeDirectory::new(
        vec![direct_conversation("conv-1", "contact-1")],
        vec![contact("contact-1", true, false)],
    );
    let (queue, store) = queue_with(Arc::clone(&sender), directory, JobQueueOptions::new());

    let job = queue.add(receipts_job("conv-1")).await.unwrap();
    job.completion.wait().await.unwrap().unwrap();

    assert_eq!(sender.calls().len(), 1, "a 508 must not be retried");
    assert!(store.stored_jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn group_sends_failing_only_on_unregistered_members_count_as_success() {
    let proto = SendError::Proto(ProtoSendError {
        errors: vec![
            RecipientError {
                recipient_id: "gone-1".to_string(),
                error: unregistered_error("gone-1"),
            },
            RecipientError {
                recipient_id: "gone-2".to_string(),
                error: unregistered_error("gone-2"),
            },
        ],
    });
    let sender = Arc::new(FakeSender::failing_with(vec![proto]));
    let directory = FakeDirectory::new(
        vec![group_conversation("group-1", &["member-1", "member-2"])],
        vec![
            contact("member-1", true, false),
            contact("member-2", true, false),
        ],
    );
    let (queue, _store) = queue_with(Arc::clone(&sender), directory, JobQueueOptions::new());

    let job = queue.add(receipts_job("group-1")).await.unwrap();
    job.completion.wait().await.unwrap().unwrap();

    assert_eq!(sender.calls().len(), 1, "nothing left to retry");
}

#[tokio::test(start_paused = true)]
async fn persistent_transport_failures_surface_a_job_error() {
    let sender = Arc::new(FakeSender::failing_with(vec![
        SendError::Transport("socket closed".to_string()),
        SendError::Transport("socket closed".to_string()),
    ]));
    let directory = FakeDirectory::new(
        vec![direct_conversation("conv-1", "contact-1")],
        vec![contact("contact-1", true, false)],
    );
    let (queue, store) = queue_with(
        Arc::clone(&sender),
        directory,
        JobQueueOptions::new().max_attempts(2),
    );

    let job = queue.add(pin_job("conv-1")).await.unwrap();
    let error = job.completion.wait().await.unwrap().unwrap_err();

    assert!(error.to_string().contains("socket closed"));
    assert_eq!(sender.calls().len(), 2);
    assert!(store.stored_jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn pin_jobs_whose_time_budget_is_spent_fail_terminally() {
    let sender = Arc::new(FakeSender::default());
    let directory = FakeDirectory::new(
        vec![direct_conversation("conv-1", "contact-1")],
        vec![contact("contact-1", true, false)],
    );
    let (queue, store) = queue_with(
        Arc::clone(&sender),
        directory,
        JobQueueOptions::new().max_retry_time(Duration::ZERO),
    );

    let job = queue.add(pin_job("conv-1")).await.unwrap();
    let error = job.completion.wait().await.unwrap().unwrap_err();

    assert!(error.to_string().contains("ran out of time"));
    assert!(sender.calls().is_empty(), "no send once the budget is spent");
    assert!(store.stored_jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn receipt_jobs_whose_time_budget_is_spent_give_up_silently() {
    let sender = Arc::new(FakeSender::default());
    let directory = FakeDirectory::new(
        vec![direct_conversation("conv-1", "contact-1")],
        vec![contact("contact-1", true, false)],
    );
    let (queue, store) = queue_with(
        Arc::clone(&sender),
        directory,
        JobQueueOptions::new().max_retry_time(Duration::ZERO),
    );

    let job = queue.add(receipts_job("conv-1")).await.unwrap();
    job.completion.wait().await.unwrap().unwrap();

    assert!(sender.calls().is_empty());
    assert!(store.stored_jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sync_only_unpins_skip_conversation_members() {
    let sender = Arc::new(FakeSender::default());
    let directory = FakeDirectory::new(
        vec![group_conversation("group-1", &["member-1"])],
        vec![contact("member-1", true, false)],
    );
    let (queue, _store) = queue_with(Arc::clone(&sender), directory, JobQueueOptions::new());

    let job = queue.add(unpin_job("group-1", true)).await.unwrap();
    job.completion.wait().await.unwrap().unwrap();

    assert_eq!(
        sender.calls(),
        vec![SendCall::Unpin {
            recipients: Vec::new(),
            sync_only: true,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn a_missing_conversation_is_a_terminal_failure() {
    let sender = Arc::new(FakeSender::default());
    let directory = FixedEmptyDirectory;
    let store = InMemoryStore::new();
    let runner = ConversationJobRunner::new(Arc::clone(&sender), Arc::new(directory));
    let queue = JobQueue::with_options(
        store.clone(),
        runner,
        JobQueueOptions::new().max_attempts(1),
    );
    {
        let queue = queue.clone();
        tokio::spawn(async move {
            let _ = queue.stream_jobs().await;
        });
    }

    let job = queue.add(receipts_job("conv-unknown")).await.unwrap();
    let error = job.completion.wait().await.unwrap().unwrap_err();

    assert!(error
        .to_string()
        .contains("failed to find conversation conv-unknown"));
    assert!(sender.calls().is_empty());
}

struct FixedEmptyDirectory;

impl ContactDirectory for FixedEmptyDirectory {
    fn conversation(&self, _conversation_id: &str) -> Option<Conversation> {
        None
    }

    fn contact(&self, _recipient_id: &str) -> Option<Contact> {
        None
    }
}

#[tokio::test(start_paused = true)]
async fn jobs_for_one_conversation_keep_their_order_across_a_retry() {
    // First job is rate limited once; the second job, for the same
    // conversation, must still run after it.
    let rate_limited = SendError::Http(
        HttpError::new(429).with_header(RETRY_AFTER, HeaderValue::from_static("2")),
    );
    let sender = Arc::new(FakeSender::failing_with(vec![rate_limited]));
    let directory = FakeDirectory::new(
        vec![direct_conversation("conv-1", "contact-1")],
        vec![contact("contact-1", true, false)],
    );
    let (queue, _store) = queue_with(Arc::clone(&sender), directory, JobQueueOptions::new());

    let first = queue.add(receipts_job("conv-1")).await.unwrap();
    let second = queue.add(unpin_job("conv-1", true)).await.unwrap();

    first.completion.wait().await.unwrap().unwrap();
    second.completion.wait().await.unwrap().unwrap();

    let calls = sender.calls();
    assert_eq!(calls.len(), 3);
    assert!(matches!(calls[0], SendCall::Receipts { .. }));
    assert!(matches!(calls[1], SendCall::Receipts { .. }));
    assert!(matches!(calls[2], SendCall::Unpin { .. }));
}
