use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::framing::{LineDecoder, ReplyBuffer};
use super::transport::{ChatError, ChatTransport};
use crate::models::{Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Sending,
    Streaming,
    Complete,
    Errored,
    Aborted,
}

/// How one submission ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Nothing was sent: empty input, a reply still streaming, or a suggested
    /// question that was already asked.
    Rejected,
    Complete,
    Errored(String),
    Aborted,
}

enum Ending {
    Complete,
    Errored(ChatError),
    Aborted,
}

/// The assistant message a stream writes into.
struct ReplyTarget {
    index: usize,
    created_at: DateTime<Utc>,
}

/// Conversation state for one case's chat panel.
///
/// The message list is only ever replaced as a whole snapshot through a watch
/// channel, so a renderer can subscribe and redraw after every change while a
/// history reload and a live stream both write to it.
pub struct ChatSession {
    case_id: String,
    transport: Arc<dyn ChatTransport>,
    messages: watch::Sender<Vec<Message>>,
    phase: watch::Sender<StreamPhase>,
    in_flight: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    processed_question: Mutex<Option<String>>,
}

impl ChatSession {
    pub fn new(case_id: impl Into<String>, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            case_id: case_id.into(),
            transport,
            messages: watch::channel(Vec::new()).0,
            phase: watch::channel(StreamPhase::Idle).0,
            in_flight: AtomicBool::new(false),
            cancel: Mutex::new(None),
            processed_question: Mutex::new(None),
        }
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    pub fn phases(&self) -> watch::Receiver<StreamPhase> {
        self.phase.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Load the stored conversation, replacing whatever is shown.
    pub async fn open(&self) {
        let history = match self.transport.fetch_history(&self.case_id).await {
            Ok(history) => history,
            Err(e) => {
                tracing::error!(case_id = %self.case_id, "Error fetching chat history: {}", e);
                Vec::new()
            }
        };
        self.messages.send_replace(history);
    }

    pub fn close(&self) {
        *lock(&self.processed_question) = None;
    }

    /// Cancel the reply in flight. Returns false when nothing was streaming.
    pub fn stop(&self) -> bool {
        match lock(&self.cancel).take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Send a typed message and stream the reply into the conversation.
    pub async fn submit(&self, text: &str) -> SubmitOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SubmitOutcome::Rejected;
        }
        // Claimed under the cancel lock so that `stop` never sees a loading
        // session without its token.
        let token = {
            let mut cancel = lock(&self.cancel);
            if self
                .in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                tracing::debug!(case_id = %self.case_id, "Reply still streaming, ignoring submission");
                return SubmitOutcome::Rejected;
            }
            let token = CancellationToken::new();
            *cancel = Some(token.clone());
            token
        };

        let ending = self.run(text, &token).await;

        lock(&self.cancel).take();
        let outcome = match ending {
            Ending::Complete => {
                self.phase.send_replace(StreamPhase::Complete);
                SubmitOutcome::Complete
            }
            Ending::Aborted => {
                tracing::info!(case_id = %self.case_id, "Reply stopped by user");
                self.phase.send_replace(StreamPhase::Aborted);
                SubmitOutcome::Aborted
            }
            Ending::Errored(e) => {
                tracing::error!(case_id = %self.case_id, "Error in chat: {}", e);
                self.push(Message::new(Role::System, format!("Error: {}", e)));
                self.phase.send_replace(StreamPhase::Errored);
                SubmitOutcome::Errored(e.to_string())
            }
        };
        self.phase.send_replace(StreamPhase::Idle);
        self.in_flight.store(false, Ordering::Release);
        outcome
    }

    /// Ask a suggested question picked from the memorandum. The selection may
    /// carry a `__<nonce>` suffix so that picking the same question twice is
    /// distinguishable; a selection already asked since `open` is ignored.
    pub async fn ask_suggested(&self, selection: &str) -> SubmitOutcome {
        if self.is_loading() {
            return SubmitOutcome::Rejected;
        }
        {
            let mut processed = lock(&self.processed_question);
            if processed.as_deref() == Some(selection) {
                return SubmitOutcome::Rejected;
            }
            *processed = Some(selection.to_string());
        }
        let question = selection.split("__").next().unwrap_or(selection);
        self.submit(question).await
    }

    async fn run(&self, text: &str, cancel: &CancellationToken) -> Ending {
        self.push(Message::new(Role::User, text));
        self.phase.send_replace(StreamPhase::Sending);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ending::Aborted,
            opened = self.transport.open_stream(&self.case_id, text) => opened,
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(e) => return Ending::Errored(e),
        };

        let placeholder = Message::new(Role::Assistant, "");
        let target = ReplyTarget {
            created_at: placeholder.created_at,
            index: self.push(placeholder),
        };
        self.phase.send_replace(StreamPhase::Streaming);

        let mut decoder = LineDecoder::default();
        let mut reply = ReplyBuffer::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Aborted,
                next = body.next() => next,
            };
            let (lines, done) = match next {
                Some(Ok(chunk)) => (decoder.push(&chunk), false),
                Some(Err(e)) => return Ending::Errored(e),
                None => (decoder.finish(), true),
            };
            for line in lines {
                if reply.apply(&line) {
                    self.show_reply(&target, reply.text());
                }
            }
            if done {
                return Ending::Complete;
            }
        }
    }

    fn push(&self, message: Message) -> usize {
        let mut index = 0;
        self.messages.send_modify(|list| {
            list.push(message);
            index = list.len() - 1;
        });
        index
    }

    fn show_reply(&self, target: &ReplyTarget, text: &str) {
        self.messages.send_if_modified(|list| match list.get_mut(target.index) {
            Some(msg) if msg.role == Role::Assistant && msg.created_at == target.created_at => {
                msg.content = text.to_string();
                true
            }
            // The list was reloaded underneath the stream.
            _ => false,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;

    use super::*;
    use crate::client::transport::ReplyStream;

    enum Reply {
        /// Chunks, then end of body.
        Chunks(Vec<&'static str>),
        /// Chunks, then the body stays open until cancelled.
        ChunksThenHang(Vec<&'static str>),
        /// Chunks, then a read failure.
        ChunksThenFail(Vec<&'static str>),
        /// The relay answered with a non-success status.
        Refused,
        /// The relay never answers.
        NeverAnswers,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        history: Mutex<Option<Vec<Message>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn replying(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn chunks(items: Vec<&'static str>) -> stream::Iter<std::vec::IntoIter<Result<Bytes, ChatError>>> {
        stream::iter(
            items
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn fetch_history(&self, _case_id: &str) -> Result<Vec<Message>, ChatError> {
            self.history
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ChatError::History("HTTP 500".to_string()))
        }

        async fn open_stream(&self, _case_id: &str, _message: &str) -> Result<ReplyStream, ChatError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Chunks(items)) => Ok(chunks(items).boxed()),
                Some(Reply::ChunksThenHang(items)) => Ok(chunks(items).chain(stream::pending()).boxed()),
                Some(Reply::ChunksThenFail(items)) => Ok(chunks(items)
                    .chain(stream::once(async {
                        Err(ChatError::Stream("connection reset".to_string()))
                    }))
                    .boxed()),
                Some(Reply::Refused) => Err(ChatError::SendFailed),
                Some(Reply::NeverAnswers) => futures::future::pending::<Result<ReplyStream, ChatError>>().await,
                None => Err(ChatError::Network("no scripted reply".to_string())),
            }
        }
    }

    fn roles(messages: &[Message]) -> Vec<Role> {
        messages.iter().map(|m| m.role).collect()
    }

    async fn wait_for_reply(session: &ChatSession, content: &str) {
        let mut rx = session.subscribe();
        rx.wait_for(|list| {
            list.last()
                .map(|m| m.role == Role::Assistant && m.content == content)
                .unwrap_or(false)
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_hello_scenario() {
        let transport = ScriptedTransport::replying(vec![Reply::Chunks(vec![
            "data: Hi\n\n",
            "data:  there\n\n",
        ])]);
        let session = ChatSession::new("case-1", transport);

        assert_eq!(session.submit("Hello").await, SubmitOutcome::Complete);
        let messages = session.messages();
        assert_eq!(roles(&messages), [Role::User, Role::Assistant]);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].content, "Hi there");
        assert!(!session.is_loading());
        assert_eq!(*session.phases().borrow(), StreamPhase::Idle);
    }

    #[tokio::test]
    async fn test_input_is_trimmed_and_blank_input_rejected() {
        let transport = ScriptedTransport::replying(vec![Reply::Chunks(vec!["data: ok\n\n"])]);
        let session = ChatSession::new("case-1", transport.clone());

        assert_eq!(session.submit("   ").await, SubmitOutcome::Rejected);
        assert!(session.messages().is_empty());
        assert_eq!(transport.calls(), 0);

        session.submit("  Hello \n").await;
        assert_eq!(session.messages()[0].content, "Hello");
    }

    #[tokio::test]
    async fn test_publishes_full_buffer_after_each_fragment() {
        let transport = ScriptedTransport::replying(vec![Reply::Chunks(vec![
            "data: The\n\n",
            "data:  access\n\ndata: \n\n",
            "data: permit\n\n",
        ])]);
        let session = Arc::new(ChatSession::new("case-1", transport));
        let mut rx = session.subscribe();

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                if let Some(last) = snapshot.last().filter(|m| m.role == Role::Assistant) {
                    if seen.last() != Some(&last.content) {
                        seen.push(last.content.clone());
                    }
                    if last.content == "The access\npermit" {
                        break;
                    }
                }
            }
            seen
        });

        session.submit("What applies?").await;
        let seen = observer.await.unwrap();
        // Intermediate snapshots may coalesce, but every one is a prefix of the final text.
        assert_eq!(seen.last().map(String::as_str), Some("The access\npermit"));
        assert!(seen.iter().all(|s| "The access\npermit".starts_with(s.as_str())));
    }

    #[tokio::test]
    async fn test_refused_message_adds_one_system_message() {
        let transport = ScriptedTransport::replying(vec![Reply::Refused]);
        let session = ChatSession::new("case-1", transport);

        let outcome = session.submit("Hello").await;
        assert_eq!(
            outcome,
            SubmitOutcome::Errored("Failed to send message".to_string())
        );
        let messages = session.messages();
        assert_eq!(roles(&messages), [Role::User, Role::System]);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].content, "Error: Failed to send message");
    }

    #[tokio::test]
    async fn test_read_failure_keeps_partial_reply() {
        let transport =
            ScriptedTransport::replying(vec![Reply::ChunksThenFail(vec!["data: Partial\n\n"])]);
        let session = ChatSession::new("case-1", transport);

        assert!(matches!(
            session.submit("Hello").await,
            SubmitOutcome::Errored(_)
        ));
        let messages = session.messages();
        assert_eq!(roles(&messages), [Role::User, Role::Assistant, Role::System]);
        assert_eq!(messages[1].content, "Partial");
        assert_eq!(messages[2].content, "Error: Stream error: connection reset");
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn test_stop_mid_stream_keeps_partial_reply() {
        let transport =
            ScriptedTransport::replying(vec![Reply::ChunksThenHang(vec!["data: Hi\n\n"])]);
        let session = Arc::new(ChatSession::new("case-1", transport));

        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.submit("Hello").await })
        };
        wait_for_reply(&session, "Hi").await;
        assert!(session.is_loading());

        assert!(session.stop());
        assert_eq!(running.await.unwrap(), SubmitOutcome::Aborted);

        let messages = session.messages();
        assert_eq!(roles(&messages), [Role::User, Role::Assistant]);
        assert_eq!(messages[1].content, "Hi");
        assert!(!session.is_loading());
        assert!(!session.stop());
    }

    #[tokio::test]
    async fn test_stop_before_relay_answers() {
        let transport = ScriptedTransport::replying(vec![Reply::NeverAnswers]);
        let session = Arc::new(ChatSession::new("case-1", transport));
        let mut phases = session.phases();

        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.submit("Hello").await })
        };
        phases
            .wait_for(|p| *p == StreamPhase::Sending)
            .await
            .unwrap();

        assert!(session.stop());
        assert_eq!(running.await.unwrap(), SubmitOutcome::Aborted);
        assert_eq!(roles(&session.messages()), [Role::User]);
    }

    #[tokio::test]
    async fn test_submit_while_loading_is_noop() {
        let transport = ScriptedTransport::replying(vec![
            Reply::ChunksThenHang(vec!["data: Working\n\n"]),
            Reply::Chunks(vec!["data: second\n\n"]),
        ]);
        let session = Arc::new(ChatSession::new("case-1", transport.clone()));

        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.submit("First").await })
        };
        wait_for_reply(&session, "Working").await;

        let before = session.messages().len();
        assert_eq!(session.submit("Second").await, SubmitOutcome::Rejected);
        assert_eq!(
            session.ask_suggested("Is a permit needed?__1").await,
            SubmitOutcome::Rejected
        );
        assert_eq!(session.messages().len(), before);
        assert_eq!(transport.calls(), 1);

        session.stop();
        running.await.unwrap();

        assert_eq!(session.submit("Second").await, SubmitOutcome::Complete);
        assert_eq!(transport.calls(), 2);
        assert_eq!(session.messages().last().unwrap().content, "second");
    }

    #[tokio::test]
    async fn test_suggested_question_uses_same_framing() {
        let transport = ScriptedTransport::replying(vec![Reply::Chunks(vec![
            "data: Line1\n\ndata: \n\ndata: Line2\n\n",
        ])]);
        let session = ChatSession::new("case-1", transport.clone());

        let outcome = session.ask_suggested("Who grants access?__1700000000").await;
        assert_eq!(outcome, SubmitOutcome::Complete);
        let messages = session.messages();
        assert_eq!(messages[0].content, "Who grants access?");
        assert_eq!(messages[1].content, "Line1\nLine2");

        // The same selection is not asked twice until the panel is reopened.
        assert_eq!(
            session.ask_suggested("Who grants access?__1700000000").await,
            SubmitOutcome::Rejected
        );
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_close_forgets_processed_question() {
        let transport = ScriptedTransport::replying(vec![
            Reply::Chunks(vec!["data: a\n\n"]),
            Reply::Chunks(vec!["data: b\n\n"]),
        ]);
        let session = ChatSession::new("case-1", transport.clone());

        session.ask_suggested("Q__1").await;
        session.close();
        assert_eq!(session.ask_suggested("Q__1").await, SubmitOutcome::Complete);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_open_replaces_list_with_history() {
        let transport = ScriptedTransport::replying(vec![Reply::Chunks(vec!["data: x\n\n"])]);
        *transport.history.lock().unwrap() = Some(vec![
            Message::new(Role::User, "Earlier question"),
            Message::new(Role::Assistant, "Earlier answer"),
        ]);
        let session = ChatSession::new("case-1", transport);

        session.submit("Local only").await;
        session.open().await;

        let contents: Vec<_> = session.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, ["Earlier question", "Earlier answer"]);
    }

    #[tokio::test]
    async fn test_open_with_failing_history_shows_empty_list() {
        let transport = ScriptedTransport::replying(vec![Reply::Chunks(vec!["data: x\n\n"])]);
        let session = ChatSession::new("case-1", transport);

        session.submit("Hello").await;
        assert_eq!(session.messages().len(), 2);

        session.open().await;
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_reload_during_stream_is_not_overwritten() {
        let transport =
            ScriptedTransport::replying(vec![Reply::ChunksThenHang(vec!["data: Hi\n\n"])]);
        *transport.history.lock().unwrap() = Some(vec![Message::new(Role::Assistant, "Stored")]);
        let session = Arc::new(ChatSession::new("case-1", transport));

        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.submit("Hello").await })
        };
        wait_for_reply(&session, "Hi").await;

        session.open().await;
        session.stop();
        running.await.unwrap();

        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Stored");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_always_reaches_a_loading_session() {
        for _ in 0..50 {
            let transport = ScriptedTransport::replying(vec![Reply::NeverAnswers]);
            let session = Arc::new(ChatSession::new("case-1", transport));

            let running = {
                let session = session.clone();
                tokio::spawn(async move { session.submit("Hello").await })
            };
            while !session.is_loading() {
                std::hint::spin_loop();
            }

            assert!(session.stop());
            assert_eq!(running.await.unwrap(), SubmitOutcome::Aborted);
        }
    }

    #[tokio::test]
    async fn test_poisoned_question_lock_is_recovered() {
        let transport = ScriptedTransport::replying(vec![Reply::Chunks(vec!["data: a\n\n"])]);
        let session = ChatSession::new("case-1", transport);

        let _ = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = session.processed_question.lock().unwrap();
                    panic!("worker thread died holding the lock");
                })
                .join()
        });
        assert!(session.processed_question.is_poisoned());

        session.close();
        assert_eq!(session.ask_suggested("Q__1").await, SubmitOutcome::Complete);
        assert_eq!(session.ask_suggested("Q__1").await, SubmitOutcome::Rejected);
    }
}
