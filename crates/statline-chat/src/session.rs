//! Conversation state machine
//!
//! A [`ChatSession`] runs at most one turn at a time. The turn in flight and
//! its transport live inside [`Phase`]; ending a turn moves the transport out
//! of the phase and drops it, so a closed stream is never polled again.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Map, Value};
use statline_stream::{
    ChatRequest, Closure, StreamEvent, TransportEvent, TransportEventStream, TransportFailure,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    conversation::{ConversationState, PhaseKind},
    error::ChatError,
    events::SessionEvent,
    handle::ChatHandle,
    message::{Message, MessageStore},
    tools::{MatchPolicy, ToolExecution, ToolTracker},
    transport::Transport,
};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How tool completions are matched to running invocations
    pub tool_matching: MatchPolicy,
    /// Capacity of the [`SessionEvent`] broadcast channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tool_matching: MatchPolicy::OldestByName,
            event_capacity: 256,
        }
    }
}

/// The open transport of the turn in flight. Dropping it closes the stream.
struct Link {
    events: TransportEventStream,
    cancel: CancellationToken,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Phase {
    Idle,
    AwaitingFirstEvent { link: Link },
    Streaming { link: Link, draft: Message },
}

impl Phase {
    fn kind(&self) -> PhaseKind {
        match self {
            Phase::Idle => PhaseKind::Idle,
            Phase::AwaitingFirstEvent { .. } => PhaseKind::AwaitingFirstEvent,
            Phase::Streaming { .. } => PhaseKind::Streaming,
        }
    }

    fn link_mut(&mut self) -> Option<&mut Link> {
        match self {
            Phase::Idle => None,
            Phase::AwaitingFirstEvent { link } | Phase::Streaming { link, .. } => Some(link),
        }
    }

    /// Leave the phase, returning what was in flight
    fn take(&mut self) -> Phase {
        std::mem::replace(self, Phase::Idle)
    }
}

/// Drives one conversation against a [`Transport`].
pub struct ChatSession {
    transport: Arc<dyn Transport>,
    conversation_id: Option<String>,
    store: MessageStore,
    tools: ToolTracker,
    phase: Phase,
    error: Option<ChatError>,
    dropped_frames: u64,
    handle: ChatHandle,
    event_tx: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<ConversationState>,
}

impl ChatSession {
    /// Create a new session
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (state_tx, _) = watch::channel(ConversationState::default());
        Self {
            tools: ToolTracker::new(config.tool_matching),
            transport,
            conversation_id: None,
            store: MessageStore::new(),
            phase: Phase::Idle,
            error: None,
            dropped_frames: 0,
            handle: ChatHandle::new(),
            event_tx,
            state_tx,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Watch state snapshots; one is published after every applied event
    pub fn watch_state(&self) -> watch::Receiver<ConversationState> {
        self.publish();
        self.state_tx.subscribe()
    }

    /// Get a cloneable handle for stopping turns from other tasks
    pub fn handle(&self) -> ChatHandle {
        self.handle.clone()
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ConversationState {
        ConversationState {
            conversation_id: self.conversation_id.clone(),
            messages: self.store.messages().to_vec(),
            is_streaming: self.is_streaming(),
            current_streaming_message: self.current_streaming_message().to_string(),
            active_tools: self.tools.active().to_vec(),
            error: self.error.clone(),
            phase: self.phase.kind(),
        }
    }

    pub fn phase(&self) -> PhaseKind {
        self.phase.kind()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Finalized messages
    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::Streaming { .. })
    }

    /// Text of the in-progress reply, empty when not streaming
    pub fn current_streaming_message(&self) -> &str {
        match &self.phase {
            Phase::Streaming { draft, .. } => &draft.content,
            _ => "",
        }
    }

    pub fn active_tools(&self) -> &[ToolExecution] {
        self.tools.active()
    }

    pub fn error(&self) -> Option<&ChatError> {
        self.error.as_ref()
    }

    /// Number of frames the transport could not decode
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Send a user message and open its stream.
    ///
    /// A turn already in flight is cancelled first, exactly as [`stop`](Self::stop)
    /// would. Failures to open the stream end up in [`error`](Self::error).
    pub async fn send_message(&mut self, text: impl Into<String>) {
        let text = text.into();

        if !matches!(self.phase, Phase::Idle) {
            tracing::debug!("superseding turn in flight");
            self.abort_turn();
        }

        let message = self.store.push_user(text.clone()).clone();
        self.emit(SessionEvent::TurnRequested { message });

        let cancel = self.handle.begin_turn();
        let request = ChatRequest::new(text, self.conversation_id.clone());

        match self.transport.open(request, cancel.clone()).await {
            Ok(events) => {
                self.phase = Phase::AwaitingFirstEvent {
                    link: Link { events, cancel },
                };
            }
            Err(e) => {
                let failure = TransportFailure::Request(e.to_string());
                self.fail(ChatError::from_transport(&failure));
            }
        }

        self.publish();
    }

    /// Process the next transport event of the turn in flight.
    ///
    /// Returns `false` when no turn is in flight. Cancellation through the
    /// [`ChatHandle`] wins over any pending transport event.
    pub async fn step(&mut self) -> bool {
        let Some(link) = self.phase.link_mut() else {
            return false;
        };

        let cancel = link.cancel.clone();
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => TransportEvent::Closed(Closure::Aborted),
            event = link.events.next() => event.unwrap_or_else(|| {
                tracing::warn!("transport ended without a terminal event");
                TransportEvent::Closed(Closure::Normal)
            }),
        };

        self.apply(event);
        true
    }

    /// Process events until the turn in flight ends
    pub async fn run_turn(&mut self) {
        while self.step().await {}
    }

    /// Send a message and process its whole turn
    pub async fn submit(&mut self, text: impl Into<String>) {
        self.send_message(text).await;
        self.run_turn().await;
    }

    /// Resend the last user message if the current error is retryable.
    ///
    /// Returns `true` when a new turn was started.
    pub async fn retry_last(&mut self) -> bool {
        if !matches!(self.phase, Phase::Idle) {
            return false;
        }
        if !self.error.as_ref().is_some_and(|e| e.is_retryable) {
            return false;
        }
        let Some(text) = self.store.last_user_message().map(|m| m.content.clone()) else {
            return false;
        };

        self.send_message(text).await;
        true
    }

    /// Stop the turn in flight.
    ///
    /// Already received text is kept as a finalized message; an empty reply
    /// leaves no message behind. No transport event is observed afterwards.
    pub fn stop(&mut self) {
        if matches!(self.phase, Phase::Idle) {
            return;
        }
        self.abort_turn();
        self.publish();
    }

    /// Reset the conversation and close any open transport
    pub fn clear_conversation(&mut self) {
        drop(self.phase.take());
        self.store.clear();
        self.tools.clear();
        self.error = None;
        self.conversation_id = None;
        self.handle.mark_idle();
        self.emit(SessionEvent::Cleared);
        self.publish();
    }

    fn apply(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                tracing::debug!("chat stream opened");
            }
            TransportEvent::FrameDropped { reason } => {
                self.dropped_frames += 1;
                tracing::warn!(total = self.dropped_frames, "frame dropped: {}", reason);
            }
            TransportEvent::Protocol(event) => self.apply_protocol(event),
            TransportEvent::Closed(Closure::Aborted) => self.abort_turn(),
            TransportEvent::Closed(Closure::Normal) => {
                if !matches!(self.phase, Phase::Idle) {
                    self.fail(ChatError::protocol_violation(
                        "stream closed before the reply completed",
                    ));
                }
            }
            TransportEvent::Closed(Closure::Failed(failure)) => {
                if !matches!(self.phase, Phase::Idle) {
                    self.fail(ChatError::from_transport(&failure));
                }
            }
        }
        self.publish();
    }

    fn apply_protocol(&mut self, event: StreamEvent) {
        let name = event.kind();

        match (self.phase.kind(), event) {
            (PhaseKind::Idle, _) => {
                tracing::debug!(event = name, "ignoring event with no turn in flight");
            }
            (_, StreamEvent::Error { error, code }) => {
                self.fail(ChatError::from_protocol(error, code));
            }
            (PhaseKind::AwaitingFirstEvent, StreamEvent::Start { conversation_id }) => {
                self.start_turn(conversation_id);
            }
            (PhaseKind::AwaitingFirstEvent, _) => {
                self.fail(ChatError::protocol_violation(format!(
                    "received `{}` before `start`",
                    name
                )));
            }
            (PhaseKind::Streaming, StreamEvent::Start { .. }) => {
                self.fail(ChatError::protocol_violation(
                    "received a second `start` within one turn",
                ));
            }
            (PhaseKind::Streaming, StreamEvent::Delta { content }) => {
                self.append_delta(content);
            }
            (
                PhaseKind::Streaming,
                StreamEvent::ToolStart {
                    tool_name,
                    arguments,
                },
            ) => {
                self.start_tool(&tool_name, arguments);
            }
            (
                PhaseKind::Streaming,
                StreamEvent::ToolEnd {
                    tool_name,
                    success,
                    result_summary,
                },
            ) => {
                self.finish_tool(&tool_name, success, result_summary);
            }
            (PhaseKind::Streaming, StreamEvent::End) => {
                self.finish_turn();
            }
        }
    }

    fn start_turn(&mut self, conversation_id: String) {
        match self.phase.take() {
            Phase::AwaitingFirstEvent { link } => {
                tracing::debug!(conversation_id = %conversation_id, "turn started");
                self.conversation_id = Some(conversation_id.clone());
                self.error = None;
                self.tools.clear();
                self.phase = Phase::Streaming {
                    link,
                    draft: Message::streaming_reply(),
                };
                self.emit(SessionEvent::TurnStarted { conversation_id });
            }
            other => self.phase = other,
        }
    }

    fn append_delta(&mut self, content: String) {
        if let Phase::Streaming { draft, .. } = &mut self.phase {
            draft.content.push_str(&content);
        }
        self.emit(SessionEvent::Delta { content });
    }

    fn start_tool(&mut self, tool_name: &str, arguments: Map<String, Value>) {
        let tool = self.tools.start(tool_name, arguments).clone();
        tracing::debug!(tool = tool_name, id = %tool.id, "tool started");
        self.emit(SessionEvent::ToolStarted { tool });
    }

    fn finish_tool(&mut self, tool_name: &str, success: bool, result_summary: Option<String>) {
        let finished = self.tools.finish(tool_name, success, result_summary).cloned();
        match finished {
            Some(tool) => {
                tracing::debug!(tool = tool_name, id = %tool.id, success, "tool finished");
                self.emit(SessionEvent::ToolFinished { tool });
            }
            None => {
                tracing::warn!(tool = tool_name, "tool_end without a matching running invocation");
            }
        }
    }

    fn finish_turn(&mut self) {
        match self.phase.take() {
            Phase::Streaming { link, draft } => {
                drop(link);
                let message = self.store.finalize(draft, self.tools.take()).clone();
                tracing::debug!(id = %message.id, chars = message.content.len(), "turn finalized");
                self.handle.mark_idle();
                self.emit(SessionEvent::TurnFinalized { message });
            }
            other => self.phase = other,
        }
    }

    /// Cancel the turn in flight, keeping any partial reply
    fn abort_turn(&mut self) {
        let kept = match self.phase.take() {
            Phase::Idle => return,
            Phase::AwaitingFirstEvent { link } => {
                drop(link);
                self.tools.clear();
                None
            }
            Phase::Streaming { link, draft } => {
                drop(link);
                if draft.content.is_empty() {
                    self.tools.clear();
                    None
                } else {
                    Some(self.store.finalize(draft, self.tools.take()).clone())
                }
            }
        };

        tracing::debug!(kept = kept.is_some(), "turn cancelled");
        self.handle.mark_idle();
        self.emit(SessionEvent::TurnCancelled { message: kept });
    }

    /// End the turn in flight with an error, discarding partial text
    fn fail(&mut self, error: ChatError) {
        drop(self.phase.take());
        self.tools.clear();
        tracing::warn!(
            code = %error.code,
            retryable = error.is_retryable,
            "turn failed: {}",
            error.message
        );
        self.error = Some(error.clone());
        self.handle.mark_idle();
        self.emit(SessionEvent::TurnFailed { error });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorCode, Role, ToolStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    enum Script {
        /// Deliver these events, then end the stream
        Events(Vec<TransportEvent>),
        /// Deliver these events, then stay open until cancelled
        Hang(Vec<TransportEvent>),
        /// Refuse to open
        Refuse,
    }

    /// A transport that plays back scripted streams, one per request.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<ChatRequest>>,
        tokens: Mutex<Vec<CancellationToken>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(
            &self,
            request: ChatRequest,
            cancel: CancellationToken,
        ) -> statline_stream::Result<TransportEventStream> {
            self.requests.lock().push(request);
            self.tokens.lock().push(cancel.clone());

            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or(Script::Events(vec![closed()]));

            let stream: TransportEventStream = match script {
                Script::Events(events) => Box::pin(futures::stream::iter(events)),
                Script::Hang(events) => Box::pin(async_stream::stream! {
                    for event in events {
                        yield event;
                    }
                    cancel.cancelled().await;
                    yield TransportEvent::Closed(Closure::Aborted);
                }),
                Script::Refuse => {
                    return Err(statline_stream::Error::Sse("connection refused".into()));
                }
            };
            Ok(stream)
        }
    }

    fn start(id: &str) -> TransportEvent {
        StreamEvent::Start {
            conversation_id: id.into(),
        }
        .into()
    }

    fn delta(text: &str) -> TransportEvent {
        StreamEvent::Delta {
            content: text.into(),
        }
        .into()
    }

    fn tool_start(name: &str) -> TransportEvent {
        StreamEvent::ToolStart {
            tool_name: name.into(),
            arguments: Map::new(),
        }
        .into()
    }

    fn tool_end(name: &str, success: bool, summary: Option<&str>) -> TransportEvent {
        StreamEvent::ToolEnd {
            tool_name: name.into(),
            success,
            result_summary: summary.map(String::from),
        }
        .into()
    }

    fn end() -> TransportEvent {
        StreamEvent::End.into()
    }

    fn server_error(message: &str, code: ErrorCode) -> TransportEvent {
        StreamEvent::Error {
            error: message.into(),
            code,
        }
        .into()
    }

    fn closed() -> TransportEvent {
        TransportEvent::Closed(Closure::Normal)
    }

    fn http_status(status: u16) -> TransportEvent {
        TransportEvent::Closed(Closure::Failed(TransportFailure::Status {
            status,
            message: "request failed".into(),
            rate_limit: None,
        }))
    }

    fn session(transport: Arc<ScriptedTransport>) -> ChatSession {
        ChatSession::new(transport, SessionConfig::default())
    }

    fn assistant_texts(session: &ChatSession) -> Vec<&str> {
        session
            .messages()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_simple_turn() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            TransportEvent::Opened,
            start("c1"),
            delta("Hi"),
            delta(" there"),
            end(),
            closed(),
        ])]);
        let mut session = session(transport.clone());

        session.submit("hello").await;

        let state = session.state();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].role, Role::User);
        assert_eq!(state.messages[0].content, "hello");
        assert_eq!(state.messages[1].role, Role::Assistant);
        assert_eq!(state.messages[1].content, "Hi there");
        assert!(!state.messages[1].is_streaming);
        assert!(state.messages[1].tools.is_none());
        assert!(!state.is_streaming);
        assert!(state.current_streaming_message.is_empty());
        assert_eq!(state.conversation_id.as_deref(), Some("c1"));
        assert!(state.error.is_none());
        assert_eq!(state.phase, PhaseKind::Idle);

        let requests = transport.requests.lock();
        assert_eq!(requests[0], ChatRequest::new("hello", None));
    }

    #[tokio::test]
    async fn test_follow_up_sends_conversation_id() {
        let transport = ScriptedTransport::new(vec![
            Script::Events(vec![start("c1"), delta("one"), end()]),
            Script::Events(vec![start("c1"), delta("two"), end()]),
        ]);
        let mut session = session(transport.clone());

        session.submit("first").await;
        session.submit("second").await;

        assert_eq!(assistant_texts(&session), vec!["one", "two"]);
        let requests = transport.requests.lock();
        assert_eq!(requests[1].conversation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_turn_with_tool() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            start("c1"),
            tool_start("search"),
            delta("Found it"),
            tool_end("search", true, Some("3 results")),
            end(),
        ])]);
        let mut session = session(transport);

        session.submit("x").await;

        let reply = session.messages().last().unwrap();
        assert_eq!(reply.content, "Found it");
        let tools = reply.tools.as_ref().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool_name, "search");
        assert_eq!(tools[0].status, ToolStatus::Success);
        assert_eq!(tools[0].result_summary.as_deref(), Some("3 results"));
        assert!(session.active_tools().is_empty());
    }

    #[tokio::test]
    async fn test_active_tools_visible_mid_turn() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![
            start("c1"),
            tool_start("leaderboard"),
            tool_start("search"),
            tool_end("leaderboard", false, Some("timeout")),
        ])]);
        let mut session = session(transport);

        session.send_message("x").await;
        for _ in 0..4 {
            assert!(session.step().await);
        }

        let tools = session.active_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].status, ToolStatus::Failed);
        assert_eq!(tools[1].status, ToolStatus::Running);
        assert!(session.is_streaming());
    }

    #[tokio::test]
    async fn test_unmatched_tool_end_is_noop() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            start("c1"),
            tool_start("x"),
            tool_end("x", true, None),
            tool_end("x", false, Some("stray")),
            tool_end("never_started", true, None),
            end(),
        ])]);
        let mut session = session(transport);

        session.submit("go").await;

        let reply = session.messages().last().unwrap();
        assert_eq!(reply.tools().len(), 1);
        assert_eq!(reply.tools()[0].status, ToolStatus::Success);
        assert!(reply.tools()[0].result_summary.is_none());
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn test_strict_matching_from_config() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            start("c1"),
            tool_start("search"),
            tool_start("search"),
            tool_end("search", true, None),
            end(),
        ])]);
        let config = SessionConfig {
            tool_matching: MatchPolicy::Strict,
            ..Default::default()
        };
        let mut session = ChatSession::new(transport, config);

        session.submit("x").await;

        let tools = session.messages().last().unwrap().tools();
        assert!(tools.iter().all(|t| t.status == ToolStatus::Running));
    }

    #[tokio::test]
    async fn test_deltas_concatenate_in_order() {
        let fragments = ["", "Ana ", "leads", "", " with ", "1 204", " pts ", "🏆", "."];
        let mut events = vec![start("c1")];
        events.extend(fragments.iter().map(|f| delta(f)));
        events.push(end());

        let transport = ScriptedTransport::new(vec![Script::Events(events)]);
        let mut session = session(transport);

        session.submit("who leads?").await;

        assert_eq!(assistant_texts(&session), vec![fragments.concat().as_str()]);
    }

    #[tokio::test]
    async fn test_zero_deltas_finalize_empty_message() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![start("c1"), end()])]);
        let mut session = session(transport);

        session.submit("anything?").await;

        assert_eq!(assistant_texts(&session), vec![""]);
    }

    #[tokio::test]
    async fn test_buffer_grows_while_streaming() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![
            start("c1"),
            delta("Par"),
            delta("tial"),
        ])]);
        let mut session = session(transport);

        session.send_message("x").await;
        assert_eq!(session.phase(), PhaseKind::AwaitingFirstEvent);
        assert!(!session.is_streaming());

        session.step().await;
        assert_eq!(session.phase(), PhaseKind::Streaming);
        session.step().await;
        assert_eq!(session.current_streaming_message(), "Par");
        session.step().await;
        assert_eq!(session.current_streaming_message(), "Partial");
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_keeps_partial_reply() {
        let transport =
            ScriptedTransport::new(vec![Script::Hang(vec![start("c1"), delta("Partial")])]);
        let mut session = session(transport.clone());

        session.send_message("x").await;
        session.step().await;
        session.step().await;
        session.stop();

        let state = session.state();
        assert_eq!(assistant_texts(&session), vec!["Partial"]);
        assert!(!state.messages[1].is_streaming);
        assert!(!state.is_streaming);
        assert!(state.current_streaming_message.is_empty());
        assert!(state.error.is_none());
        assert!(transport.tokens.lock()[0].is_cancelled());
        assert!(!session.handle().is_running());
        assert!(!session.step().await);
    }

    #[tokio::test]
    async fn test_stop_with_empty_buffer_adds_nothing() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![
            start("c1"),
            tool_start("search"),
        ])]);
        let mut session = session(transport);

        session.send_message("x").await;
        session.step().await;
        session.step().await;
        session.stop();

        assert_eq!(session.messages().len(), 1);
        assert!(session.active_tools().is_empty());
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![])]);
        let mut session = session(transport);

        session.send_message("x").await;
        session.stop();

        assert_eq!(session.phase(), PhaseKind::Idle);
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_stop_is_observed_before_further_events() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            start("c1"),
            delta("Partial"),
            delta(" and more"),
            end(),
        ])]);
        let mut session = session(transport);
        let handle = session.handle();

        session.send_message("x").await;
        assert!(handle.is_running());
        session.step().await;
        session.step().await;

        handle.stop();
        assert!(session.step().await);
        assert!(!session.step().await);

        assert_eq!(assistant_texts(&session), vec!["Partial"]);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_handle_stop_from_another_task() {
        let transport =
            ScriptedTransport::new(vec![Script::Hang(vec![start("c1"), delta("Partial")])]);
        let mut session = session(transport);
        let handle = session.handle();
        let mut events = session.subscribe();

        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, SessionEvent::Delta { .. }) {
                    handle.stop();
                }
            }
        });

        session.submit("x").await;

        assert_eq!(assistant_texts(&session), vec!["Partial"]);
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn test_http_500_before_start() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![http_status(500)])]);
        let mut session = session(transport);

        session.submit("x").await;

        let error = session.error().unwrap();
        assert_eq!(error.code, ErrorCode::AgentError);
        assert!(error.is_retryable);
        assert_eq!(session.messages().len(), 1);
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_http_401_needs_reverification() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![http_status(401)])]);
        let mut session = session(transport);

        session.submit("x").await;

        let error = session.error().unwrap();
        assert_eq!(error.code, ErrorCode::AuthFailed);
        assert!(!error.is_retryable);
        assert!(error.needs_reverification());
    }

    #[tokio::test]
    async fn test_connection_lost_mid_turn_discards_partial_reply() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            start("c1"),
            delta("partial"),
            tool_start("search"),
            TransportEvent::Closed(Closure::Failed(TransportFailure::Connection(
                "connection reset by peer".into(),
            ))),
        ])]);
        let mut session = session(transport.clone());

        session.submit("x").await;

        let state = session.state();
        let error = state.error.as_ref().unwrap();
        assert_eq!(error.code, ErrorCode::InternalError);
        assert!(error.is_retryable);
        assert!(error.message.contains("connection reset by peer"));
        assert!(!state.is_streaming);
        assert!(state.current_streaming_message.is_empty());
        assert!(state.active_tools.is_empty());
        assert_eq!(state.phase, PhaseKind::Idle);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].role, Role::User);
        assert!(transport.tokens.lock()[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_protocol_error_discards_partial_reply() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            start("c1"),
            tool_start("search"),
            delta("half an ans"),
            server_error("redis unavailable", ErrorCode::RedisError),
            closed(),
        ])]);
        let mut session = session(transport);

        session.submit("x").await;

        let state = session.state();
        let error = state.error.as_ref().unwrap();
        assert_eq!(error.code, ErrorCode::RedisError);
        assert_eq!(error.message, "redis unavailable");
        assert!(error.is_retryable);
        assert!(!state.is_streaming);
        assert!(state.current_streaming_message.is_empty());
        assert!(state.active_tools.is_empty());
        assert_eq!(state.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_reported_internal_error_not_retryable() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            start("c1"),
            server_error("unexpected", ErrorCode::InternalError),
        ])]);
        let mut session = session(transport);

        session.submit("x").await;

        assert!(!session.error().unwrap().is_retryable);
    }

    #[tokio::test]
    async fn test_error_before_start_is_honoured() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![server_error(
            "message too long",
            ErrorCode::ValidationError,
        )])]);
        let mut session = session(transport);

        session.submit("x").await;

        let error = session.error().unwrap();
        assert_eq!(error.code, ErrorCode::ValidationError);
        assert!(!error.is_retryable);
    }

    #[tokio::test]
    async fn test_delta_before_start_is_protocol_violation() {
        let transport =
            ScriptedTransport::new(vec![Script::Events(vec![delta("early"), start("c1"), end()])]);
        let mut session = session(transport.clone());

        session.submit("x").await;

        let error = session.error().unwrap();
        assert_eq!(error.code, ErrorCode::InternalError);
        assert!(error.message.contains("`delta` before `start`"));
        assert_eq!(session.messages().len(), 1);
        assert!(transport.tokens.lock()[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_second_start_is_protocol_violation() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            start("c1"),
            delta("a"),
            start("c2"),
            end(),
        ])]);
        let mut session = session(transport);

        session.submit("x").await;

        assert_eq!(session.error().unwrap().code, ErrorCode::InternalError);
        assert_eq!(session.conversation_id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_close_without_end_is_error() {
        let transport =
            ScriptedTransport::new(vec![Script::Events(vec![start("c1"), delta("cut"), closed()])]);
        let mut session = session(transport);

        session.submit("x").await;

        let error = session.error().unwrap();
        assert_eq!(error.code, ErrorCode::InternalError);
        assert!(error.is_retryable);
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_without_terminal_event_is_closed() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![start("c1")])]);
        let mut session = session(transport);

        session.submit("x").await;

        assert_eq!(session.phase(), PhaseKind::Idle);
        assert!(session.error().is_some());
    }

    #[tokio::test]
    async fn test_transport_refusal_becomes_error() {
        let transport = ScriptedTransport::new(vec![Script::Refuse]);
        let mut session = session(transport);

        session.submit("x").await;

        let error = session.error().unwrap();
        assert_eq!(error.code, ErrorCode::InternalError);
        assert!(error.message.contains("connection refused"));
        assert_eq!(session.phase(), PhaseKind::Idle);
        assert!(!session.handle().is_running());
    }

    #[tokio::test]
    async fn test_dropped_frames_are_counted() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            start("c1"),
            delta("a"),
            TransportEvent::FrameDropped {
                reason: "EOF while parsing".into(),
            },
            delta("b"),
            end(),
        ])]);
        let mut session = session(transport);

        session.submit("x").await;

        assert_eq!(assistant_texts(&session), vec!["ab"]);
        assert_eq!(session.dropped_frames(), 1);
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn test_start_clears_previous_error() {
        let transport = ScriptedTransport::new(vec![
            Script::Events(vec![http_status(503)]),
            Script::Hang(vec![start("c1")]),
        ]);
        let mut session = session(transport);

        session.submit("x").await;
        assert!(session.error().is_some());

        session.send_message("y").await;
        assert!(session.error().is_some());
        session.step().await;
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn test_new_message_supersedes_turn_in_flight() {
        let transport = ScriptedTransport::new(vec![
            Script::Hang(vec![start("c1"), delta("first part")]),
            Script::Events(vec![start("c1"), delta("second reply"), end()]),
        ]);
        let mut session = session(transport.clone());

        session.send_message("one").await;
        session.step().await;
        session.step().await;

        session.send_message("two").await;
        assert!(transport.tokens.lock()[0].is_cancelled());
        assert!(!transport.tokens.lock()[1].is_cancelled());
        session.run_turn().await;

        let contents: Vec<_> = session
            .messages()
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            contents,
            vec![
                (Role::User, "one"),
                (Role::Assistant, "first part"),
                (Role::User, "two"),
                (Role::Assistant, "second reply"),
            ]
        );
        assert!(session.messages().iter().all(|m| !m.is_streaming));
    }

    #[tokio::test]
    async fn test_clear_conversation() {
        let transport = ScriptedTransport::new(vec![
            Script::Events(vec![start("c1"), delta("done"), end()]),
            Script::Hang(vec![start("c1"), tool_start("search"), delta("mid")]),
        ]);
        let mut session = session(transport.clone());

        session.submit("first").await;
        session.send_message("second").await;
        for _ in 0..3 {
            session.step().await;
        }

        session.clear_conversation();

        let state = session.state();
        assert_eq!(state, ConversationState::default());
        assert!(transport.tokens.lock()[1].is_cancelled());
        assert!(!session.handle().is_running());
        assert!(!session.step().await);
    }

    #[tokio::test]
    async fn test_retry_last_only_when_retryable() {
        let transport = ScriptedTransport::new(vec![
            Script::Events(vec![http_status(502)]),
            Script::Events(vec![start("c1"), delta("recovered"), end()]),
            Script::Events(vec![http_status(400)]),
        ]);
        let mut session = session(transport.clone());

        session.submit("top teams?").await;
        assert!(session.retry_last().await);
        session.run_turn().await;
        assert_eq!(assistant_texts(&session), vec!["recovered"]);
        assert!(!session.retry_last().await);

        session.submit("bad").await;
        assert_eq!(session.error().unwrap().code, ErrorCode::ValidationError);
        assert!(!session.retry_last().await);

        let requests = transport.requests.lock();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].message, "top teams?");
    }

    #[tokio::test]
    async fn test_session_events_in_order() {
        let transport = ScriptedTransport::new(vec![Script::Events(vec![
            start("c1"),
            tool_start("search"),
            delta("Hi"),
            tool_end("search", true, None),
            end(),
        ])]);
        let mut session = session(transport);
        let mut events = session.subscribe();

        session.submit("hello").await;

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event {
                SessionEvent::TurnRequested { .. } => "requested",
                SessionEvent::TurnStarted { .. } => "started",
                SessionEvent::Delta { .. } => "delta",
                SessionEvent::ToolStarted { .. } => "tool_started",
                SessionEvent::ToolFinished { .. } => "tool_finished",
                SessionEvent::TurnFinalized { .. } => "finalized",
                SessionEvent::TurnFailed { .. } => "failed",
                SessionEvent::TurnCancelled { .. } => "cancelled",
                SessionEvent::Cleared => "cleared",
            });
        }
        assert_eq!(
            kinds,
            vec![
                "requested",
                "started",
                "tool_started",
                "delta",
                "tool_finished",
                "finalized"
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_state_publishes_snapshots() {
        let transport =
            ScriptedTransport::new(vec![Script::Hang(vec![start("c9"), delta("live")])]);
        let mut session = session(transport);
        let mut state = session.watch_state();
        assert!(!state.borrow_and_update().is_busy());

        session.send_message("x").await;
        session.step().await;
        session.step().await;

        assert!(state.has_changed().unwrap());
        let snapshot = state.borrow_and_update().clone();
        assert!(snapshot.is_streaming);
        assert_eq!(snapshot.current_streaming_message, "live");
        assert_eq!(snapshot.conversation_id.as_deref(), Some("c9"));

        session.stop();
        let snapshot = state.borrow_and_update().clone();
        assert_eq!(snapshot.last_message().unwrap().content, "live");
        assert!(!snapshot.is_busy());
    }
}
