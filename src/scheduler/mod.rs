//! The agent loop scheduler.
//!
//! Pulls inbound messages off the bus one at a time, routes each to an
//! agent, and drives the bounded LLM-and-tool iteration loop: build context,
//! call the model (through the fallback chain when configured), execute tool
//! calls, append results, repeat. Summarization runs in the background after
//! a turn; emergency compression runs inline when a provider rejects the
//! context.

pub mod compact;

use anyhow::Result;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::history::estimate_history_tokens;
use crate::agent::tools::{AsyncCallback, ProgressCallback, ToolContext};
use crate::agent::{AgentInstance, AgentRegistry, SessionStore};
use crate::bus::{is_internal_channel, InboundMessage, MessageBus, OutboundMessage};
use crate::config::SchedulerConfig;
use crate::heartbeat::is_heartbeat_ok;
use crate::protocol::{Message, Role, ToolCall};
use crate::state::StateManager;

pub const CLEAR_CONFIRMATION: &str = "✨ Session cleared. Starting fresh.";

const COMPRESSION_NOTICE: &str = "Context is full; compressing history and retrying…";

/// Emergency-compression retries per loop invocation.
const CONTEXT_RETRY_LIMIT: usize = 2;

/// Minimum spacing between progress notices, per tool call.
const PROGRESS_DEBOUNCE: Duration = Duration::from_secs(2);

pub struct Scheduler {
    bus: Arc<dyn MessageBus>,
    agents: Arc<AgentRegistry>,
    sessions: Arc<SessionStore>,
    state: Arc<StateManager>,
    config: SchedulerConfig,
    /// Coalesces concurrent summarization triggers, keyed agent+session.
    summarizing: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        agents: Arc<AgentRegistry>,
        sessions: Arc<SessionStore>,
        state: Arc<StateManager>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            agents,
            sessions,
            state,
            config,
            summarizing: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        }
    }

    /// Serial inbound loop; returns when cancelled or the bus closes.
    pub async fn run(&self) {
        info!("Scheduler started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Scheduler stopping");
                    break;
                }
                inbound = self.bus.consume_inbound() => {
                    let Some(msg) = inbound else { break };
                    if let Err(e) = self.handle_inbound(msg).await {
                        warn!("Failed to process inbound message: {:#}", e);
                    }
                }
            }
        }
    }

    pub async fn handle_inbound(&self, msg: InboundMessage) -> Result<()> {
        if msg.channel == "system" {
            return self.handle_system_completion(msg).await;
        }

        let (agent, route) = self.agents.resolve(&msg);
        debug!(
            "Routed {}:{} to agent '{}' via {} (session {})",
            msg.channel, msg.chat_id, route.agent_id, route.matched_by, route.session_key
        );

        if !is_internal_channel(&msg.channel) {
            if let Err(e) = self.state.record_last_route(&msg.channel, &msg.chat_id) {
                warn!("Failed to record last route: {:#}", e);
            }
        }

        let content = msg.content.trim();
        if content.eq_ignore_ascii_case("/clear") {
            self.sessions.clear(&route.session_key);
            self.sessions.save_or_log(&route.session_key);
            info!("Cleared session {}", route.session_key);
            return self
                .bus
                .publish_outbound(OutboundMessage::new(
                    &msg.channel,
                    &msg.chat_id,
                    CLEAR_CONFIRMATION,
                ))
                .await;
        }

        if msg.channel == "heartbeat" {
            return self.handle_heartbeat(&agent, &route.session_key, content).await;
        }

        self.run_agent_loop(
            &agent,
            &route.session_key,
            &msg.channel,
            &msg.chat_id,
            content,
            true,
        )
        .await?;
        Ok(())
    }

    /// Sub-agent completions arrive as `channel="system"` with the origin
    /// encoded in `chat_id`. Internal origins are dropped; external origins
    /// get a fresh loop over the origin session and the result forwarded.
    async fn handle_system_completion(&self, msg: InboundMessage) -> Result<()> {
        let Some((origin_channel, origin_chat)) = msg.chat_id.split_once(':') else {
            warn!("System completion with malformed chat_id '{}'", msg.chat_id);
            return Ok(());
        };

        let content = msg
            .content
            .strip_prefix("Result:\n")
            .unwrap_or(&msg.content);

        if is_internal_channel(origin_channel) {
            info!(
                "Dropping sub-agent completion for internal origin {}:{}",
                origin_channel, origin_chat
            );
            return Ok(());
        }

        let synthetic = format!("[System: {}] {}", msg.sender_id, content);
        let mut routed = InboundMessage::new(origin_channel, &msg.sender_id, origin_chat, &synthetic);
        // Bind the loop to the origin conversation, not the completing tool.
        routed
            .metadata
            .insert("peer_kind".to_string(), "direct".to_string());
        routed
            .metadata
            .insert("peer_id".to_string(), origin_chat.to_string());

        let (agent, route) = self.agents.resolve(&routed);
        if let Err(e) = self.state.record_last_route(origin_channel, origin_chat) {
            warn!("Failed to record last route: {:#}", e);
        }

        self.run_agent_loop(
            &agent,
            &route.session_key,
            origin_channel,
            origin_chat,
            &synthetic,
            true,
        )
        .await?;
        Ok(())
    }

    /// Heartbeat turns run against the agent's main session and deliver to
    /// the last active conversation only when something needs attention.
    async fn handle_heartbeat(
        &self,
        agent: &Arc<AgentInstance>,
        session_key: &str,
        prompt: &str,
    ) -> Result<()> {
        let reply = self
            .run_agent_loop(agent, session_key, "heartbeat", "heartbeat", prompt, false)
            .await?;

        if is_heartbeat_ok(&reply) {
            debug!("Heartbeat: nothing needs attention");
            return Ok(());
        }
        match self.state.last_route() {
            Some((channel, chat_id)) => {
                self.bus
                    .publish_outbound(OutboundMessage::new(&channel, &chat_id, &reply))
                    .await
            }
            None => {
                info!("Heartbeat produced output but no conversation to deliver it to");
                Ok(())
            }
        }
    }

    /// The iteration loop: at most `max_iterations` provider calls, tool
    /// dispatch in call order, context-exhaustion retries via emergency
    /// compression. Returns the final assistant content.
    pub async fn run_agent_loop(
        &self,
        agent: &Arc<AgentInstance>,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        user_message: &str,
        send_response: bool,
    ) -> Result<String> {
        let internal = is_internal_channel(channel);
        let tool_defs = agent.tools.to_provider_definitions();

        // The user turn enters the session together with the first
        // response; until then it rides along as the pending input.
        let mut pending_user: Option<String> = if user_message.is_empty() {
            None
        } else {
            Some(user_message.to_string())
        };

        let mut compression_retries = 0;
        let mut iteration = 0;
        let mut final_content: Option<String> = None;

        while iteration < agent.max_iterations {
            if self.cancel.is_cancelled() {
                anyhow::bail!("Cancelled before provider call");
            }

            let history = self.sessions.get_history(session_key);
            let summary = self.sessions.get_summary(session_key);
            let messages = agent.context.build_messages(
                &history,
                &summary,
                pending_user.as_deref().unwrap_or(""),
                channel,
                chat_id,
            );

            let response = match agent.chat(&messages, &tool_defs).await {
                Ok((response, _attempts)) => response,
                Err(e) => {
                    let text = format!("{:#}", e);
                    if compact::is_context_window_error(&text)
                        && compression_retries < CONTEXT_RETRY_LIMIT
                    {
                        compression_retries += 1;
                        warn!(
                            "Context exhausted for {} (retry {}/{}): compressing",
                            session_key, compression_retries, CONTEXT_RETRY_LIMIT
                        );
                        if compression_retries == 1 && !internal {
                            let _ = self
                                .bus
                                .publish_outbound(OutboundMessage::status_update(
                                    channel,
                                    chat_id,
                                    COMPRESSION_NOTICE,
                                ))
                                .await;
                        }
                        let compressed = compact::emergency_compress(&history);
                        self.sessions.set_history(session_key, compressed);
                        self.sessions.save_or_log(session_key);
                        continue;
                    }
                    return Err(e);
                }
            };
            iteration += 1;

            if !response.has_tool_calls() {
                if let Some(user) = pending_user.take() {
                    self.sessions.append(session_key, Message::user(user));
                }
                final_content = Some(response.content);
                break;
            }

            let mut calls = response.tool_calls;
            for call in &mut calls {
                call.normalize();
            }

            if let Some(user) = pending_user.take() {
                self.sessions.append(session_key, Message::user(user));
            }
            self.sessions
                .append_with_tool_calls(session_key, &response.content, calls.clone());

            if !internal {
                let _ = self
                    .bus
                    .publish_outbound(OutboundMessage::status_update(
                        channel,
                        chat_id,
                        &describe_tool_calls(&calls),
                    ))
                    .await;
            }

            for call in &calls {
                let ctx = ToolContext {
                    channel: channel.to_string(),
                    chat_id: chat_id.to_string(),
                    session_key: session_key.to_string(),
                };
                let progress_cb = if internal {
                    None
                } else {
                    Some(self.progress_callback(channel, chat_id))
                };

                let result = agent
                    .tools
                    .execute_with_context(
                        &call.name,
                        &call.arguments,
                        &ctx,
                        Some(self.completion_callback(&call.name, channel, chat_id)),
                        progress_cb,
                    )
                    .await;

                if send_response && !result.silent && !result.for_user.is_empty() {
                    self.bus
                        .publish_outbound(OutboundMessage::new(channel, chat_id, &result.for_user))
                        .await?;
                }

                let for_llm = if result.for_llm.is_empty() {
                    result.err.clone().unwrap_or_default()
                } else {
                    result.for_llm.clone()
                };
                self.sessions
                    .append(session_key, Message::tool(&call.id, for_llm));
            }
        }

        let final_content = match final_content {
            Some(content) if !content.is_empty() => content,
            Some(_) => self.config.default_reply.clone(),
            // Iteration bound reached: behave as if the last response had no
            // tool calls.
            None => {
                let history = self.sessions.get_history(session_key);
                history
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::Assistant && !m.content.is_empty())
                    .map(|m| m.content.clone())
                    .unwrap_or_else(|| self.config.default_reply.clone())
            }
        };

        if let Some(user) = pending_user.take() {
            self.sessions.append(session_key, Message::user(user));
        }
        self.sessions
            .append(session_key, Message::assistant(&final_content));
        self.sessions.save_or_log(session_key);

        self.maybe_summarize(agent, session_key);

        if send_response {
            self.bus
                .publish_outbound(OutboundMessage::new(channel, chat_id, &final_content))
                .await?;
        }
        Ok(final_content)
    }

    /// Kick off background summarization when the estimated history tokens
    /// cross the threshold, coalescing concurrent triggers per session.
    fn maybe_summarize(&self, agent: &Arc<AgentInstance>, session_key: &str) {
        if !self.config.summarization {
            return;
        }
        let history = self.sessions.get_history(session_key);
        if history.len() <= compact::KEEP_LAST {
            return;
        }
        let estimated = estimate_history_tokens(&history);
        let threshold = compact::summary_threshold(agent.context_window);
        if estimated <= threshold {
            return;
        }

        let flight_key = format!("{}{}", agent.id, session_key);
        {
            let mut in_flight = self.summarizing.lock().expect("summarize lock poisoned");
            if !in_flight.insert(flight_key.clone()) {
                debug!("Summarization already in flight for {}", session_key);
                return;
            }
        }
        info!(
            "History for {} at ~{} tokens (threshold {}); summarizing",
            session_key, estimated, threshold
        );

        let agent = Arc::clone(agent);
        let sessions = Arc::clone(&self.sessions);
        let summarizing = Arc::clone(&self.summarizing);
        let key = session_key.to_string();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(
                compact::SUMMARY_TIMEOUT,
                compact::summarize_session(&agent, &sessions, &key),
            )
            .await;
            match outcome {
                Err(_) => warn!("Summarization for {} timed out", key),
                Ok(Err(e)) => warn!("Summarization for {} failed: {:#}", key, e),
                Ok(Ok(())) => debug!("Summarization for {} complete", key),
            }
            summarizing
                .lock()
                .expect("summarize lock poisoned")
                .remove(&flight_key);
        });
    }

    /// Completion callback for async tools: the result re-enters the bus as
    /// a system-channel inbound message, so it is serialized with everything
    /// else.
    fn completion_callback(&self, tool_name: &str, channel: &str, chat_id: &str) -> AsyncCallback {
        let bus = Arc::clone(&self.bus);
        let tool_name = tool_name.to_string();
        let origin = format!("{}:{}", channel, chat_id);
        Arc::new(move |result| {
            let bus = Arc::clone(&bus);
            let msg = InboundMessage::new("system", &tool_name, &origin, &result.for_llm);
            tokio::spawn(async move {
                if let Err(e) = bus.publish_inbound(msg).await {
                    warn!("Failed to publish async tool completion: {:#}", e);
                }
            });
        })
    }

    /// Progress callback for one tool call, debounced to one notice per two
    /// seconds.
    fn progress_callback(&self, channel: &str, chat_id: &str) -> ProgressCallback {
        let bus = Arc::clone(&self.bus);
        let channel = channel.to_string();
        let chat_id = chat_id.to_string();
        let last_sent: Mutex<Option<Instant>> = Mutex::new(None);
        Arc::new(move |text| {
            {
                let mut last = last_sent.lock().expect("progress lock poisoned");
                if last.map(|t| t.elapsed() < PROGRESS_DEBOUNCE).unwrap_or(false) {
                    return;
                }
                *last = Some(Instant::now());
            }
            let bus = Arc::clone(&bus);
            let msg = OutboundMessage::status_update(&channel, &chat_id, &text);
            tokio::spawn(async move {
                let _ = bus.publish_outbound(msg).await;
            });
        })
    }
}

/// `⚙️ running: tool(arg)` notice summarizing a batch of tool calls.
fn describe_tool_calls(calls: &[ToolCall]) -> String {
    let parts: Vec<String> = calls
        .iter()
        .map(|call| match call.arguments.values().find_map(Value::as_str) {
            Some(arg) => {
                let preview: String = arg.chars().take(40).collect();
                let ellipsis = if arg.chars().count() > 40 { "…" } else { "" };
                format!("{}({}{})", call.name, preview, ellipsis)
            }
            None => format!("{}(…)", call.name),
        })
        .collect();
    format!("⚙️ running: {}", parts.join(", "))
}
