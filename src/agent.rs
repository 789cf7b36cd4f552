//! The per-participant agent driver: a task holding one running LLM
//! conversation, batching live transcripts into user turns, reacting to the
//! trigger and to bus traffic, and dispatching tool calls.

pub mod prompt;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::AgentMessage;
use crate::domain::ids::UserId;
use crate::domain::transcript::TranscriptEntry;
use crate::domain::trigger::TriggerEvent;
use crate::llm::{ChatMessage, ChatRequest, ContentBlock, LlmProvider, StopReason, ToolDefinition};
use crate::panel::ServerPanelMessage;
use prompt::AgentRole;
use tools::ToolContext;

/// Bound on tool-call loops within one turn. Exceeding it aborts the turn
/// and surfaces an error panel message.
pub const MAX_RECURSION_DEPTH: usize = 20;
/// Quiet period after which pending transcripts flush into one user turn.
pub const BATCH_FLUSH: Duration = Duration::from_secs(2);
const MAX_COMPLETION_TOKENS: u32 = 4_096;

/// Commands from the room supervisor to one agent task.
#[derive(Debug)]
pub enum AgentCommand {
    /// A final transcript entry to batch.
    Transcript(TranscriptEntry),
    /// The trigger fired; the pending batch is discarded and the handoff
    /// message (with the full conversation so far) injected.
    Trigger {
        event: TriggerEvent,
        conversation: String,
    },
    Shutdown,
}

/// Handle the room supervisor keeps per member.
pub struct AgentHandle {
    pub user_id: UserId,
    tx: mpsc::UnboundedSender<AgentCommand>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn send(&self, command: AgentCommand) {
        let _ = self.tx.send(command);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(AgentCommand::Shutdown);
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the agent task for one member. `bus_inbox` is this agent's end of
/// the inter-agent bus.
pub fn spawn(
    llm: Arc<dyn LlmProvider>,
    ctx: ToolContext,
    bus_inbox: mpsc::UnboundedReceiver<AgentMessage>,
) -> AgentHandle {
    let user_id = ctx.profile.user_id.clone();
    let role = prompt::derive_role(&ctx.profile);
    let system_prompt =
        prompt::build_system_prompt(&ctx.profile, &ctx.peer_profile.display_name, role);
    info!(user = %user_id, ?role, "agent driver starting");

    let driver = AgentDriver {
        llm,
        ctx,
        role,
        system_prompt,
        conversation: Vec::new(),
        tool_defs: tools::definitions(),
        batch: Vec::new(),
        activated: false,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(driver.run(rx, bus_inbox));
    AgentHandle { user_id, tx, task }
}

struct AgentDriver {
    llm: Arc<dyn LlmProvider>,
    ctx: ToolContext,
    role: AgentRole,
    system_prompt: String,
    conversation: Vec<ChatMessage>,
    tool_defs: Vec<ToolDefinition>,
    batch: Vec<TranscriptEntry>,
    /// Set on trigger; before that, transcript batches accumulate context
    /// without invoking the model.
    activated: bool,
}

impl AgentDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<AgentCommand>,
        mut bus_inbox: mpsc::UnboundedReceiver<AgentMessage>,
    ) {
        let mut flush_at: Option<Instant> = None;
        let mut bus_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(AgentCommand::Shutdown) => break,
                    Some(AgentCommand::Transcript(entry)) => {
                        self.batch.push(entry);
                        // Every arrival resets the quiet-period timer.
                        flush_at = Some(Instant::now() + BATCH_FLUSH);
                    }
                    Some(AgentCommand::Trigger { event, conversation }) => {
                        self.batch.clear();
                        flush_at = None;
                        self.on_trigger(event, conversation).await;
                    }
                },
                message = bus_inbox.recv(), if bus_open => match message {
                    None => bus_open = false,
                    Some(message) => self.on_bus_message(message).await,
                },
                _ = async { tokio::time::sleep_until(flush_at.expect("guarded")).await },
                    if flush_at.is_some() =>
                {
                    flush_at = None;
                    self.flush_batch().await;
                }
            }
        }
        info!(user = %self.ctx.profile.user_id, "agent driver stopped");
    }

    /// Fold the pending batch into one user turn. Only an activated agent
    /// spends an LLM call on it.
    async fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let lines = self
            .batch
            .drain(..)
            .map(|entry| format!("{}: {}", entry.speaker, entry.text))
            .collect::<Vec<_>>()
            .join("\n");
        self.conversation
            .push(ChatMessage::user_text(format!("Live transcript:\n{lines}")));

        if self.activated {
            self.run_turn().await;
        }
    }

    async fn on_trigger(&mut self, event: TriggerEvent, conversation: String) {
        self.activated = true;
        let handoff = prompt::trigger_handoff(&event, &conversation, self.role);
        self.conversation.push(ChatMessage::user_text(handoff));

        // The proposer acts now; the responder waits for the bus.
        if self.role == AgentRole::Proposer {
            self.run_turn().await;
        }
    }

    async fn on_bus_message(&mut self, message: AgentMessage) {
        let payload = serde_json::to_string(&message).unwrap_or_default();
        match &message {
            AgentMessage::AgentProposal { .. } | AgentMessage::AgentCounter { .. } => {
                self.activated = true;
                self.conversation.push(ChatMessage::user_text(format!(
                    "Message from the counterparty's agent:\n{payload}\n\nEvaluate it and answer \
                     with evaluate_proposal."
                )));
                self.run_turn().await;
            }
            AgentMessage::AgentAccept { .. } | AgentMessage::AgentReject { .. } => {
                // Terminal news; context only, no model turn. The room
                // broadcasts the outcome to both panels.
                self.conversation.push(ChatMessage::user_text(format!(
                    "Message from the counterparty's agent:\n{payload}"
                )));
            }
        }
    }

    /// One model turn: complete, dispatch tool calls, repeat until
    /// `end_turn` or the depth bound.
    async fn run_turn(&mut self) {
        for depth in 0..MAX_RECURSION_DEPTH {
            let request = ChatRequest {
                system: self.system_prompt.clone(),
                messages: self.conversation.clone(),
                tools: self.tool_defs.clone(),
                max_tokens: MAX_COMPLETION_TOKENS,
            };

            let response = match self.llm.complete(request).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(user = %self.ctx.profile.user_id, %err, "LLM call failed; turn abandoned");
                    self.ctx.panels.send(
                        &self.ctx.profile.user_id,
                        ServerPanelMessage::Error {
                            message: "Your agent hit a model error and paused; it will pick up \
                                      on the next update."
                                .to_string(),
                        },
                    );
                    return;
                }
            };

            self.conversation
                .push(ChatMessage::assistant(response.content.clone()));

            if response.stop_reason != StopReason::ToolUse {
                debug!(user = %self.ctx.profile.user_id, depth, "turn complete");
                return;
            }

            let mut results = Vec::new();
            for (id, name, input) in response.tool_uses() {
                let text = tools::dispatch(&self.ctx, name, input).await;
                let is_error = text.starts_with("Error:");
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id.to_string(),
                    content: text,
                    is_error,
                });
            }
            if results.is_empty() {
                // tool_use stop with no tool blocks; nothing to feed back.
                return;
            }
            self.conversation.push(ChatMessage::tool_results(results));
        }

        warn!(
            user = %self.ctx.profile.user_id,
            "tool loop exceeded depth {MAX_RECURSION_DEPTH}; turn aborted"
        );
        self.ctx.panels.send(
            &self.ctx.profile.user_id,
            ServerPanelMessage::Error {
                message: format!(
                    "Your agent stopped after {MAX_RECURSION_DEPTH} consecutive tool calls."
                ),
            },
        );
    }
}
