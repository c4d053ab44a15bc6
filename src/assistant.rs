//! Transport-facing service over the agent flow.
//!
//! One `Assistant` owns the session registry: each conversation thread gets
//! its own agent with its own provider instance and RM-scoped capability
//! bindings, plus a turn lock so messages for a thread are processed
//! strictly in the order received. The streaming and non-streaming entry
//! points drive the same state machine; only the delivery differs.

use anyhow::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use crate::agent::{Agent, TurnOutcome};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::providers::base::Provider;
use crate::providers::configs::ProviderConfig;
use crate::providers::factory;
use crate::session::ThreadStore;
use crate::toolkit::Toolkit;

/// Builds a provider instance for a new session
pub type ProviderFactory = Arc<dyn Fn() -> Result<Box<dyn Provider>> + Send + Sync>;

/// Builds the capability set for a new session, scoped to the given RM
pub type ToolkitFactory = Arc<dyn Fn(i64) -> Vec<Box<dyn Toolkit>> + Send + Sync>;

/// Non-streaming turn result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResponse {
    pub message: String,
    pub interrupted: bool,
}

/// One element of the streaming turn result; the final element has
/// `done = true` and carries the interrupt question when suspended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    pub interrupted: bool,
}

struct Session {
    agent: Agent,
    turn_lock: Mutex<()>,
}

pub struct Assistant {
    providers: ProviderFactory,
    toolkits: ToolkitFactory,
    store: Arc<dyn ThreadStore>,
    sessions: DashMap<String, Arc<Session>>,
}

impl Assistant {
    pub fn new(
        providers: ProviderFactory,
        toolkits: ToolkitFactory,
        store: Arc<dyn ThreadStore>,
    ) -> Self {
        Self {
            providers,
            toolkits,
            store,
            sessions: DashMap::new(),
        }
    }

    /// Convenience constructor using the provider factory over a config
    pub fn from_config(
        config: ProviderConfig,
        toolkits: ToolkitFactory,
        store: Arc<dyn ThreadStore>,
    ) -> Self {
        let providers: ProviderFactory = Arc::new(move || factory::get_provider(config.clone()));
        Self::new(providers, toolkits, store)
    }

    /// The canonical one-thread-per-RM mapping
    pub fn thread_for_rm(rm_id: i64) -> String {
        format!("rm_{}", rm_id)
    }

    fn session(&self, thread_id: &str, rm_id: i64) -> Result<Arc<Session>> {
        if let Some(existing) = self.sessions.get(thread_id) {
            return Ok(existing.clone());
        }
        let provider = (self.providers)()?;
        let mut agent = Agent::new(provider, rm_id);
        for toolkit in (self.toolkits)(rm_id) {
            agent.add_toolkit(toolkit)?;
        }
        let session = Arc::new(Session {
            agent,
            turn_lock: Mutex::new(()),
        });
        Ok(self
            .sessions
            .entry(thread_id.to_string())
            .or_insert(session)
            .clone())
    }

    /// Process one inbound message and return the full response. While a
    /// confirmation is pending for the thread, the message is interpreted as
    /// the answer to it.
    pub async fn submit_turn(
        &self,
        thread_id: &str,
        rm_id: i64,
        user_text: &str,
    ) -> Result<TurnResponse> {
        let session = self.session(thread_id, rm_id)?;
        let _turn = session.turn_lock.lock().await;

        let mut state = self.store.get(thread_id).await?.unwrap_or_default();
        let outcome = session.agent.reply(&mut state, user_text, None).await?;
        self.store.put(thread_id, &state).await?;

        Ok(match outcome {
            TurnOutcome::Completed { message } => TurnResponse {
                message,
                interrupted: false,
            },
            TurnOutcome::Interrupted { question } => TurnResponse {
                message: question,
                interrupted: true,
            },
        })
    }

    /// Streaming variant of `submit_turn`: assistant messages are emitted as
    /// they are produced and turn-level failures become a final error chunk
    /// instead of an error.
    pub fn submit_turn_stream(
        &self,
        thread_id: &str,
        rm_id: i64,
        user_text: &str,
    ) -> ReceiverStream<StreamChunk> {
        let (tx, rx) = mpsc::channel(100);

        let session = match self.session(thread_id, rm_id) {
            Ok(session) => session,
            Err(e) => {
                let _ = tx.try_send(StreamChunk {
                    content: format!("Error: {}", e),
                    done: true,
                    interrupted: false,
                });
                return ReceiverStream::new(rx);
            }
        };

        let store = self.store.clone();
        let thread_id = thread_id.to_string();
        let user_text = user_text.to_string();

        tokio::spawn(async move {
            let _turn = session.turn_lock.lock().await;

            let (message_tx, mut message_rx) = mpsc::channel::<Message>(100);
            let chunk_tx = tx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(message) = message_rx.recv().await {
                    if message.role != Role::Assistant {
                        continue;
                    }
                    let content = message.text();
                    if content.is_empty() {
                        continue;
                    }
                    let _ = chunk_tx
                        .send(StreamChunk {
                            content,
                            done: false,
                            interrupted: false,
                        })
                        .await;
                }
            });

            let result = {
                let turn = async {
                    let mut state = store.get(&thread_id).await?.unwrap_or_default();
                    let outcome = session
                        .agent
                        .reply(&mut state, &user_text, Some(&message_tx))
                        .await?;
                    store.put(&thread_id, &state).await?;
                    Ok::<TurnOutcome, anyhow::Error>(outcome)
                };
                turn.await
            };

            // Close the sink so the forwarder drains before the final chunk
            drop(message_tx);
            let _ = forwarder.await;

            let final_chunk = match result {
                Ok(TurnOutcome::Completed { .. }) => StreamChunk {
                    content: String::new(),
                    done: true,
                    interrupted: false,
                },
                Ok(TurnOutcome::Interrupted { question }) => StreamChunk {
                    content: question,
                    done: true,
                    interrupted: true,
                },
                Err(e) => {
                    error!("streamed turn failed: {}", e);
                    StreamChunk {
                        content: format!("Error: {}", e),
                        done: true,
                        interrupted: false,
                    }
                }
            };
            let _ = tx.send(final_chunk).await;
        });

        ReceiverStream::new(rx)
    }

    /// Inspect the pending interrupt question for a thread without mutating
    pub async fn peek_interrupt(&self, thread_id: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get(thread_id)
            .await?
            .and_then(|state| state.pending_interrupt)
            .map(|pending| pending.question))
    }

    /// Discard a thread's persisted conversation and live session
    pub async fn clear(&self, thread_id: &str) -> Result<()> {
        self.sessions.remove(thread_id);
        self.store.delete(thread_id).await
    }
}
