use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    agent::command::{Answer, Command},
    error::{StratusError, StratusResult},
    types::HostId,
};

/// Sends commands to host agents.
///
/// `Ok(answer)` means the host executed the command, successfully or not.
/// `AgentUnavailable` and `OperationTimeout` mean the outcome is unknown.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn send(&self, command: Command) -> StratusResult<Answer>;

    /// Whether a live session to `host_id` exists right now.
    fn is_connected(&self, host_id: HostId) -> bool;
}

/// One command waiting for the host's reply
#[derive(Debug)]
pub struct AgentRequest {
    pub command: Command,
    reply: oneshot::Sender<Answer>,
}

impl AgentRequest {
    /// Deliver the answer. Returns `false` if the dispatcher stopped waiting.
    pub fn respond(self, answer: Answer) -> bool {
        self.reply.send(answer).is_ok()
    }
}

/// Host side of a connection: receives the commands addressed to one host.
pub struct AgentSession {
    host_id: HostId,
    receiver: mpsc::Receiver<AgentRequest>,
}

impl AgentSession {
    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub async fn next_request(&mut self) -> Option<AgentRequest> {
        self.receiver.recv().await
    }

    /// Hand every request to `handler` on a background task until the
    /// session is disconnected.
    pub fn serve<H>(mut self, mut handler: H) -> JoinHandle<()>
    where
        H: FnMut(AgentRequest) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(request) = self.receiver.recv().await {
                handler(request);
            }
            debug!("Agent session for host {} closed", self.host_id);
        })
    }
}

/// In-process registry of host sessions, one bounded channel per host.
pub struct AgentManager {
    links: DashMap<HostId, mpsc::Sender<AgentRequest>>,
    channel_depth: usize,
}

impl AgentManager {
    pub fn new(channel_depth: usize) -> Self {
        Self {
            links: DashMap::new(),
            channel_depth: channel_depth.max(1),
        }
    }

    /// Register a host agent. A previous session for the host is replaced.
    pub fn connect(&self, host_id: HostId) -> AgentSession {
        let (sender, receiver) = mpsc::channel(self.channel_depth);
        if self.links.insert(host_id, sender).is_some() {
            info!("Agent for host {} reconnected", host_id);
        } else {
            info!("Agent for host {} connected", host_id);
        }
        AgentSession { host_id, receiver }
    }

    pub fn disconnect(&self, host_id: HostId) {
        if self.links.remove(&host_id).is_some() {
            info!("Agent for host {} disconnected", host_id);
        }
    }

    pub fn connected_hosts(&self) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self.links.iter().map(|entry| *entry.key()).collect();
        hosts.sort();
        hosts
    }
}

#[async_trait]
impl AgentDispatcher for AgentManager {
    async fn send(&self, command: Command) -> StratusResult<Answer> {
        let host_id = command.target_host_id;
        let kind = command.kind.clone();
        let wait = command.wait;

        let sender = self
            .links
            .get(&host_id)
            .map(|link| link.value().clone())
            .ok_or_else(|| StratusError::AgentUnavailable {
                host_id,
                details: format!("no session for {}", kind),
            })?;

        let (reply, answer) = oneshot::channel();
        let request = AgentRequest { command, reply };

        debug!("Dispatching {} to host {} (wait {:?})", kind, host_id, wait);
        let outcome = tokio::time::timeout(wait, async move {
            if sender.send(request).await.is_err() {
                return Err("session closed");
            }
            answer.await.map_err(|_| "agent dropped the request")
        })
        .await;

        match outcome {
            Ok(Ok(answer)) => {
                if answer.succeeded {
                    debug!("{} succeeded on host {}", kind, host_id);
                } else {
                    warn!("{} failed on host {}: {}", kind, host_id, answer.details);
                }
                Ok(answer)
            }
            Ok(Err(details)) => {
                warn!("{} to host {} lost: {}", kind, host_id, details);
                Err(StratusError::AgentUnavailable {
                    host_id,
                    details: details.to_string(),
                })
            }
            Err(_) => {
                warn!("{} to host {} timed out after {:?}", kind, host_id, wait);
                Err(StratusError::OperationTimeout {
                    host_id,
                    operation: kind,
                    wait,
                })
            }
        }
    }

    fn is_connected(&self, host_id: HostId) -> bool {
        self.links
            .get(&host_id)
            .map(|link| !link.is_closed())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use bytes::Bytes;
    use std::time::Duration;

    fn command(host: u64, wait_ms: u64) -> Command {
        Command {
            target_host_id: HostId(host),
            kind: "StopCommand".to_string(),
            payload: Bytes::new(),
            wait: Duration::from_millis(wait_ms),
        }
    }

    #[tokio::test]
    async fn test_unknown_host_is_unavailable() {
        let manager = AgentManager::new(4);
        let err = manager.send(command(5, 100)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentUnavailable);
        assert!(!manager.is_connected(HostId(5)));
    }

    #[tokio::test]
    async fn test_definite_failure_is_an_answer() {
        let manager = AgentManager::new(4);
        let session = manager.connect(HostId(5));
        session.serve(|request| {
            request.respond(Answer::failure("vm not found"));
        });

        let answer = manager.send(command(5, 500)).await.unwrap();
        assert!(!answer.succeeded);
        assert_eq!(answer.details, "vm not found");
    }

    #[tokio::test]
    async fn test_silent_agent_times_out() {
        let manager = AgentManager::new(4);
        let mut session = manager.connect(HostId(6));
        let held = tokio::spawn(async move {
            // Keep the request alive without answering
            let request = session.next_request().await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(request);
        });

        let err = manager.send(command(6, 50)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationTimeout);
        held.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_request_is_unavailable() {
        let manager = AgentManager::new(4);
        let session = manager.connect(HostId(7));
        session.serve(drop);

        let err = manager.send(command(7, 500)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentUnavailable);

        manager.disconnect(HostId(7));
        assert!(manager.connected_hosts().is_empty());
    }
}
