use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::RwLock;
use relay_proto::{ClientMetadata, Envelope, MessageKind};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientInfo};
use crate::connection::Connection;
use crate::error::AdmissionError;

pub type MessageHandler =
    Arc<dyn Fn(&Arc<Client>, &Envelope) -> anyhow::Result<()> + Send + Sync>;
pub type RemovalHook = Arc<dyn Fn(&Client) + Send + Sync>;

/// Collects handlers and removal hooks before the registry is shared.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<MessageKind, Vec<MessageHandler>>,
    removal_hooks: Vec<RemovalHook>,
}

impl RegistryBuilder {
    /// Every handler registered for `kind` runs, in registration order, for
    /// each inbound message of that kind from any client.
    pub fn on_message_type<F>(mut self, kind: MessageKind, handler: F) -> Self
    where
        F: Fn(&Arc<Client>, &Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.entry(kind).or_default().push(Arc::new(handler));
        self
    }

    pub fn on_client_removed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.removal_hooks.push(Arc::new(hook));
        self
    }

    pub fn build(self) -> ClientRegistry {
        ClientRegistry {
            directory: RwLock::new(Directory::default()),
            handlers: self.handlers,
            removal_hooks: self.removal_hooks,
        }
    }
}

/// Directory of live clients, grouped by shared token, plus the inbound
/// message routing table.
pub struct ClientRegistry {
    directory: RwLock<Directory>,
    handlers: HashMap<MessageKind, Vec<MessageHandler>>,
    removal_hooks: Vec<RemovalHook>,
}

/// `groups[g]` holds exactly the ids whose client has group key `g`.
/// Both maps change together under one write lock.
#[derive(Default)]
struct Directory {
    clients: HashMap<String, Arc<Client>>,
    groups: HashMap<String, HashSet<String>>,
}

impl Directory {
    fn insert(&mut self, client: Arc<Client>) {
        self.groups
            .entry(client.group_key().to_string())
            .or_default()
            .insert(client.id().to_string());
        self.clients.insert(client.id().to_string(), client);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Client>> {
        let client = self.clients.remove(id)?;
        let group_key = client.group_key();
        let emptied = match self.groups.get_mut(group_key) {
            Some(members) => {
                members.remove(id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            self.groups.remove(group_key);
        }
        Some(client)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// How one inbound message is handled.
enum Route<'a> {
    Probe,
    ProbeReply,
    Handlers(&'a [MessageHandler]),
    /// No handler subscribed: relay to the sender's group.
    Unhandled,
}

impl ClientRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Binds `connection` to a new client under `id`. A live client already
    /// holding `id` wins: the incoming connection is closed and refused. A
    /// client that holds `id` but is no longer alive is evicted first.
    pub fn add_client(
        &self,
        connection: Connection,
        id: String,
        group_key: String,
        metadata: ClientMetadata,
    ) -> Result<Arc<Client>, AdmissionError> {
        let (client, displaced) = {
            let mut directory = self.directory.write();
            let existing_alive = directory.clients.get(&id).map(|client| client.is_alive());
            let displaced = match existing_alive {
                Some(true) => {
                    drop(directory);
                    let err = AdmissionError::DuplicateClient(id);
                    connection.close(err.close_code(), "client id already connected");
                    counter!(
                        "beach_relay_admissions_rejected_total",
                        1,
                        "reason" => err.reason()
                    );
                    return Err(err);
                }
                Some(false) => directory.remove(&id),
                None => None,
            };
            let client = Arc::new(Client::new(id, group_key, metadata, connection));
            directory.insert(Arc::clone(&client));
            (client, displaced)
        };

        if let Some(stale) = displaced {
            self.finish_removal(&stale, "replaced");
        }

        info!(
            client_id = %client.id(),
            connection_id = %client.connection().id(),
            world = ?client.metadata().world_title,
            "client registered"
        );
        gauge!("beach_relay_clients_active", self.len() as f64);
        Ok(client)
    }

    /// Removes whatever client holds `id`. Unknown ids are a no-op.
    pub fn remove_client(&self, id: &str) -> bool {
        let removed = self.directory.write().remove(id);
        match removed {
            Some(client) => {
                self.finish_removal(&client, "removed");
                true
            }
            None => false,
        }
    }

    /// Removes `client` only if its id is still bound to this instance, so a
    /// stale connection shutting down never evicts a newer client.
    pub fn release(&self, client: &Arc<Client>) -> bool {
        let removed = {
            let mut directory = self.directory.write();
            match directory.clients.get(client.id()) {
                Some(current) if Arc::ptr_eq(current, client) => directory.remove(client.id()),
                _ => None,
            }
        };
        match removed {
            Some(client) => {
                self.finish_removal(&client, "released");
                true
            }
            None => false,
        }
    }

    fn finish_removal(&self, client: &Client, cause: &'static str) {
        client.mark_disconnected();
        for hook in &self.removal_hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(client))).is_err() {
                error!(client_id = %client.id(), "client removal hook panicked");
            }
        }
        info!(client_id = %client.id(), cause, "client deregistered");
        gauge!("beach_relay_clients_active", self.len() as f64);
    }

    pub fn get_client(&self, id: &str) -> Option<Arc<Client>> {
        self.directory.read().clients.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.directory.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn group_members(&self, group_key: &str) -> Vec<Arc<Client>> {
        let directory = self.directory.read();
        directory
            .groups
            .get(group_key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| directory.clients.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids of the alive clients in `group_key`.
    pub fn get_connected_clients(&self, group_key: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .group_members(group_key)
            .into_iter()
            .filter(|client| client.is_alive())
            .map(|client| client.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn connected_clients(&self, group_key: &str) -> Vec<ClientInfo> {
        let mut infos: Vec<ClientInfo> = self
            .group_members(group_key)
            .into_iter()
            .filter(|client| client.is_alive())
            .map(|client| client.info())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Best-effort delivery of `message` to every other alive member of the
    /// sender's group.
    pub fn broadcast_to_group(&self, sender_id: &str, message: &Envelope) -> BroadcastReport {
        let recipients: Vec<Arc<Client>> = {
            let directory = self.directory.read();
            let Some(sender) = directory.clients.get(sender_id) else {
                return BroadcastReport::default();
            };
            directory
                .groups
                .get(sender.group_key())
                .map(|ids| {
                    ids.iter()
                        .filter(|id| id.as_str() != sender_id)
                        .filter_map(|id| directory.clients.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut report = BroadcastReport::default();
        for recipient in recipients {
            if !recipient.is_alive() {
                report.skipped += 1;
            } else if recipient.send(message) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.delivered > 0 {
            counter!("beach_relay_broadcast_delivered_total", report.delivered as u64);
        }
        if report.failed > 0 {
            counter!("beach_relay_broadcast_failed_total", report.failed as u64);
        }
        report
    }

    /// Routes a message from the client bound to `client_id`.
    pub fn handle_incoming_message(&self, client_id: &str, message: Envelope) {
        match self.get_client(client_id) {
            Some(client) => self.route(&client, message),
            None => debug!(
                client_id,
                message_type = %message.kind,
                "dropping message from unregistered client"
            ),
        }
    }

    pub(crate) fn route(&self, client: &Arc<Client>, message: Envelope) {
        client.touch();
        let kind = message.message_kind();
        match self.plan(&kind) {
            Route::Probe => {
                client.send(&Envelope::probe_reply());
            }
            Route::ProbeReply => {}
            Route::Handlers(handlers) => self.invoke(client, &kind, handlers, &message),
            Route::Unhandled => {
                let report = self.broadcast_to_group(client.id(), &message);
                debug!(
                    client_id = %client.id(),
                    message_type = %message.kind,
                    delivered = report.delivered,
                    failed = report.failed,
                    "relayed unhandled message to group"
                );
            }
        }
    }

    fn plan(&self, kind: &MessageKind) -> Route<'_> {
        match kind {
            MessageKind::Ping => Route::Probe,
            MessageKind::Pong => Route::ProbeReply,
            other => match self.handlers.get(other) {
                Some(handlers) => Route::Handlers(handlers),
                None => Route::Unhandled,
            },
        }
    }

    fn invoke(
        &self,
        client: &Arc<Client>,
        kind: &MessageKind,
        handlers: &[MessageHandler],
        message: &Envelope,
    ) {
        for (index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(client, message))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    client_id = %client.id(),
                    message_type = %message.kind,
                    handler = index,
                    error = %err,
                    "message handler failed"
                ),
                Err(_) => error!(
                    client_id = %client.id(),
                    message_type = %message.kind,
                    handler = index,
                    "message handler panicked"
                ),
            }
        }
        counter!(
            "beach_relay_messages_handled_total",
            1,
            "kind" => kind.label().to_string()
        );
    }

    /// Evicts every client that is no longer alive. Returns how many were removed.
    pub fn cleanup_inactive_clients(&self) -> usize {
        let snapshot: Vec<Arc<Client>> = self.directory.read().clients.values().cloned().collect();
        let mut evicted = 0usize;
        for client in snapshot {
            if !client.is_alive() && self.release(&client) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "evicted inactive clients");
        }
        evicted
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut interval = tokio::time::interval(every);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                registry.cleanup_inactive_clients();
            }
        })
    }

    #[cfg(test)]
    fn group_index(&self) -> HashMap<String, HashSet<String>> {
        self.directory.read().groups.clone()
    }

    #[cfg(test)]
    fn client_groups(&self) -> HashMap<String, HashSet<String>> {
        let mut expected: HashMap<String, HashSet<String>> = HashMap::new();
        for client in self.directory.read().clients.values() {
            expected
                .entry(client.group_key().to_string())
                .or_default()
                .insert(client.id().to_string());
        }
        expected
    }
}
