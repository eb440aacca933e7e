//! Client role: the shadow table.
//!
//! A [`MirrorManager`] holds read-only copies of the objects the server
//! announces. Inbound messages are queued by the connection tasks and
//! applied only when the caller asks, either one at a time
//! ([`MirrorManager::process_single`]) or in bulk from
//! [`MirrorManager::tick`].

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tessera_config::NetworkConfig;
use tessera_net::{
    ClientConfig, ConnectError, ConnectionId, DisconnectReason, FieldUpdate, FrameConfig, Message,
    NetClient, NetEvent, ObjectId, Owner, SpawnRecord,
};

use crate::behaviour::NetworkBehaviour;
use crate::error::{ProtocolViolation, RequestError};
use crate::manager::NetworkManager;
use crate::object::{ObjectTable, ReplicatedObject, Side};
use crate::request::{RequestHandle, RequestPayload};
use crate::template::TemplateRegistry;

/// Application callbacks for the client side.
pub trait ClientListener: Send {
    fn on_connected(&mut self, connection: ConnectionId) {
        let _ = connection;
    }

    fn on_connect_failed(&mut self, error: &ConnectError) {
        let _ = error;
    }

    /// Called once, after every shadow has been dropped.
    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        let _ = reason;
    }

    fn on_object_spawned(&mut self, id: ObjectId) {
        let _ = id;
    }

    /// The shadow is already gone when this runs.
    fn on_object_destroyed(&mut self, id: ObjectId) {
        let _ = id;
    }
}

impl ClientListener for () {}

fn client_config(config: &NetworkConfig) -> ClientConfig {
    ClientConfig {
        server_addr: config.endpoint(),
        connect_timeout: config.connect_timeout(),
        frame: FrameConfig {
            max_frame_size: config.max_frame_size,
        },
        inbound_queue_capacity: config.inbound_queue_capacity,
    }
}

pub struct MirrorManager {
    templates: TemplateRegistry,
    objects: ObjectTable,
    /// Spawns whose template is not registered here. Their diffs are ignored.
    refused: HashSet<ObjectId>,
    client: NetClient,
    connection_id: ConnectionId,
    connected: bool,
    pending: VecDeque<NetEvent>,
    automatic: bool,
    listener: Box<dyn ClientListener>,
}

impl MirrorManager {
    /// Connect to the configured server.
    ///
    /// On failure the listener hears about it before the error is returned.
    pub async fn connect(
        config: &NetworkConfig,
        templates: TemplateRegistry,
        mut listener: impl ClientListener + 'static,
    ) -> Result<Self, ConnectError> {
        match NetClient::connect(&client_config(config)).await {
            Ok(client) => Ok(Self::from_client(client, templates, listener)),
            Err(e) => {
                tracing::warn!(server = %config.endpoint(), error = %e, "connect failed");
                listener.on_connect_failed(&e);
                Err(e)
            }
        }
    }

    /// Wrap a client whose handshake already completed.
    pub fn from_client(
        client: NetClient,
        templates: TemplateRegistry,
        listener: impl ClientListener + 'static,
    ) -> Self {
        let connection_id = client.connection_id();
        let mut listener: Box<dyn ClientListener> = Box::new(listener);
        listener.on_connected(connection_id);
        Self {
            templates,
            objects: ObjectTable::default(),
            refused: HashSet::new(),
            client,
            connection_id,
            connected: true,
            pending: VecDeque::new(),
            automatic: true,
            listener,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Non-field state of a shadow's behaviour. Synchronized fields stay
    /// read-only through this reference.
    pub fn behaviour_mut<B: NetworkBehaviour>(&mut self, id: ObjectId) -> Option<&mut B> {
        self.objects.get_mut(id)?.behaviour_mut::<B>()
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    /// Whether [`MirrorManager::tick`] applies queued messages. On by default.
    pub fn set_process_automatically(&mut self, automatic: bool) {
        self.automatic = automatic;
    }

    pub fn processes_automatically(&self) -> bool {
        self.automatic
    }

    fn pump(&mut self) {
        if !self.connected {
            return;
        }
        while let Some(event) = self.client.try_next_event() {
            self.pending.push_back(event);
        }
    }

    /// Whether at least one inbound message is waiting.
    pub fn has_pending(&mut self) -> bool {
        self.pump();
        !self.pending.is_empty()
    }

    /// Apply exactly one queued message. `false` if none was waiting.
    pub fn process_single(&mut self) -> bool {
        self.pump();
        match self.pending.pop_front() {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Apply everything queued so far. Returns how many messages were applied.
    pub fn process_all(&mut self) -> usize {
        self.pump();
        let queued = self.pending.len();
        let mut handled = 0;
        while handled < queued && self.process_single() {
            handled += 1;
        }
        handled
    }

    /// Per-frame entry point: applies every queued message in automatic mode,
    /// nothing otherwise.
    pub fn tick(&mut self) -> usize {
        if self.automatic { self.process_all() } else { 0 }
    }

    /// Wait up to `timeout` until a message is queued. Applies nothing.
    pub async fn wait_for_message(&mut self, timeout: Duration) -> bool {
        if self.has_pending() {
            return true;
        }
        if !self.connected {
            return false;
        }
        match tokio::time::timeout(timeout, self.client.next_event()).await {
            Ok(Some(event)) => {
                self.pending.push_back(event);
                true
            }
            _ => false,
        }
    }

    fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Message(_, message) => {
                if let Err(violation) = self.apply(message) {
                    tracing::warn!(connection = ?self.connection_id, %violation, "protocol violation from server");
                    self.client.disconnect();
                    self.teardown(DisconnectReason::Protocol(violation.0));
                }
            }
            NetEvent::Disconnected(_, reason) => self.teardown(reason),
            NetEvent::Connected(_) => {}
        }
    }

    fn apply(&mut self, message: Message) -> Result<(), ProtocolViolation> {
        match message {
            Message::FullSnapshot(records) => {
                tracing::debug!(objects = records.len(), "applying full snapshot");
                records
                    .into_iter()
                    .try_for_each(|record| self.apply_spawn(record))
            }
            Message::Spawn(record) => self.apply_spawn(record),
            Message::Destroy(id) => {
                self.apply_destroy(id);
                Ok(())
            }
            Message::FieldUpdate(updates) => updates
                .iter()
                .try_for_each(|update| self.apply_update(update)),
            other => Err(ProtocolViolation(format!(
                "{:?} is not a server message",
                other.tag()
            ))),
        }
    }

    fn apply_spawn(&mut self, record: SpawnRecord) -> Result<(), ProtocolViolation> {
        let SpawnRecord {
            object_id,
            template,
            owner,
            fields,
        } = record;
        let behaviours = match self.templates.instantiate(&template) {
            Ok(behaviours) => behaviours,
            Err(e) => {
                tracing::warn!(object = ?object_id, %template, error = %e, "spawn refused");
                self.refused.insert(object_id);
                return Ok(());
            }
        };
        let mut object =
            ReplicatedObject::instantiate(object_id, &template, owner, Side::Mirror, behaviours)
                .map_err(|e| ProtocolViolation(e.to_string()))?;
        object.apply_snapshot(&fields)?;

        self.refused.remove(&object_id);
        if let Some(mut previous) = self.objects.insert(object) {
            tracing::debug!(object = ?object_id, "duplicate spawn replaced shadow");
            previous.teardown();
        }
        tracing::debug!(object = ?object_id, %template, %owner, "shadow spawned");
        self.listener.on_object_spawned(object_id);
        Ok(())
    }

    fn apply_destroy(&mut self, id: ObjectId) {
        if self.refused.remove(&id) {
            return;
        }
        match self.objects.remove(id) {
            Some(mut object) => {
                object.teardown();
                tracing::debug!(object = ?id, "shadow destroyed");
                self.listener.on_object_destroyed(id);
            }
            None => tracing::debug!(object = ?id, "destroy for unknown object ignored"),
        }
    }

    fn apply_update(&mut self, update: &FieldUpdate) -> Result<(), ProtocolViolation> {
        if self.refused.contains(&update.object_id) {
            return Ok(());
        }
        let Some(object) = self.objects.get_mut(update.object_id) else {
            return Err(ProtocolViolation(format!(
                "field update for unknown object {:?}",
                update.object_id
            )));
        };
        object.apply_field(update.field_id, &update.value)
    }

    // -----------------------------------------------------------------------
    // Disconnect
    // -----------------------------------------------------------------------

    /// Close the connection and drop every shadow. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if self.connected {
            self.client.disconnect();
            self.teardown(DisconnectReason::Local);
        }
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.pending.clear();
        self.refused.clear();
        for mut object in self.objects.drain() {
            object.teardown();
            self.listener.on_object_destroyed(object.id());
        }
        tracing::info!(connection = ?self.connection_id, %reason, "mirror disconnected");
        self.listener.on_disconnected(&reason);
    }
}

impl NetworkManager for MirrorManager {
    fn local_owner(&self) -> Owner {
        Owner::Client(self.connection_id)
    }

    fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Serializes the filled payload into a `CLIENT_REQUEST`. The handler
    /// runs on the server; its effects come back as field updates.
    fn invoke_with<P, F>(&mut self, handle: RequestHandle<P>, fill: F) -> Result<(), RequestError>
    where
        P: RequestPayload,
        F: FnOnce(&mut P),
    {
        if !self.connected {
            return Err(RequestError::NotConnected);
        }
        let object_id = handle.object_id();
        let request_id = handle.request_id();
        let mine = self.local_owner();
        let object = self
            .objects
            .get_mut(object_id)
            .ok_or(RequestError::UnknownObject(object_id))?;
        let owner = object.owner();
        if owner != mine {
            tracing::warn!(object = ?object_id, %owner, "authority violation: request on an object this client does not own");
            return Err(RequestError::NotOwner {
                object: object_id,
                owner,
            });
        }
        object.prepare_request(request_id, fill)?;
        let payload = object.encode_request(request_id)?;

        let message = Message::ClientRequest {
            object_id,
            request_id,
            payload,
        };
        if let Err(e) = self.client.send(message) {
            self.teardown(DisconnectReason::Transport(e.to_string()));
            return Err(e.into());
        }
        tracing::trace!(object = ?object_id, request = ?request_id, "request sent");
        Ok(())
    }
}

impl Drop for MirrorManager {
    fn drop(&mut self) {
        self.client.disconnect();
    }
}

#[cfg(test)]
#[path = "mirror_tests.rs"]
mod tests;
