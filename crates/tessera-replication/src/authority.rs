//! Server role: the canonical object table.
//!
//! The [`AuthorityManager`] is the single source of truth. It spawns and
//! destroys objects, flushes dirty fields once per tick, and runs client
//! requests after checking ownership. Spawns and destroys go out as soon as
//! they happen; field diffs go out in one batch per [`AuthorityManager::flush`].
//!
//! Network tasks only decode and queue. State changes happen on the caller's
//! tick.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tessera_config::{DisconnectPolicy, NetworkConfig};
use tessera_net::{
    Batches, ConnectionId, DisconnectReason, FIELD_UPDATE_OVERHEAD, FULL_SNAPSHOT_OVERHEAD,
    FieldUpdate, FrameBudget, FrameConfig, Message, NetEvent, NetServer, ObjectId, Outbound, Owner,
    RequestId, ServerConfig, SpawnRecord,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::behaviour::NetworkBehaviour;
use crate::error::{RequestError, SpawnError};
use crate::manager::NetworkManager;
use crate::object::{ObjectTable, ReplicatedObject, Side};
use crate::request::{RequestHandle, RequestPayload};
use crate::template::TemplateRegistry;

/// Updates per `FIELD_UPDATE` message. Larger flushes are split, as are
/// batches whose encoded size would exceed the frame limit.
pub const MAX_UPDATES_PER_MESSAGE: usize = 1024;

/// Application callbacks for connection events.
///
/// Callbacks get the manager back so they can spawn or destroy in response.
pub trait ServerListener: Send {
    fn on_client_connected(&mut self, server: &mut AuthorityManager, connection: ConnectionId) {
        let _ = (server, connection);
    }

    /// Called after the disconnect policy has been applied.
    fn on_client_disconnected(
        &mut self,
        server: &mut AuthorityManager,
        connection: ConnectionId,
        reason: &DisconnectReason,
    ) {
        let _ = (server, connection, reason);
    }
}

impl ServerListener for () {}

pub struct AuthorityManager {
    templates: TemplateRegistry,
    objects: ObjectTable,
    next_object_id: u32,
    connections: BTreeMap<ConnectionId, Outbound>,
    events: mpsc::Receiver<NetEvent>,
    server: Arc<NetServer>,
    local_addr: Option<SocketAddr>,
    listener: Option<Box<dyn ServerListener>>,
    policy: DisconnectPolicy,
    budget: FrameBudget,
    scratch: Vec<FieldUpdate>,
}

fn server_config(config: &NetworkConfig, bind_addr: SocketAddr) -> ServerConfig {
    ServerConfig {
        bind_addr,
        max_connections: config.max_connections,
        frame: FrameConfig {
            max_frame_size: config.max_frame_size,
        },
        inbound_queue_capacity: config.inbound_queue_capacity,
    }
}

impl AuthorityManager {
    /// Bind the configured endpoint and start accepting clients.
    pub async fn bind(
        config: &NetworkConfig,
        templates: TemplateRegistry,
        listener: impl ServerListener + 'static,
    ) -> std::io::Result<Self> {
        let socket = TcpListener::bind(config.endpoint()).await?;
        let local_addr = socket.local_addr()?;
        let (server, events) = NetServer::new(server_config(config, local_addr));

        let mut manager = Self::with_server(server, events, templates, config.disconnect_policy);
        manager.local_addr = Some(local_addr);
        manager.set_listener(listener);

        let accept = Arc::clone(&manager.server);
        tokio::spawn(async move {
            if let Err(e) = accept.run_with_listener(socket).await {
                tracing::error!(error = %e, "accept loop failed");
            }
        });
        tracing::info!(addr = %local_addr, policy = ?config.disconnect_policy, "authority listening");
        Ok(manager)
    }

    /// Wrap a server whose streams are supplied by the caller, e.g. through
    /// [`NetServer::accept_stream`].
    pub fn with_server(
        server: NetServer,
        events: mpsc::Receiver<NetEvent>,
        templates: TemplateRegistry,
        policy: DisconnectPolicy,
    ) -> Self {
        let budget = FrameBudget::new(server.config().frame.max_frame_size);
        Self {
            templates,
            objects: ObjectTable::default(),
            next_object_id: 0,
            connections: BTreeMap::new(),
            events,
            server: Arc::new(server),
            local_addr: None,
            listener: None,
            policy,
            budget,
            scratch: Vec::new(),
        }
    }

    pub fn set_listener(&mut self, listener: impl ServerListener + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn net_server(&self) -> &Arc<NetServer> {
        &self.server
    }

    /// Address the accept loop is bound to, if it was started by [`AuthorityManager::bind`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn disconnect_policy(&self) -> DisconnectPolicy {
        self.policy
    }

    pub fn set_disconnect_policy(&mut self, policy: DisconnectPolicy) {
        self.policy = policy;
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
    }

    // -----------------------------------------------------------------------
    // Object lifecycle
    // -----------------------------------------------------------------------

    /// Instantiate `template`, give it a fresh id, and announce it to every
    /// connected client.
    pub fn spawn(&mut self, template: &str, owner: Owner) -> Result<ObjectId, SpawnError> {
        let behaviours = match self.templates.instantiate(template) {
            Ok(behaviours) => behaviours,
            Err(e) => {
                tracing::warn!(template, error = %e, "spawn refused");
                return Err(e);
            }
        };
        let id = ObjectId(self.next_object_id);
        let next = self
            .next_object_id
            .checked_add(1)
            .ok_or(SpawnError::IdsExhausted)?;

        let mut object =
            ReplicatedObject::instantiate(id, template, owner, Side::Authority, behaviours)?;
        let record = object.snapshot()?;
        // Checked against the snapshot overhead, the larger of the two
        // frames a record can travel in.
        let size = record.encoded_len();
        if !self.budget.fits(FULL_SNAPSHOT_OVERHEAD, size) {
            object.teardown();
            let max = self.budget.max_frame_size();
            tracing::error!(template, size, max, "spawn refused: initial state exceeds frame limit");
            return Err(SpawnError::TooLarge {
                template: template.to_owned(),
                size,
                max,
            });
        }
        self.next_object_id = next;
        self.objects.insert(object);
        self.broadcast(&Message::Spawn(record));
        tracing::info!(object = ?id, template, %owner, "spawned");
        Ok(id)
    }

    /// Remove an object, tell every client to drop it, and run its teardown.
    /// Returns `false` for unknown ids.
    pub fn destroy(&mut self, id: ObjectId) -> bool {
        let Some(mut object) = self.objects.remove(id) else {
            tracing::debug!(object = ?id, "destroy of unknown object ignored");
            return false;
        };
        self.broadcast(&Message::Destroy(id));
        object.teardown();
        tracing::info!(object = ?id, template = object.template(), "destroyed");
        true
    }

    pub fn behaviour_mut<B: NetworkBehaviour>(&mut self, id: ObjectId) -> Option<&mut B> {
        self.objects.get_mut(id)?.behaviour_mut::<B>()
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Apply every queued network event, then flush dirty fields.
    pub fn tick(&mut self) {
        self.process_events();
        self.flush();
    }

    /// Apply every queued network event. Returns how many were handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for one network event and apply it.
    pub async fn process_next(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Ok(Some(event)) => {
                self.handle_event(event);
                true
            }
            _ => false,
        }
    }

    /// Send every dirty field to every client. Returns the number of field
    /// updates sent.
    ///
    /// A value too large for a frame of its own is dropped with an error and
    /// its field is left clean. Clients keep the previous value.
    pub fn flush(&mut self) -> usize {
        let mut updates = std::mem::take(&mut self.scratch);
        updates.clear();
        for object in self.objects.iter_mut() {
            if let Err(e) = object.collect_dirty(&mut updates) {
                tracing::warn!(object = ?object.id(), error = %e, "field left out of flush");
            }
        }

        let Batches { batches, oversized } = self.budget.split(
            updates.drain(..),
            FIELD_UPDATE_OVERHEAD,
            MAX_UPDATES_PER_MESSAGE,
            FieldUpdate::encoded_len,
        );
        for update in &oversized {
            tracing::error!(
                object = ?update.object_id,
                field = ?update.field_id,
                size = FIELD_UPDATE_OVERHEAD + update.encoded_len(),
                max = self.budget.max_frame_size(),
                "field value exceeds frame limit, update dropped"
            );
        }

        let count = batches.iter().map(Vec::len).sum();
        if count > 0 {
            let messages = batches.len();
            for batch in batches {
                self.broadcast(&Message::FieldUpdate(batch));
            }
            tracing::trace!(updates = count, messages, clients = self.connections.len(), "flushed");
        }
        self.scratch = updates;
        count
    }

    fn broadcast(&self, message: &Message) {
        for link in self.connections.values() {
            if let Err(e) = link.send(message.clone()) {
                tracing::debug!(error = %e, tag = ?message.tag(), "broadcast skipped closed link");
            }
        }
    }

    fn snapshot_all(&mut self) -> Vec<SpawnRecord> {
        self.objects
            .iter_mut()
            .filter_map(|object| match object.snapshot() {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(object = ?object.id(), error = %e, "object left out of snapshot");
                    None
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Connection events
    // -----------------------------------------------------------------------

    fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected(link) => self.on_connected(link),
            NetEvent::Message(connection, message) => self.on_message(connection, message),
            NetEvent::Disconnected(connection, reason) => {
                if !self.drop_connection(connection, reason) {
                    tracing::trace!(?connection, "disconnect of already dropped connection");
                }
            }
        }
    }

    /// Split the world into as many `FULL_SNAPSHOT` frames as the frame limit
    /// needs. Always at least one, so an empty world still announces itself.
    fn snapshot_frames(&mut self) -> (Vec<Message>, usize) {
        let records = self.snapshot_all();
        let Batches { batches, oversized } =
            self.budget
                .split(records, FULL_SNAPSHOT_OVERHEAD, usize::MAX, SpawnRecord::encoded_len);
        for record in &oversized {
            tracing::error!(
                object = ?record.object_id,
                template = %record.template,
                size = FULL_SNAPSHOT_OVERHEAD + record.encoded_len(),
                max = self.budget.max_frame_size(),
                "object exceeds frame limit, left out of snapshot"
            );
        }
        let count = batches.iter().map(Vec::len).sum();
        let mut frames: Vec<Message> = batches.into_iter().map(Message::FullSnapshot).collect();
        if frames.is_empty() {
            frames.push(Message::FullSnapshot(Vec::new()));
        }
        (frames, count)
    }

    fn on_connected(&mut self, link: Outbound) {
        let connection = link.id();
        let (frames, count) = self.snapshot_frames();
        let parts = frames.len();
        for frame in frames {
            if let Err(e) = link.send(frame) {
                tracing::debug!(?connection, error = %e, "client left before its snapshot");
                return;
            }
        }
        self.connections.insert(connection, link);
        tracing::info!(?connection, objects = count, frames = parts, "client connected");
        self.with_listener(|listener, server| listener.on_client_connected(server, connection));
    }

    fn on_message(&mut self, connection: ConnectionId, message: Message) {
        if !self.connections.contains_key(&connection) {
            tracing::trace!(?connection, "message from dropped connection ignored");
            return;
        }
        match message {
            Message::ClientRequest {
                object_id,
                request_id,
                payload,
            } => self.route_request(connection, object_id, request_id, &payload),
            other => self.violation(
                connection,
                format!("{:?} is not a client message", other.tag()),
            ),
        }
    }

    fn route_request(
        &mut self,
        connection: ConnectionId,
        object_id: ObjectId,
        request_id: RequestId,
        payload: &[u8],
    ) {
        let Some(object) = self.objects.get_mut(object_id) else {
            return self.violation(connection, format!("request for unknown object {object_id:?}"));
        };
        if object.owner() != Owner::Client(connection) {
            tracing::warn!(
                ?connection,
                object = ?object_id,
                owner = %object.owner(),
                "authority violation: request from non-owner dropped"
            );
            return;
        }
        match object.receive_request(request_id, payload) {
            Ok(()) => {
                tracing::trace!(?connection, object = ?object_id, request = ?request_id, "request handled");
            }
            Err(e) if e.is_protocol_violation() => self.violation(connection, e.to_string()),
            Err(e) => {
                tracing::warn!(?connection, object = ?object_id, error = %e, "request failed");
            }
        }
    }

    fn violation(&mut self, connection: ConnectionId, why: String) {
        tracing::warn!(?connection, %why, "protocol violation");
        self.drop_connection(connection, DisconnectReason::Protocol(why));
    }

    /// Close a client connection. Its objects are handled per the disconnect
    /// policy and the listener is told.
    pub fn disconnect(&mut self, connection: ConnectionId) -> bool {
        self.drop_connection(connection, DisconnectReason::Local)
    }

    fn drop_connection(&mut self, connection: ConnectionId, reason: DisconnectReason) -> bool {
        let Some(link) = self.connections.remove(&connection) else {
            return false;
        };
        link.close();

        let owned = self.objects.owned_by(Owner::Client(connection));
        match self.policy {
            DisconnectPolicy::Despawn => {
                for id in &owned {
                    self.destroy(*id);
                }
            }
            DisconnectPolicy::Retain => {
                if !owned.is_empty() {
                    tracing::debug!(?connection, objects = owned.len(), "retaining objects of departed client");
                }
            }
        }
        tracing::info!(?connection, %reason, "client disconnected");
        self.with_listener(|listener, server| {
            listener.on_client_disconnected(server, connection, &reason)
        });
        true
    }

    /// Run a listener callback with the listener taken out of `self`, so the
    /// callback can use the manager freely.
    fn with_listener(&mut self, f: impl FnOnce(&mut dyn ServerListener, &mut Self)) {
        let Some(mut listener) = self.listener.take() else {
            return;
        };
        f(listener.as_mut(), self);
        if self.listener.is_none() {
            self.listener = Some(listener);
        }
    }

    /// Stop accepting and close every connection. Objects stay in the table.
    pub fn shutdown(&mut self) {
        self.server.shutdown();
        let connections = std::mem::take(&mut self.connections);
        for (connection, link) in connections {
            link.close();
            self.with_listener(|listener, server| {
                listener.on_client_disconnected(server, connection, &DisconnectReason::Shutdown)
            });
        }
        tracing::info!(objects = self.objects.len(), "authority shut down");
    }
}

impl NetworkManager for AuthorityManager {
    fn local_owner(&self) -> Owner {
        Owner::Server
    }

    fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Runs the handler in place, without touching the network. Only objects
    /// the server owns outright can be invoked here.
    fn invoke_with<P, F>(&mut self, handle: RequestHandle<P>, fill: F) -> Result<(), RequestError>
    where
        P: RequestPayload,
        F: FnOnce(&mut P),
    {
        let object_id = handle.object_id();
        let object = self
            .objects
            .get_mut(object_id)
            .ok_or(RequestError::UnknownObject(object_id))?;
        let owner = object.owner();
        if owner != Owner::Server {
            tracing::warn!(object = ?object_id, %owner, "authority violation: server does not own this object");
            return Err(RequestError::NotOwner {
                object: object_id,
                owner,
            });
        }
        object.prepare_request(handle.request_id(), fill)?;
        object.run_request(handle.request_id())
    }
}

impl Drop for AuthorityManager {
    fn drop(&mut self) {
        self.server.shutdown();
        for link in self.connections.values() {
            link.close();
        }
    }
}

#[cfg(test)]
#[path = "authority_tests.rs"]
mod tests;
