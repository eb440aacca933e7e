//! Operations shared by the authority and the mirror.
//!
//! Game code receives the manager it runs against as a parameter; there is no
//! global "active manager". Generic code can be written once against
//! [`NetworkManager`] and run on either side.

use tessera_net::{ObjectId, Owner};

use crate::behaviour::NetworkBehaviour;
use crate::error::RequestError;
use crate::object::{ObjectTable, ReplicatedObject};
use crate::request::{RequestHandle, RequestPayload};

pub trait NetworkManager {
    /// The owner value that means "this side".
    fn local_owner(&self) -> Owner;

    fn objects(&self) -> &ObjectTable;

    /// Invoke a request channel after filling its reusable payload buffer in
    /// place.
    fn invoke_with<P, F>(&mut self, handle: RequestHandle<P>, fill: F) -> Result<(), RequestError>
    where
        P: RequestPayload,
        F: FnOnce(&mut P);

    /// Invoke a request channel with a complete payload.
    fn invoke<P: RequestPayload>(
        &mut self,
        handle: RequestHandle<P>,
        payload: P,
    ) -> Result<(), RequestError> {
        self.invoke_with(handle, move |buffer| *buffer = payload)
    }

    fn object(&self, id: ObjectId) -> Option<&ReplicatedObject> {
        self.objects().get(id)
    }

    fn has_object(&self, id: ObjectId) -> bool {
        self.objects().contains(id)
    }

    /// Whether this side owns `id`. False for unknown ids.
    fn is_mine(&self, id: ObjectId) -> bool {
        self.object(id)
            .is_some_and(|object| object.owner() == self.local_owner())
    }

    fn find_by_component_type<B: NetworkBehaviour>(&self) -> Vec<ObjectId> {
        self.objects().find_by_component_type::<B>()
    }

    fn behaviour<B: NetworkBehaviour>(&self, id: ObjectId) -> Option<&B> {
        self.object(id)?.behaviour::<B>()
    }
}

/// A relation to a replicated object by id, resolved through a manager.
///
/// Holding an `ObjectRef` never keeps the object or its connection alive;
/// after a destroy it simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    id: ObjectId,
}

impl ObjectRef {
    pub fn new(id: ObjectId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn resolve<'m, M: NetworkManager>(&self, manager: &'m M) -> Option<&'m ReplicatedObject> {
        manager.object(self.id)
    }

    pub fn is_valid<M: NetworkManager>(&self, manager: &M) -> bool {
        manager.has_object(self.id)
    }

    pub fn is_mine<M: NetworkManager>(&self, manager: &M) -> bool {
        manager.is_mine(self.id)
    }

    pub fn behaviour<'m, B: NetworkBehaviour, M: NetworkManager>(
        &self,
        manager: &'m M,
    ) -> Option<&'m B> {
        manager.behaviour::<B>(self.id)
    }
}

impl From<ObjectId> for ObjectRef {
    fn from(id: ObjectId) -> Self {
        Self::new(id)
    }
}
