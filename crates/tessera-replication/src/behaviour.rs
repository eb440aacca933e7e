//! Networked behaviours: the logic units that make up a replicated object.

use std::any::Any;

use tessera_net::{ObjectId, Owner, RequestId};

use crate::field::SyncField;
use crate::object::Side;
use crate::request::{RequestBinding, RequestHandle, RequestPayload, TypedRequest};

/// Upcast to [`Any`] so managers can look behaviours up by type.
///
/// Blanket-implemented; behaviours never implement it by hand.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A component of a replicated object.
///
/// Behaviours own their [`SyncVar`](crate::SyncVar)s and expose them through
/// [`visit_fields`](NetworkBehaviour::visit_fields). The visiting order
/// defines the field ids, so it must be the same on every build that talks to
/// each other.
pub trait NetworkBehaviour: AsAny + Send + 'static {
    /// Visit every synchronized field, always in the same order.
    fn visit_fields(&mut self, visit: &mut dyn FnMut(&mut dyn SyncField)) {
        let _ = visit;
    }

    /// Runs once on both sides after the object's fields are attached.
    /// Request channels are registered here.
    fn on_network_initialize(&mut self, ctx: &mut InitContext<'_>) {
        let _ = ctx;
    }

    /// Runs when the object is destroyed, or when a mirror drops its shadow.
    fn on_destroy(&mut self) {}
}

pub(crate) fn downcast_ref<B: NetworkBehaviour>(behaviour: &dyn NetworkBehaviour) -> Option<&B> {
    behaviour.as_any().downcast_ref::<B>()
}

pub(crate) fn downcast_mut<B: NetworkBehaviour>(
    behaviour: &mut dyn NetworkBehaviour,
) -> Option<&mut B> {
    behaviour.as_any_mut().downcast_mut::<B>()
}

/// What a behaviour sees while it initializes.
pub struct InitContext<'a> {
    object: ObjectId,
    owner: Owner,
    side: Side,
    behaviour_index: usize,
    requests: &'a mut Vec<Box<dyn RequestBinding>>,
    overflowed: bool,
}

impl<'a> InitContext<'a> {
    pub(crate) fn new(
        object: ObjectId,
        owner: Owner,
        side: Side,
        requests: &'a mut Vec<Box<dyn RequestBinding>>,
    ) -> Self {
        Self {
            object,
            owner,
            side,
            behaviour_index: 0,
            requests,
            overflowed: false,
        }
    }

    pub(crate) fn set_behaviour_index(&mut self, index: usize) {
        self.behaviour_index = index;
    }

    pub(crate) fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn object_id(&self) -> ObjectId {
        self.object
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Whether this copy is the server's.
    pub fn is_authority(&self) -> bool {
        self.side == Side::Authority
    }

    /// Register a request channel handled by behaviour type `B`.
    ///
    /// `default` is the initial content of the reusable payload buffer. The
    /// handler only ever runs on the server, on the behaviour that
    /// registered it. Request ids follow registration order across the
    /// whole object, so both sides must register the same requests in the
    /// same order.
    pub fn register_request<B, P, F>(&mut self, default: P, handler: F) -> RequestHandle<P>
    where
        B: NetworkBehaviour,
        P: RequestPayload,
        F: FnMut(&mut B, &P) + Send + 'static,
    {
        let index = self.requests.len();
        let Ok(id) = u16::try_from(index) else {
            self.overflowed = true;
            return RequestHandle::new(self.object, RequestId(u16::MAX));
        };
        self.requests.push(Box::new(TypedRequest::new(
            self.behaviour_index,
            default,
            handler,
        )));
        RequestHandle::new(self.object, RequestId(id))
    }
}
