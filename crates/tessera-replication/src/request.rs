//! Request channels: owner-gated remote procedures on a replicated object.
//!
//! A behaviour registers each request once, from its network-initialize hook,
//! and keeps the returned [`RequestHandle`]. Invoking a handle on the server
//! runs the handler in place; invoking it on the owning client serializes the
//! payload into a `CLIENT_REQUEST` and the server runs the handler when the
//! message arrives.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_net::{ObjectId, RequestId};

use crate::behaviour::{NetworkBehaviour, downcast_mut};
use crate::error::RequestError;

/// Anything that can travel as a request payload.
pub trait RequestPayload: Serialize + DeserializeOwned + Send + 'static {}

impl<T> RequestPayload for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Typed address of one request channel on one object.
pub struct RequestHandle<P> {
    object: ObjectId,
    request: RequestId,
    _payload: PhantomData<fn(P)>,
}

impl<P> RequestHandle<P> {
    pub(crate) fn new(object: ObjectId, request: RequestId) -> Self {
        Self {
            object,
            request,
            _payload: PhantomData,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object
    }

    pub fn request_id(&self) -> RequestId {
        self.request
    }
}

impl<P> Clone for RequestHandle<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for RequestHandle<P> {}

impl<P> PartialEq for RequestHandle<P> {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object && self.request == other.request
    }
}

impl<P> Eq for RequestHandle<P> {}

impl<P> fmt::Debug for RequestHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("object", &self.object)
            .field("request", &self.request)
            .finish()
    }
}

/// Type-erased request binding stored on the object.
pub(crate) trait RequestBinding: Send {
    /// Index of the behaviour that registered the request.
    fn behaviour_index(&self) -> usize;

    /// The reusable payload buffer, for typed filling.
    fn buffer_mut(&mut self) -> &mut dyn Any;

    fn encode_buffer(&self) -> Result<Vec<u8>, postcard::Error>;

    fn decode_into_buffer(&mut self, bytes: &[u8]) -> Result<(), postcard::Error>;

    /// Run the handler against the current buffer. `false` if `behaviour`
    /// is not the type the handler was registered for.
    fn run(&mut self, behaviour: &mut dyn NetworkBehaviour) -> bool;
}

pub(crate) struct TypedRequest<B, P, F> {
    behaviour_index: usize,
    buffer: P,
    handler: F,
    _behaviour: PhantomData<fn(&mut B)>,
}

impl<B, P, F> TypedRequest<B, P, F> {
    pub(crate) fn new(behaviour_index: usize, buffer: P, handler: F) -> Self {
        Self {
            behaviour_index,
            buffer,
            handler,
            _behaviour: PhantomData,
        }
    }
}

impl<B, P, F> RequestBinding for TypedRequest<B, P, F>
where
    B: NetworkBehaviour,
    P: RequestPayload,
    F: FnMut(&mut B, &P) + Send + 'static,
{
    fn behaviour_index(&self) -> usize {
        self.behaviour_index
    }

    fn buffer_mut(&mut self) -> &mut dyn Any {
        &mut self.buffer
    }

    fn encode_buffer(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(&self.buffer)
    }

    fn decode_into_buffer(&mut self, bytes: &[u8]) -> Result<(), postcard::Error> {
        self.buffer = postcard::from_bytes(bytes)?;
        Ok(())
    }

    fn run(&mut self, behaviour: &mut dyn NetworkBehaviour) -> bool {
        match downcast_mut::<B>(behaviour) {
            Some(target) => {
                (self.handler)(target, &self.buffer);
                true
            }
            None => false,
        }
    }
}

/// Fill the binding's buffer through a typed closure.
pub(crate) fn fill_buffer<P: RequestPayload>(
    binding: &mut dyn RequestBinding,
    fill: impl FnOnce(&mut P),
    object: ObjectId,
    request: RequestId,
) -> Result<(), RequestError> {
    let buffer = binding
        .buffer_mut()
        .downcast_mut::<P>()
        .ok_or(RequestError::PayloadMismatch { object, request })?;
    fill(buffer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Default)]
    struct Door {
        opened_with: Option<String>,
    }

    impl NetworkBehaviour for Door {}

    struct Wall;

    impl NetworkBehaviour for Wall {}

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Knock {
        code: String,
    }

    fn door_binding() -> Box<dyn RequestBinding> {
        Box::new(TypedRequest::new(
            0,
            Knock::default(),
            |door: &mut Door, knock: &Knock| door.opened_with = Some(knock.code.clone()),
        ))
    }

    #[test]
    fn test_decoded_payload_reaches_handler() {
        let mut binding = door_binding();
        let bytes = postcard::to_allocvec(&Knock {
            code: "3-1-2".into(),
        })
        .unwrap();
        binding.decode_into_buffer(&bytes).unwrap();

        let mut door = Door::default();
        assert!(binding.run(&mut door));
        assert_eq!(door.opened_with.as_deref(), Some("3-1-2"));
    }

    #[test]
    fn test_handler_refuses_other_behaviour_type() {
        let mut binding = door_binding();
        assert!(!binding.run(&mut Wall));
    }

    #[test]
    fn test_fill_then_encode_matches_postcard() {
        let mut binding = door_binding();
        fill_buffer::<Knock>(
            binding.as_mut(),
            |k| k.code = "open".into(),
            ObjectId(1),
            RequestId(0),
        )
        .unwrap();
        let expected = postcard::to_allocvec(&Knock {
            code: "open".into(),
        })
        .unwrap();
        assert_eq!(binding.encode_buffer().unwrap(), expected);
    }

    #[test]
    fn test_fill_with_wrong_payload_type() {
        let mut binding = door_binding();
        let result = fill_buffer::<u32>(binding.as_mut(), |v| *v = 1, ObjectId(1), RequestId(0));
        assert!(matches!(result, Err(RequestError::PayloadMismatch { .. })));
    }

    #[test]
    fn test_truncated_payload_is_codec_error() {
        let mut binding = door_binding();
        assert!(binding.decode_into_buffer(&[5, b'a']).is_err());
    }

    #[test]
    fn test_handles_compare_by_address() {
        let a = RequestHandle::<Knock>::new(ObjectId(1), RequestId(0));
        let b = a;
        assert_eq!(a, b);
        assert_ne!(a, RequestHandle::new(ObjectId(1), RequestId(1)));
    }
}
