//! Replicated objects and the table that holds them.

use std::collections::BTreeMap;

use tessera_net::{FieldId, FieldUpdate, FieldValue, ObjectId, Owner, RequestId, SpawnRecord};

use crate::behaviour::{InitContext, NetworkBehaviour, downcast_mut, downcast_ref};
use crate::error::{FieldError, ProtocolViolation, RequestError, SpawnError};
use crate::field::{FieldRole, SyncField};
use crate::request::{RequestBinding, RequestPayload, fill_buffer};

/// Which copy of an object this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The canonical copy on the server.
    Authority,
    /// A client's shadow.
    Mirror,
}

impl From<Side> for FieldRole {
    fn from(side: Side) -> Self {
        match side {
            Side::Authority => FieldRole::Authority,
            Side::Mirror => FieldRole::Mirror,
        }
    }
}

/// One unit of shared state: an id, an owner, and its behaviours.
pub struct ReplicatedObject {
    id: ObjectId,
    owner: Owner,
    template: String,
    side: Side,
    behaviours: Vec<Box<dyn NetworkBehaviour>>,
    requests: Vec<Box<dyn RequestBinding>>,
    field_count: usize,
}

impl ReplicatedObject {
    /// Attach every field, then run each behaviour's initialize hook in order.
    pub(crate) fn instantiate(
        id: ObjectId,
        template: &str,
        owner: Owner,
        side: Side,
        mut behaviours: Vec<Box<dyn NetworkBehaviour>>,
    ) -> Result<Self, SpawnError> {
        let role = FieldRole::from(side);
        let mut field_count = 0usize;
        for behaviour in &mut behaviours {
            behaviour.visit_fields(&mut |field| {
                field.attach(role);
                field_count += 1;
            });
        }
        if field_count > usize::from(u16::MAX) + 1 {
            return Err(SpawnError::TooManyFields {
                template: template.to_owned(),
                count: field_count,
            });
        }

        let mut requests = Vec::new();
        let mut ctx = InitContext::new(id, owner, side, &mut requests);
        for (index, behaviour) in behaviours.iter_mut().enumerate() {
            ctx.set_behaviour_index(index);
            behaviour.on_network_initialize(&mut ctx);
        }
        if ctx.overflowed() {
            return Err(SpawnError::TooManyRequests {
                template: template.to_owned(),
            });
        }

        Ok(Self {
            id,
            owner,
            template: template.to_owned(),
            side,
            behaviours,
            requests,
            field_count,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// First behaviour of type `B`.
    pub fn behaviour<B: NetworkBehaviour>(&self) -> Option<&B> {
        self.behaviours.iter().find_map(|b| downcast_ref::<B>(b.as_ref()))
    }

    pub fn behaviour_mut<B: NetworkBehaviour>(&mut self) -> Option<&mut B> {
        self.behaviours
            .iter_mut()
            .find_map(|b| downcast_mut::<B>(b.as_mut()))
    }

    pub fn has_behaviour<B: NetworkBehaviour>(&self) -> bool {
        self.behaviour::<B>().is_some()
    }

    /// Walk the field layout in id order.
    fn for_each_field(&mut self, mut f: impl FnMut(FieldId, &mut dyn SyncField)) {
        let mut next = 0u16;
        for behaviour in &mut self.behaviours {
            behaviour.visit_fields(&mut |field| {
                f(FieldId(next), field);
                next = next.wrapping_add(1);
            });
        }
    }

    /// Spawn record carrying every field's current value.
    pub(crate) fn snapshot(&mut self) -> Result<SpawnRecord, FieldError> {
        let mut fields = Vec::with_capacity(self.field_count);
        let mut failure = None;
        self.for_each_field(|_, field| match field.snapshot() {
            Ok(value) => fields.push(value),
            Err(e) => failure = Some(e),
        });
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(SpawnRecord {
            object_id: self.id,
            template: self.template.clone(),
            owner: self.owner,
            fields,
        })
    }

    /// Append an update for every dirty field and clear the flags.
    ///
    /// A field whose value cannot be encoded stays out of the batch; the
    /// error is returned after the other fields were collected.
    pub(crate) fn collect_dirty(&mut self, out: &mut Vec<FieldUpdate>) -> Result<(), FieldError> {
        let object_id = self.id;
        let mut failure = None;
        self.for_each_field(|field_id, field| match field.take_if_dirty() {
            Ok(Some(value)) => out.push(FieldUpdate {
                object_id,
                field_id,
                value,
            }),
            Ok(None) => {}
            Err(e) => failure = Some(e),
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Apply one server diff to a shadow field.
    pub(crate) fn apply_field(
        &mut self,
        field_id: FieldId,
        value: &FieldValue,
    ) -> Result<(), ProtocolViolation> {
        let object_id = self.id;
        let mut outcome = Err(ProtocolViolation(format!(
            "object {object_id:?} has no field {field_id:?}"
        )));
        self.for_each_field(|id, field| {
            if id == field_id {
                outcome = field.apply(value).map_err(ProtocolViolation::from);
            }
        });
        outcome
    }

    /// Apply a full field list, as carried by a spawn record.
    pub(crate) fn apply_snapshot(&mut self, values: &[FieldValue]) -> Result<(), ProtocolViolation> {
        if values.len() != self.field_count {
            return Err(ProtocolViolation(format!(
                "template {:?} has {} fields, spawn carried {}",
                self.template,
                self.field_count,
                values.len()
            )));
        }
        let mut outcome = Ok(());
        self.for_each_field(|id, field| {
            if outcome.is_ok()
                && let Some(value) = values.get(usize::from(id.0))
            {
                outcome = field.apply(value).map_err(ProtocolViolation::from);
            }
        });
        outcome
    }

    fn binding_mut(
        &mut self,
        request: RequestId,
    ) -> Result<&mut Box<dyn RequestBinding>, RequestError> {
        let object = self.id;
        self.requests
            .get_mut(usize::from(request.0))
            .ok_or(RequestError::UnknownRequest { object, request })
    }

    /// Fill the request's payload buffer in place.
    pub(crate) fn prepare_request<P: RequestPayload>(
        &mut self,
        request: RequestId,
        fill: impl FnOnce(&mut P),
    ) -> Result<(), RequestError> {
        let object = self.id;
        fill_buffer(self.binding_mut(request)?.as_mut(), fill, object, request)
    }

    /// Serialize the request's current payload buffer.
    pub(crate) fn encode_request(&mut self, request: RequestId) -> Result<Vec<u8>, RequestError> {
        Ok(self.binding_mut(request)?.encode_buffer()?)
    }

    /// Run the handler against the current payload buffer.
    pub(crate) fn run_request(&mut self, request: RequestId) -> Result<(), RequestError> {
        let object = self.id;
        let binding = self
            .requests
            .get_mut(usize::from(request.0))
            .ok_or(RequestError::UnknownRequest { object, request })?;
        // Distinct fields, so the binding and its behaviour can be borrowed together.
        let ran = self
            .behaviours
            .get_mut(binding.behaviour_index())
            .is_some_and(|behaviour| binding.run(behaviour.as_mut()));
        if ran {
            Ok(())
        } else {
            Err(RequestError::BehaviourMismatch { object, request })
        }
    }

    /// Decode a received payload into the buffer and run the handler.
    pub(crate) fn receive_request(
        &mut self,
        request: RequestId,
        payload: &[u8],
    ) -> Result<(), RequestError> {
        self.binding_mut(request)?.decode_into_buffer(payload)?;
        self.run_request(request)
    }

    /// Run every behaviour's teardown hook.
    pub(crate) fn teardown(&mut self) {
        for behaviour in &mut self.behaviours {
            behaviour.on_destroy();
        }
    }
}

impl std::fmt::Debug for ReplicatedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedObject")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("template", &self.template)
            .field("side", &self.side)
            .field("behaviours", &self.behaviours.len())
            .field("fields", &self.field_count)
            .field("requests", &self.requests.len())
            .finish()
    }
}

/// Objects keyed by id, iterated in id order.
#[derive(Debug, Default)]
pub struct ObjectTable {
    objects: BTreeMap<ObjectId, ReplicatedObject>,
}

impl ObjectTable {
    pub fn get(&self, id: ObjectId) -> Option<&ReplicatedObject> {
        self.objects.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Option<&mut ReplicatedObject> {
        self.objects.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicatedObject> {
        self.objects.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ReplicatedObject> {
        self.objects.values_mut()
    }

    /// Insert, returning any object previously stored under the same id.
    pub(crate) fn insert(&mut self, object: ReplicatedObject) -> Option<ReplicatedObject> {
        self.objects.insert(object.id(), object)
    }

    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<ReplicatedObject> {
        self.objects.remove(&id)
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = ReplicatedObject> {
        std::mem::take(&mut self.objects).into_values()
    }

    /// Ids of every object carrying a behaviour of type `B`.
    pub fn find_by_component_type<B: NetworkBehaviour>(&self) -> Vec<ObjectId> {
        self.objects
            .values()
            .filter(|o| o.has_behaviour::<B>())
            .map(ReplicatedObject::id)
            .collect()
    }

    /// Ids of every object owned by `owner`.
    pub fn owned_by(&self, owner: Owner) -> Vec<ObjectId> {
        self.objects
            .values()
            .filter(|o| o.owner() == owner)
            .map(ReplicatedObject::id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{SyncBool, SyncInt, SyncString};
    use crate::request::RequestHandle;
    use serde::{Deserialize, Serialize};
    use tessera_net::ConnectionId;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct SetCounter {
        password: String,
        value: i32,
    }

    #[derive(Default)]
    struct Capital {
        sync_me: SyncBool,
        sync_me_also: SyncString,
        set_counter: Option<RequestHandle<SetCounter>>,
        destroyed: bool,
    }

    impl NetworkBehaviour for Capital {
        fn visit_fields(&mut self, visit: &mut dyn FnMut(&mut dyn SyncField)) {
            visit(&mut self.sync_me);
            visit(&mut self.sync_me_also);
        }

        fn on_network_initialize(&mut self, ctx: &mut InitContext<'_>) {
            self.set_counter = Some(ctx.register_request(
                SetCounter::default(),
                |capital: &mut Capital, req: &SetCounter| {
                    if req.password == "hunter2" {
                        capital.sync_me.set(req.value > 0);
                    }
                },
            ));
        }

        fn on_destroy(&mut self) {
            self.destroyed = true;
        }
    }

    #[derive(Default)]
    struct Treasury {
        counter: SyncInt,
    }

    impl NetworkBehaviour for Treasury {
        fn visit_fields(&mut self, visit: &mut dyn FnMut(&mut dyn SyncField)) {
            visit(&mut self.counter);
        }

        fn on_network_initialize(&mut self, ctx: &mut InitContext<'_>) {
            ctx.register_request(0i32, |t: &mut Treasury, v: &i32| t.counter.set(*v));
        }
    }

    fn capital(side: Side) -> ReplicatedObject {
        let behaviours: Vec<Box<dyn NetworkBehaviour>> = vec![
            Box::new(Capital {
                sync_me_also: SyncString::new("Hello World"),
                ..Capital::default()
            }),
            Box::new(Treasury::default()),
        ];
        ReplicatedObject::instantiate(
            ObjectId(1),
            "capital",
            Owner::Client(ConnectionId(7)),
            side,
            behaviours,
        )
        .unwrap()
    }

    #[test]
    fn test_layout_spans_behaviours_in_order() {
        let mut server = capital(Side::Authority);
        assert_eq!(server.field_count(), 3);
        assert_eq!(server.request_count(), 2);

        let record = server.snapshot().unwrap();
        assert_eq!(
            record.fields,
            vec![
                FieldValue::Bool(false),
                FieldValue::Str("Hello World".into()),
                FieldValue::Int(0),
            ]
        );
        assert_eq!(record.owner, Owner::Client(ConnectionId(7)));
    }

    #[test]
    fn test_request_ids_follow_registration_order() {
        let server = capital(Side::Authority);
        let handle = server.behaviour::<Capital>().unwrap().set_counter.unwrap();
        assert_eq!(handle.request_id(), RequestId(0));
        assert_eq!(handle.object_id(), ObjectId(1));
    }

    #[test]
    fn test_dirty_fields_collected_with_ids() {
        let mut server = capital(Side::Authority);
        server.behaviour_mut::<Treasury>().unwrap().counter.set(354);
        server.behaviour_mut::<Capital>().unwrap().sync_me.set(true);

        let mut out = Vec::new();
        server.collect_dirty(&mut out).unwrap();
        assert_eq!(
            out,
            vec![
                FieldUpdate {
                    object_id: ObjectId(1),
                    field_id: FieldId(0),
                    value: FieldValue::Bool(true),
                },
                FieldUpdate {
                    object_id: ObjectId(1),
                    field_id: FieldId(2),
                    value: FieldValue::Int(354),
                },
            ]
        );

        out.clear();
        server.collect_dirty(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_snapshot_applies_to_mirror() {
        let mut server = capital(Side::Authority);
        server.behaviour_mut::<Capital>().unwrap().sync_me.set(true);
        let record = server.snapshot().unwrap();

        let mut client = capital(Side::Mirror);
        client.apply_snapshot(&record.fields).unwrap();
        let view = client.behaviour::<Capital>().unwrap();
        assert!(*view.sync_me.get());
        assert_eq!(view.sync_me_also.get(), "Hello World");
    }

    #[test]
    fn test_snapshot_with_wrong_layout_is_violation() {
        let mut client = capital(Side::Mirror);
        assert!(client.apply_snapshot(&[FieldValue::Bool(true)]).is_err());
        assert!(
            client
                .apply_snapshot(&[
                    FieldValue::Int(1),
                    FieldValue::Str("x".into()),
                    FieldValue::Int(0),
                ])
                .is_err()
        );
    }

    #[test]
    fn test_unknown_field_id_is_violation() {
        let mut client = capital(Side::Mirror);
        assert!(client.apply_field(FieldId(9), &FieldValue::Int(1)).is_err());
        client.apply_field(FieldId(2), &FieldValue::Int(5)).unwrap();
        assert_eq!(*client.behaviour::<Treasury>().unwrap().counter.get(), 5);
    }

    #[test]
    fn test_received_request_runs_on_registering_behaviour() {
        let mut server = capital(Side::Authority);
        let payload = postcard::to_allocvec(&354i32).unwrap();
        server.receive_request(RequestId(1), &payload).unwrap();
        assert_eq!(*server.behaviour::<Treasury>().unwrap().counter.get(), 354);
    }

    #[test]
    fn test_prepared_request_runs_locally() {
        let mut server = capital(Side::Authority);
        server
            .prepare_request::<SetCounter>(RequestId(0), |req| {
                req.password = "hunter2".into();
                req.value = 1;
            })
            .unwrap();
        server.run_request(RequestId(0)).unwrap();
        assert!(*server.behaviour::<Capital>().unwrap().sync_me.get());
    }

    #[test]
    fn test_unknown_request_id() {
        let mut server = capital(Side::Authority);
        let err = server.receive_request(RequestId(5), &[]).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_teardown_reaches_behaviours() {
        let mut server = capital(Side::Authority);
        server.teardown();
        assert!(server.behaviour::<Capital>().unwrap().destroyed);
    }

    #[test]
    fn test_table_lookup_by_behaviour_type() {
        struct Marker;
        impl NetworkBehaviour for Marker {}

        let mut table = ObjectTable::default();
        table.insert(capital(Side::Authority));
        let plain = ReplicatedObject::instantiate(
            ObjectId(2),
            "marker",
            Owner::Server,
            Side::Authority,
            vec![Box::new(Marker)],
        )
        .unwrap();
        table.insert(plain);

        assert_eq!(table.find_by_component_type::<Capital>(), vec![ObjectId(1)]);
        assert_eq!(table.find_by_component_type::<Marker>(), vec![ObjectId(2)]);
        assert_eq!(table.owned_by(Owner::Server), vec![ObjectId(2)]);
        assert_eq!(table.ids(), vec![ObjectId(1), ObjectId(2)]);
    }
}
