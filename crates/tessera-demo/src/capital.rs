//! The `capital` template shared by both demo roles.

use serde::{Deserialize, Serialize};
use tessera_replication::{
    InitContext, NetworkBehaviour, RequestHandle, SyncBool, SyncField, SyncInt, SyncString,
    TemplateRegistry,
};

pub const TEMPLATE: &str = "capital";

/// Password the server accepts for [`SetCounter`].
pub const PASSWORD: &str = "open sesame";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetCounter {
    pub password: String,
    pub value: i32,
}

pub struct Capital {
    pub sync_me: SyncBool,
    pub sync_me_also: SyncString,
    pub counter: SyncInt,
    pub set_counter: Option<RequestHandle<SetCounter>>,
}

impl Default for Capital {
    fn default() -> Self {
        Self {
            sync_me: SyncBool::new(false).with_on_change(|v| tracing::debug!(sync_me = v, "changed")),
            sync_me_also: SyncString::new("Hello World")
                .with_on_change(|v| tracing::debug!(sync_me_also = %v, "changed")),
            counter: SyncInt::new(0).with_on_change(|v| tracing::debug!(counter = v, "changed")),
            set_counter: None,
        }
    }
}

impl Capital {
    pub fn describe(&self) -> String {
        format!(
            "sync_me={} sync_me_also={:?} counter={}",
            self.sync_me.get(),
            self.sync_me_also.get(),
            self.counter.get()
        )
    }
}

impl NetworkBehaviour for Capital {
    fn visit_fields(&mut self, visit: &mut dyn FnMut(&mut dyn SyncField)) {
        visit(&mut self.sync_me);
        visit(&mut self.sync_me_also);
        visit(&mut self.counter);
    }

    fn on_network_initialize(&mut self, ctx: &mut InitContext<'_>) {
        self.set_counter = Some(ctx.register_request(
            SetCounter::default(),
            |capital: &mut Capital, req: &SetCounter| {
                if req.password == PASSWORD {
                    capital.counter.set(req.value);
                } else {
                    tracing::warn!("set_counter with wrong password ignored");
                }
            },
        ));
    }

    fn on_destroy(&mut self) {
        tracing::debug!("capital torn down");
    }
}

pub fn templates() -> TemplateRegistry {
    TemplateRegistry::builder()
        .register(TEMPLATE, || vec![Box::new(Capital::default())])
        .build()
}
