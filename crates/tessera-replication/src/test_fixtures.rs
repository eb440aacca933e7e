//! Behaviours and templates shared by the unit tests.

use serde::{Deserialize, Serialize};

use crate::behaviour::{InitContext, NetworkBehaviour};
use crate::field::{SyncBool, SyncField, SyncInt, SyncString, SyncValue};
use crate::request::RequestHandle;
use crate::template::TemplateRegistry;

pub const PASSWORD: &str = "hunter2";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetCounter {
    pub password: String,
    pub value: i32,
}

pub struct Capital {
    pub sync_me: SyncBool,
    pub sync_me_also: SyncString,
    pub counter: SyncInt,
    pub set_counter: Option<RequestHandle<SetCounter>>,
    pub rename: Option<RequestHandle<String>>,
    pub requests_handled: u32,
    pub destroyed: bool,
}

impl Default for Capital {
    fn default() -> Self {
        Self {
            sync_me: SyncBool::new(false),
            sync_me_also: SyncString::new("Hello World"),
            counter: SyncInt::new(0),
            set_counter: None,
            rename: None,
            requests_handled: 0,
            destroyed: false,
        }
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
                capital.requests_handled += 1;
                if req.password == PASSWORD {
                    capital.counter.set(req.value);
                }
            },
        ));
        self.rename = Some(ctx.register_request(
            String::new(),
            |capital: &mut Capital, name: &String| {
                capital.requests_handled += 1;
                capital.sync_me_also.set(name.clone());
            },
        ));
    }

    fn on_destroy(&mut self) {
        self.destroyed = true;
    }
}

#[derive(Default)]
pub struct Ledger {
    pub entries: SyncValue<Vec<String>>,
}

impl NetworkBehaviour for Ledger {
    fn visit_fields(&mut self, visit: &mut dyn FnMut(&mut dyn SyncField)) {
        visit(&mut self.entries);
    }
}

/// `capital` and `ledger`, identical on both sides.
pub fn templates() -> TemplateRegistry {
    TemplateRegistry::builder()
        .register("capital", || vec![Box::new(Capital::default())])
        .register("ledger", || vec![Box::new(Ledger::default())])
        .build()
}
