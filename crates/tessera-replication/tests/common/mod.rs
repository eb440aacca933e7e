//! Shared templates and helpers for the loopback tests.

#![allow(dead_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_config::{DisconnectPolicy, NetworkConfig};
use tessera_replication::{
    AuthorityManager, InitContext, MirrorManager, NetworkBehaviour, RequestHandle, SyncBool,
    SyncField, SyncInt, SyncString, SyncValue, TemplateRegistry,
};

pub const WAIT: Duration = Duration::from_secs(3);
pub const QUIET: Duration = Duration::from_millis(150);
pub const PASSWORD: &str = "correct horse";

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
            sync_me: SyncBool::new(false),
            sync_me_also: SyncString::new("Hello World"),
            counter: SyncInt::new(0),
            set_counter: None,
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
                if req.password == PASSWORD {
                    capital.counter.set(req.value);
                }
            },
        ));
    }
}

impl Capital {
    pub fn state(&self) -> (bool, String, i32) {
        (
            *self.sync_me.get(),
            self.sync_me_also.get().clone(),
            *self.counter.get(),
        )
    }
}

#[derive(Default)]
pub struct Granary {
    pub stock: SyncValue<Vec<(String, u32)>>,
}

impl NetworkBehaviour for Granary {
    fn visit_fields(&mut self, visit: &mut dyn FnMut(&mut dyn SyncField)) {
        visit(&mut self.stock);
    }
}

pub fn templates() -> TemplateRegistry {
    TemplateRegistry::builder()
        .register("capital", || vec![Box::new(Capital::default())])
        .register("granary", || vec![Box::new(Granary::default())])
        .build()
}

/// Bind an authority on an ephemeral loopback port. The returned config
/// points clients at it.
pub async fn start_server(policy: DisconnectPolicy) -> (AuthorityManager, NetworkConfig) {
    tessera_log::init_test_logging();
    let mut config = NetworkConfig {
        server_address: "127.0.0.1".into(),
        server_port: 0,
        disconnect_policy: policy,
        ..NetworkConfig::default()
    };
    let auth = AuthorityManager::bind(&config, templates(), ())
        .await
        .expect("bind loopback");
    config.server_port = auth.local_addr().expect("bound address").port();
    (auth, config)
}

/// Connect a mirror and let the authority register it and send its snapshot.
pub async fn join(auth: &mut AuthorityManager, config: &NetworkConfig) -> MirrorManager {
    let mirror = MirrorManager::connect(config, templates(), ())
        .await
        .expect("connect to loopback authority");
    assert!(auth.process_next(WAIT).await, "authority never saw the client");
    mirror
}

/// Apply messages until the link stays quiet.
pub async fn drain(mirror: &mut MirrorManager) -> usize {
    let mut applied = 0;
    while mirror.wait_for_message(QUIET).await {
        applied += mirror.process_all();
    }
    applied
}
