use plinth_plugin_sdk::{HandlerError, Plugin, Reply, RequestExt, Routes};
use serde_json::json;

#[derive(Debug, Default)]
pub struct Ping;

impl Plugin for Ping {
    fn mount(&self, routes: &mut Routes) -> anyhow::Result<()> {
        routes.get("/ping", |req| async move {
            let owner = req.plugin_manifest().map(|manifest| manifest.name.clone());
            Ok::<_, HandlerError>(Reply::data(json!({ "pong": true, "plugin": owner })))
        });
        Ok(())
    }
}
