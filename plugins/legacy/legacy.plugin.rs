use plinth_plugin_sdk::{HandlerError, Plugin, Reply, Routes};
use serde_json::json;

#[derive(Debug, Default)]
pub struct Legacy;

impl Plugin for Legacy {
    fn mount(&self, routes: &mut Routes) -> anyhow::Result<()> {
        routes.get("/status", |_req| async {
            Ok::<_, HandlerError>(Reply::data(json!({ "legacy": true })))
        });
        Ok(())
    }
}
