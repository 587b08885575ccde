//! `steadfast poll <url> <request_id>` – wait for a server-side job.

use anyhow::Result;
use serde_json::json;
use steadfast_core::config::CoreConfig;
use steadfast_core::transport::HttpRequest;

use super::{ctrl_c_token, dispatcher};

pub async fn run_poll(cfg: &CoreConfig, url: &str, request_id: &str) -> Result<()> {
    let dispatcher = dispatcher(cfg);
    let poll = HttpRequest::post_json(url, &json!({ "request_id": request_id }))?;
    let handle = dispatcher.promise(request_id, poll)?;
    let cancel = ctrl_c_token();

    let result = dispatcher.await_promise(&handle, &cancel).await;
    let status = handle.status();
    tracing::info!(
        request_id,
        polls = handle.polls(),
        state = ?status.state,
        queue_state = ?status.queue_state,
        "poll finished"
    );
    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
