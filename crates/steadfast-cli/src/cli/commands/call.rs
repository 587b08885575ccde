//! `steadfast call <url>` – one request through the dispatcher.

use anyhow::{bail, Context, Result};
use steadfast_core::config::CoreConfig;
use steadfast_core::transport::HttpRequest;
use steadfast_core::{CallSpec, TrafficClass};

use super::{ctrl_c_token, dispatcher};

#[derive(Debug, Clone)]
pub struct CallArgs {
    pub url: String,
    pub class: TrafficClass,
    pub method: Option<String>,
    pub data: Option<String>,
    pub headers: Vec<String>,
    pub stream: bool,
}

/// Build the request described by `args`. `--data` must be valid JSON.
pub(crate) fn build_request(args: &CallArgs) -> Result<HttpRequest> {
    let method = match (&args.method, &args.data) {
        (Some(m), _) => m.to_ascii_uppercase(),
        (None, Some(_)) => "POST".to_string(),
        (None, None) => "GET".to_string(),
    };
    let mut request = HttpRequest::new(method, args.url.clone());
    if let Some(data) = &args.data {
        serde_json::from_str::<serde_json::Value>(data).context("--data is not valid JSON")?;
        request = request
            .with_header("Content-Type", "application/json")
            .with_body(data.as_bytes().to_vec());
    }
    for raw in &args.headers {
        let Some((name, value)) = raw.split_once(':') else {
            bail!("header {raw:?} is not `Name: value`");
        };
        request = request.with_header(name.trim(), value.trim());
    }
    Ok(request)
}

pub async fn run_call(cfg: &CoreConfig, args: CallArgs) -> Result<()> {
    let request = build_request(&args)?;
    let dispatcher = dispatcher(cfg);
    let cancel = ctrl_c_token();
    let call = CallSpec::new(args.class, request);

    if args.stream {
        // Print events as they arrive; long-lived streams may never end.
        dispatcher
            .execute_stream_with(call, &cancel, |event| match &event.event {
                Some(name) => println!("[{name}] {}", event.data),
                None => println!("{}", event.data),
            })
            .await?;
        return Ok(());
    }

    let response = dispatcher.execute(call, &cancel).await?;
    eprintln!("HTTP {}", response.status);
    println!("{}", response.text());
    Ok(())
}
