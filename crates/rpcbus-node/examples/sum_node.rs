//! A node exporting simple arithmetic interfaces. Run the daemon first,
//! then: `cargo run --example sum_node`.

use std::time::Duration;

use rpcbus_node::{Args, ClientSession, HandlerError, Interface, SessionConfig, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let session = ClientSession::connect(SessionConfig::default()).await?;
    session
        .register(
            "app_sum",
            vec![
                Interface::new("add2", "%d%d", "%d", |args: Args<'_>| {
                    let a = args.get_int(0).map_err(|e| HandlerError::new(e.to_string()))?;
                    let b = args.get_int(1).map_err(|e| HandlerError::new(e.to_string()))?;
                    Ok(Value::Int(a + b))
                }),
                Interface::new("add3", "%d%d%d", "%d", |args: Args<'_>| {
                    let values = args
                        .scan("%d%d%d")
                        .map_err(|e| HandlerError::new(e.to_string()))?;
                    Ok(Value::Int(values.iter().filter_map(|v| v.as_int()).sum()))
                }),
                Interface::new("getinfo", "", "%s", |_args: Args<'_>| {
                    Ok(Value::Str("sum node v1".to_string()))
                }),
            ],
        )
        .await?;

    // Serve calls for five minutes, then leave.
    tokio::time::sleep(Duration::from_secs(300)).await;
    session.shutdown().await?;
    Ok(())
}
