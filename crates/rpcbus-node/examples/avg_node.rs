//! A node that both exports an interface and calls another node. Start
//! the daemon and `sum_node` first, then: `cargo run --example avg_node`.

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
            "app_avg",
            vec![Interface::new("avg2", "%d%d", "%d", |args: Args<'_>| {
                let a = args.get_int(0).map_err(|e| HandlerError::new(e.to_string()))?;
                let b = args.get_int(1).map_err(|e| HandlerError::new(e.to_string()))?;
                Ok(Value::Int((a + b) / 2))
            })],
        )
        .await?;

    let sum = session
        .call(
            "app_sum",
            "add2",
            "%d%d",
            vec![Value::Int(108), Value::Int(27)],
            "%d",
        )
        .await?;
    println!("app_sum.add2(108, 27) = {sum}");

    session.shutdown().await?;
    Ok(())
}
