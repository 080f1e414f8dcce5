use std::error::Error;

use biostar_session::{ClientConfig, PushEventKind, SessionClient};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = SessionClient::builder(config)
            .on_connected(|| println!("session established"))
            .build()?;

        let subscription = client.subscribe(|event| match event.kind() {
            PushEventKind::Access => {
                let user = event
                    .body()
                    .and_then(|body| body.pointer("/user_id/user_id"))
                    .and_then(|value| value.as_str())
                    .unwrap_or("-");
                println!("access user={user} raw={}", event.raw());
            }
            kind => println!("{kind:?} {}", event.raw()),
        });

        client.connect().await?;
        println!("listening; press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;

        subscription.unsubscribe();
        client.disconnect().await;
        Ok::<_, Box<dyn Error>>(())
    })
}
