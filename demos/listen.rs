use std::env;
use std::error::Error;
use std::sync::Arc;

use pushover_client::Client;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let secret = env::var("PUSHOVER_SECRET")?;
    let user_id = env::var("PUSHOVER_USER_ID")?;
    let device_id = env::var("PUSHOVER_DEVICE_ID")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut client = Client::new()?;
        client.restore_login(SecretString::new(secret), user_id);
        client.restore_device(device_id);
        let client = Arc::new(client);

        let deliveries = client.deliveries();
        let mut listener = client.spawn_listener();

        let error = loop {
            tokio::select! {
                Some(message) = deliveries.recv() => {
                    println!(
                        "id={} app={} title={:?} date={} text={:?}",
                        message.relative_id,
                        message.app_name,
                        message.title,
                        message.date,
                        message.text,
                    );
                }
                _ = tokio::signal::ctrl_c() => client.close(),
                result = &mut listener => break result?,
            }
        };

        println!("stream ended: {error} (retryable={})", error.is_retryable());
        Ok::<(), Box<dyn Error>>(())
    })
}
