use std::env;
use std::error::Error;

use pushover_client::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let email = env::var("PUSHOVER_EMAIL")?;
    let password = SecretString::new(env::var("PUSHOVER_PASSWORD")?);
    let device_name =
        env::var("PUSHOVER_DEVICE_NAME").unwrap_or_else(|_| "rust-client".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut client = Client::new()?;
        client.login(&email, &password).await?;
        client.register_device(&device_name).await?;

        // Persist these and use restore_login/restore_device next time.
        if let Some((user_id, secret)) = client.session().user() {
            println!("user_id={user_id} secret={}", secret.expose_secret());
        }
        if let Some(device_id) = client.session().device_id() {
            println!("device_id={device_id}");
        }

        let pending = client.fetch_messages().await?;
        println!("pending messages={}", pending.len());
        client.acknowledge_through(&pending).await?;

        Ok::<(), Box<dyn Error>>(())
    })
}
