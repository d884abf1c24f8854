use std::path::Path;

use passctrl::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "passctrl.toml".to_string());
    let config = Config::load_from(Path::new(&config_path))?;

    init_tracing(&config.server.logging)?;

    let state = AppState::build(config.clone()).await?;

    // SIGHUP triggers a rule-bundle reload with cache invalidation.
    #[cfg(unix)]
    {
        let reload_state = state.clone();
        tokio::spawn(async move {
            let mut hangup = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::hangup(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!("failed to install SIGHUP handler: {e}");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                tracing::info!("SIGHUP received, reloading rule bundle");
                if let Err(e) = reload_state.reload().await {
                    tracing::error!("reload failed, keeping previous snapshot: {e}");
                }
            }
        });
    }

    Server::new(config).serve(router(state)).await?;
    Ok(())
}
