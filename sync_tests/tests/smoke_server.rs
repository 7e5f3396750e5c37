use sync_server::server::bind_ephemeral;
use sync_shared::config::ServerConfig;

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let mut server = bind_ephemeral(ServerConfig::default()).await?;
    server.run_for_ticks(3).await?;
    assert_eq!(server.tick(), 3);
    Ok(())
}

#[tokio::test]
async fn quit_ends_run_loop() -> anyhow::Result<()> {
    let mut server = bind_ephemeral(ServerConfig::default()).await?;
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    server.set_console_input(rx);
    tx.send("quit".to_string()).await?;
    tokio::time::timeout(std::time::Duration::from_secs(2), server.run()).await??;
    assert!(!server.is_running());
    Ok(())
}
