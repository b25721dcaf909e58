//! Ex command handler.

use color_eyre::Result;

use super::App;

impl App {
    pub async fn run_command(&self, cmd: &str) -> Result<()> {
        let (client, _task) = self.connect().await?;

        let result = client.command(cmd).await;
        client.close().await?;
        result?;

        tracing::info!(%cmd, "Command executed");
        Ok(())
    }
}
