//! Call command handler.

use color_eyre::Result;

use super::convert::parse_arg;
use super::{print_json, App};

impl App {
    /// Call `method` with JSON arguments and print the result.
    pub async fn run_call(&self, method: &str, args: &[String]) -> Result<()> {
        let (client, _task) = self.connect().await?;
        let args = args.iter().map(|a| parse_arg(a)).collect();

        tracing::debug!(%method, "Calling");
        let result = client.call(method, args).await;
        client.close().await?;

        print_json(&result?)
    }
}
