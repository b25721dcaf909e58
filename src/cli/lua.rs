//! Lua command handler.

use color_eyre::Result;

use super::convert::parse_arg;
use super::{print_json, App};

impl App {
    /// Run a Lua chunk through `nvim_exec_lua` and print what it returns.
    pub async fn run_lua(&self, code: &str, args: &[String]) -> Result<()> {
        let (client, _task) = self.connect().await?;
        let args = args.iter().map(|a| parse_arg(a)).collect();

        let result = client.exec_lua(code, args).await;
        client.close().await?;

        print_json(&result?)
    }
}
