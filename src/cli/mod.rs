//! CLI module for nvim-rpc.
//!
//! Subcommands:
//! - `call`: Call an API method and print the result
//! - `lua`: Run Lua code and print the result
//! - `command`: Run an Ex command
//! - `listen`: Print inbound notifications and requests

mod call;
mod command;
pub mod convert;
mod listen;
mod lua;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;

use crate::client::Client;
use crate::config::Config;
use crate::connection::{Address, ChildConnection};
use crate::rpc::ListenerTask;

/// nvim-rpc - msgpack-rpc client for Neovim
#[derive(Parser)]
#[command(name = "nvim-rpc")]
#[command(about = "Talk to a running or embedded Neovim over msgpack-rpc")]
#[command(version)]
pub struct App {
    /// Run in verbose mode
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Socket path or host:port of a running Neovim
    #[arg(long, global = true, conflicts_with = "embed")]
    pub address: Option<String>,

    /// Spawn a headless `nvim --embed` instead of connecting
    #[arg(long, global = true)]
    pub embed: bool,

    /// Number of write workers (1 keeps requests in order)
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Call an API method; arguments are parsed as JSON, or taken as strings
    Call {
        /// Method name, e.g. nvim_get_current_line
        method: String,

        /// Arguments
        args: Vec<String>,
    },

    /// Run Lua code and print what it returns
    Lua {
        /// Lua chunk; `...` holds the arguments
        code: String,

        /// Arguments passed to the chunk
        args: Vec<String>,
    },

    /// Run an Ex command
    Command {
        /// Command line without the leading colon
        cmd: String,
    },

    /// Print every inbound notification and request as a JSON line
    Listen {
        /// Events to subscribe to with nvim_subscribe
        #[arg(long = "subscribe", value_name = "EVENT")]
        events: Vec<String>,
    },
}

impl App {
    /// Run the CLI application.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Call {
                ref method,
                ref args,
            } => self.run_call(method, args).await,
            Command::Lua { ref code, ref args } => self.run_lua(code, args).await,
            Command::Command { ref cmd } => self.run_command(cmd).await,
            Command::Listen { ref events } => self.run_listen(events).await,
        }
    }

    /// Builds a client from config and flags and attaches it to Neovim.
    async fn connect(&self) -> Result<(Client, ListenerTask)> {
        let config = Config::load().map_err(crate::Error::from)?;
        let mut client_config = config.client_config();
        if let Some(workers) = self.workers {
            client_config.sender_workers = workers;
        }
        let client = Client::new(client_config);

        let task = if self.embed {
            let nvim = &config.connection.nvim_path;
            tracing::info!(nvim = %nvim.display(), "Spawning embedded Neovim");
            let child = ChildConnection::embed(nvim)
                .wrap_err_with(|| format!("Failed to spawn {}", nvim.display()))?;
            client.attach_owned(Box::new(child))?
        } else {
            let address = self
                .address
                .as_deref()
                .map(Address::parse)
                .or_else(|| config.address())
                .or_else(Address::discover)
                .ok_or_else(|| {
                    eyre!("No Neovim address: pass --address, set $NVIM, or use --embed")
                })?;
            client
                .connect(&address)
                .await
                .wrap_err_with(|| format!("Failed to connect to {address}"))?
        };

        Ok((client, task))
    }
}

/// Prints `value` as pretty JSON on stdout.
fn print_json(value: &rmpv::Value) -> Result<()> {
    let json = convert::msgpack_to_json(value);
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
