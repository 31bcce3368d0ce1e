// src/bin/contentctl-cli.rs

//! Command-line interface for the cluster controller's admin server.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use contentctl::client::{AdminClient, ConnectionOptions};
use contentctl::controller::ResponseWait;
use contentctl::server::AdminRequest;
use serde_json::Value;
use std::time::Duration;

/// The contentctl command-line interface.
#[derive(Parser, Debug)]
#[clap(name = "contentctl-cli", about = "Cluster controller admin CLI", version)]
struct Cli {
    /// Address of the controller's admin server.
    #[clap(short, long, default_value = "127.0.0.1:19050")]
    address: String,

    /// Connect timeout in seconds.
    #[clap(long, default_value = "10")]
    connect_timeout: u64,

    /// Operation timeout in seconds.
    #[clap(long, default_value = "60")]
    operation_timeout: u64,

    #[clap(subcommand)]
    command: Command,
}

/// Options shared by the set-state commands.
#[derive(clap::Args, Debug)]
struct SetOptions {
    /// Wanted state: up, retired, maintenance or down.
    state: String,

    /// Free-text reason recorded with the wanted state.
    #[clap(short, long, default_value = "")]
    reason: String,

    /// Safety condition: safe or force.
    #[clap(short, long, default_value = "safe")]
    condition: String,

    /// Only report what would happen.
    #[clap(long)]
    probe: bool,

    /// Answer once the state is recorded instead of once the cluster has acknowledged it.
    #[clap(long)]
    no_wait: bool,

    /// Time budget for the request in milliseconds.
    #[clap(long)]
    timeout_ms: Option<u64>,
}

impl SetOptions {
    fn apply(self, request: &mut AdminRequest) {
        request.state = Some(self.state);
        request.reason = Some(self.reason);
        request.condition = Some(self.condition);
        request.probe = Some(self.probe);
        request.timeout_ms = self.timeout_ms;
        if self.no_wait {
            request.response_wait = Some(ResponseWait::NoWait);
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the cluster state and every node.
    #[clap(name = "cluster")]
    Cluster,
    /// Show one node.
    #[clap(name = "node")]
    Node {
        /// Node identifier, for example storage.3.
        node: String,
    },
    /// Set the wanted state of one node.
    #[clap(name = "set-node")]
    SetNode {
        /// Node identifier, for example storage.3.
        node: String,
        #[clap(flatten)]
        options: SetOptions,
    },
    /// Set the wanted state of every storage node (force only).
    #[clap(name = "set-cluster")]
    SetCluster {
        #[clap(flatten)]
        options: SetOptions,
    },
}

fn print_cluster(data: &Value) {
    println!("Cluster:  {}", data["cluster_name"].as_str().unwrap_or("?"));
    println!("Version:  {}", data["version"]);
    println!("Up:       {}", data["cluster_up"]);
    println!("Master:   {}", data["is_master"]);
    println!("State:    {}", data["state"].as_str().unwrap_or(""));
    if let Some(spaces) = data["bucket_spaces"].as_object() {
        for (name, state) in spaces {
            println!("  [{}] {}", name, state.as_str().unwrap_or(""));
        }
    }
    println!();
    println!("{:<16} {:<14} {:<14} {:<14} {}", "NODE", "REPORTED", "WANTED", "PUBLISHED", "REASON");
    for node in data["nodes"].as_array().into_iter().flatten() {
        print_node_row(node);
    }
}

fn print_node_row(node: &Value) {
    let id = format!(
        "{}.{}",
        node["node"]["node_type"].as_str().unwrap_or("?"),
        node["node"]["index"]
    );
    println!(
        "{:<16} {:<14} {:<14} {:<14} {}",
        id,
        node["reported_state"]["state"].as_str().unwrap_or("?"),
        node["wanted_state"]["state"].as_str().unwrap_or("?"),
        node["published_state"]["state"].as_str().unwrap_or("?"),
        node["wanted_state"]["description"].as_str().unwrap_or(""),
    );
}

fn print_set_response(data: &Value) {
    let modified = data["was_modified"].as_bool().unwrap_or(false);
    println!("{}: {}", if modified { "Modified" } else { "Not modified" }, data["reason"].as_str().unwrap_or(""));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let options = ConnectionOptions {
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        operation_timeout: Duration::from_secs(cli.operation_timeout),
    };
    let mut client = AdminClient::connect(cli.address.as_str(), options).await?;

    match cli.command {
        Command::Cluster => {
            let data = client.call(&AdminRequest::new("get_cluster")).await?;
            print_cluster(&data);
        }
        Command::Node { node } => {
            let mut request = AdminRequest::new("get_node");
            request.node = Some(node);
            let data = client.call(&request).await?;
            println!("{:<16} {:<14} {:<14} {:<14} {}", "NODE", "REPORTED", "WANTED", "PUBLISHED", "REASON");
            print_node_row(&data);
        }
        Command::SetNode { node, options } => {
            let mut request = AdminRequest::new("set_node_state");
            request.node = Some(node);
            options.apply(&mut request);
            print_set_response(&client.call(&request).await?);
        }
        Command::SetCluster { options } => {
            if !options.condition.eq_ignore_ascii_case("force") {
                bail!("set-cluster requires --condition force");
            }
            let mut request = AdminRequest::new("set_cluster_state");
            options.apply(&mut request);
            print_set_response(&client.call(&request).await?);
        }
    }

    Ok(())
}
