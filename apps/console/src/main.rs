use anyhow::Result;
use clap::Parser;
use client_core::{ClientEvent, ConsoleClient};
use shared::domain::WaId;
use tokio::sync::broadcast;

mod config;

#[derive(Parser, Debug)]
struct Args {
    /// Base URL of the CRM backend, e.g. http://127.0.0.1:8443
    #[arg(long)]
    server_url: Option<String>,
    /// Open this conversation immediately.
    #[arg(long)]
    wa_id: Option<String>,
    /// Unread count currently shown for --wa-id; a nonzero value marks the
    /// conversation read on open.
    #[arg(long, default_value_t = 0)]
    known_unread: u64,
    /// Scope the unread badge to one department.
    #[arg(long)]
    department: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(department) = args.department {
        settings.department = Some(department);
    }

    let client = ConsoleClient::connect(&settings.server_url, settings.sync_config()).await?;
    let mut events = client.subscribe_events();
    println!("connected to {}", settings.server_url);

    if let Some(wa_id) = args.wa_id {
        let feed = client
            .open_conversation(WaId::new(wa_id), args.known_unread)
            .await;
        for message in feed.messages() {
            println!(
                "[{}] {:?} {:?}: {}",
                message.timestamp, message.direction, message.status, message.content
            );
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            received = events.recv() => match received {
                Ok(ClientEvent::UnreadChanged(snapshot)) => {
                    println!(
                        "unread: {} messages across {} contacts",
                        snapshot.total_unread_messages, snapshot.contacts_with_unread
                    );
                }
                Ok(ClientEvent::ConversationUpdated { wa_id }) => {
                    println!("conversation {wa_id} updated");
                }
                Ok(ClientEvent::PushStateChanged(state)) => {
                    println!("push channel: {state:?}");
                }
                Ok(ClientEvent::Error(message)) => {
                    eprintln!("error: {message}");
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}
