//! Line-oriented operator console on stdin.

use crate::admin::Admin;
use crate::utils::join_words;
use log::{info, warn};
use relay_shared::ClientId;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "Available commands:
help: Show this help message
stats: Print server stats
quiet: Toggle quiet mode
roomCount: Show the number of rooms
clientCount: Show the number of clients
list: List all rooms and clients
stop: Stop the server
message <clientId> <message>: Send a message to a client
messageAll <message>: Send a message to all clients
disable <clientId> <message>: Disable anchor on a client
disableAll <message>: Disable anchor on all clients
deleteRoom <roomId>: Disables anchor on all clients in the room and deletes it";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Help,
    Stats,
    Quiet,
    RoomCount,
    ClientCount,
    List,
    Stop,
    Message { client_id: ClientId, message: String },
    MessageAll { message: String },
    Disable { client_id: ClientId, message: String },
    DisableAll { message: String },
    DeleteRoom { room_id: String },
}

impl AdminCommand {
    /// Parses one console line. Anything unrecognised, including a command
    /// missing its client id or room id, becomes `Help`.
    pub fn parse(line: &str) -> Self {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            return AdminCommand::Help;
        };

        match command {
            "stats" => AdminCommand::Stats,
            "quiet" => AdminCommand::Quiet,
            "roomCount" => AdminCommand::RoomCount,
            "clientCount" => AdminCommand::ClientCount,
            "list" => AdminCommand::List,
            "stop" => AdminCommand::Stop,
            "messageAll" => AdminCommand::MessageAll {
                message: join_words(args),
            },
            "disableAll" => AdminCommand::DisableAll {
                message: join_words(args),
            },
            "message" | "disable" => {
                let Some(client_id) = args.first().and_then(|id| parse_client_id(id)) else {
                    return AdminCommand::Help;
                };
                let message = join_words(&args[1..]);
                if command == "message" {
                    AdminCommand::Message { client_id, message }
                } else {
                    AdminCommand::Disable { client_id, message }
                }
            }
            "deleteRoom" => match args.first() {
                Some(room_id) => AdminCommand::DeleteRoom {
                    room_id: room_id.to_string(),
                },
                None => AdminCommand::Help,
            },
            _ => AdminCommand::Help,
        }
    }
}

fn parse_client_id(word: &str) -> Option<ClientId> {
    match word.parse::<ClientId>() {
        Ok(0) | Err(_) => {
            warn!("Given text was not a valid clientId: {:?}", word);
            None
        }
        Ok(id) => Some(id),
    }
}

pub async fn execute(admin: &Admin, command: AdminCommand) {
    match command {
        AdminCommand::Help => info!("{}", HELP),
        AdminCommand::Stats => {
            let online = admin.online_count().await;
            let games = admin.registry().games_completed().await;
            info!("Online Count: {} | Games Complete: {}", online, games);
        }
        AdminCommand::Quiet => info!("Quiet mode: {}", admin.toggle_quiet()),
        AdminCommand::RoomCount => info!("Room count: {}", admin.room_count().await),
        AdminCommand::ClientCount => info!("Client count: {}", admin.online_count().await),
        AdminCommand::List => {
            for room in admin.dump().await {
                info!("Room {} (teams: {}):", room.room_id, room.teams.join(", "));
                for client in room.clients {
                    info!(
                        "  Client {} [{}{}]: {}",
                        client.client_id,
                        client.team_id,
                        if client.online { "" } else { ", offline" },
                        client.state
                    );
                }
            }
        }
        AdminCommand::Stop => admin.stop().await,
        AdminCommand::Message { client_id, message } => {
            if !admin.message_client(client_id, &message).await {
                info!("Client {} not found", client_id);
            }
        }
        AdminCommand::MessageAll { message } => {
            admin.message_all(&message).await;
        }
        AdminCommand::Disable { client_id, message } => {
            if !admin.disable_client(client_id, &message).await {
                info!("Client {} not found", client_id);
            }
        }
        AdminCommand::DisableAll { message } => {
            admin.disable_all(&message).await;
        }
        AdminCommand::DeleteRoom { room_id } => {
            if !admin.delete_room(&room_id).await {
                info!("Room {} not found", room_id);
            }
        }
    }
}

/// Reads commands until stdin closes.
pub async fn run(admin: Admin) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                execute(&admin, AdminCommand::parse(&line)).await;
            }
            Ok(None) => {
                info!("Console input closed");
                return;
            }
            Err(e) => {
                warn!("Error reading from stdin: {}", e);
                return;
            }
        }
    }
}
