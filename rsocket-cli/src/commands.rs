//! Command execution.

use crate::Commands;
use bytes::Bytes;
use colored::Colorize;
use futures::StreamExt;
use rsocket_core::{Payload, RSocket, RSocketError};

/// Executes a command and returns the formatted output. Stream items are
/// printed as they arrive.
pub async fn execute(socket: &RSocket, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Fnf { data, metadata } => {
            socket.fire_and_forget(payload(data, metadata)).await?;
            Ok("Sent".green().to_string())
        }

        Commands::Request { data, metadata } => {
            match socket.request_response(payload(data, metadata)).await? {
                Some(response) => Ok(format_payload(&response)),
                None => Ok("(empty response)".dimmed().to_string()),
            }
        }

        Commands::Stream {
            data,
            metadata,
            request_n,
            limit,
        } => {
            let mut items = socket
                .request_stream(payload(data, metadata), request_n)
                .await?;
            let limit = limit.unwrap_or(usize::MAX);
            let mut received = 0usize;
            let mut outstanding = request_n;

            while received < limit {
                match items.next().await {
                    Some(item) => {
                        println!("{}", format_payload(&item?));
                        received += 1;
                        outstanding -= 1;
                        if outstanding == 0 {
                            items.request(request_n);
                            outstanding = request_n;
                        }
                    }
                    None => break,
                }
            }
            if !items.is_done() {
                items.cancel();
            }
            Ok(format!("{} {} item(s)", "Received".green(), received))
        }

        Commands::Channel { items, request_n } => {
            let outbound = futures::stream::iter(
                items
                    .into_iter()
                    .map(|item| Ok::<_, RSocketError>(Payload::from(item))),
            );
            let mut inbound = socket.request_channel(outbound, request_n).await?;
            let mut received = 0usize;
            let mut outstanding = request_n;

            while let Some(item) = inbound.next().await {
                println!("{}", format_payload(&item?));
                received += 1;
                outstanding -= 1;
                if outstanding == 0 {
                    inbound.request(request_n);
                    outstanding = request_n;
                }
            }
            Ok(format!("{} {} item(s)", "Received".green(), received))
        }

        Commands::MetadataPush { metadata } => {
            socket.metadata_push(metadata).await?;
            Ok("Pushed".green().to_string())
        }
    }
}

fn payload(data: String, metadata: Option<String>) -> Payload {
    Payload::new(data, metadata.map(Bytes::from))
}

fn format_payload(payload: &Payload) -> String {
    let data = match payload.data_utf8() {
        Some(text) => text.to_string(),
        None => format!("<{} bytes>", payload.data().len()),
    };
    match payload.metadata() {
        Some(metadata) => {
            let metadata = match payload.metadata_utf8() {
                Some(text) => text.to_string(),
                None => format!("<{} bytes>", metadata.len()),
            };
            format!("{} {}", metadata.cyan(), data)
        }
        None => data,
    }
}
