//! Loopback demo - two sessions over a local TCP connection.
//!
//! This example demonstrates:
//! - Building sessions with the fluent builder
//! - Sending a single file and a bulk batch
//! - Consuming lifecycle events on the receiving side
//!
//! # Running
//!
//! ```text
//! RUST_LOG=wiredrop=debug cargo run --example loopback -- notes.txt photo.jpg
//! ```
//!
//! Without arguments a few generated files are sent.

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;
use wiredrop::{ClientType, OutboundFile, Session, TransferEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wiredrop=info")),
        )
        .init();

    let files = load_files().await?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (server, _) = accepted?;

    let (receiver, mut events) = Session::builder()
        .peer_version(0, 0)
        .spawn(server)?;
    let (sender, _sender_events) = Session::builder()
        .client_type(ClientType::IosApp)
        .fragment_size(8 * 1024)
        .peer_version(0, 0)
        .spawn(client?)?;

    let expected = files.len() + 1;
    let printer = tokio::spawn(async move {
        let mut received = 0;
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::ReceivedFile(file) => {
                    received += 1;
                    println!(
                        "received #{} {} ({} bytes)",
                        file.file_no,
                        file.filename_str().unwrap_or("<binary name>"),
                        file.payload.len()
                    );
                    if received == expected {
                        break;
                    }
                }
                TransferEvent::FragmentReceived { progress, .. } => {
                    println!("  batch {:>5.1}%", progress.batch * 100.0);
                }
                TransferEvent::BulkTransferEnded { success, bulk_id } => {
                    println!("bulk {} ended, success: {}", bulk_id, success);
                }
                _ => {}
            }
        }
    });

    sender
        .send_file(&b"single file outside any batch"[..], 0, 1, "single.txt")
        .await?;
    sender.send_files(files).await?;

    printer.await?;
    println!(
        "receiver idle, {} files pending",
        receiver.total_files_to_transfer().await
    );
    Ok(())
}

async fn load_files() -> std::io::Result<Vec<OutboundFile>> {
    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        return Ok((0..3)
            .map(|i| {
                let data: Vec<u8> = (0..20_000u32 * (i + 1)).map(|b| b as u8).collect();
                OutboundFile::new(format!("generated-{}.bin", i), data)
            })
            .collect());
    }

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let data = tokio::fs::read(&path).await?;
        files.push(OutboundFile::new(Bytes::from(path), data));
    }
    Ok(files)
}
