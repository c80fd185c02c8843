//! Terminal rendering of transfer events.

use std::io::Write;

use syndro_parallel::{Direction, TransferEvent, TransferProgress};
use tokio::sync::broadcast;

/// Format bytes for human-readable display.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}

/// One status line for a progress event.
pub fn progress_line(progress: &TransferProgress) -> String {
    let verb = match progress.direction {
        Direction::Send => "sent",
        Direction::Receive => "received",
    };
    format!(
        "{:>5.1}% {} / {} {verb} ({}/{} chunks, {}/s)",
        progress.fraction() * 100.0,
        format_bytes(progress.bytes_done),
        format_bytes(progress.total_bytes),
        progress.chunks_done,
        progress.total_chunks,
        format_bytes(progress.bytes_per_second as u64),
    )
}

/// Prints events to stderr until the channel closes.
///
/// With `follow_one`, stops after the first terminal event.
pub async fn print_events(mut events: broadcast::Receiver<TransferEvent>, follow_one: bool) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let mut stderr = std::io::stderr().lock();
        let _ = match &event {
            TransferEvent::Initiated {
                file_name,
                file_size,
                total_chunks,
                connections,
                direction,
                ..
            } => match direction {
                Direction::Send => writeln!(
                    stderr,
                    "sending {file_name} ({}, {total_chunks} chunks, {connections} connections)",
                    format_bytes(*file_size)
                ),
                Direction::Receive => writeln!(
                    stderr,
                    "receiving {file_name} ({}, {total_chunks} chunks)",
                    format_bytes(*file_size)
                ),
            },
            TransferEvent::Progress(progress) => {
                write!(stderr, "\r{}", progress_line(progress)).and_then(|()| stderr.flush())
            }
            TransferEvent::ChunkRetry {
                chunk_index,
                attempt,
                error,
                ..
            } => writeln!(stderr, "\nretrying chunk {chunk_index} (attempt {attempt}): {error}"),
            TransferEvent::Completed { path, .. } => match path {
                Some(path) => writeln!(stderr, "\nsaved to {}", path.display()),
                None => writeln!(stderr, "\ndone"),
            },
            TransferEvent::Failed { error, .. } => writeln!(stderr, "\nfailed: {error}"),
            TransferEvent::Cancelled { .. } => writeln!(stderr, "\ncancelled"),
            TransferEvent::AwaitingApproval { .. } => Ok(()),
        };

        if follow_one && event.is_terminal() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_units() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn progress_line_shows_percent_and_chunks() {
        let line = progress_line(&TransferProgress {
            transfer_id: "t1".into(),
            direction: Direction::Send,
            bytes_done: 512 * 1024,
            total_bytes: 1024 * 1024,
            chunks_done: 2,
            total_chunks: 4,
            bytes_per_second: 2048.0,
        });
        assert!(line.contains("50.0%"), "{line}");
        assert!(line.contains("2/4 chunks"), "{line}");
        assert!(line.contains("2.00 KB/s"), "{line}");
    }
}
