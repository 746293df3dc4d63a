//! Streamed file downloads with transfer-progress events.
//!
//! Possession of a file id is the capability; the record resolves to a
//! path on this node's filesystem and the content is streamed straight
//! from disk. The stream publishes a throttled `file_transfer` event
//! while bytes move and exactly one terminal event when it stops.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::stream::Stream;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;
use uuid::Uuid;

use cyberchat_shared::constants::PROGRESS_THROTTLE;
use cyberchat_store::FileRecord;

use crate::events::{Event, EventBus, FileTransferPayload};

const CHUNK_SIZE: usize = 64 * 1024;

/// Progress-tracking state for one download. Emits `starting` up
/// front, throttled `transferring` events while reading, and exactly
/// one terminal event: `completed`, `failed`, or (via `Drop`) an
/// aborted-transfer failure when the client goes away mid-stream.
pub struct Transfer {
    bus: Arc<EventBus>,
    file_id: Uuid,
    filename: String,
    size: i64,
    client_ip: String,
    transfer_id: Uuid,
    started: Instant,
    start_time: i64,
    throttle: Duration,
    bytes_read: u64,
    last_emit: Instant,
    finished: bool,
}

impl Transfer {
    pub fn new(bus: Arc<EventBus>, record: &FileRecord, client_ip: String) -> Self {
        Self::with_throttle(bus, record, client_ip, PROGRESS_THROTTLE)
    }

    pub fn with_throttle(
        bus: Arc<EventBus>,
        record: &FileRecord,
        client_ip: String,
        throttle: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            bus,
            file_id: record.file_id,
            filename: record.filename.clone(),
            size: record.size,
            client_ip,
            transfer_id: Uuid::new_v4(),
            started: now,
            start_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64,
            throttle,
            bytes_read: 0,
            last_emit: now,
            finished: false,
        }
    }

    fn payload(&self, status: &str) -> FileTransferPayload {
        FileTransferPayload {
            file_id: self.file_id,
            filename: self.filename.clone(),
            size: self.size,
            client_ip: self.client_ip.clone(),
            status: status.into(),
            progress: None,
            bytes_read: None,
            speed: None,
            transfer_id: self.transfer_id,
            start_time: self.start_time,
            duration: None,
            avg_speed: None,
            error: None,
        }
    }

    fn percent(&self) -> u8 {
        if self.size <= 0 {
            return 100;
        }
        ((self.bytes_read as f64 / self.size as f64) * 100.0).min(100.0) as u8
    }

    fn speed(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.bytes_read as f64 / elapsed
    }

    pub fn emit_starting(&self) {
        let mut payload = self.payload("starting");
        payload.progress = Some(0);
        self.bus.publish(&Event::FileTransfer(payload));
    }

    fn on_chunk(&mut self, len: usize) {
        self.bytes_read += len as u64;
        if self.last_emit.elapsed() < self.throttle {
            return;
        }
        self.last_emit = Instant::now();

        let mut payload = self.payload("transferring");
        payload.progress = Some(self.percent());
        payload.bytes_read = Some(self.bytes_read);
        payload.speed = Some(self.speed());
        self.bus.publish(&Event::FileTransfer(payload));
    }

    fn emit_completed(&mut self) {
        self.finished = true;
        let duration = self.started.elapsed().as_secs_f64();
        let mut payload = self.payload("completed");
        payload.duration = Some(duration);
        payload.avg_speed = Some(if duration > 0.0 {
            self.bytes_read as f64 / duration
        } else {
            0.0
        });
        self.bus.publish(&Event::FileTransfer(payload));
    }

    fn emit_failed(&mut self, error: &str) {
        self.finished = true;
        let mut payload = self.payload("failed");
        payload.error = Some(error.to_string());
        self.bus.publish(&Event::FileTransfer(payload));
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if !self.finished {
            debug!(transfer = %self.transfer_id, "transfer aborted by client");
            self.emit_failed("transfer aborted");
        }
    }
}

/// Chunked read stream over the file, driving the transfer state.
pub fn transfer_stream(
    file: File,
    transfer: Transfer,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    futures::stream::unfold((file, transfer), |(mut file, mut transfer)| async move {
        if transfer.finished {
            return None;
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => {
                transfer.emit_completed();
                None
            }
            Ok(n) => {
                buf.truncate(n);
                transfer.on_chunk(n);
                Some((Ok(Bytes::from(buf)), (file, transfer)))
            }
            Err(e) => {
                transfer.emit_failed(&e.to_string());
                Some((Err(e), (file, transfer)))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use std::io::Write;
    use tokio::sync::mpsc;

    fn record(path: &std::path::Path, size: i64) -> FileRecord {
        FileRecord {
            file_id: Uuid::new_v4(),
            sender_guid: Uuid::new_v4(),
            receiver_guid: None,
            filename: "blob.bin".into(),
            path: path.display().to_string(),
            size,
            mime_type: "application/octet-stream".into(),
            created_at: Utc::now(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(value["type"], "file_transfer");
            events.push(value["content"].clone());
        }
        events
    }

    #[tokio::test]
    async fn test_stream_event_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let content = vec![0xA5u8; 256 * 1024];
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&content)
            .unwrap();

        let bus = Arc::new(EventBus::new());
        let (_session, mut rx) = bus.register();

        let record = record(&path, content.len() as i64);
        // Zero throttle so every chunk reports progress.
        let transfer = Transfer::with_throttle(
            bus.clone(),
            &record,
            "127.0.0.1".into(),
            Duration::ZERO,
        );
        transfer.emit_starting();

        let file = File::open(&path).await.unwrap();
        let streamed: Vec<u8> = transfer_stream(file, transfer)
            .map(|chunk| chunk.unwrap())
            .collect::<Vec<Bytes>>()
            .await
            .concat();
        assert_eq!(streamed, content);

        let events = drain(&mut rx);
        assert_eq!(events.first().unwrap()["status"], "starting");
        assert_eq!(events.last().unwrap()["status"], "completed");

        let transferring: Vec<_> = events
            .iter()
            .filter(|e| e["status"] == "transferring")
            .collect();
        assert!(!transferring.is_empty());

        // Progress is monotonically non-decreasing and ends at 100%.
        let mut last = 0;
        for event in &transferring {
            let p = event["progress"].as_u64().unwrap();
            assert!(p >= last);
            last = p;
        }

        let completed = events.last().unwrap();
        assert!(completed["duration"].as_f64().unwrap() >= 0.0);
        assert!(completed["avg_speed"].as_f64().unwrap() > 0.0);

        // Exactly one terminal event.
        let terminal = events
            .iter()
            .filter(|e| e["status"] == "completed" || e["status"] == "failed")
            .count();
        assert_eq!(terminal, 1);
    }

    #[tokio::test]
    async fn test_abort_emits_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![1u8; 200 * 1024]).unwrap();

        let bus = Arc::new(EventBus::new());
        let (_session, mut rx) = bus.register();

        let record = record(&path, 200 * 1024);
        let transfer =
            Transfer::with_throttle(bus.clone(), &record, "127.0.0.1".into(), Duration::ZERO);
        transfer.emit_starting();

        let file = File::open(&path).await.unwrap();
        let mut stream = Box::pin(transfer_stream(file, transfer));
        // Client reads one chunk, then disconnects.
        let _ = stream.next().await;
        drop(stream);

        let events = drain(&mut rx);
        let last = events.last().unwrap();
        assert_eq!(last["status"], "failed");
        assert_eq!(last["error"], "transfer aborted");
    }
}
