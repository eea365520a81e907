// ===============================
// src/recorder.rs
// ===============================
//
// Order audit trail as JSONL:
// - one AuditRecord per line, appended
// - BufWriter, flushed every second and every 100 records
// - parent directory created on open; a failed write reopens the file once
//
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Attempt,
    Success,
    Block,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub environment: String,
    pub action: AuditAction,
    pub symbol: String,
    pub side: String,
    pub kind: String,
    pub client_order_id: String,
    pub notional: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

const FLUSH_EVERY: u32 = 100;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Drains `rx` into `path` until every sender is gone.
pub async fn run(mut rx: mpsc::Receiver<AuditRecord>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(critical = true, %path, error = %e, "audit: cannot open file, audit records will only be logged");
            while let Some(rec) = rx.recv().await {
                info!(target: "audit", record = ?rec);
            }
            return;
        }
    };
    info!(%path, "audit: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(rec) = maybe else {
                    let _ = writer.flush().await;
                    info!("audit: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&rec) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "audit: serialize failed, record skipped");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(error = %e, "audit: write failed, reopening");
                    let retried = match open_writer(&path).await {
                        Ok(w) => {
                            writer = w;
                            write_line(&mut writer, &line).await
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e2) = retried {
                        error!(error = %e2, record = %line, "audit: write failed after reopen, record only logged");
                        continue;
                    }
                }
                since_flush += 1;
                if since_flush >= FLUSH_EVERY {
                    let _ = writer.flush().await;
                    since_flush = 0;
                }
            }
            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(action: AuditAction) -> AuditRecord {
        AuditRecord {
            at: Utc::now(),
            environment: "mainnet".into(),
            action,
            symbol: "NEWUSDT".into(),
            side: "BUY".into(),
            kind: "market".into(),
            client_order_id: "lb-1".into(),
            notional: 20.0,
            order_id: None,
            detail: None,
        }
    }

    #[tokio::test]
    async fn writes_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("orders.jsonl");
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run(rx, path.to_string_lossy().into_owned()));

        tx.send(rec(AuditAction::Attempt)).await.unwrap();
        let mut ok = rec(AuditAction::Success);
        ok.order_id = Some(9);
        tx.send(ok).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditRecord> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].action, AuditAction::Attempt);
        assert_eq!(lines[1].order_id, Some(9));
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert!(first.get("order_id").is_none());
        assert!(first.get("client_order_id").is_some());
    }
}
