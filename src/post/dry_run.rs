//! Poster that only logs.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::{PostError, PostPayload, Poster};

/// Logs each payload, keeps a copy, and hands back a synthetic URL.
#[derive(Debug, Default)]
pub struct DryRunPoster {
    next_id: AtomicU64,
    posted: Mutex<Vec<PostPayload>>,
}

impl DryRunPoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything posted so far, oldest first.
    pub fn posted(&self) -> Vec<PostPayload> {
        self.posted.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Poster for DryRunPoster {
    async fn post(&self, payload: &PostPayload) -> Result<String, PostError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!(
            "[dry-run] post #{} text={:?} media={:?} reply_to={:?}",
            id,
            payload.text,
            payload.media,
            payload.in_reply_to
        );
        self.posted
            .lock()
            .map_err(|e| PostError::Fatal(e.to_string()))?
            .push(payload.clone());
        Ok(format!("dry-run://post/{}", id))
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}
