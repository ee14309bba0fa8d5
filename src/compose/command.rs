//! Composer backed by image search and an external render command.
//!
//! One attempt:
//! 1. Pick a source: the request's hint, or the first search hit that is not
//!    excluded and downloads cleanly (image content type, under the source
//!    byte ceiling)
//! 2. Run the render command with `{input}`, `{output}`, `{caption}` filled in
//! 3. Classify: missing output is transient, output over the artifact
//!    ceiling is too large, anything else is a success

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::process::Command;

use super::{CaptionStyle, ComposeConfig, Composer};
use crate::domain::{Artifact, ComposeAttemptResult, ComposeRequest};
use crate::error::{AkariError, Result};
use crate::search::ImageProvider;

/// Stable file stem for a phrase.
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

pub struct CommandComposer {
    provider: Arc<dyn ImageProvider>,
    client: Client,
    caption_style: CaptionStyle,
    config: ComposeConfig,
    work_dir: PathBuf,
    /// Per-attempt suffix; concurrent composes of one phrase never share files
    sequence: AtomicU64,
}

impl CommandComposer {
    pub fn new(provider: Arc<dyn ImageProvider>, config: ComposeConfig, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = work_dir.into();
        std::fs::create_dir_all(&work_dir)?;

        if config.render_command.is_empty() {
            return Err(AkariError::Config("compose.render_command is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(config.attempt_timeout())
            .build()
            .map_err(|e| AkariError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            provider,
            client,
            caption_style: config.caption_style,
            config,
            work_dir,
            sequence: AtomicU64::new(0),
        })
    }

    /// File stem for one attempt at `text`.
    fn attempt_stem(&self, text: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("image_{}-{}-{}", text_hash(text), std::process::id(), n)
    }

    fn input_path(&self, stem: &str) -> PathBuf {
        self.work_dir.join(format!("{}-original", stem))
    }

    fn output_path(&self, stem: &str) -> PathBuf {
        self.work_dir
            .join(format!("{}-akari.{}", stem, self.config.output_extension))
    }

    /// Find and fetch a usable source image. Returns its URL.
    async fn acquire_source(&self, request: &ComposeRequest, dest: &Path) -> Option<String> {
        if let Some(hint) = &request.source_hint {
            // hints come from inbound posts; only provider hits may be local
            if !is_remote(hint) {
                log::warn!("Refusing non-http source hint {}", hint);
                return None;
            }
            return match self.fetch(hint, None, dest).await {
                Ok(()) => Some(hint.clone()),
                Err(e) => {
                    log::warn!("Could not fetch hinted source {}: {}", hint, e);
                    None
                }
            };
        }

        let hits = self.provider.search(&request.text).await;
        for hit in hits.iter().filter(|h| !request.is_excluded(&h.image_url)) {
            match self.fetch(&hit.image_url, Some(&hit.source_url), dest).await {
                Ok(()) => return Some(hit.image_url.clone()),
                Err(e) => log::info!("Skipping {}: {}", hit.image_url, e),
            }
        }
        None
    }

    /// Copy a source into `dest`. `http(s)` URLs are downloaded with a faked
    /// Referer; anything else is treated as a local path.
    async fn fetch(&self, url: &str, referer: Option<&str>, dest: &Path) -> Result<()> {
        if !is_remote(url) {
            let size = tokio::fs::metadata(url).await?.len();
            if size > self.config.max_source_bytes {
                return Err(AkariError::Search(format!("source is {} bytes", size)));
            }
            tokio::fs::copy(url, dest).await?;
            return Ok(());
        }

        let mut get = self.client.get(url);
        if let Some(referer) = referer.filter(|r| !r.is_empty()) {
            get = get.header(reqwest::header::REFERER, referer);
        }
        let response = get
            .send()
            .await
            .map_err(|e| AkariError::Search(format!("download failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AkariError::Search(format!("download returned {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(AkariError::Search(format!("not an image ({})", content_type)));
        }

        if let Some(length) = response.content_length()
            && length > self.config.max_source_bytes
        {
            return Err(AkariError::Search(format!("source is {} bytes", length)));
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AkariError::Search(format!("download failed: {}", e)))?;
            body.extend_from_slice(&chunk);
            if body.len() as u64 > self.config.max_source_bytes {
                return Err(AkariError::Search("source exceeds byte ceiling".to_string()));
            }
        }

        tokio::fs::write(dest, &body).await?;
        Ok(())
    }

    fn render_args(&self, input: &Path, output: &Path, caption: &str) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.config
            .render_command
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{caption}", caption)
            })
            .collect()
    }

    async fn render(&self, args: &[String]) -> std::result::Result<(), String> {
        let (program, rest) = args.split_first().ok_or_else(|| "empty render command".to_string())?;
        let output = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first = stderr.lines().next().unwrap_or_default();
            return Err(format!("{} exited with {:?}: {}", program, output.status.code(), first));
        }
        Ok(())
    }
}

#[async_trait]
impl Composer for CommandComposer {
    async fn compose(&self, request: &ComposeRequest) -> ComposeAttemptResult {
        let stem = self.attempt_stem(&request.text);
        let input = self.input_path(&stem);
        let output = self.output_path(&stem);

        let Some(source) = self.acquire_source(request, &input).await else {
            let _ = tokio::fs::remove_file(&input).await;
            return ComposeAttemptResult::NoSourceAvailable;
        };

        let caption = self.caption_style.render(&request.text);
        let args = self.render_args(&input, &output, &caption);
        let rendered = self.render(&args).await;
        let _ = tokio::fs::remove_file(&input).await;
        if let Err(reason) = rendered {
            let _ = tokio::fs::remove_file(&output).await;
            return ComposeAttemptResult::TransientToolFailure(reason);
        }

        let bytes = match tokio::fs::metadata(&output).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => {
                return ComposeAttemptResult::TransientToolFailure(format!(
                    "renderer produced no output at {}",
                    output.display()
                ));
            }
        };

        if bytes > self.config.max_artifact_bytes {
            let _ = tokio::fs::remove_file(&output).await;
            return ComposeAttemptResult::TooLarge { source };
        }

        ComposeAttemptResult::Success(Artifact {
            path: output,
            caption,
            source: Some(source),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ImageHit;
    use tempfile::TempDir;

    struct StaticProvider {
        hits: Vec<ImageHit>,
    }

    #[async_trait]
    impl ImageProvider for StaticProvider {
        async fn search(&self, _text: &str) -> Vec<ImageHit> {
            self.hits.clone()
        }

        fn name(&self) -> &'static str {
            "static"
        }
    }

    fn write_source(dir: &Path, name: &str, bytes: usize) -> String {
        let path = dir.join(name);
        std::fs::write(&path, vec![b'x'; bytes]).unwrap();
        path.to_string_lossy().to_string()
    }

    fn composer(temp: &TempDir, hits: Vec<ImageHit>, command: &[&str], max_artifact_bytes: u64) -> CommandComposer {
        let config = ComposeConfig {
            render_command: command.iter().map(|s| s.to_string()).collect(),
            max_artifact_bytes,
            caption_style: CaptionStyle::Plain,
            ..Default::default()
        };
        CommandComposer::new(Arc::new(StaticProvider { hits }), config, temp.path().join("images")).unwrap()
    }

    #[test]
    fn test_text_hash_is_stable_hex() {
        let hash = text_hash("cats");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, text_hash("cats"));
        assert_ne!(hash, text_hash("dogs"));
    }

    #[test]
    fn test_new_rejects_empty_command() {
        let temp = TempDir::new().unwrap();
        let config = ComposeConfig {
            render_command: Vec::new(),
            ..Default::default()
        };
        let result = CommandComposer::new(Arc::new(StaticProvider { hits: vec![] }), config, temp.path());
        assert!(matches!(result, Err(AkariError::Config(_))));
    }

    #[tokio::test]
    async fn test_no_hits_is_no_source() {
        let temp = TempDir::new().unwrap();
        let composer = composer(&temp, vec![], &["cp", "{input}", "{output}"], 1024);
        let result = composer.compose(&ComposeRequest::new("cats")).await;
        assert_eq!(result, ComposeAttemptResult::NoSourceAvailable);
    }

    #[tokio::test]
    async fn test_success_copies_through_render_command() {
        let temp = TempDir::new().unwrap();
        let source = write_source(temp.path(), "cat.jpg", 100);
        let composer = composer(&temp, vec![ImageHit::new(&source, "")], &["cp", "{input}", "{output}"], 1024);

        match composer.compose(&ComposeRequest::new("cats")).await {
            ComposeAttemptResult::Success(artifact) => {
                assert_eq!(artifact.bytes, 100);
                assert_eq!(artifact.caption, "cats");
                assert_eq!(artifact.source.as_deref(), Some(source.as_str()));
                assert!(artifact.path.exists());
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_output_is_transient() {
        let temp = TempDir::new().unwrap();
        let source = write_source(temp.path(), "cat.jpg", 100);
        let composer = composer(&temp, vec![ImageHit::new(&source, "")], &["true", "{input}"], 1024);

        let result = composer.compose(&ComposeRequest::new("cats")).await;
        assert!(matches!(result, ComposeAttemptResult::TransientToolFailure(_)));
    }

    #[tokio::test]
    async fn test_failing_command_is_transient() {
        let temp = TempDir::new().unwrap();
        let source = write_source(temp.path(), "cat.jpg", 100);
        let composer = composer(&temp, vec![ImageHit::new(&source, "")], &["false"], 1024);

        let result = composer.compose(&ComposeRequest::new("cats")).await;
        assert!(matches!(result, ComposeAttemptResult::TransientToolFailure(_)));
    }

    #[tokio::test]
    async fn test_oversized_output_names_source() {
        let temp = TempDir::new().unwrap();
        let big = write_source(temp.path(), "big.jpg", 4096);
        let small = write_source(temp.path(), "small.jpg", 10);
        let composer = composer(
            &temp,
            vec![ImageHit::new(&big, ""), ImageHit::new(&small, "")],
            &["cp", "{input}", "{output}"],
            1024,
        );

        let mut request = ComposeRequest::new("cats");
        let first = composer.compose(&request).await;
        assert_eq!(first, ComposeAttemptResult::TooLarge { source: big.clone() });

        request.excluded_sources.push(big);
        request.attempt = 2;
        let second = composer.compose(&request).await;
        assert!(second.is_success());
    }

    #[tokio::test]
    async fn test_local_path_hint_is_refused() {
        let temp = TempDir::new().unwrap();
        let secret = write_source(temp.path(), "secret.txt", 50);
        let searchable = write_source(temp.path(), "cat.jpg", 50);
        let composer = composer(&temp, vec![ImageHit::new(&searchable, "")], &["cp", "{input}", "{output}"], 1024);

        let request = ComposeRequest::new("cats").with_source_hint(Some(secret));
        assert_eq!(composer.compose(&request).await, ComposeAttemptResult::NoSourceAvailable);

        let mut leaked = std::fs::read_dir(temp.path().join("images")).unwrap();
        assert!(leaked.next().is_none());
    }

    #[tokio::test]
    async fn test_file_url_hint_is_refused() {
        let temp = TempDir::new().unwrap();
        let composer = composer(&temp, vec![], &["cp", "{input}", "{output}"], 1024);
        let request = ComposeRequest::new("cats").with_source_hint(Some("file:///etc/passwd".to_string()));
        assert_eq!(composer.compose(&request).await, ComposeAttemptResult::NoSourceAvailable);
    }

    #[tokio::test]
    async fn test_repeated_phrase_keeps_earlier_artifact() {
        let temp = TempDir::new().unwrap();
        let source = write_source(temp.path(), "sushi.jpg", 100);
        let composer = composer(&temp, vec![ImageHit::new(&source, "")], &["cp", "{input}", "{output}"], 1024);

        let first = match composer.compose(&ComposeRequest::new("sushi")).await {
            ComposeAttemptResult::Success(artifact) => artifact,
            other => panic!("expected success, got {:?}", other),
        };
        let second = match composer.compose(&ComposeRequest::new("sushi")).await {
            ComposeAttemptResult::Success(artifact) => artifact,
            other => panic!("expected success, got {:?}", other),
        };

        assert_ne!(first.path, second.path);
        assert!(first.path.exists());
        assert!(second.path.exists());
    }

    #[tokio::test]
    async fn test_concurrent_same_phrase_renders_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let source = write_source(temp.path(), "sushi.jpg", 100);
        let composer = composer(
            &temp,
            vec![ImageHit::new(&source, "")],
            &["sh", "-c", "sleep 0.2 && cp \"$0\" \"$1\"", "{input}", "{output}"],
            1024,
        );

        let request = ComposeRequest::new("sushi");
        let (a, b) = tokio::join!(composer.compose(&request), composer.compose(&request));
        match (a, b) {
            (ComposeAttemptResult::Success(a), ComposeAttemptResult::Success(b)) => {
                assert_ne!(a.path, b.path);
                assert_eq!(std::fs::metadata(&a.path).unwrap().len(), 100);
                assert_eq!(std::fs::metadata(&b.path).unwrap().len(), 100);
            }
            other => panic!("expected two successes, got {:?}", other),
        }
    }

    #[test]
    fn test_render_args_substitution() {
        let temp = TempDir::new().unwrap();
        let composer = composer(&temp, vec![], &["render", "-i", "{input}", "--text={caption}", "{output}"], 1024);
        let args = composer.render_args(Path::new("/in"), Path::new("/out.png"), "hello world");
        assert_eq!(args, vec!["render", "-i", "/in", "--text=hello world", "/out.png"]);
    }
}
