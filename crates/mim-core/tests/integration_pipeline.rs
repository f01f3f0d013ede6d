//! End-to-end pipeline tests: intake through delivery with a scripted
//! outbound adapter and a fake encoder, over the local range server.

mod common;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::range_server;
use mim_core::config::IngestConfig;
use mim_core::events::InboundEvent;
use mim_core::failure::FailureClass;
use mim_core::fetcher::ProgressThrottle;
use mim_core::normalize::{Encoder, MediaProbe, NormalizeOutput};
use mim_core::outbox::{MediaAttributes, Outbox, OutboundFile, OutboxError, TargetRef};
use mim_core::paths::StateLayout;
use mim_core::pipeline::Pipeline;
use mim_core::task::MediaKind;
use std::io::Write;

/// One observed outbound send.
#[derive(Debug, Clone)]
struct SentMessage {
    kind: MediaKind,
    files: Vec<PathBuf>,
    caption: String,
    at: Instant,
}

/// Scripted failure applied to the next matching send.
enum ScriptStep {
    RateLimit(u64),
    /// Reject the next VIDEO send, naming its first file.
    MediaInvalidFirstVideo,
}

#[derive(Default)]
struct FakeOutbox {
    sent: Mutex<Vec<SentMessage>>,
    script: Mutex<VecDeque<ScriptStep>>,
    statuses: Mutex<Vec<String>>,
}

impl FakeOutbox {
    fn with_script(steps: Vec<ScriptStep>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            ..Default::default()
        }
    }

    fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn deliver(&self, kind: MediaKind, files: &[OutboundFile], caption: &str) -> Result<(), OutboxError> {
        {
            let mut script = self.script.lock().unwrap();
            let applies = match script.front() {
                Some(ScriptStep::RateLimit(_)) => true,
                Some(ScriptStep::MediaInvalidFirstVideo) => kind == MediaKind::Video,
                None => false,
            };
            if applies {
                match script.pop_front().unwrap() {
                    ScriptStep::RateLimit(wait_secs) => {
                        // The files must still exist at failure time.
                        for f in files {
                            assert!(f.path.exists(), "file deleted before send succeeded");
                        }
                        return Err(OutboxError::RateLimited { wait_secs });
                    }
                    ScriptStep::MediaInvalidFirstVideo => {
                        return Err(OutboxError::MediaInvalid {
                            files: vec![files[0].path.clone()],
                        });
                    }
                }
            }
        }
        for f in files {
            assert!(f.path.exists(), "sent file must exist on disk");
        }
        self.sent.lock().unwrap().push(SentMessage {
            kind,
            files: files.iter().map(|f| f.path.clone()).collect(),
            caption: caption.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl Outbox for FakeOutbox {
    async fn resolve_target(&self, handle: &str) -> Result<TargetRef, OutboxError> {
        Ok(TargetRef(handle.to_string()))
    }

    async fn send_album(
        &self,
        _target: &TargetRef,
        kind: MediaKind,
        files: &[OutboundFile],
        caption: &str,
    ) -> Result<(), OutboxError> {
        assert!(files.len() > 1, "albums carry more than one file");
        assert!(files.len() <= 10, "albums never exceed the platform cap");
        self.deliver(kind, files, caption)
    }

    async fn send_media(
        &self,
        _target: &TargetRef,
        file: &OutboundFile,
        caption: &str,
    ) -> Result<(), OutboxError> {
        self.deliver(file.kind, std::slice::from_ref(file), caption)
    }

    async fn send_status(&self, _target: &TargetRef, text: &str) -> Result<(), OutboxError> {
        self.statuses.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Encoder fake: every container probes as playable mp4/h264, and
/// "conversion" copies the input to the output.
struct FakeEncoder;

impl Encoder for FakeEncoder {
    fn probe(&self, _file: &Path) -> anyhow::Result<MediaProbe> {
        Ok(MediaProbe {
            container: "mov,mp4,m4a,3gp,3g2,mj2".into(),
            video_codec: Some("h264".into()),
            audio_codec: Some("aac".into()),
            width: Some(640),
            height: Some(480),
            duration_secs: Some(5.0),
        })
    }

    fn normalize(
        &self,
        input: &Path,
        output: &Path,
        _duration_hint: Option<f64>,
        _timeout: Duration,
        progress: &mut ProgressThrottle,
        _abort: Option<Arc<AtomicBool>>,
    ) -> Result<NormalizeOutput, FailureClass> {
        std::fs::copy(input, output)
            .map_err(|e| FailureClass::Unknown(format!("copy: {e}")))?;
        progress.finish(100, Some(100));
        Ok(NormalizeOutput {
            path: output.to_path_buf(),
            duration_secs: Some(5.0),
            width: Some(640),
            height: Some(480),
            thumbnail: None,
        })
    }
}

fn test_config() -> IngestConfig {
    let mut cfg = IngestConfig::default();
    cfg.free_space_floor = 0;
    cfg.snapshot_interval = 1;
    cfg.retry.base_seconds = 1;
    cfg
}

fn build_zip(dir: &Path, entries: &[(&str, &[u8])]) -> Vec<u8> {
    let path = dir.join("payload.zip");
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::<()>::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
    std::fs::read(&path).unwrap()
}

async fn run_until_drained(pipeline: &Pipeline, handles: Vec<tokio::task::JoinHandle<()>>) {
    tokio::time::timeout(Duration::from_secs(60), pipeline.drain())
        .await
        .expect("pipeline drained in time")
        .unwrap();
    pipeline.supervisor().request_shutdown();
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn archive_of_eleven_images_yields_full_album_plus_trailing_single() {
    let work = tempfile::tempdir().unwrap();
    let entries: Vec<(String, Vec<u8>)> = (0..11)
        .map(|i| (format!("photos/img-{i:02}.jpg"), format!("image-payload-{i}").into_bytes()))
        .collect();
    let mut zip_entries: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(n, d)| (n.as_str(), d.as_slice()))
        .collect();
    let readme = (String::from("readme.txt"), b"not media".to_vec());
    zip_entries.push((readme.0.as_str(), readme.1.as_slice()));
    let zip_bytes = build_zip(work.path(), &zip_entries);
    let zip_len = zip_bytes.len() as u64;
    let url = range_server::start(zip_bytes);

    let layout = StateLayout::at(work.path().join("state"));
    let outbox = Arc::new(FakeOutbox::default());
    let pipeline = Pipeline::restore(
        test_config(),
        layout.clone(),
        Arc::clone(&outbox) as Arc<dyn Outbox>,
        Arc::new(FakeEncoder),
    )
    .unwrap();
    let handles = pipeline.spawn();

    pipeline
        .on_message(InboundEvent::Document {
            name: "A.zip".into(),
            size: zip_len,
            mime: Some("application/zip".into()),
            fetch_url: url,
            source_ref: Some("msg:1".into()),
        })
        .unwrap();

    run_until_drained(&pipeline, handles).await;

    let sent = outbox.sent();
    assert_eq!(sent.len(), 2, "one full album plus the trailing single");
    assert_eq!(sent[0].files.len(), 10);
    assert_eq!(sent[0].kind, MediaKind::Image);
    assert!(sent[0].caption.contains("A.zip"));
    assert!(sent[0].caption.contains("Images"));
    assert!(sent[0].caption.contains("Batch 1/"));
    assert_eq!(sent[1].files.len(), 1);

    // Ordering follows the expander's yield order.
    let first_names: Vec<String> = sent[0]
        .files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(first_names[0].starts_with("img-00"));
    assert!(first_names[9].starts_with("img-09"));

    // Terminal cleanup: archive, extraction root, and manifests are gone.
    assert!(
        std::fs::read_dir(layout.download_dir()).unwrap().next().is_none(),
        "downloaded archive removed after the last batch"
    );
    assert!(
        std::fs::read_dir(layout.extraction_dir()).unwrap().next().is_none(),
        "extraction roots removed"
    );
    assert!(
        std::fs::read_dir(layout.manifest_dir()).unwrap().next().is_none(),
        "manifests removed"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resubmitting_the_same_archive_produces_no_new_uploads() {
    let work = tempfile::tempdir().unwrap();
    let zip_bytes = build_zip(
        work.path(),
        &[("a.jpg", b"one".as_slice()), ("b.jpg", b"two".as_slice())],
    );
    let zip_len = zip_bytes.len() as u64;
    let url = range_server::start(zip_bytes);

    let layout = StateLayout::at(work.path().join("state"));
    let outbox = Arc::new(FakeOutbox::default());
    let pipeline = Pipeline::restore(
        test_config(),
        layout,
        Arc::clone(&outbox) as Arc<dyn Outbox>,
        Arc::new(FakeEncoder),
    )
    .unwrap();
    let handles = pipeline.spawn();

    let event = InboundEvent::Document {
        name: "B.zip".into(),
        size: zip_len,
        mime: None,
        fetch_url: url,
        source_ref: Some("msg:2".into()),
    };
    pipeline.on_message(event.clone()).unwrap();
    tokio::time::timeout(Duration::from_secs(60), pipeline.drain())
        .await
        .unwrap()
        .unwrap();
    let after_first = outbox.sent().len();
    assert_eq!(after_first, 1, "two images form one album");

    // Same (name, size) again: intake skips it outright.
    pipeline.on_message(event).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    tokio::time::timeout(Duration::from_secs(30), pipeline.drain())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outbox.sent().len(), after_first, "no duplicate uploads");

    pipeline.supervisor().request_shutdown();
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limit_wait_is_honored_without_deleting_files() {
    let work = tempfile::tempdir().unwrap();
    let zip_bytes = build_zip(
        work.path(),
        &[
            ("x.jpg", b"xx".as_slice()),
            ("y.jpg", b"yy".as_slice()),
            ("z.jpg", b"zz".as_slice()),
        ],
    );
    let zip_len = zip_bytes.len() as u64;
    let url = range_server::start(zip_bytes);

    let layout = StateLayout::at(work.path().join("state"));
    let outbox = Arc::new(FakeOutbox::with_script(vec![ScriptStep::RateLimit(2)]));
    let pipeline = Pipeline::restore(
        test_config(),
        layout,
        Arc::clone(&outbox) as Arc<dyn Outbox>,
        Arc::new(FakeEncoder),
    )
    .unwrap();
    let handles = pipeline.spawn();

    let started = Instant::now();
    pipeline
        .on_message(InboundEvent::Document {
            name: "C.zip".into(),
            size: zip_len,
            mime: None,
            fetch_url: url,
            source_ref: Some("msg:3".into()),
        })
        .unwrap();

    run_until_drained(&pipeline, handles).await;

    let sent = outbox.sent();
    assert_eq!(sent.len(), 1, "the album eventually lands exactly once");
    assert_eq!(sent[0].files.len(), 3);
    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "delivery waited out the reported flood wait"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_media_splits_batch_and_defers_conversion() {
    let work = tempfile::tempdir().unwrap();
    let zip_bytes = build_zip(
        work.path(),
        &[
            ("p1.jpg", b"p1".as_slice()),
            ("p2.jpg", b"p2".as_slice()),
            ("v1.mp4", b"v1-bytes".as_slice()),
            ("v2.mp4", b"v2-bytes".as_slice()),
        ],
    );
    let zip_len = zip_bytes.len() as u64;
    let url = range_server::start(zip_bytes);

    let layout = StateLayout::at(work.path().join("state"));
    // First video album send is rejected, naming its first file.
    let outbox = Arc::new(FakeOutbox::with_script(vec![ScriptStep::MediaInvalidFirstVideo]));
    let pipeline = Pipeline::restore(
        test_config(),
        layout,
        Arc::clone(&outbox) as Arc<dyn Outbox>,
        Arc::new(FakeEncoder),
    )
    .unwrap();
    let handles = pipeline.spawn();

    pipeline
        .on_message(InboundEvent::Document {
            name: "D.zip".into(),
            size: zip_len,
            mime: None,
            fetch_url: url,
            source_ref: Some("msg:4".into()),
        })
        .unwrap();

    run_until_drained(&pipeline, handles).await;

    let sent = outbox.sent();
    // Expected successful sends: the image album, the surviving video, and
    // the converted (deferred) video. The rejected album attempt is not
    // recorded as sent.
    assert_eq!(sent.len(), 3, "split batch re-sends without failing");

    let image_sends: Vec<_> = sent.iter().filter(|s| s.kind == MediaKind::Image).collect();
    assert_eq!(image_sends.len(), 1);
    assert_eq!(image_sends[0].files.len(), 2);

    let video_sends: Vec<_> = sent.iter().filter(|s| s.kind == MediaKind::Video).collect();
    assert_eq!(video_sends.len(), 2, "survivor plus converted output");
    assert!(video_sends.iter().all(|s| s.files.len() == 1));
    assert!(
        video_sends
            .iter()
            .any(|s| s.files[0].to_string_lossy().contains(".norm.")),
        "the deferred conversion's output was uploaded"
    );

    // No send ever mixes kinds.
    for s in &sent {
        let kinds: std::collections::HashSet<MediaKind> = s
            .files
            .iter()
            .map(|p| MediaKind::from_filename(&p.file_name().unwrap().to_string_lossy()))
            .collect();
        assert_eq!(kinds.len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attributes_follow_media_kind() {
    // DirectUpload of a single video carries duration and dimensions from
    // the probe.
    let work = tempfile::tempdir().unwrap();
    let body = b"just-a-video".to_vec();
    let url = range_server::start(body);

    let layout = StateLayout::at(work.path().join("state"));
    let outbox = Arc::new(CapturingOutbox::default());
    let pipeline = Pipeline::restore(
        test_config(),
        layout,
        Arc::clone(&outbox) as Arc<dyn Outbox>,
        Arc::new(FakeEncoder),
    )
    .unwrap();
    let handles = pipeline.spawn();

    pipeline
        .on_message(InboundEvent::Media {
            kind: MediaKind::Video,
            name: "clip.mp4".into(),
            size: 12,
            fetch_url: url,
            source_ref: Some("msg:5".into()),
        })
        .unwrap();

    run_until_drained(&pipeline, handles).await;

    let attrs = outbox.attributes.lock().unwrap().clone();
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs[0].duration_secs, Some(5.0));
    assert_eq!(attrs[0].width, Some(640));
    assert_eq!(attrs[0].filename.as_deref(), Some("clip.mp4"));
}

/// Outbox that records full attributes for the attribute test.
#[derive(Default)]
struct CapturingOutbox {
    attributes: Mutex<Vec<MediaAttributes>>,
}

#[async_trait]
impl Outbox for CapturingOutbox {
    async fn resolve_target(&self, handle: &str) -> Result<TargetRef, OutboxError> {
        Ok(TargetRef(handle.to_string()))
    }

    async fn send_album(
        &self,
        _target: &TargetRef,
        _kind: MediaKind,
        files: &[OutboundFile],
        _caption: &str,
    ) -> Result<(), OutboxError> {
        let mut attrs = self.attributes.lock().unwrap();
        attrs.extend(files.iter().map(|f| f.attributes.clone()));
        Ok(())
    }

    async fn send_media(
        &self,
        _target: &TargetRef,
        file: &OutboundFile,
        _caption: &str,
    ) -> Result<(), OutboxError> {
        self.attributes.lock().unwrap().push(file.attributes.clone());
        Ok(())
    }

    async fn send_status(&self, _target: &TargetRef, _text: &str) -> Result<(), OutboxError> {
        Ok(())
    }
}
