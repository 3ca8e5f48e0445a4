use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use mediaframe::config::ServerSettings;
use mediaframe::modules::crypto::{decrypt_frame, encrypt_frame, SessionKey};
use mediaframe::modules::processor::{
    DurationProbe, MediaJob, MediaProcessor, ProcessedMedia, ProcessingError,
};
use mediaframe::modules::secure_keys::{parse_pem_public_key, wrap_session_key, ServerKeyPair};
use mediaframe::modules::transfer::request::RequestHeader;
use mediaframe::modules::transfer::{SessionOutcome, SessionState, TransferSession};

const CHUNK_SIZE: usize = 4096;

/// What the recording processor does when invoked.
enum Output {
    /// Write these bytes as the processed file.
    Bytes(Vec<u8>),
    /// Fail the way a crashed ffmpeg run does.
    ToolFailure,
    /// Claim success but point at a file that was never written.
    Missing,
}

/// Produces a canned [`Output`] and counts invocations.
struct RecordingProcessor {
    calls: AtomicUsize,
    output: Output,
}

impl RecordingProcessor {
    fn new(output: Output) -> Arc<Self> {
        Arc::new(RecordingProcessor {
            calls: AtomicUsize::new(0),
            output,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProcessor for RecordingProcessor {
    async fn process(
        &self,
        input: &Path,
        dir: &Path,
        job: &MediaJob,
    ) -> Result<ProcessedMedia, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stem = input.file_stem().unwrap().to_string_lossy().into_owned();
        let file_name = job.output_file_name(&stem);
        match &self.output {
            Output::Bytes(bytes) => {
                let path = dir.join(&file_name);
                tokio::fs::write(&path, bytes).await?;
                Ok(ProcessedMedia { file_name, path })
            }
            Output::ToolFailure => Err(ProcessingError::ToolFailed {
                tool: "ffmpeg".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "Invalid data found when processing input".to_string(),
            }),
            Output::Missing => {
                let path = dir.join("never-written").join(&file_name);
                Ok(ProcessedMedia { file_name, path })
            }
        }
    }
}

struct FixedDuration(Option<f64>);

#[async_trait]
impl DurationProbe for FixedDuration {
    async fn duration(&self, _path: &Path) -> Result<f64, ProcessingError> {
        self.0
            .ok_or_else(|| ProcessingError::Probe("no duration".to_string()))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    storage: std::path::PathBuf,
    keypair: Arc<ServerKeyPair>,
    processor: Arc<RecordingProcessor>,
}

impl Harness {
    fn new(output: Vec<u8>) -> Self {
        Self::with_output(Output::Bytes(output))
    }

    fn with_output(output: Output) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().to_path_buf();
        Harness {
            _dir: dir,
            storage,
            keypair: Arc::new(ServerKeyPair::generate_with_bits(1024).unwrap()),
            processor: RecordingProcessor::new(output),
        }
    }

    fn spawn_session(
        &self,
        probe: FixedDuration,
    ) -> (
        DuplexStream,
        tokio::task::JoinHandle<(SessionOutcome, SessionState)>,
    ) {
        let settings = Arc::new(ServerSettings {
            storage_dir: self.storage.clone(),
            chunk_size: CHUNK_SIZE,
            ..ServerSettings::default()
        });
        let mut session = TransferSession::new(
            self.keypair.clone(),
            self.processor.clone(),
            Arc::new(probe),
            settings,
        );
        let (client, server) = duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let outcome = session.handle_connection(server).await;
            (outcome, session.state())
        });
        (client, handle)
    }

    fn stored_files(&self) -> usize {
        std::fs::read_dir(&self.storage).unwrap().count()
    }
}

async fn write_prefixed<W: AsyncWrite + Unpin>(w: &mut W, blob: &[u8]) {
    w.write_all(&(blob.len() as u32).to_be_bytes()).await.unwrap();
    w.write_all(blob).await.unwrap();
}

async fn read_prefixed<R: AsyncRead + Unpin>(r: &mut R) -> Option<Vec<u8>> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await.ok()?;
    let mut blob = vec![0u8; u32::from_be_bytes(len) as usize];
    r.read_exact(&mut blob).await.ok()?;
    Some(blob)
}

/// Client side of the handshake; returns the established session key.
async fn client_handshake(stream: &mut DuplexStream) -> SessionKey {
    let client_keys = ServerKeyPair::generate_with_bits(1024).unwrap();
    write_prefixed(stream, client_keys.public_key_pem().as_bytes()).await;

    let server_pem = read_prefixed(stream).await.unwrap();
    let server_public = parse_pem_public_key(&server_pem).unwrap();
    let key = SessionKey::generate();
    let wrapped = wrap_session_key(&server_public, &key).unwrap();
    write_prefixed(stream, &wrapped).await;
    key
}

async fn send_sealed(stream: &mut DuplexStream, key: &SessionKey, plaintext: &[u8]) {
    let blob = encrypt_frame(plaintext, key).unwrap();
    stream.write_all(&blob).await.unwrap();
}

async fn send_request(
    stream: &mut DuplexStream,
    key: &SessionKey,
    params: &serde_json::Value,
    media_type: &str,
    file_size: u64,
) {
    let params = serde_json::to_vec(params).unwrap();
    send_raw_request(stream, key, &params, media_type, file_size).await;
}

async fn send_raw_request(
    stream: &mut DuplexStream,
    key: &SessionKey,
    params: &[u8],
    media_type: &str,
    file_size: u64,
) {
    let header = RequestHeader {
        json_size: params.len() as u16,
        media_type_len: media_type.len() as u8,
        file_size,
    };
    send_sealed(stream, key, &header.encode()).await;
    send_sealed(stream, key, params).await;
    send_sealed(stream, key, media_type.as_bytes()).await;
}

async fn send_upload(stream: &mut DuplexStream, key: &SessionKey, data: &[u8]) {
    for chunk in data.chunks(CHUNK_SIZE) {
        send_sealed(stream, key, chunk).await;
    }
}

async fn read_response_frame(stream: &mut DuplexStream, key: &SessionKey) -> Option<Vec<u8>> {
    let blob = read_prefixed(stream).await?;
    Some(decrypt_frame(&blob, key).unwrap())
}

async fn read_error(stream: &mut DuplexStream, key: &SessionKey) -> serde_json::Value {
    assert_eq!(read_response_frame(stream, key).await.unwrap(), vec![0x00]);
    serde_json::from_slice(&read_response_frame(stream, key).await.unwrap()).unwrap()
}

#[tokio::test]
async fn test_compress_end_to_end() {
    let output: Vec<u8> = (0..150_000u32).map(|i| (i % 253) as u8).collect();
    let harness = Harness::new(output.clone());
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let key = client_handshake(&mut client).await;
    let upload = vec![0x42u8; 1_000_000];
    send_request(&mut client, &key, &json!({"action": 1}), "mp4", upload.len() as u64).await;
    send_upload(&mut client, &key, &upload).await;

    assert_eq!(read_response_frame(&mut client, &key).await.unwrap(), vec![0x01]);
    let meta: serde_json::Value =
        serde_json::from_slice(&read_response_frame(&mut client, &key).await.unwrap()).unwrap();
    assert_eq!(meta["status_code"], "success");
    assert_eq!(meta["file_extension"], "mp4");
    assert_eq!(meta["file_size"], output.len() as u64);

    let mut chunks = Vec::new();
    while let Some(chunk) = read_response_frame(&mut client, &key).await {
        chunks.push(chunk);
    }
    assert_eq!(chunks.len(), output.len().div_ceil(CHUNK_SIZE));
    assert!(chunks.iter().all(|c| c.len() <= CHUNK_SIZE));
    assert_eq!(chunks.concat(), output);

    let (outcome, state) = session.await.unwrap();
    assert!(matches!(
        outcome,
        SessionOutcome::Completed { output_size } if output_size == output.len() as u64
    ));
    assert_eq!(state, SessionState::Closed);
    assert_eq!(harness.processor.calls(), 1);
    assert_eq!(harness.stored_files(), 0);
}

#[tokio::test]
async fn test_half_upload_reports_upload_error() {
    let harness = Harness::new(b"unused".to_vec());
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let key = client_handshake(&mut client).await;
    let upload = vec![7u8; 100_000];
    send_request(&mut client, &key, &json!({"action": 1}), "mp4", upload.len() as u64).await;
    send_upload(&mut client, &key, &upload[..50_000]).await;
    client.shutdown().await.unwrap();

    let error = read_error(&mut client, &key).await;
    assert_eq!(error["error_code"], "1001");
    assert!(read_response_frame(&mut client, &key).await.is_none());

    let (outcome, _) = session.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Reported(ref info) if info.error_code == "1001"));
    assert_eq!(harness.processor.calls(), 0);
    assert_eq!(harness.stored_files(), 0);
}

#[tokio::test]
async fn test_wrong_wrapping_key_sends_nothing_more() {
    let harness = Harness::new(b"unused".to_vec());
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let client_keys = ServerKeyPair::generate_with_bits(1024).unwrap();
    write_prefixed(&mut client, client_keys.public_key_pem().as_bytes()).await;
    let server_pem = read_prefixed(&mut client).await.unwrap();
    assert!(String::from_utf8(server_pem).unwrap().starts_with("-----BEGIN PUBLIC KEY-----"));

    // wrapped for the client's own key instead of the server's
    let wrapped = wrap_session_key(&client_keys.public_key(), &SessionKey::generate()).unwrap();
    write_prefixed(&mut client, &wrapped).await;

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let (outcome, state) = session.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Aborted(_)));
    assert_eq!(state, SessionState::Closed);
}

#[tokio::test]
async fn test_zero_file_size_rejected_before_upload() {
    let harness = Harness::new(b"unused".to_vec());
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let key = client_handshake(&mut client).await;
    let header = RequestHeader {
        json_size: 12,
        media_type_len: 3,
        file_size: 0,
    };
    send_sealed(&mut client, &key, &header.encode()).await;

    let error = read_error(&mut client, &key).await;
    assert_eq!(error["error_code"], "1000");
    assert!(error["description"].as_str().unwrap().contains("Invalid file size"));

    session.await.unwrap();
    assert_eq!(harness.processor.calls(), 0);
}

#[tokio::test]
async fn test_clip_past_duration_is_rejected() {
    let harness = Harness::new(b"unused".to_vec());
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(30.0)));

    let key = client_handshake(&mut client).await;
    let params = json!({"action": 5, "extension": "mp4", "startseconds": 10.0, "endseconds": 45.5});
    let upload = vec![1u8; 10_000];
    send_request(&mut client, &key, &params, "mp4", upload.len() as u64).await;
    send_upload(&mut client, &key, &upload).await;

    let error = read_error(&mut client, &key).await;
    assert_eq!(error["error_code"], "1007");

    session.await.unwrap();
    assert_eq!(harness.processor.calls(), 0);
    assert_eq!(harness.stored_files(), 0);
}

#[tokio::test]
async fn test_failed_duration_lookup_reports_clip_error() {
    let harness = Harness::new(b"unused".to_vec());
    let (mut client, session) = harness.spawn_session(FixedDuration(None));

    let key = client_handshake(&mut client).await;
    let params = json!({"action": 5, "extension": "mp4", "startseconds": 0.0, "endseconds": 5.0});
    send_request(&mut client, &key, &params, "mp4", 100).await;
    send_upload(&mut client, &key, &[0u8; 100]).await;

    let error = read_error(&mut client, &key).await;
    assert_eq!(error["error_code"], "1006");

    session.await.unwrap();
    assert_eq!(harness.processor.calls(), 0);
}

#[tokio::test]
async fn test_unknown_action_is_invalid_request() {
    let harness = Harness::new(b"unused".to_vec());
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let key = client_handshake(&mut client).await;
    // several times the pipe capacity, so it only gets through if the
    // session keeps reading the upload
    let upload = vec![4u8; 300_000];
    send_request(&mut client, &key, &json!({"action": 9}), "mp4", upload.len() as u64).await;
    tokio::time::timeout(Duration::from_secs(10), send_upload(&mut client, &key, &upload))
        .await
        .expect("upload was not consumed");

    let error = read_error(&mut client, &key).await;
    assert_eq!(error["error_code"], "1000");
    assert!(error["description"].as_str().unwrap().contains("unsupported action"));

    let (outcome, _) = session.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Reported(ref info) if info.error_code == "1000"));
    assert_eq!(harness.processor.calls(), 0);
    assert_eq!(harness.stored_files(), 0);
}

#[tokio::test]
async fn test_malformed_parameters_after_full_upload() {
    let harness = Harness::new(b"unused".to_vec());
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let key = client_handshake(&mut client).await;
    let upload = vec![6u8; 10_000];
    send_raw_request(&mut client, &key, b"{\"action\":", "mp4", upload.len() as u64).await;
    send_upload(&mut client, &key, &upload).await;

    let error = read_error(&mut client, &key).await;
    assert_eq!(error["error_code"], "1000");
    assert!(error["description"].as_str().unwrap().contains("malformed parameters"));

    session.await.unwrap();
    assert_eq!(harness.processor.calls(), 0);
    assert_eq!(harness.stored_files(), 0);
}

#[tokio::test]
async fn test_invalid_resolution_uses_action_code() {
    let harness = Harness::new(b"unused".to_vec());
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let key = client_handshake(&mut client).await;
    let params = json!({"action": 2, "resolution": "8K"});
    let upload = vec![2u8; 1_000];
    send_request(&mut client, &key, &params, "mp4", upload.len() as u64).await;
    send_upload(&mut client, &key, &upload).await;

    let error = read_error(&mut client, &key).await;
    assert_eq!(error["error_code"], "1003");
    assert_eq!(
        error["solution"],
        "Please verify that FFmpeg is properly installed."
    );

    session.await.unwrap();
    assert_eq!(harness.processor.calls(), 0);
    assert_eq!(harness.stored_files(), 0);
}

#[tokio::test]
async fn test_processor_failure_reports_action_code() {
    let harness = Harness::with_output(Output::ToolFailure);
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let key = client_handshake(&mut client).await;
    let params = json!({"action": 3, "aspect_ratio": "16:9"});
    let upload = vec![8u8; 20_000];
    send_request(&mut client, &key, &params, "mp4", upload.len() as u64).await;
    send_upload(&mut client, &key, &upload).await;

    let error = read_error(&mut client, &key).await;
    assert_eq!(error["error_code"], "1004");
    let description = error["description"].as_str().unwrap();
    assert!(description.starts_with("Error during video aspect ratio change"));
    assert!(description.contains("ffmpeg exited"));
    assert_eq!(
        error["solution"],
        "Please check the uploaded video and try uploading and processing again. If the issue persists, contact the administrator."
    );
    assert!(read_response_frame(&mut client, &key).await.is_none());

    let (outcome, state) = session.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Reported(ref info) if info.error_code == "1004"));
    assert_eq!(state, SessionState::Closed);
    assert_eq!(harness.processor.calls(), 1);
    assert_eq!(harness.stored_files(), 0);
}

#[tokio::test]
async fn test_tampered_upload_chunk_reports_upload_error() {
    let harness = Harness::new(b"unused".to_vec());
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let key = client_handshake(&mut client).await;
    let upload = vec![5u8; 3 * CHUNK_SIZE];
    send_request(&mut client, &key, &json!({"action": 1}), "mp4", upload.len() as u64).await;
    for (i, chunk) in upload.chunks(CHUNK_SIZE).enumerate() {
        let mut blob = encrypt_frame(chunk, &key).unwrap();
        if i == 1 {
            blob[40] ^= 0x01;
        }
        client.write_all(&blob).await.unwrap();
    }

    let error = read_error(&mut client, &key).await;
    assert_eq!(error["error_code"], "1001");
    assert!(error["description"]
        .as_str()
        .unwrap()
        .starts_with("Error during file storage"));
    assert!(read_response_frame(&mut client, &key).await.is_none());

    let (outcome, _) = session.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Reported(ref info) if info.error_code == "1001"));
    assert_eq!(harness.processor.calls(), 0);
    assert_eq!(harness.stored_files(), 0);
}

#[tokio::test]
async fn test_unreadable_output_reports_transmission_error() {
    let harness = Harness::with_output(Output::Missing);
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let key = client_handshake(&mut client).await;
    let upload = vec![1u8; 5_000];
    send_request(&mut client, &key, &json!({"action": 1}), "mp4", upload.len() as u64).await;
    send_upload(&mut client, &key, &upload).await;

    // the error replaces the success status; nothing else precedes it
    let error = read_error(&mut client, &key).await;
    assert_eq!(error["error_code"], "1008");
    assert!(error["description"]
        .as_str()
        .unwrap()
        .starts_with("File transmission error"));
    assert_eq!(error["solution"], "Please check your network connection.");
    assert!(read_response_frame(&mut client, &key).await.is_none());

    let (outcome, state) = session.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Reported(ref info) if info.error_code == "1008"));
    assert_eq!(state, SessionState::Closed);
    assert_eq!(harness.processor.calls(), 1);
    assert_eq!(harness.stored_files(), 0);
}

#[tokio::test]
async fn test_audio_conversion_output_extension() {
    let harness = Harness::new(vec![9u8; 5000]);
    let (mut client, session) = harness.spawn_session(FixedDuration(Some(60.0)));

    let key = client_handshake(&mut client).await;
    let upload = vec![3u8; 9000];
    send_request(&mut client, &key, &json!({"action": 4}), "mov", upload.len() as u64).await;
    send_upload(&mut client, &key, &upload).await;

    assert_eq!(read_response_frame(&mut client, &key).await.unwrap(), vec![0x01]);
    let meta: serde_json::Value =
        serde_json::from_slice(&read_response_frame(&mut client, &key).await.unwrap()).unwrap();
    assert_eq!(meta["file_extension"], "mp3");
    assert_eq!(meta["file_size"], 5000);

    let mut total = 0;
    while let Some(chunk) = read_response_frame(&mut client, &key).await {
        total += chunk.len();
    }
    assert_eq!(total, 5000);
    session.await.unwrap();
}
