//! Per-connection session state machine.
//!
//! One session serves exactly one request:
//! handshake, header, parameters and media type, upload, processing,
//! then a single success or error response. The parameters are only
//! interpreted once the whole upload is in. Stored files are removed and
//! the connection is closed on every path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};

use super::channel::FrameChannel;
use super::error::{ErrorCode, ErrorInfo, SessionError};
use super::handshake::perform_handshake;
use super::request::{parse_media_type, RequestHeader, REQUEST_HEADER_SIZE};
use super::response::{ResponseSender, SendFailure};
use super::storage::UploadStore;
use super::upload::UploadReceiver;
use crate::config::{log_timing, ServerSettings};
use crate::modules::crypto::SessionKey;
use crate::modules::processor::{
    DurationProbe, JobError, MediaAction, MediaJob, MediaProcessor, RequestParams,
};
use crate::modules::secure_keys::ServerKeyPair;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    AwaitingHeader,
    AwaitingParamsAndType,
    ReceivingUpload,
    Dispatching,
    RespondingSuccess,
    RespondingError,
    CleaningUp,
    Closed,
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The processed file was delivered in full.
    Completed { output_size: u64 },
    /// An error report was delivered.
    Reported(ErrorInfo),
    /// The connection was dropped without a response.
    Aborted(SessionError),
}

/// Why the session stopped short of success.
enum Failure {
    /// A response was partly written; the stream cannot carry a report.
    Silent(SessionError),
    /// Try to deliver this report, then close.
    Report(ErrorInfo),
}

/// Anything that goes wrong while reading the request is reported as an
/// invalid request, including a peer that stopped sending.
impl From<SessionError> for Failure {
    fn from(e: SessionError) -> Self {
        Failure::Report(ErrorInfo::new(ErrorCode::InvalidRequest, e))
    }
}

impl From<JobError> for Failure {
    fn from(e: JobError) -> Self {
        let code = match &e {
            JobError::UnknownAction(_) => ErrorCode::InvalidRequest,
            JobError::InvalidField { action, .. } => action_error_code(*action),
        };
        Failure::Report(ErrorInfo::new(code, e))
    }
}

/// Decode the parameters JSON into a validated job.
fn parse_job(params_json: &[u8]) -> Result<MediaJob, Failure> {
    let params = RequestParams::from_json(params_json).map_err(|e| {
        Failure::Report(ErrorInfo::new(
            ErrorCode::InvalidRequest,
            format!("malformed parameters: {}", e),
        ))
    })?;
    Ok(MediaJob::from_params(&params)?)
}

/// Error code reported when `action` fails.
pub fn action_error_code(action: MediaAction) -> ErrorCode {
    match action {
        MediaAction::Compress => ErrorCode::Compression,
        MediaAction::ChangeResolution => ErrorCode::Resolution,
        MediaAction::ChangeAspectRatio => ErrorCode::AspectRatio,
        MediaAction::ConvertToAudio => ErrorCode::AudioConversion,
        MediaAction::ExtractClip => ErrorCode::ClipExtraction,
    }
}

/// Request metadata read ahead of the upload. The parameters stay raw
/// until dispatch.
struct Request {
    header: RequestHeader,
    media_type: String,
    params_json: Vec<u8>,
}

/// Serves one connection.
pub struct TransferSession {
    keypair: Arc<ServerKeyPair>,
    processor: Arc<dyn MediaProcessor>,
    probe: Arc<dyn DurationProbe>,
    store: UploadStore,
    settings: Arc<ServerSettings>,
    state: SessionState,
    stored: Vec<PathBuf>,
}

impl TransferSession {
    pub fn new(
        keypair: Arc<ServerKeyPair>,
        processor: Arc<dyn MediaProcessor>,
        probe: Arc<dyn DurationProbe>,
        settings: Arc<ServerSettings>,
    ) -> Self {
        TransferSession {
            keypair,
            processor,
            probe,
            store: UploadStore::new(settings.storage_dir.clone()),
            settings,
            state: SessionState::Handshaking,
            stored: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Drive the connection to completion. Never returns early: cleanup
    /// and close run on every path.
    pub async fn handle_connection<S>(&mut self, stream: S) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut channel = FrameChannel::new(stream, self.settings.io_timeout);
        let outcome = self.run(&mut channel).await;

        self.transition(SessionState::CleaningUp);
        let stored = std::mem::take(&mut self.stored);
        self.store.delete_all(&stored).await;
        channel.close().await;
        self.transition(SessionState::Closed);

        match &outcome {
            SessionOutcome::Completed { output_size } => {
                log::info!("Session completed, {} bytes delivered", output_size)
            }
            SessionOutcome::Reported(info) => log::info!("Session ended with error {}", info),
            SessionOutcome::Aborted(e) => log::warn!("Session aborted: {}", e),
        }
        outcome
    }

    async fn run<S>(&mut self, channel: &mut FrameChannel<S>) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let start = Instant::now();
        let handshake = match perform_handshake(channel, &self.keypair).await {
            Ok(handshake) => handshake,
            Err(e) => {
                log::warn!("Handshake failed: {}", e);
                return SessionOutcome::Aborted(e);
            }
        };
        log_timing(&self.settings, "Handshake", start.elapsed());
        log::info!("Session key established");

        let key = handshake.session_key;
        match self.serve(channel, &key).await {
            Ok(output_size) => SessionOutcome::Completed { output_size },
            Err(Failure::Silent(e)) => SessionOutcome::Aborted(e),
            Err(Failure::Report(info)) => self.report(channel, &key, info).await,
        }
    }

    async fn serve<S>(
        &mut self,
        channel: &mut FrameChannel<S>,
        key: &SessionKey,
    ) -> Result<u64, Failure>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request = self.read_request(channel, key).await?;

        // ReceivingUpload
        self.transition(SessionState::ReceivingUpload);
        let input = self.store.destination(&request.media_type);
        self.stored.push(input.clone());
        log::info!(
            "Receiving {} byte upload into {}",
            request.header.file_size,
            input.display()
        );

        let start = Instant::now();
        UploadReceiver::new(key, self.settings.chunk_size)
            .receive(channel, &input, request.header.file_size)
            .await
            .map_err(|failure| {
                log::warn!(
                    "Upload stopped after {} of {} bytes ({} drained): {}",
                    failure.bytes_written,
                    request.header.file_size,
                    failure.drained,
                    failure.error
                );
                Failure::Report(failure.to_error_info())
            })?;
        log_timing(&self.settings, "Upload", start.elapsed());

        // Dispatching
        self.transition(SessionState::Dispatching);
        let job = parse_job(&request.params_json)?;
        log::info!("Dispatching {:?} on .{} upload", job, request.media_type);
        let job = &job;
        let code = action_error_code(job.action());

        if let MediaJob::ExtractClip { end_seconds, .. } = job {
            let duration = self
                .probe
                .duration(&input)
                .await
                .map_err(|e| Failure::Report(ErrorInfo::new(ErrorCode::ClipExtraction, e)))?;
            if *end_seconds > duration {
                log::warn!(
                    "Clip end {}s exceeds media duration {}s",
                    end_seconds,
                    duration
                );
                return Err(Failure::Report(ErrorInfo::bare(ErrorCode::ClipOutOfRange)));
            }
        }

        let start = Instant::now();
        let processed = self
            .processor
            .process(&input, self.store.dir(), job)
            .await
            .map_err(|e| {
                log::error!("{:?} failed: {}", job.action(), e);
                Failure::Report(ErrorInfo::new(code, e))
            })?;
        self.stored.push(processed.path.clone());
        log_timing(&self.settings, "Processing", start.elapsed());
        log::info!("Processed output {}", processed.file_name);

        // RespondingSuccess
        self.transition(SessionState::RespondingSuccess);
        let start = Instant::now();
        let sent = ResponseSender::new(key)
            .send_success(channel, &processed.path, self.settings.chunk_size)
            .await
            .map_err(|failure| match failure {
                SendFailure::BeforeWrite(e) => {
                    Failure::Report(ErrorInfo::new(ErrorCode::Transmission, e))
                }
                SendFailure::MidStream(e) => {
                    log::error!("Response interrupted, tearing down connection: {}", e);
                    Failure::Silent(e)
                }
            })?;
        log_timing(&self.settings, "Transmission", start.elapsed());
        Ok(sent)
    }

    async fn read_request<S>(
        &mut self,
        channel: &mut FrameChannel<S>,
        key: &SessionKey,
    ) -> Result<Request, Failure>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.transition(SessionState::AwaitingHeader);
        let block = channel.recv_decrypted(REQUEST_HEADER_SIZE, key).await?;
        let header = RequestHeader::parse(&block, self.settings.max_upload_size)?;
        log::debug!("Request header: {:?}", header);

        self.transition(SessionState::AwaitingParamsAndType);
        let params_json = channel
            .recv_decrypted(usize::from(header.json_size), key)
            .await?;
        let media_type_block = channel
            .recv_decrypted(usize::from(header.media_type_len), key)
            .await?;
        let media_type = parse_media_type(media_type_block)?;

        Ok(Request {
            header,
            media_type,
            params_json,
        })
    }

    async fn report<S>(
        &mut self,
        channel: &mut FrameChannel<S>,
        key: &SessionKey,
        info: ErrorInfo,
    ) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.transition(SessionState::RespondingError);
        log::warn!("Reporting error {}", info);
        match ResponseSender::new(key).send_error(channel, &info).await {
            Ok(()) => SessionOutcome::Reported(info),
            Err(e) => {
                log::warn!("Could not deliver error report: {}", e);
                SessionOutcome::Aborted(e)
            }
        }
    }
}
