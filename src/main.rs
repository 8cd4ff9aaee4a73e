use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uploader::config::{UploaderConfig, DEFAULT_CONFIG_PATH};
use uploader::core::{FileCategory, FileHandle, PendingUpload, UploadId, UploadState};
use uploader::scheduler::{UploadEvent, UploadScheduler};
use uploader::session::{FileMetadata, FileMetadataPatch, FileStatus, FileStore, SessionPatch, SessionStore, UploaderStep};
use uploader::transform::{preset_by_name, TransformPipeline};
use uploader::uploaders::{HttpAuthorizationProvider, HttpTransfer};
use uploader::utils::format_file_size;
use uploader::validation::validate;

/// 校验、处理并上传一组文件
#[derive(Parser, Debug)]
#[command(author, version, about = "Validate, transform and upload files to presigned destinations")]
struct Args {
    /// Config file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// instruction, parts-list, gallery-image or thumbnail
    #[arg(long, short = 't', default_value = "gallery-image", value_parser = parse_category)]
    category: FileCategory,

    /// Compression preset, overrides the config file
    #[arg(long)]
    preset: Option<String>,

    /// Overrides scheduler.concurrency
    #[arg(long)]
    concurrency: Option<usize>,

    /// Only validate and transform
    #[arg(long)]
    dry_run: bool,

    files: Vec<PathBuf>,
}

fn parse_category(value: &str) -> std::result::Result<FileCategory, String> {
    FileCategory::parse(value).ok_or_else(|| format!("unknown category `{}`", value))
}

/// Re-authorizations attempted after transfers end up expired.
const MAX_REFRESH_ROUNDS: usize = 2;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = load_config(&args)?;
    if let Some(concurrency) = args.concurrency {
        config.scheduler.concurrency = concurrency.max(1);
    }
    if let Some(preset) = &args.preset {
        config.transform.preset = preset_by_name(preset).name().to_string();
    }

    if args.files.is_empty() {
        bail!("no files given");
    }

    let prepared = prepare_files(&args, &config).await?;
    if prepared.is_empty() {
        bail!("no file passed validation");
    }
    if args.dry_run {
        return Ok(());
    }

    let session = open_session(&config)?;
    if let Some(session) = &session {
        let files = prepared
            .iter()
            .map(|pending| FileMetadata::from_file(pending.id, &pending.file, pending.category))
            .collect();
        session.add_files(files);
        session.update(SessionPatch {
            step: Some(UploaderStep::Files),
            ..Default::default()
        });
    }

    let endpoint = config
        .authorization_endpoint()?
        .context("authorization.endpoint is required to upload")?;
    let mut provider = HttpAuthorizationProvider::new(endpoint, Duration::from_secs(config.authorization.timeout_secs))?;
    if let Some(token) = &config.authorization.token {
        provider = provider.credentials(token.clone());
    }

    let transfer = HttpTransfer::new(Duration::from_secs(config.transfer.timeout_secs))?
        .chunk_size(config.transfer.chunk_size)
        .credentials_header(config.transfer.credentials_header.clone());

    let handle = UploadScheduler::builder(Arc::new(transfer))
        .provider(Arc::new(provider))
        .config(config.scheduler_config())
        .on_session_expired(|count| warn!(count, "Upload authorization expired"))
        .spawn();
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let results = scheduler.enqueue_authorized(prepared).await?;
    let authorized = results.iter().filter(|result| result.is_ok()).count();
    for result in results.iter().filter_map(|result| result.as_ref().err()) {
        error!(error = %result, "File not authorized");
    }
    if authorized == 0 {
        handle.shutdown().await?;
        bail!("no file could be authorized");
    }

    let report = scheduler.start().await?;
    info!(started = report.started, expired = report.expired, "Uploads started");

    let mut refresh_rounds = 0;
    loop {
        match events.recv().await {
            Ok(UploadEvent::StateChanged { upload_id, new_state, .. }) => {
                record_state(session.as_ref(), upload_id, new_state);
            }
            Ok(UploadEvent::Progress { upload_id, progress }) => {
                info!(%upload_id, progress, "Upload progress");
            }
            Ok(UploadEvent::SessionExpired { count }) => {
                warn!(count, "Transfers need a new authorization");
            }
            Ok(UploadEvent::AllCompleted { total, success_count, failed_count }) => {
                let state = scheduler.batch_state().await?;
                if state.expired_count > 0 && refresh_rounds < MAX_REFRESH_ROUNDS {
                    refresh_rounds += 1;
                    let requeued = scheduler.refresh_expired().await?;
                    info!(requeued, round = refresh_rounds, "Re-authorized expired uploads");
                    if requeued > 0 {
                        continue;
                    }
                }
                info!(total, success_count, failed_count, expired = state.expired_count, "All uploads settled");
                break;
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event receiver lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    let state = scheduler.batch_state().await?;
    for task in scheduler.tasks().await? {
        if let (Some(code), Some(message)) = (task.error_code, &task.error) {
            error!(file = %task.file_name(), %code, %message, "Upload failed");
        }
    }

    if let Some(session) = session {
        if state.is_complete {
            session.mark_finalized();
        } else {
            session.set_step(UploaderStep::Review);
        }
        session.close().await;
    }
    handle.shutdown().await?;

    if !state.is_complete {
        bail!("{} of {} uploads did not succeed", state.total - state.success_count, state.total);
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<UploaderConfig> {
    match &args.config {
        Some(path) => UploaderConfig::load_config(path).with_context(|| format!("loading {}", path.display())),
        None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
            UploaderConfig::load_config(DEFAULT_CONFIG_PATH).context("loading config.toml")
        }
        None => Ok(UploaderConfig::default()),
    }
}

async fn prepare_files(args: &Args, config: &UploaderConfig) -> Result<Vec<PendingUpload>> {
    let pipeline = TransformPipeline::default();
    let options = config.transform_options();
    let mut prepared = Vec::with_capacity(args.files.len());

    for path in &args.files {
        let file = FileHandle::from_path(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        if let Err(err) = validate(&file, args.category) {
            error!(file = %file.name(), code = %err.code(), "{}", err.message);
            continue;
        }

        let output = pipeline.transform(&file, &options).await;
        info!(
            file = %output.file.name(),
            original = %format_file_size(file.size()),
            upload = %format_file_size(output.file.size()),
            "File prepared"
        );
        prepared.push(PendingUpload::new(output.file, args.category));
    }

    Ok(prepared)
}

fn open_session(config: &UploaderConfig) -> Result<Option<SessionStore>> {
    let Some(dir) = &config.session.dir else {
        return Ok(None);
    };
    let backend = FileStore::new(dir)?;
    let store = SessionStore::builder(Arc::new(backend), config.session.route.clone())
        .identity(config.session.user.clone())
        .config(config.session_config())
        .on_restore(|session| info!(title = %session.title, files = session.files.len(), "Previous draft found"))
        .open();
    Ok(Some(store))
}

fn record_state(session: Option<&SessionStore>, upload_id: UploadId, state: UploadState) {
    let Some(session) = session else { return };
    let status = match state {
        UploadState::Queued => FileStatus::Pending,
        UploadState::Uploading => FileStatus::Uploading,
        UploadState::Success => FileStatus::Uploaded,
        _ => FileStatus::Failed,
    };
    if let Some(index) = session.file_index(upload_id) {
        session.update_file(index, FileMetadataPatch::status(status));
    }
}
