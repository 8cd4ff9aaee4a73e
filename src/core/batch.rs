use chrono::{DateTime, Utc};
use super::types::{AuthorizationWindow, UploadState, UploadTask};

/// Aggregate view over every task, derived on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadBatchState {
    pub total: usize,
    pub queued_count: usize,
    pub uploading_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub expired_count: usize,
    pub canceled_count: usize,
    /// Byte-weighted progress over all tasks that are not canceled, 0-100.
    pub overall_progress: u8,
    pub is_complete: bool,
    pub is_uploading: bool,
    pub has_errors: bool,
    pub session_id: Option<String>,
    pub session_expires_at: Option<DateTime<Utc>>,
}

impl UploadBatchState {
    pub fn from_tasks<'a>(
        tasks: impl IntoIterator<Item = &'a UploadTask>,
        window: Option<&AuthorizationWindow>,
    ) -> Self {
        let mut state = UploadBatchState {
            session_id: window.map(|w| w.session_id.clone()),
            session_expires_at: window.map(|w| w.expires_at),
            ..Default::default()
        };

        let mut weighted: u128 = 0;
        let mut total_bytes: u128 = 0;
        let mut plain_sum: u64 = 0;
        let mut counted: u64 = 0;

        for task in tasks {
            state.total += 1;
            match task.state {
                UploadState::Queued => state.queued_count += 1,
                UploadState::Uploading => state.uploading_count += 1,
                UploadState::Success => state.success_count += 1,
                UploadState::Failed => state.failed_count += 1,
                UploadState::Expired => state.expired_count += 1,
                UploadState::Canceled => state.canceled_count += 1,
            }

            if task.state == UploadState::Canceled {
                continue;
            }

            let progress = if task.state == UploadState::Success { 100 } else { task.progress.min(100) };
            weighted += progress as u128 * task.file_size as u128;
            total_bytes += task.file_size as u128;
            plain_sum += progress as u64;
            counted += 1;
        }

        state.overall_progress = if total_bytes > 0 {
            (weighted / total_bytes) as u8
        } else if counted > 0 {
            (plain_sum / counted) as u8
        } else {
            0
        };

        state.is_uploading = state.uploading_count > 0;
        state.has_errors = state.failed_count > 0 || state.expired_count > 0;
        state.is_complete = state.success_count > 0
            && state.queued_count == 0
            && state.uploading_count == 0
            && !state.has_errors;

        state
    }
}
