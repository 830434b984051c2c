//! Cloud Files API host for Windows.
//!
//! Registers `extern "system"` callbacks with `CfConnectSyncRoot` and
//! forwards them to the provider. The callback table is boxed and passed as
//! the callback context; it must outlive the registration and is reclaimed
//! on disconnect, including a disconnect of an invalidated key.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::{size_of, size_of_val};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::ptr;

use parking_lot::Mutex;
use windows::core::{Error as WinError, PCWSTR};
use windows::Win32::Foundation::{
    NTSTATUS, STATUS_CLOUD_FILE_INVALID_REQUEST, STATUS_CLOUD_FILE_REQUEST_CANCELED,
    STATUS_CLOUD_FILE_UNSUCCESSFUL, STATUS_SUCCESS,
};
use windows::Win32::Storage::CloudFilters::{
    CfConnectSyncRoot, CfDisconnectSyncRoot, CfExecute, CfReportProviderProgress,
    CF_CALLBACK_INFO, CF_CALLBACK_PARAMETERS, CF_CALLBACK_REGISTRATION,
    CF_CALLBACK_TYPE_CANCEL_FETCH_DATA, CF_CALLBACK_TYPE_FETCH_DATA,
    CF_CALLBACK_TYPE_FETCH_PLACEHOLDERS, CF_CALLBACK_TYPE_NONE, CF_CONNECTION_KEY,
    CF_CONNECT_FLAGS, CF_CONNECT_FLAG_NONE, CF_CONNECT_FLAG_REQUIRE_FULL_FILE_PATH,
    CF_CONNECT_FLAG_REQUIRE_PROCESS_INFO, CF_FS_METADATA, CF_OPERATION_INFO,
    CF_OPERATION_PARAMETERS, CF_OPERATION_PARAMETERS_0, CF_OPERATION_TRANSFER_DATA_FLAG_NONE,
    CF_OPERATION_TRANSFER_PLACEHOLDERS_FLAG_NONE, CF_OPERATION_TYPE,
    CF_OPERATION_TYPE_TRANSFER_DATA, CF_OPERATION_TYPE_TRANSFER_PLACEHOLDERS,
    CF_PLACEHOLDER_CREATE_FLAG_MARK_IN_SYNC, CF_PLACEHOLDER_CREATE_FLAG_NONE,
    CF_PLACEHOLDER_CREATE_INFO, CF_PROVIDER_STATUS_SYNC_FULL, CF_PROVIDER_STATUS_SYNC_INCREMENTAL,
    CF_SYNC_STATUS,
};
use windows::Win32::Storage::FileSystem::FILE_BASIC_INFO;

use crate::error::HostError;
use crate::host::{
    CallbackSlot, CallbackTable, CompletionOp, ConnectFlags, ExecuteReceipt, ProviderSyncStatus, SyncRootHost,
};
use crate::outcome::{CompletionStatus, FetchStatus};
use crate::request::{ByteRange, CallbackInfo, ConnectionKey, CorrelationKey, ProcessInfo};
use crate::util::wstr::{string_to_wide, wide_to_string};

/// Host backed by the Windows Cloud Files API.
#[derive(Default)]
pub struct CloudFilesHost {
    /// Boxed callback tables by connection key, stored as addresses.
    contexts: Mutex<HashMap<i64, usize>>,
}

impl CloudFilesHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncRootHost for CloudFilesHost {
    fn connect(
        &self,
        client_root: &Path,
        table: CallbackTable,
        flags: ConnectFlags,
    ) -> Result<ConnectionKey, HostError> {
        let root: Vec<u16> = string_to_wide(&client_root.display().to_string());
        let registrations: Vec<CF_CALLBACK_REGISTRATION> = build_registrations(&table);
        let context: *mut CallbackTable = Box::into_raw(Box::new(table));

        // Safety: `registrations` and `root` outlive the call; `context`
        // stays allocated until disconnect.
        let result = unsafe {
            CfConnectSyncRoot(
                PCWSTR(root.as_ptr()),
                registrations.as_ptr(),
                Some(context as *const c_void),
                connect_flags(flags),
            )
        };

        match result {
            Ok(key) => {
                self.contexts.lock().insert(key.0, context as usize);
                Ok(ConnectionKey(key.0))
            }
            Err(e) => {
                // Safety: the driver rejected the registration and holds no
                // reference to the context.
                unsafe { drop(Box::from_raw(context)) };
                Err(api_error("CfConnectSyncRoot", &e))
            }
        }
    }

    fn disconnect(&self, key: ConnectionKey) -> Result<(), HostError> {
        let result = unsafe { CfDisconnectSyncRoot(CF_CONNECTION_KEY(key.0)) };

        // Dropped on failure too: a key the driver refuses to disconnect is
        // one it has already invalidated, and it will not call back on it.
        if let Some(address) = self.contexts.lock().remove(&key.0) {
            // Safety: created by Box::into_raw in connect; the driver no
            // longer calls back for this key.
            unsafe { drop(Box::from_raw(address as *mut CallbackTable)) };
        }

        result.map_err(|e| api_error("CfDisconnectSyncRoot", &e))
    }

    fn execute(&self, op: CompletionOp<'_>) -> Result<ExecuteReceipt, HostError> {
        match op {
            CompletionOp::TransferPlaceholders {
                key,
                status,
                sync_status,
                batch,
            } => {
                let names: Vec<Vec<u16>> = batch.iter().map(|p| string_to_wide(p.relative_name)).collect();
                let mut infos: Vec<CF_PLACEHOLDER_CREATE_INFO> = batch
                    .iter()
                    .zip(names.iter())
                    .map(|(p, name)| CF_PLACEHOLDER_CREATE_INFO {
                        RelativeFileName: PCWSTR(name.as_ptr()),
                        FsMetadata: CF_FS_METADATA {
                            BasicInfo: FILE_BASIC_INFO {
                                CreationTime: p.times.created,
                                LastAccessTime: p.times.last_access,
                                LastWriteTime: p.times.last_write,
                                ChangeTime: p.times.change,
                                FileAttributes: p.attributes.bits(),
                            },
                            FileSize: p.size_bytes as i64,
                        },
                        FileIdentity: p.identity.as_ptr() as *const c_void,
                        FileIdentityLength: p.identity.len() as u32,
                        Flags: if p.in_sync {
                            CF_PLACEHOLDER_CREATE_FLAG_MARK_IN_SYNC
                        } else {
                            CF_PLACEHOLDER_CREATE_FLAG_NONE
                        },
                        ..Default::default()
                    })
                    .collect();

                let count: u32 = u32::try_from(infos.len())
                    .map_err(|_| HostError::Rejected(format!("{} placeholders in one batch", infos.len())))?;

                // Must outlive CfExecute; the operation info points at it.
                let sync: CF_SYNC_STATUS = sync_status_record(sync_status);
                let mut op_info: CF_OPERATION_INFO = operation_info(&key, CF_OPERATION_TYPE_TRANSFER_PLACEHOLDERS);
                op_info.SyncStatus = &sync;

                let mut params: CF_OPERATION_PARAMETERS = CF_OPERATION_PARAMETERS::default();
                // Safety: writes to the union member matching the operation type.
                unsafe {
                    let placeholders = &mut params.Anonymous.TransferPlaceholders;
                    placeholders.Flags = CF_OPERATION_TRANSFER_PLACEHOLDERS_FLAG_NONE;
                    placeholders.CompletionStatus = nt_status(status);
                    placeholders.PlaceholderTotalCount = i64::from(count);
                    placeholders.PlaceholderArray = if infos.is_empty() {
                        ptr::null_mut()
                    } else {
                        infos.as_mut_ptr()
                    };
                    placeholders.PlaceholderCount = count;
                    params.ParamSize = param_size(size_of_val(&params.Anonymous.TransferPlaceholders));
                }

                unsafe { CfExecute(&op_info, &mut params) }.map_err(|e| api_error("CfExecute", &e))?;

                // Safety: same union member, filled in by the driver.
                let processed: u32 = unsafe { params.Anonymous.TransferPlaceholders.EntriesProcessed };
                Ok(ExecuteReceipt {
                    entries_processed: processed,
                })
            }
            CompletionOp::TransferData { key, offset, data } => {
                transfer_data(&key, STATUS_SUCCESS, data.as_ptr() as *const c_void, offset, data.len() as u64)?;
                Ok(ExecuteReceipt::default())
            }
            CompletionOp::FetchComplete { key, range, status, .. } => {
                // Data already went out chunk by chunk; only failures need a
                // closing operation over the requested range.
                if status != FetchStatus::Completed {
                    transfer_data(
                        &key,
                        nt_status(status.completion_status()),
                        ptr::null(),
                        range.offset,
                        range.length,
                    )?;
                }
                Ok(ExecuteReceipt::default())
            }
        }
    }

    fn report_progress(&self, key: &CorrelationKey, total: u64, completed: u64) -> Result<(), HostError> {
        unsafe {
            CfReportProviderProgress(
                CF_CONNECTION_KEY(key.connection_key.0),
                key.transfer_key,
                total as i64,
                completed as i64,
            )
        }
        .map_err(|e| api_error("CfReportProviderProgress", &e))
    }
}

// ============================================================================
// Callbacks
// ============================================================================

unsafe extern "system" fn fetch_placeholders_cb(
    info: *const CF_CALLBACK_INFO,
    _params: *const CF_CALLBACK_PARAMETERS,
) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        with_callback(info, |table, callback| {
            table.provider().fetch_placeholders(callback);
        })
    }));
}

unsafe extern "system" fn fetch_data_cb(info: *const CF_CALLBACK_INFO, params: *const CF_CALLBACK_PARAMETERS) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let fetch = &(*params).Anonymous.FetchData;
        let range = ByteRange::new(fetch.RequiredFileOffset as u64, fetch.RequiredLength as u64);
        with_callback(info, |table, callback| {
            table.provider().fetch_data(callback, range);
        })
    }));
}

unsafe extern "system" fn cancel_fetch_data_cb(
    info: *const CF_CALLBACK_INFO,
    _params: *const CF_CALLBACK_PARAMETERS,
) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        with_callback(info, |table, callback| {
            table.provider().cancel_fetch_data(callback);
        })
    }));
}

/// Translate raw callback info and run `f` with the registered table.
///
/// # Safety
/// `info` must be the pointer the driver passed to the callback.
unsafe fn with_callback<F>(info: *const CF_CALLBACK_INFO, f: F)
where
    F: FnOnce(&CallbackTable, &CallbackInfo<'_>),
{
    let info: &CF_CALLBACK_INFO = &*info;
    if info.CallbackContext.is_null() {
        tracing::error!("Callback without context");
        return;
    }
    let table: &CallbackTable = &*(info.CallbackContext as *const CallbackTable);

    let identity: &[u8] = if info.FileIdentity.is_null() || info.FileIdentityLength == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(info.FileIdentity as *const u8, info.FileIdentityLength as usize)
    };
    let normalized_path: Option<String> = pcwstr_to_string(info.NormalizedPath);
    let process: Option<ProcessInfo> = if info.ProcessInfo.is_null() {
        None
    } else {
        let raw = &*info.ProcessInfo;
        Some(ProcessInfo {
            process_id: raw.ProcessId,
            image_path: pcwstr_to_string(raw.ImagePath),
        })
    };

    let callback = CallbackInfo {
        key: CorrelationKey::new(ConnectionKey(info.ConnectionKey.0), info.TransferKey, info.RequestKey),
        identity,
        normalized_path: normalized_path.as_deref(),
        process: process.as_ref(),
    };
    f(table, &callback);
}

// ============================================================================
// Helper Functions (Primitives)
// ============================================================================

fn build_registrations(table: &CallbackTable) -> Vec<CF_CALLBACK_REGISTRATION> {
    table
        .slots()
        .iter()
        .map(|slot| match slot {
            CallbackSlot::FetchPlaceholders => CF_CALLBACK_REGISTRATION {
                Type: CF_CALLBACK_TYPE_FETCH_PLACEHOLDERS,
                Callback: Some(fetch_placeholders_cb),
            },
            CallbackSlot::FetchData => CF_CALLBACK_REGISTRATION {
                Type: CF_CALLBACK_TYPE_FETCH_DATA,
                Callback: Some(fetch_data_cb),
            },
            CallbackSlot::CancelFetchData => CF_CALLBACK_REGISTRATION {
                Type: CF_CALLBACK_TYPE_CANCEL_FETCH_DATA,
                Callback: Some(cancel_fetch_data_cb),
            },
            CallbackSlot::End => CF_CALLBACK_REGISTRATION {
                Type: CF_CALLBACK_TYPE_NONE,
                Callback: None,
            },
        })
        .collect()
}

fn connect_flags(flags: ConnectFlags) -> CF_CONNECT_FLAGS {
    let mut raw: CF_CONNECT_FLAGS = CF_CONNECT_FLAG_NONE;
    if flags.require_process_info {
        raw = raw | CF_CONNECT_FLAG_REQUIRE_PROCESS_INFO;
    }
    if flags.require_full_file_path {
        raw = raw | CF_CONNECT_FLAG_REQUIRE_FULL_FILE_PATH;
    }
    raw
}

fn operation_info(key: &CorrelationKey, op_type: CF_OPERATION_TYPE) -> CF_OPERATION_INFO {
    CF_OPERATION_INFO {
        StructSize: size_of::<CF_OPERATION_INFO>() as u32,
        Type: op_type,
        ConnectionKey: CF_CONNECTION_KEY(key.connection_key.0),
        TransferKey: key.transfer_key,
        RequestKey: key.request_key,
        ..Default::default()
    }
}

fn sync_status_record(status: ProviderSyncStatus) -> CF_SYNC_STATUS {
    let code = match status {
        ProviderSyncStatus::Full => CF_PROVIDER_STATUS_SYNC_FULL,
        ProviderSyncStatus::Incremental => CF_PROVIDER_STATUS_SYNC_INCREMENTAL,
    };
    CF_SYNC_STATUS {
        StructSize: size_of::<CF_SYNC_STATUS>() as u32,
        Code: code.0 as u32,
        ..Default::default()
    }
}

/// `ParamSize` covering the header and one union member.
fn param_size(member: usize) -> u32 {
    (size_of::<CF_OPERATION_PARAMETERS>() - size_of::<CF_OPERATION_PARAMETERS_0>() + member) as u32
}

fn transfer_data(
    key: &CorrelationKey,
    status: NTSTATUS,
    buffer: *const c_void,
    offset: u64,
    length: u64,
) -> Result<(), HostError> {
    let op_info: CF_OPERATION_INFO = operation_info(key, CF_OPERATION_TYPE_TRANSFER_DATA);
    let mut params: CF_OPERATION_PARAMETERS = CF_OPERATION_PARAMETERS::default();
    // Safety: writes to the union member matching the operation type.
    unsafe {
        let data = &mut params.Anonymous.TransferData;
        data.Flags = CF_OPERATION_TRANSFER_DATA_FLAG_NONE;
        data.CompletionStatus = status;
        data.Buffer = buffer;
        data.Offset = offset as i64;
        data.Length = length as i64;
        params.ParamSize = param_size(size_of_val(&params.Anonymous.TransferData));
    }

    unsafe { CfExecute(&op_info, &mut params) }.map_err(|e| api_error("CfExecute", &e))
}

fn nt_status(status: CompletionStatus) -> NTSTATUS {
    match status {
        CompletionStatus::Success => STATUS_SUCCESS,
        CompletionStatus::Unsuccessful => STATUS_CLOUD_FILE_UNSUCCESSFUL,
        CompletionStatus::Cancelled => STATUS_CLOUD_FILE_REQUEST_CANCELED,
        CompletionStatus::InvalidRequest => STATUS_CLOUD_FILE_INVALID_REQUEST,
    }
}

fn api_error(operation: &'static str, error: &WinError) -> HostError {
    HostError::api(operation, error.code().0 as u32)
}

/// Read a driver-owned wide string, if present.
///
/// # Safety
/// `p` must be null or point to a null-terminated wide string.
unsafe fn pcwstr_to_string(p: PCWSTR) -> Option<String> {
    if p.is_null() {
        return None;
    }
    wide_to_string(p.as_wide())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::outcome::OperationOutcome;
    use crate::provider::SyncProvider;

    struct IdleProvider;

    impl SyncProvider for IdleProvider {
        fn fetch_placeholders(&self, _: &CallbackInfo<'_>) -> OperationOutcome {
            OperationOutcome::Placeholders {
                status: CompletionStatus::Success,
                entries_processed: 0,
                total: 0,
            }
        }

        fn fetch_data(&self, _: &CallbackInfo<'_>, _: ByteRange) -> CompletionStatus {
            CompletionStatus::Success
        }

        fn cancel_fetch_data(&self, _: &CallbackInfo<'_>) {}
    }

    #[test]
    fn test_disconnect_of_stale_key_releases_context() {
        let host = CloudFilesHost::new();
        let provider: Arc<IdleProvider> = Arc::new(IdleProvider);
        let table = CallbackTable::new(provider.clone() as Arc<dyn SyncProvider>);
        let stale: i64 = 0x5EED;
        host.contexts
            .lock()
            .insert(stale, Box::into_raw(Box::new(table)) as usize);

        // The driver never issued this key, so the call itself may fail.
        let _ = host.disconnect(ConnectionKey(stale));

        assert!(host.contexts.lock().is_empty());
        assert_eq!(Arc::strong_count(&provider), 1);
    }

    #[test]
    fn test_sync_status_record_codes() {
        let full: CF_SYNC_STATUS = sync_status_record(ProviderSyncStatus::Full);
        assert_eq!(full.StructSize as usize, size_of::<CF_SYNC_STATUS>());
        assert_eq!(full.Code, CF_PROVIDER_STATUS_SYNC_FULL.0 as u32);
        assert_eq!(full.DescriptionLength, 0);

        let incremental: CF_SYNC_STATUS = sync_status_record(ProviderSyncStatus::Incremental);
        assert_eq!(incremental.Code, CF_PROVIDER_STATUS_SYNC_INCREMENTAL.0 as u32);
    }
}
