// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The externally visible error taxonomy. These codes are the contract between
//! this crate and the daemon service layer; the names and numeric values are
//! stable. Internal modules use their own error types and map to these at the
//! service boundary.

use std::fmt;

/// Flag set on reported codes when the device is in developer mode.
pub const DEV_MODE_FLAG: u32 = 1 << 31;
/// Flag set on reported codes when the update was a resumed update.
pub const RESUMED_FLAG: u32 = 1 << 30;
/// Flag set on reported codes when the device is running a test image.
pub const TEST_IMAGE_FLAG: u32 = 1 << 29;
/// Flag set on reported codes when the update server is a test server.
pub const TEST_OMAHA_URL_FLAG: u32 = 1 << 28;

/// All bits that may be OR-ed into a reported code. Consumers must mask these
/// off before comparing against [`ErrorCode`] values.
pub const SPECIAL_FLAGS: u32 =
    DEV_MODE_FLAG | RESUMED_FLAG | TEST_IMAGE_FLAG | TEST_OMAHA_URL_FLAG;

/// Codes at or above this value encode an HTTP response error from the update
/// server and are folded into [`ErrorCode::OmahaErrorInHTTPResponse`] before
/// reporting.
pub const OMAHA_REQUEST_HTTP_RESPONSE_BASE: u32 = 2000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    #[default]
    Success = 0,
    Error = 1,
    PostinstallRunnerError = 5,
    InstallDeviceOpenError = 7,
    PostinstallBootedFromFirmwareB = 19,
    DownloadStateInitializationError = 20,
    DownloadInvalidMetadataMagicString = 21,
    DownloadManifestParseError = 23,
    DownloadMetadataSignatureError = 24,
    DownloadMetadataSignatureVerificationError = 25,
    DownloadMetadataSignatureMismatch = 26,
    DownloadOperationHashMismatch = 29,
    DownloadInvalidMetadataSize = 32,
    OmahaErrorInHTTPResponse = 37,
    DownloadMetadataSignatureMissingError = 39,
    PostinstallPowerwashError = 41,
    PostinstallFirmwareRONotUpdatable = 43,
    UnsupportedMajorPayloadVersion = 44,
    UserCanceled = 48,
    UpdatedButNotActive = 52,
    NoUpdate = 53,
    RollbackNotPossible = 54,
    NotEnoughSpace = 60,
    PostInstallMountError = 63,
    UpdateAlreadyInstalled = 66,
    UpdateProcessing = 67,
}

impl ErrorCode {
    /// Whether the code represents a terminal state that is not a failure.
    /// [`ErrorCode::UpdatedButNotActive`] signals a fully applied update that
    /// intentionally did not switch the active slot.
    pub fn is_non_failure(self) -> bool {
        matches!(self, Self::Success | Self::UpdatedButNotActive)
    }

    /// Strip the high-order flag bits from a raw reported code.
    pub fn base_code(raw: u32) -> u32 {
        raw & !SPECIAL_FLAGS
    }

    /// Normalize a raw reported code for telemetry: flag bits are masked off
    /// and HTTP response codes are folded into a single bucket.
    pub fn for_reporting(raw: u32) -> Self {
        let base = Self::base_code(raw);

        if base >= OMAHA_REQUEST_HTTP_RESPONSE_BASE {
            return Self::OmahaErrorInHTTPResponse;
        }

        Self::try_from(base).unwrap_or(Self::Error)
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        let code = match value {
            0 => Self::Success,
            1 => Self::Error,
            5 => Self::PostinstallRunnerError,
            7 => Self::InstallDeviceOpenError,
            19 => Self::PostinstallBootedFromFirmwareB,
            20 => Self::DownloadStateInitializationError,
            21 => Self::DownloadInvalidMetadataMagicString,
            23 => Self::DownloadManifestParseError,
            24 => Self::DownloadMetadataSignatureError,
            25 => Self::DownloadMetadataSignatureVerificationError,
            26 => Self::DownloadMetadataSignatureMismatch,
            29 => Self::DownloadOperationHashMismatch,
            32 => Self::DownloadInvalidMetadataSize,
            37 => Self::OmahaErrorInHTTPResponse,
            39 => Self::DownloadMetadataSignatureMissingError,
            41 => Self::PostinstallPowerwashError,
            43 => Self::PostinstallFirmwareRONotUpdatable,
            44 => Self::UnsupportedMajorPayloadVersion,
            48 => Self::UserCanceled,
            52 => Self::UpdatedButNotActive,
            53 => Self::NoUpdate,
            54 => Self::RollbackNotPossible,
            60 => Self::NotEnoughSpace,
            63 => Self::PostInstallMountError,
            66 => Self::UpdateAlreadyInstalled,
            67 => Self::UpdateProcessing,
            v => return Err(v),
        };

        Ok(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "kSuccess",
            Self::Error => "kError",
            Self::PostinstallRunnerError => "kPostinstallRunnerError",
            Self::InstallDeviceOpenError => "kInstallDeviceOpenError",
            Self::PostinstallBootedFromFirmwareB => "kPostinstallBootedFromFirmwareB",
            Self::DownloadStateInitializationError => "kDownloadStateInitializationError",
            Self::DownloadInvalidMetadataMagicString => "kDownloadInvalidMetadataMagicString",
            Self::DownloadManifestParseError => "kDownloadManifestParseError",
            Self::DownloadMetadataSignatureError => "kDownloadMetadataSignatureError",
            Self::DownloadMetadataSignatureVerificationError => {
                "kDownloadMetadataSignatureVerificationError"
            }
            Self::DownloadMetadataSignatureMismatch => "kDownloadMetadataSignatureMismatch",
            Self::DownloadOperationHashMismatch => "kDownloadOperationHashMismatch",
            Self::DownloadInvalidMetadataSize => "kDownloadInvalidMetadataSize",
            Self::OmahaErrorInHTTPResponse => "kOmahaErrorInHTTPResponse",
            Self::DownloadMetadataSignatureMissingError => {
                "kDownloadMetadataSignatureMissingError"
            }
            Self::PostinstallPowerwashError => "kPostinstallPowerwashError",
            Self::PostinstallFirmwareRONotUpdatable => "kPostinstallFirmwareRONotUpdatable",
            Self::UnsupportedMajorPayloadVersion => "kUnsupportedMajorPayloadVersion",
            Self::UserCanceled => "kUserCanceled",
            Self::UpdatedButNotActive => "kUpdatedButNotActive",
            Self::NoUpdate => "kNoUpdate",
            Self::RollbackNotPossible => "kRollbackNotPossible",
            Self::NotEnoughSpace => "kNotEnoughSpace",
            Self::PostInstallMountError => "kPostInstallMountError",
            Self::UpdateAlreadyInstalled => "kUpdateAlreadyInstalled",
            Self::UpdateProcessing => "kUpdateProcessing",
        };

        write!(f, "ErrorCode::{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_masking() {
        let raw = ErrorCode::PostinstallRunnerError as u32 | RESUMED_FLAG | DEV_MODE_FLAG;
        assert_eq!(ErrorCode::base_code(raw), 5);
        assert_eq!(
            ErrorCode::for_reporting(raw),
            ErrorCode::PostinstallRunnerError,
        );
    }

    #[test]
    fn http_response_folding() {
        assert_eq!(
            ErrorCode::for_reporting(OMAHA_REQUEST_HTTP_RESPONSE_BASE + 404),
            ErrorCode::OmahaErrorInHTTPResponse,
        );
        assert_eq!(
            ErrorCode::for_reporting(OMAHA_REQUEST_HTTP_RESPONSE_BASE + 500 | TEST_IMAGE_FLAG),
            ErrorCode::OmahaErrorInHTTPResponse,
        );
    }

    #[test]
    fn non_failure_codes() {
        assert!(ErrorCode::Success.is_non_failure());
        assert!(ErrorCode::UpdatedButNotActive.is_non_failure());
        assert!(!ErrorCode::PostinstallRunnerError.is_non_failure());
    }
}
