//! gRPC status values produced by error actions.
use std::str::FromStr;
use tonic::{
    Code, Status,
    metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue},
};

/// A terminal error status: code, message and optional trailing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorStatus {
    pub code: Code,
    pub message: String,
    pub metadata: Vec<(String, String)>,
}

impl ErrorStatus {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: Vec::new(),
        }
    }

    /// Converts into the `tonic::Status` sent to the peer.
    pub fn to_status(&self) -> Status {
        let mut metadata = MetadataMap::new();
        for (key, value) in &self.metadata {
            // Keys and values are validated when the rule document is loaded.
            if let (Ok(key), Ok(value)) = (
                MetadataKey::<Ascii>::from_str(key),
                MetadataValue::<Ascii>::from_str(value),
            ) {
                metadata.insert(key, value);
            }
        }
        Status::with_metadata(self.code, self.message.clone(), metadata)
    }
}

/// Checks that a metadata pair can be sent as an ASCII gRPC trailer.
pub(crate) fn is_valid_metadata(key: &str, value: &str) -> bool {
    MetadataKey::<Ascii>::from_str(key).is_ok() && MetadataValue::<Ascii>::from_str(value).is_ok()
}

/// Parses a gRPC status code from its number (`5`) or name (`NOT_FOUND`, `NotFound`).
pub fn parse_code(value: &str) -> Option<Code> {
    let value = value.trim();

    if let Ok(number) = value.parse::<i32>() {
        return code_from_number(number);
    }

    let normalized: String = value
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();

    let code = match normalized.as_str() {
        "ok" => Code::Ok,
        "cancelled" | "canceled" => Code::Cancelled,
        "unknown" => Code::Unknown,
        "invalidargument" => Code::InvalidArgument,
        "deadlineexceeded" => Code::DeadlineExceeded,
        "notfound" => Code::NotFound,
        "alreadyexists" => Code::AlreadyExists,
        "permissiondenied" => Code::PermissionDenied,
        "resourceexhausted" => Code::ResourceExhausted,
        "failedprecondition" => Code::FailedPrecondition,
        "aborted" => Code::Aborted,
        "outofrange" => Code::OutOfRange,
        "unimplemented" => Code::Unimplemented,
        "internal" => Code::Internal,
        "unavailable" => Code::Unavailable,
        "dataloss" => Code::DataLoss,
        "unauthenticated" => Code::Unauthenticated,
        _ => return None,
    };

    Some(code)
}

/// Maps a numeric status code, rejecting values outside the gRPC code range.
pub fn code_from_number(number: i32) -> Option<Code> {
    (0..=16).contains(&number).then(|| Code::from_i32(number))
}
