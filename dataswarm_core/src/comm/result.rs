use std::fmt;

/// Outcome of an RPC, carried in the `code` of error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum ResultCode {
    Success = 0,
    BadMessage = 1,
    BadMethod = 2,
    BadId = 3,
    BadParams = 4,
    NoSuchTaskId = 5,
    NoSuchBlobId = 6,
    TooFull = 7,
    BadPermission = 8,
    Unable = 9,
    Pending = 10,
    BadState = 11,
    TaskIdExists = 12,
    BlobIdExists = 13,
}

impl ResultCode {
    pub fn from_code(code: i64) -> Option<ResultCode> {
        use self::ResultCode::*;
        Some(match code {
            0 => Success,
            1 => BadMessage,
            2 => BadMethod,
            3 => BadId,
            4 => BadParams,
            5 => NoSuchTaskId,
            6 => NoSuchBlobId,
            7 => TooFull,
            8 => BadPermission,
            9 => Unable,
            10 => Pending,
            11 => BadState,
            12 => TaskIdExists,
            13 => BlobIdExists,
            _ => return None,
        })
    }

    #[inline]
    pub fn code(self) -> i64 {
        self as i64
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    /// Human readable text sent as the `message` of error responses.
    pub fn as_str(self) -> &'static str {
        use self::ResultCode::*;
        match self {
            Success => "success",
            BadMessage => "invalid/malformed RPC message",
            BadMethod => "method does not specify a known message in the given context",
            BadId => "method that needs a reply is missing the id field",
            BadParams => "params keys missing or of incorrect type",
            NoSuchTaskId => "requested task-id does not exist",
            NoSuchBlobId => "requested blob-id does not exist",
            TooFull => "insufficient resources to complete request",
            BadPermission => "insufficient privileges to complete request",
            Unable => "could not complete request for internal reason",
            Pending => "rpc not completed yet.",
            BadState => "cannot take that action in this state.",
            TaskIdExists => "attempt to create a task which already exists.",
            BlobIdExists => "attempt to create a blob which already exists.",
        }
    }
}

impl From<ResultCode> for i64 {
    fn from(code: ResultCode) -> i64 {
        code.code()
    }
}

impl ::std::convert::TryFrom<i64> for ResultCode {
    type Error = String;

    fn try_from(code: i64) -> ::std::result::Result<Self, String> {
        ResultCode::from_code(code).ok_or_else(|| format!("unknown result code {}", code))
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
