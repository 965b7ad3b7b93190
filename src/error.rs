use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("测试机正在被用户 {holder_name} 使用")]
    HostBusy { holder_name: String },

    #[error("您正在使用其他测试机: {}", .addresses.join(", "))]
    HolderBusyElsewhere { addresses: Vec<String> },

    #[error("无权释放，测试机正在被用户 {holder_name} 使用")]
    NoPermission { holder_name: String },

    #[error("用户不匹配")]
    HolderMismatch,

    #[error("测试机未被占用")]
    LeaseNotFound,

    #[error("会话不存在")]
    SessionNotFound,

    #[error("主机不存在: {0}")]
    HostNotFound(String),

    #[error("主机离线: {0}")]
    HostOffline(String),

    #[error("主机已存在: {0}")]
    HostExists(String),

    #[error("无效的IP地址: {0}")]
    InvalidAddress(String),

    #[error("缺少必要参数: {0}")]
    InvalidRequest(String),

    #[error("测试用例不存在: {0}")]
    CaseNotFound(String),

    #[error("测试ID不存在: {0}")]
    RunNotFound(String),

    #[error("测试已经停止，当前状态: {state}")]
    RunFinished { run_id: String, state: String },

    #[error("启动测试进程失败: {0}")]
    Spawn(String),

    #[error("Remote agent error [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BenchError {
    /// Stable machine-readable code, surfaced verbatim to API callers.
    pub fn code(&self) -> &str {
        match self {
            BenchError::HostBusy { .. } | BenchError::HolderBusyElsewhere { .. } => "HOST_BUSY",
            BenchError::NoPermission { .. } | BenchError::HolderMismatch => "NO_PERMISSION",
            BenchError::LeaseNotFound | BenchError::SessionNotFound => "LEASE_NOT_FOUND",
            BenchError::HostNotFound(_) => "HOST_NOT_FOUND",
            BenchError::HostOffline(_) => "HOST_OFFLINE",
            BenchError::HostExists(_) => "HOST_EXISTS",
            BenchError::InvalidAddress(_) => "INVALID_ADDRESS",
            BenchError::InvalidRequest(_) => "INVALID_REQUEST",
            BenchError::CaseNotFound(_) => "CASE_NOT_FOUND",
            BenchError::RunNotFound(_) => "RUN_NOT_FOUND",
            BenchError::RunFinished { .. } => "RUN_FINISHED",
            BenchError::Spawn(_) => "SPAWN_FAILED",
            BenchError::Remote { code, .. } => code,
            BenchError::Http(_) => "REMOTE_ERROR",
            BenchError::Io(_) | BenchError::Json(_) | BenchError::Internal(_) => "INTERNAL",
        }
    }

    /// Contention errors are expected outcomes the caller can retry later.
    pub fn is_contention(&self) -> bool {
        matches!(self.code(), "HOST_BUSY" | "NO_PERMISSION")
    }

    /// Rebuild a typed error from a remote `{code, message}` pair so that
    /// not-found and contention cases keep their meaning across the wire.
    pub fn from_remote(code: &str, message: String) -> Self {
        match code {
            "CASE_NOT_FOUND" => BenchError::CaseNotFound(strip_prefix(&message)),
            "RUN_NOT_FOUND" => BenchError::RunNotFound(strip_prefix(&message)),
            _ => BenchError::Remote {
                code: code.to_string(),
                message,
            },
        }
    }
}

fn strip_prefix(message: &str) -> String {
    message
        .split_once(": ")
        .map(|(_, rest)| rest.to_string())
        .unwrap_or_else(|| message.to_string())
}

pub type Result<T> = std::result::Result<T, BenchError>;
