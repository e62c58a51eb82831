use serde_json::{json, Value};

pub const GENERATION_FAILED: &str = "GENERATION_FAILED";
pub const TIMEOUT: &str = "TIMEOUT";
pub const TRANSPORT_FAILURE: &str = "TRANSPORT_FAILURE";

#[derive(Debug, Clone)]
pub struct OrchestratorError {
    code: &'static str,
    message: String,
    detail: Option<Value>,
}

impl OrchestratorError {
    pub fn new(code: &'static str, message: String, detail: Option<Value>) -> Self {
        Self {
            code,
            message,
            detail,
        }
    }

    pub fn generation_failed(message: String, detail: Option<Value>) -> Self {
        Self::new(GENERATION_FAILED, message, detail)
    }

    pub fn timeout(message: String) -> Self {
        Self::new(TIMEOUT, message, None)
    }

    pub fn transport_failure(message: String) -> Self {
        Self::new(TRANSPORT_FAILURE, message, None)
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&Value> {
        self.detail.as_ref()
    }

    /// 只有连接层故障才允许以 HTTP 错误码返回，其余业务失败走 200 + success=false。
    pub fn is_transport(&self) -> bool {
        self.code == TRANSPORT_FAILURE
    }

    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(detail) = &self.detail {
            if let Value::Object(ref mut map) = payload {
                map.insert("detail".to_string(), detail.clone());
            }
        }
        payload
    }
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for OrchestratorError {}
