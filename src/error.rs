use thiserror::Error;

/// Error type for every fallible operation of the runtime
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// A shape whose element count cannot be represented
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Rank mismatch: expected {expected} dimensions, got {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("Index out of range: {0}")]
    OutOfRange(String),

    /// Element counts or broadcast shapes do not agree
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Tensor is not contiguous: {0}")]
    NotContiguous(String),

    #[error("Invalid permutation: {0}")]
    InvalidPermutation(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Unsupported dtype {dtype} for {operation}")]
    UnsupportedDType { dtype: String, operation: String },

    #[error("Device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: String, got: String },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unknown kernel '{name}' on device {device}")]
    UnknownKernel { name: String, device: String },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Out of memory: failed to allocate {requested} bytes ({context})")]
    OutOfMemory { requested: usize, context: String },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal errors that shouldn't happen
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl RuntimeError {
    /// Create a shape mismatch error with an optional hint
    pub fn shape_mismatch(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = match suggestion {
            Some(sugg) => format!("expected {}, got {}. Suggestion: {}", expected, got, sugg),
            None => format!("expected {}, got {}", expected, got),
        };
        RuntimeError::ShapeMismatch(message)
    }

    pub fn device_mismatch(expected: impl ToString, got: impl ToString) -> Self {
        RuntimeError::DeviceMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    pub fn unsupported_dtype(dtype: impl ToString, operation: &str) -> Self {
        RuntimeError::UnsupportedDType {
            dtype: dtype.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn out_of_memory(requested: usize, context: &str) -> Self {
        RuntimeError::OutOfMemory {
            requested,
            context: context.to_string(),
        }
    }

    pub fn unknown_kernel(name: &str, device: impl ToString) -> Self {
        RuntimeError::UnknownKernel {
            name: name.to_string(),
            device: device.to_string(),
        }
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::SerializationError(err.to_string())
    }
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Error context for providing additional debugging information
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub operation: String,
    pub tensor_shapes: Vec<String>,
    pub device_info: String,
    pub suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            ..Default::default()
        }
    }

    pub fn with_shape(mut self, shape: &str) -> Self {
        self.tensor_shapes.push(shape.to_string());
        self
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.device_info = device.to_string();
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestions.push(suggestion.to_string());
        self
    }

    pub fn to_error_message(&self) -> String {
        let mut message = format!("operation: {}", self.operation);
        if !self.tensor_shapes.is_empty() {
            message.push_str(&format!("; shapes: {}", self.tensor_shapes.join(", ")));
        }
        if !self.device_info.is_empty() {
            message.push_str(&format!("; device: {}", self.device_info));
        }
        for suggestion in &self.suggestions {
            message.push_str(&format!("; hint: {}", suggestion));
        }
        message
    }
}

/// Helper trait for adding context to errors
///
/// Only message-carrying variants are annotated; structured variants pass
/// through untouched so callers can still match on their fields.
pub trait WithContext<T> {
    fn with_context<F>(self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T> WithContext<T> for RuntimeResult<T> {
    fn with_context<F>(self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|e| {
            let context = f().to_error_message();
            match e {
                RuntimeError::ShapeMismatch(msg) => {
                    RuntimeError::ShapeMismatch(format!("{} ({})", msg, context))
                }
                RuntimeError::InvalidInput(msg) => {
                    RuntimeError::InvalidInput(format!("{} ({})", msg, context))
                }
                RuntimeError::InvalidGraph(msg) => {
                    RuntimeError::InvalidGraph(format!("{} ({})", msg, context))
                }
                RuntimeError::UnsupportedOperation(msg) => {
                    RuntimeError::UnsupportedOperation(format!("{} ({})", msg, context))
                }
                other => other,
            }
        })
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Shape,
    Layout,
    DType,
    Device,
    DeviceNotFound,
    Kernel,
    OutOfMemory,
    Unsupported,
    Graph,
    Usage,
    Config,
    Internal,
}

impl RuntimeError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::InvalidShape(_)
            | RuntimeError::RankMismatch { .. }
            | RuntimeError::OutOfRange(_)
            | RuntimeError::ShapeMismatch(_)
            | RuntimeError::InvalidRange(_) => ErrorCode::Shape,
            RuntimeError::NotContiguous(_) | RuntimeError::InvalidPermutation(_) => ErrorCode::Layout,
            RuntimeError::UnsupportedDType { .. } => ErrorCode::DType,
            RuntimeError::DeviceMismatch { .. } => ErrorCode::Device,
            RuntimeError::DeviceNotFound(_) => ErrorCode::DeviceNotFound,
            RuntimeError::UnknownKernel { .. } => ErrorCode::Kernel,
            RuntimeError::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            RuntimeError::UnsupportedOperation(_) | RuntimeError::NotImplemented(_) => {
                ErrorCode::Unsupported
            }
            RuntimeError::InvalidGraph(_) => ErrorCode::Graph,
            RuntimeError::InvalidInput(_) | RuntimeError::InvalidState(_) => ErrorCode::Usage,
            RuntimeError::ConfigurationError(_)
            | RuntimeError::IoError(_)
            | RuntimeError::SerializationError(_) => ErrorCode::Config,
            RuntimeError::InternalError(_) => ErrorCode::Internal,
        }
    }

    /// Environment failures the caller may retry with different parameters
    pub fn is_recoverable(&self) -> bool {
        matches!(self.code(), ErrorCode::OutOfMemory | ErrorCode::DeviceNotFound)
    }

    /// Shape, rank and range failures always indicate a caller bug
    pub fn is_programming_error(&self) -> bool {
        matches!(self.code(), ErrorCode::Shape | ErrorCode::Layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let error = RuntimeError::shape_mismatch("[2, 3]", "[3, 2]", Some("call contiguous() first"));
        assert!(error.to_string().contains("expected [2, 3], got [3, 2]"));
        assert!(error.to_string().contains("call contiguous() first"));
    }

    #[test]
    fn test_error_context() {
        let result: RuntimeResult<()> = Err(RuntimeError::InvalidInput("bad axis".to_string()));
        let err = result
            .with_context(|| {
                ErrorContext::new("sum")
                    .with_shape("[4, 5]")
                    .with_device("cpu:0")
                    .with_suggestion("axis must be below the rank")
            })
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("operation: sum"));
        assert!(message.contains("shapes: [4, 5]"));
        assert!(message.contains("device: cpu:0"));
    }

    #[test]
    fn test_structured_errors_pass_through_context() {
        let result: RuntimeResult<()> = Err(RuntimeError::RankMismatch { expected: 2, got: 3 });
        let err = result.with_context(|| ErrorContext::new("offset")).unwrap_err();
        assert_eq!(err, RuntimeError::RankMismatch { expected: 2, got: 3 });
    }

    #[test]
    fn test_error_codes() {
        let oom = RuntimeError::out_of_memory(1 << 40, "cpu:0");
        assert_eq!(oom.code(), ErrorCode::OutOfMemory);
        assert!(oom.is_recoverable());

        let missing = RuntimeError::DeviceNotFound("cuda:3".to_string());
        assert!(missing.is_recoverable());

        let rank = RuntimeError::RankMismatch { expected: 2, got: 1 };
        assert!(!rank.is_recoverable());
        assert!(rank.is_programming_error());

        let kernel = RuntimeError::unknown_kernel("conv", "cpu:0");
        assert_eq!(kernel.code(), ErrorCode::Kernel);
        assert!(!kernel.is_recoverable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RuntimeError = io.into();
        assert_eq!(err.code(), ErrorCode::Config);
    }
}
