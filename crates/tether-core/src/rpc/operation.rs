//! Forward operation catalog.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Timeout category of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallCategory {
    /// Ordinary unary operation.
    Standard,
    /// Model downloads and similar.
    LongRunning,
    /// Token generation.
    Generation,
}

macro_rules! operations {
    ($($variant:ident => $name:literal,)*) => {
        /// A call the host can issue to the worker.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Operation {
            $($variant,)*
        }

        impl Operation {
            /// Every operation, in catalog order.
            pub const ALL: &'static [Operation] = &[$(Operation::$variant,)*];

            /// Wire type string.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Operation::$variant => $name,)*
                }
            }

            /// Look up an operation by its wire type string.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Operation::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

operations! {
    Init => "init",
    GetLocalModels => "getLocalModels",
    GetAvailableModels => "getAvailableModels",
    SearchModels => "searchModels",
    DownloadModel => "downloadModel",
    DeleteModel => "deleteModel",
    LoadModel => "loadModel",
    UpdateSessionHistory => "updateSessionHistory",
    UnloadModel => "unloadModel",
    GenerateResponse => "generateResponse",
    GenerateStreamResponse => "generateStreamResponse",
    AbortGeneration => "abortGeneration",
    SetModelSettings => "setModelSettings",
    GetModelSettings => "getModelSettings",
    CalculateOptimalSettings => "calculateOptimalSettings",
    GetModelRuntimeInfo => "getModelRuntimeInfo",
    ClearContextSizeCache => "clearContextSizeCache",
    GetModelStatus => "getModelStatus",
    CancelDownload => "cancelDownload",
    GetDownloadProgress => "getDownloadProgress",
    Cleanup => "cleanup",
}

impl Operation {
    /// Timeout category.
    pub fn category(self) -> CallCategory {
        match self {
            Operation::DownloadModel => CallCategory::LongRunning,
            Operation::GenerateResponse | Operation::GenerateStreamResponse => {
                CallCategory::Generation
            }
            _ => CallCategory::Standard,
        }
    }

    /// Results arrive as `streamChunk` messages ended by the completion sentinel.
    pub fn is_streaming(self) -> bool {
        matches!(self, Operation::GenerateStreamResponse)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::from_name(s)
            .ok_or_else(|| Error::Protocol(format!("unknown operation: {}", s)))
    }
}
